//! Local interrupt gating and IRQ-line callbacks.

use alloc::vec::Vec;

use spin::Once;
use x86_64::instructions::interrupts;

use crate::sync::SpinLock;

/// Saved interrupt state, as returned by [`disable_local`].
pub struct DisabledLocalIrqGuard {
    was_enabled: bool,
}

impl !Send for DisabledLocalIrqGuard {}

/// Disables interrupts on the calling CPU, remembering whether they were
/// enabled. Dropping the guard restores the previous state, so nesting
/// works naturally.
#[must_use]
pub fn disable_local() -> DisabledLocalIrqGuard {
    let was_enabled = interrupts::are_enabled();
    if was_enabled {
        interrupts::disable();
    }
    DisabledLocalIrqGuard { was_enabled }
}

impl DisabledLocalIrqGuard {
    /// Forgets the saved state, leaving interrupts disabled after drop.
    pub fn forget(mut self) {
        self.was_enabled = false;
    }
}

impl Drop for DisabledLocalIrqGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            interrupts::enable();
        }
    }
}

#[inline]
pub fn irqs_enabled() -> bool {
    interrupts::are_enabled()
}

type IrqCallback = alloc::sync::Arc<dyn Fn(&IrqContext) + Send + Sync>;

/// What an IRQ callback gets to see about the interrupt that fired.
#[derive(Debug, Clone, Copy)]
pub struct IrqContext {
    pub vector: u8,
    /// True when the interrupt arrived while the CPU was in user mode.
    pub from_user: bool,
}

struct IrqLine {
    callbacks: SpinLock<Vec<IrqCallback>>,
}

impl IrqLine {
    const fn new() -> Self {
        Self {
            callbacks: SpinLock::new(Vec::new()),
        }
    }
}

static IRQ_LINES: Once<Vec<IrqLine>> = Once::new();

pub(crate) fn init() {
    IRQ_LINES.call_once(|| (0..256).map(|_| IrqLine::new()).collect());
}

/// Registers a callback for a vector. Multiple callbacks per line are
/// allowed; they run in registration order, in interrupt context.
pub fn register_irq_callback<F>(vector: u8, callback: F)
where
    F: Fn(&IrqContext) + Send + Sync + 'static,
{
    IRQ_LINES.get().expect("irq lines not initialized")[vector as usize]
        .callbacks
        .lock_irq_disabled()
        .push(alloc::sync::Arc::new(callback));
}

/// Invoked from the trap paths for every hardware interrupt vector.
///
/// Callbacks are snapshotted before the call so that one of them (the
/// scheduler tick) may context-switch away without a lock held.
pub(crate) fn dispatch(ctx: &IrqContext) {
    let Some(lines) = IRQ_LINES.get() else {
        return;
    };
    let callbacks: Vec<IrqCallback> = lines[ctx.vector as usize]
        .callbacks
        .lock_irq_disabled()
        .iter()
        .cloned()
        .collect();
    for callback in callbacks {
        callback(ctx);
    }
}
