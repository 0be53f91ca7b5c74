//! Monotonic uptime and the timed-event wheel.
//!
//! Uptime comes from the TSC, calibrated once against PIT channel 2.
//! The APIC timer runs in one-shot mode: each dispatch re-arms one
//! scheduler quantum, and every expiry drains the ordered deadline list
//! before preempting.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use x86_64::instructions::port::Port;

use crate::arch::x86::{apic, read_tsc};
use crate::config::SCHED_QUANTUM_NANOS;
use crate::sync::SpinLock;
use crate::task::{self, Task};
use crate::trap::{self, IrqContext};

const PIT_HZ: u64 = 1_193_182;
/// PIT ticks per calibration run; about 50 ms.
const CALIBRATION_PIT_TICKS: u64 = 59_659;

static TSC_HZ: AtomicU64 = AtomicU64::new(0);
static BOOT_TSC: AtomicU64 = AtomicU64::new(0);
/// APIC timer counts per scheduler quantum, divide-by-16.
static QUANTUM_COUNTS: AtomicU32 = AtomicU32::new(0);

/// A pending timed wakeup for one thread. Cancellation is idempotent;
/// a cancelled entry is skipped when its deadline comes up.
pub struct TimerEntry {
    deadline: u64,
    task: Arc<Task>,
    fired: AtomicBool,
    cancelled: AtomicBool,
}

impl TimerEntry {
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

static DEADLINES: SpinLock<BTreeMap<u64, Vec<Arc<TimerEntry>>>> =
    SpinLock::new(BTreeMap::new());

/// Nanoseconds since calibration.
pub fn uptime_nanos() -> u64 {
    let hz = TSC_HZ.load(Ordering::Relaxed);
    if hz == 0 {
        return 0;
    }
    let delta = read_tsc().wrapping_sub(BOOT_TSC.load(Ordering::Relaxed));
    ((delta as u128) * 1_000_000_000 / hz as u128) as u64
}

/// Spins until `nanos` have elapsed.
pub fn busy_wait_nanos(nanos: u64) {
    let end = uptime_nanos() + nanos;
    while uptime_nanos() < end {
        core::hint::spin_loop();
    }
}

/// Registers a wakeup for the calling thread at an absolute uptime.
pub fn schedule_wakeup(deadline_nanos: u64) -> Arc<TimerEntry> {
    let entry = Arc::new(TimerEntry {
        deadline: deadline_nanos,
        task: task::current(),
        fired: AtomicBool::new(false),
        cancelled: AtomicBool::new(false),
    });
    DEADLINES
        .lock_irq_disabled()
        .entry(deadline_nanos)
        .or_default()
        .push(entry.clone());
    entry
}

/// Wakes everything whose deadline has passed. Runs on every tick, in
/// interrupt context.
fn process_deadlines() {
    let now = uptime_nanos();
    let mut due = Vec::new();
    {
        let mut deadlines = DEADLINES.lock_irq_disabled();
        while let Some((&deadline, _)) = deadlines.first_key_value() {
            if deadline > now {
                break;
            }
            let (_, entries) = deadlines.pop_first().unwrap();
            due.extend(entries);
        }
    }
    for entry in due {
        if !entry.cancelled.load(Ordering::Acquire) {
            entry.fired.store(true, Ordering::Release);
            task::wake(&entry.task);
        }
    }
}

/// Measures the TSC frequency against PIT channel 2 in mode 0.
fn calibrate_tsc() {
    // Safety: standard PIT/keyboard-controller ports, used once at boot.
    unsafe {
        let mut gate = Port::<u8>::new(0x61);
        let prev = gate.read();
        gate.write((prev & !0x02) | 0x01);

        Port::<u8>::new(0x43).write(0xB0u8);
        Port::<u8>::new(0x42).write((CALIBRATION_PIT_TICKS & 0xFF) as u8);
        Port::<u8>::new(0x42).write((CALIBRATION_PIT_TICKS >> 8) as u8);

        let start = read_tsc();
        while gate.read() & 0x20 == 0 {
            core::hint::spin_loop();
        }
        let end = read_tsc();

        let tsc_hz = (end - start) as u128 * PIT_HZ as u128 / CALIBRATION_PIT_TICKS as u128;
        TSC_HZ.store(tsc_hz as u64, Ordering::SeqCst);
        BOOT_TSC.store(start, Ordering::SeqCst);
        log::info!("timer: TSC at {} MHz", tsc_hz / 1_000_000);
    }
}

/// Measures how many APIC timer counts one quantum takes, then arms the
/// first quantum: let the counter free-run and see how far it gets while
/// the monotonic clock advances one quantum's worth.
fn calibrate_quantum() {
    apic::set_timer_divide_16();
    apic::set_lvt_timer(0x1_0000); // masked while measuring
    apic::set_timer_init_count(u32::MAX);

    busy_wait_nanos(SCHED_QUANTUM_NANOS);

    let counts = u32::MAX - apic::timer_current_count();
    apic::set_timer_init_count(0);
    QUANTUM_COUNTS.store(counts, Ordering::SeqCst);
    log::info!("timer: quantum is {} APIC counts", counts);

    apic::set_lvt_timer(trap::VECTOR_TIMER as u32);
    apic::set_timer_init_count(counts);
}

/// Starts one more quantum on the calling CPU's timer.
pub(crate) fn rearm_quantum() {
    let counts = QUANTUM_COUNTS.load(Ordering::SeqCst);
    if counts != 0 {
        apic::set_timer_init_count(counts);
    }
}

pub(crate) fn init() {
    calibrate_tsc();
    trap::register_irq_callback(trap::VECTOR_TIMER, |_ctx: &IrqContext| {
        process_deadlines();
        task::preempt();
    });
    calibrate_quantum();
}

/// Arms the local APIC timer of an application processor.
pub(crate) fn init_local() {
    apic::set_timer_divide_16();
    apic::set_lvt_timer(trap::VECTOR_TIMER as u32);
    rearm_quantum();
}
