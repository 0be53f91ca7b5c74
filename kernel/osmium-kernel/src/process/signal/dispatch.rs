//! Turning pending signals into user-visible control flow.
//!
//! Dispatch is an explicit step on the way back from kernel to user
//! mode: the thread loop calls [`handle_pending_signals`] with the banked
//! user context before every re-entry, and this module rewrites that
//! context so the next entry lands in the handler (or never happens,
//! for fatal signals).

use osmium_frame::config::PAGE_SIZE;
use osmium_frame::user::UserContext;
use osmium_frame::vm::page_table::{self, MapFlags, USER_AUX_BASE};

use crate::prelude::*;
use crate::process;
use crate::process::wait_status;
use crate::thread::{take_ready_signal, Thread};
use crate::util::user;

use super::sig_action::{
    SigActionFlags, SIG_CORE, SIG_FIRST_HANDLER_ADDR, SIG_IGN, SIG_STOP, SIG_TERM,
};
use super::sig_info::SigInfo;
use super::sig_num::{SIGKILL, SIGTHKILL, SIGTHWAKE};

core::arch::global_asm!(include_str!("sigreturn.S"));

extern "C" {
    fn __sigreturn_tramp_start();
    fn __sigreturn_tramp_end();
}

/// The GPR block pushed above the red zone on the user stack. `rsp`
/// comes first so a restorer may discard it; `rip` last so it can be
/// used as a return slot.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct MContextGprs {
    rsp: u64,
    rflags: u64,
    rax: u64,
    rbx: u64,
    rcx: u64,
    rdx: u64,
    rsi: u64,
    rdi: u64,
    rbp: u64,
    r8: u64,
    r9: u64,
    r10: u64,
    r11: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rip: u64,
}

/// Matches `ucontext_t` in userspace; the FPU block must sit at a
/// 16-byte-aligned address, which the dispatcher guarantees by aligning
/// the whole structure.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct UContext {
    uc_link: u64,        // 0x00
    uc_sigmask: u64,     // 0x08
    uc_stack: [u64; 3],  // 0x10
    uc_padding: u64,     // 0x28
    fpu_regs: [u8; 512], // 0x30
    gpr_ptr: u64,        // 0x230
}

const _: () = {
    assert!(core::mem::offset_of!(UContext, fpu_regs) == 0x30);
    assert!(core::mem::offset_of!(UContext, gpr_ptr) == 0x230);
};

/// Copies the signal-return trampoline into the shared user-aux window.
/// Runs once at boot, before the first process exists, so every address
/// space inherits the mapping through its top-level aux slot.
pub(super) fn init_sigreturn_trampoline() {
    let len = __sigreturn_tramp_end as usize - __sigreturn_tramp_start as usize;
    assert!(len <= PAGE_SIZE);

    let frame = osmium_frame::vm::frame_pool::alloc_user_page()
        .expect("out of memory mapping the signal trampoline");
    // Safety: fresh page; the trampoline bytes are plain code.
    unsafe {
        core::ptr::copy_nonoverlapping(
            __sigreturn_tramp_start as usize as *const u8,
            frame.as_ptr(),
            len,
        );
    }
    let frame_pa = osmium_frame::vm::frame_pool::virt_to_phys(frame.as_ptr() as usize).unwrap();
    page_table::map_kernel(
        USER_AUX_BASE,
        frame_pa,
        PAGE_SIZE,
        MapFlags::USER | MapFlags::EXEC,
    )
    .expect("failed to map the signal trampoline");
}

/// User-visible address of the trampoline.
fn sigreturn_addr() -> u64 {
    USER_AUX_BASE as u64
}

/// Delivers every ready signal to the calling thread by rewriting its
/// user context. Returns only when nothing deliverable is left; fatal
/// signals do not return at all.
pub fn handle_pending_signals(ctx: &mut UserContext) {
    loop {
        let Some(thread) = Thread::current() else {
            return;
        };
        let Some(info) = take_ready_signal(&thread) else {
            return;
        };
        let signum = info.signum();

        // Thread-directed control signals short-circuit the disposition
        // machinery entirely.
        if signum == SIGTHKILL {
            process::exit_thread(0);
        }
        if signum == SIGTHWAKE {
            continue;
        }

        let proc = thread.process().expect("signal for a process-less thread");
        let (action, handler) = {
            let mut dispositions = proc.dispositions.lock_irq_disabled();
            let action = dispositions.get(signum);
            let handler = dispositions.effective_handler(signum);
            if handler >= SIG_FIRST_HANDLER_ADDR
                && action.flags().contains(SigActionFlags::SA_RESETHAND)
            {
                // One-shot handlers revert before entry.
                dispositions.set(signum, Default::default());
            }
            (action, handler)
        };

        match handler {
            SIG_IGN => continue,
            SIG_TERM | SIG_CORE => {
                process::do_exit(wait_status::ws_signalled(signum));
            }
            SIG_STOP => {
                // Job control stopping has no backing story yet; dropping
                // the signal here beats wedging the process.
                warn!("ignoring stop signal {:?}", signum);
                continue;
            }
            handler => {
                if enter_handler(ctx, &thread, &info, handler, &action).is_err() {
                    // An unwritable stack means the process cannot take
                    // signals at all.
                    process::do_exit(wait_status::ws_signalled(SIGKILL));
                }
                return;
            }
        }
    }
}

/// Builds the handler frame on the user stack:
///
/// ```text
///   [red zone skipped]
///   GPR block            (original registers, rip last)
///   ksiginfo             (8-aligned)
///   ucontext             (16-aligned, holds the FPU image)
///   trampoline address   <- rsp on handler entry
/// ```
fn enter_handler(
    ctx: &mut UserContext,
    thread: &Arc<Thread>,
    info: &SigInfo,
    handler: u64,
    action: &super::sig_action::SigAction,
) -> Result<()> {
    let gprs = MContextGprs {
        rsp: ctx.rsp,
        rflags: ctx.rflags,
        rax: ctx.rax,
        rbx: ctx.rbx,
        rcx: ctx.rcx,
        rdx: ctx.rdx,
        rsi: ctx.rsi,
        rdi: ctx.rdi,
        rbp: ctx.rbp,
        r8: ctx.r8,
        r9: ctx.r9,
        r10: ctx.r10,
        r11: ctx.r11,
        r12: ctx.r12,
        r13: ctx.r13,
        r14: ctx.r14,
        r15: ctx.r15,
        rip: ctx.rip,
    };

    let gpr_addr = ctx.rsp - core::mem::size_of::<MContextGprs>() as u64 - 128;
    user::write_val(gpr_addr as Vaddr, &gprs)?;

    let siginfo_addr = (gpr_addr - core::mem::size_of::<SigInfo>() as u64) & !0x7;
    user::write_val(siginfo_addr as Vaddr, info)?;

    let blocked = thread.blocked();
    let ucontext = UContext {
        uc_link: 0,
        uc_sigmask: blocked.as_u64(),
        uc_stack: [0; 3],
        uc_padding: 0,
        fpu_regs: *ctx.fpu.as_bytes(),
        gpr_ptr: gpr_addr,
    };
    let ucontext_addr = (siginfo_addr - core::mem::size_of::<UContext>() as u64) & !0xF;
    user::write_val(ucontext_addr as Vaddr, &ucontext)?;

    // Mask what the action asks for, for the duration of the handler.
    thread.set_blocked(blocked | action.mask());

    let rsp = ucontext_addr - 8;
    user::write_val(rsp as Vaddr, &sigreturn_addr())?;

    ctx.rdi = info.si_signo as u64;
    ctx.rsi = siginfo_addr;
    ctx.rdx = ucontext_addr;
    ctx.rsp = rsp;
    ctx.rip = handler;
    Ok(())
}
