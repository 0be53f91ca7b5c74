use crate::prelude::*;

use super::sig_num::*;
use super::sig_set::SigSet;

/// Special disposition values, shared with userspace. Handler addresses
/// below 256 are these sentinels, not code.
pub const SIG_DFL: u64 = 0;
pub const SIG_ERR: u64 = 1;
pub const SIG_HOLD: u64 = 2;
pub const SIG_IGN: u64 = 3;
pub const SIG_CORE: u64 = 4;
pub const SIG_TERM: u64 = 5;
pub const SIG_STOP: u64 = 6;

/// First address a real user handler may live at.
pub const SIG_FIRST_HANDLER_ADDR: u64 = 256;

bitflags! {
    pub struct SigActionFlags: i32 {
        const SA_NOCLDSTOP = 1 << 0;
        const SA_NOCLDWAIT = 1 << 1;
        const SA_NODEFER   = 1 << 2;
        const SA_ONSTACK   = 1 << 3;
        const SA_RESETHAND = 1 << 4;
        const SA_RESTART   = 1 << 5;
        const SA_SIGINFO   = 1 << 6;
    }
}

/// One entry of the per-process disposition table. The layout matches
/// `struct sigaction` in libc, which is why the handler is a raw value
/// rather than an enum.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SigAction {
    pub handler: u64,
    pub mask: u64,
    pub flags: i32,
    pub _pad: i32,
}

impl Default for SigAction {
    fn default() -> Self {
        Self {
            handler: SIG_DFL,
            mask: 0,
            flags: 0,
            _pad: 0,
        }
    }
}

impl SigAction {
    pub fn mask(&self) -> SigSet {
        SigSet::from(self.mask)
    }

    pub fn flags(&self) -> SigActionFlags {
        SigActionFlags::from_bits_truncate(self.flags)
    }
}

/// The default action of every signal, by the conventional
/// term/core/stop/ignore classification.
pub fn default_action(signum: SigNum) -> u64 {
    match signum {
        SIGHUP | SIGINT | SIGKILL | SIGPIPE | SIGALRM | SIGTERM | SIGUSR1 | SIGUSR2
        | SIGPOLL => SIG_TERM,
        SIGQUIT | SIGILL | SIGTRAP | SIGABRT | SIGFPE | SIGBUS | SIGSEGV | SIGSYS => SIG_CORE,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => SIG_STOP,
        _ => SIG_IGN,
    }
}

/// The per-process disposition table.
#[derive(Clone)]
pub struct SigDispositions {
    table: [SigAction; SIG_NUM],
}

impl Default for SigDispositions {
    fn default() -> Self {
        Self {
            table: [SigAction::default(); SIG_NUM],
        }
    }
}

impl SigDispositions {
    pub fn get(&self, signum: SigNum) -> SigAction {
        self.table[signum.as_usize()]
    }

    pub fn set(&mut self, signum: SigNum, action: SigAction) {
        self.table[signum.as_usize()] = action;
    }

    /// The handler value after resolving SIG_DFL.
    pub fn effective_handler(&self, signum: SigNum) -> u64 {
        let handler = self.get(signum).handler;
        if handler == SIG_DFL {
            default_action(signum)
        } else {
            handler
        }
    }

    /// Exec (and process creation for PID 1) resets everything.
    pub fn reset(&mut self) {
        self.table = [SigAction::default(); SIG_NUM];
    }
}

#[if_cfg_ktest]
mod test {
    use super::*;

    #[ktest]
    fn defaults_follow_the_classification() {
        assert_eq!(default_action(SIGKILL), SIG_TERM);
        assert_eq!(default_action(SIGSEGV), SIG_CORE);
        assert_eq!(default_action(SIGSTOP), SIG_STOP);
        assert_eq!(default_action(SIGCHLD), SIG_IGN);
    }

    #[ktest]
    fn effective_handler_resolves_default() {
        let mut dispositions = SigDispositions::default();
        assert_eq!(dispositions.effective_handler(SIGTERM), SIG_TERM);
        dispositions.set(
            SIGTERM,
            SigAction {
                handler: SIG_IGN,
                ..SigAction::default()
            },
        );
        assert_eq!(dispositions.effective_handler(SIGTERM), SIG_IGN);
    }
}
