use crate::prelude::*;

/// A validated signal number, 1..=38.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SigNum(u8);

/// One past the largest signal number.
pub const SIG_NUM: usize = 39;

pub const SIGHUP: SigNum = SigNum(1);
pub const SIGINT: SigNum = SigNum(2);
pub const SIGQUIT: SigNum = SigNum(3);
pub const SIGILL: SigNum = SigNum(4);
pub const SIGTRAP: SigNum = SigNum(5);
pub const SIGABRT: SigNum = SigNum(6);
pub const SIGEMT: SigNum = SigNum(7);
pub const SIGFPE: SigNum = SigNum(8);
pub const SIGKILL: SigNum = SigNum(9);
pub const SIGBUS: SigNum = SigNum(10);
pub const SIGSEGV: SigNum = SigNum(11);
pub const SIGSYS: SigNum = SigNum(12);
pub const SIGPIPE: SigNum = SigNum(13);
pub const SIGALRM: SigNum = SigNum(14);
pub const SIGTERM: SigNum = SigNum(15);
pub const SIGUSR1: SigNum = SigNum(16);
pub const SIGUSR2: SigNum = SigNum(17);
pub const SIGCHLD: SigNum = SigNum(18);
pub const SIGPWR: SigNum = SigNum(19);
pub const SIGWINCH: SigNum = SigNum(20);
pub const SIGURG: SigNum = SigNum(21);
pub const SIGPOLL: SigNum = SigNum(22);
pub const SIGSTOP: SigNum = SigNum(23);
pub const SIGTSTP: SigNum = SigNum(24);
pub const SIGCONT: SigNum = SigNum(25);
pub const SIGTTIN: SigNum = SigNum(26);
pub const SIGTTOU: SigNum = SigNum(27);
pub const SIGVTALRM: SigNum = SigNum(28);
pub const SIGPROF: SigNum = SigNum(29);
pub const SIGXCPU: SigNum = SigNum(30);
pub const SIGXFSZ: SigNum = SigNum(31);
pub const SIGWAITING: SigNum = SigNum(32);
pub const SIGLWP: SigNum = SigNum(33);
pub const SIGAIO: SigNum = SigNum(34);
/// Kernel-defined: terminate just the receiving thread.
pub const SIGTHKILL: SigNum = SigNum(35);
/// Wake a thread without dispatching a handler.
pub const SIGTHWAKE: SigNum = SigNum(36);
/// Debugger notification.
pub const SIGTRACE: SigNum = SigNum(37);
/// Suspend a single thread.
pub const SIGTHSUSP: SigNum = SigNum(38);

impl SigNum {
    pub fn try_from_i32(value: i32) -> Result<Self> {
        if !(1..SIG_NUM as i32).contains(&value) {
            return_errno_with_message!(Errno::EINVAL, "invalid signal number");
        }
        Ok(SigNum(value as u8))
    }

    pub const fn as_u8(self) -> u8 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// SIGKILL, SIGSTOP and SIGTHKILL can be neither blocked nor given a
    /// disposition.
    pub fn is_unblockable(self) -> bool {
        matches!(self, SIGKILL | SIGSTOP | SIGTHKILL)
    }

    pub fn iter_all() -> impl Iterator<Item = SigNum> {
        (1..SIG_NUM as u8).map(SigNum)
    }
}
