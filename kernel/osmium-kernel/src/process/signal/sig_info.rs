use super::sig_num::SigNum;
use crate::process::Pid;

/// Generic si_code values.
pub const SI_USER: i32 = 0;

/// si_code values for SIGSEGV.
pub const SEGV_MAPERR: i32 = 0x1001;
pub const SEGV_ACCERR: i32 = 0x1002;

/// si_code values for SIGCHLD.
pub const CLD_EXITED: i32 = 0x2001;
pub const CLD_KILLED: i32 = 0x2002;

/// Information accompanying a signal; the user-visible layout matches
/// libc's `siginfo_t`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SigInfo {
    pub si_signo: i32,
    pub si_code: i32,
    pub si_errno: i32,
    pub si_pid: Pid,
    pub si_uid: u32,
    pub si_addr: u64,
    pub si_status: i32,
    pub si_band: i64,
    pub si_value: u64,
}

impl SigInfo {
    pub fn new(signum: SigNum, code: i32) -> Self {
        Self {
            si_signo: signum.as_u8() as i32,
            si_code: code,
            si_errno: 0,
            si_pid: 0,
            si_uid: 0,
            si_addr: 0,
            si_status: 0,
            si_band: 0,
            si_value: 0,
        }
    }

    pub fn signum(&self) -> SigNum {
        SigNum::try_from_i32(self.si_signo).expect("SigInfo holds a valid signal")
    }
}

impl Default for SigInfo {
    fn default() -> Self {
        Self::new(super::sig_num::SIGHUP, SI_USER)
    }
}
