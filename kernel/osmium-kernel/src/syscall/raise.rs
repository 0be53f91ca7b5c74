use crate::prelude::*;
use crate::process::signal::{self, sig_info::{SigInfo, SI_USER}, sig_num::SigNum};
use crate::thread::Thread;

/// Queues a signal on the calling thread.
pub fn sys_raise(signo: i32) -> Result<isize> {
    let signum = SigNum::try_from_i32(signo)?;
    let thread = Thread::current().ok_or(Error::new(Errno::EINVAL))?;
    let proc = current!();
    let creds = proc.credentials();

    let mut info = SigInfo::new(signum, SI_USER);
    info.si_pid = proc.pid();
    info.si_uid = creds.ruid;
    signal::deliver_to_thread(&thread, info);
    Ok(0)
}
