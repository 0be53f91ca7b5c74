use crate::prelude::*;
use crate::process::signal::sig_action::SigAction;
use crate::process::signal::sig_num::SigNum;
use crate::util::user;

/// Installs a signal disposition. SIGKILL, SIGSTOP and SIGTHKILL cannot
/// be re-disposed; attempts are rejected rather than ignored.
pub fn sys_sigaction(signo: i32, uact: Vaddr, uoldact: Vaddr) -> Result<isize> {
    let signum = SigNum::try_from_i32(signo)?;

    let act: Option<SigAction> = if uact != 0 {
        Some(user::read_val(uact)?)
    } else {
        None
    };

    let proc = current!();
    let old = {
        let mut dispositions = proc.dispositions.lock_irq_disabled();
        let old = dispositions.get(signum);
        if let Some(act) = act {
            if signum.is_unblockable() {
                return_errno!(Errno::EINVAL);
            }
            dispositions.set(signum, act);
        }
        old
    };

    if uoldact != 0 {
        user::write_val(uoldact, &old)?;
    }
    Ok(0)
}
