use crate::process::{self, wait_status};

pub fn sys_exit(code: i32) -> ! {
    process::do_exit(wait_status::ws_exited(code));
}
