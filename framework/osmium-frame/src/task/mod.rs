//! Kernel threads and the scheduler.

mod scheduler;
#[allow(clippy::module_inception)]
mod task;

pub use scheduler::{
    current, detach, exit, idle_loop, join, preempt, suspend, try_current, wake, yield_now,
};
pub use task::{Priority, Task, TaskOptions};

/// Makes a freshly built task runnable for the first time.
pub fn run(task: &alloc::sync::Arc<Task>) {
    scheduler::assign_home_cpu(task);
    scheduler::wake(task);
}

pub(crate) use scheduler::{init_global, init_local, init_local_ap};
