#![allow(unused)]

pub(crate) use alloc::{
    boxed::Box,
    collections::{BTreeMap, VecDeque},
    string::{String, ToString},
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
pub(crate) use core::{any::Any, fmt::Debug};

pub(crate) use osmium_frame::{
    config::PAGE_SIZE,
    sync::{Mutex, MutexGuard, SpinLock, SpinLockGuard},
    vm::{Paddr, Vaddr},
};

pub(crate) use bitflags::bitflags;
pub(crate) use lazy_static::lazy_static;
pub(crate) use log::{debug, error, info, trace, warn};

pub(crate) use crate::error::{Errno, Error};
pub(crate) type Result<T> = core::result::Result<T, Error>;
pub(crate) use crate::{return_errno, return_errno_with_message};

/// The current process. Panics on pure kernel threads.
#[macro_export]
macro_rules! current {
    () => {
        $crate::process::current()
    };
}

/// The current thread's kernel-side object.
#[macro_export]
macro_rules! current_thread {
    () => {
        $crate::thread::Thread::current()
    };
}

pub(crate) use crate::{current, current_thread};
