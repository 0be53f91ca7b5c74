//! A minimal in-kernel unit-test harness for `#![no_std]` crates.
//!
//! Tests are plain `fn() -> ()` items marked with `#[ktest]` inside an
//! `#[if_cfg_ktest] mod test` block. The macro places a descriptor in the
//! `.ktest_array` link section; the kernel linker script brackets that
//! section with `__ktest_array` / `__ktest_array_end`, and [`run_ktests`]
//! walks it after the kernel services come up. A failing assertion panics,
//! which the kernel panic path reports with the test's full path.
//!
//! ```ignore
//! #[if_cfg_ktest]
//! mod test {
//!     #[ktest]
//!     fn trivial_assertion() {
//!         assert_eq!(0, 0);
//!     }
//! }
//! ```

#![no_std]

pub use ktest_proc_macro::{if_cfg_ktest, ktest};
use log::info;

/// A registered kernel test.
pub struct KtestItem {
    fn_: fn() -> (),
    path: &'static str,
}

impl KtestItem {
    pub const fn new(fn_: fn() -> (), path: &'static str) -> Self {
        Self { fn_, path }
    }

    pub fn path(&self) -> &'static str {
        self.path
    }

    pub fn run(&self) {
        (self.fn_)();
    }
}

fn ktest_array() -> &'static [KtestItem] {
    extern "C" {
        fn __ktest_array();
        fn __ktest_array_end();
    }
    let len = (__ktest_array_end as usize - __ktest_array as usize)
        / core::mem::size_of::<KtestItem>();
    // Safety: the two linker symbols bracket a section consisting solely of
    // `KtestItem` values emitted by the `#[ktest]` macro.
    unsafe { core::slice::from_raw_parts(__ktest_array as *const KtestItem, len) }
}

/// Runs every registered test, logging each one. Panics on the first
/// failure, leaving the failing test named in the panic message.
pub fn run_ktests() -> usize {
    let tests = ktest_array();
    for (i, test) in tests.iter().enumerate() {
        info!("[ktest] {}/{}: {}", i + 1, tests.len(), test.path());
        test.run();
    }
    info!("[ktest] {} tests passed", tests.len());
    tests.len()
}
