//! Ordered kernel initialization actions.
//!
//! Subsystems declare a named init action with the names of the actions
//! that must run first; the declarations land in the `.kinit_array` link
//! section (bracketed by `__kinit_array`/`__kinit_array_end` in the
//! linker script) and the boot CPU runs them once, in a topological
//! order of the declared dependencies.
//!
//! ```ignore
//! fn vfs_init() { /* ... */ }
//! kernel_init_action!(KIA_VFS, vfs_init, KIA_FRAME_POOL);
//! ```

use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, Ordering};

/// One declared init action.
pub struct InitAction {
    pub name: &'static str,
    pub func: fn(),
    pub deps: &'static [&'static str],
    pub started: AtomicBool,
}

impl InitAction {
    pub const fn new(name: &'static str, func: fn(), deps: &'static [&'static str]) -> Self {
        Self {
            name,
            func,
            deps,
            started: AtomicBool::new(false),
        }
    }
}

/// Declares an init action: a name constant, the function, then zero or
/// more names of actions it depends on.
#[macro_export]
macro_rules! kernel_init_action {
    ($name:expr, $func:ident $(, $dep:expr)* $(,)?) => {
        const _: () = {
            #[used]
            #[link_section = ".kinit_array"]
            static ACTION: $crate::init_action::InitAction =
                $crate::init_action::InitAction::new($name, $func, &[$($dep),*]);
        };
    };
}

fn actions() -> &'static [InitAction] {
    extern "C" {
        fn __kinit_array();
        fn __kinit_array_end();
    }
    let len = (__kinit_array_end as usize - __kinit_array as usize)
        / core::mem::size_of::<InitAction>();
    // Safety: the section consists solely of `InitAction` values emitted
    // by the macro above.
    unsafe { core::slice::from_raw_parts(__kinit_array as *const InitAction, len) }
}

fn run_one(all: &[InitAction], action: &InitAction, depth: usize) {
    assert!(depth < all.len() + 1, "init-action dependency cycle");
    if action.started.swap(true, Ordering::SeqCst) {
        return;
    }
    for dep in action.deps {
        let dep_action = all
            .iter()
            .find(|a| a.name == *dep)
            .unwrap_or_else(|| panic!("init action {:?} depends on unknown {:?}", action.name, dep));
        run_one(all, dep_action, depth + 1);
    }
    log::info!("init: {}", action.name);
    (action.func)();
}

/// Runs every registered action exactly once, dependencies first.
pub fn run_init_actions() {
    let all = actions();
    // Stable order for actions with no ordering constraint between them.
    let mut order: Vec<&InitAction> = all.iter().collect();
    order.sort_by_key(|action| action.name);
    for action in order {
        run_one(all, action, 0);
    }
}
