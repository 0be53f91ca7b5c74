#![allow(unused)]

use log::Level;

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SIZE_BITS: usize = 12;
pub const ENTRY_COUNT: usize = 512;

/// Kernel stacks are 64 KiB; the top holds the syscall/trap frames.
pub const KERNEL_STACK_SIZE: usize = PAGE_SIZE * 16;

/// The static heap arena the allocator starts from before it can rescue
/// itself with frame-pool pages.
pub const KERNEL_HEAP_SIZE: usize = 0x80_0000;

/// Base of the kernel image mapping. The image lives in the top-level
/// slot just below the recursive one, which owns the very last slot.
pub const KERNEL_OFFSET: usize = 0xFFFF_FF00_0000_0000;

/// Base of the area where usable physical memory is mapped consecutively.
/// Regions are packed one after another here; translation back to physical
/// addresses goes through the frame pool's region list.
pub const VIRT_MAP_BASE: usize = 0xFFFF_A000_0000_0000;

/// First virtual address handed out by `alloc_virtual` (MMIO windows and
/// other never-freed mappings); grows upward, after the direct map.
pub const VIRT_ALLOC_BASE: usize = 0xFFFF_C000_0000_0000;

/// Lowest address of the shared kernel half; top-level entries at and above
/// this are identical in every translation root.
pub const KERNEL_HALF_BASE: usize = 0xFFFF_8000_0000_0000;

/// The self-referential slot in the top-level table.
pub const RECURSIVE_INDEX: usize = 511;

/// Userspace addresses are at most 44 bits so that an address right-shifted
/// by 12 fits the 32-bit page index the mapping tree is keyed by.
pub const USER_ADDR_MAX: usize = 1 << 44;

pub const MAX_CPUS: usize = 64;

/// Scheduler quantum in nanoseconds.
pub const SCHED_QUANTUM_NANOS: u64 = 35_000_000;

/// Number of priority bands per runqueue. Band 0 is the most urgent and is
/// reserved for system threads (timer expiry, cleanup) so user load cannot
/// starve them.
pub const SCHED_NUM_BANDS: usize = 4;

pub const DEFAULT_LOG_LEVEL: Level = Level::Info;

/// Low-memory layout used while bootstrapping application processors.
pub const AP_TRAMPOLINE_CODE: usize = 0xA000;
pub const AP_TRAMPOLINE_DATA: usize = 0xB000;
