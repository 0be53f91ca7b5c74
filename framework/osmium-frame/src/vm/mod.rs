//! Physical and virtual memory management.

pub mod frame_pool;
pub mod heap_allocator;
pub mod page_table;

pub use frame_pool::{
    alloc_user_page, user_page_dup, user_page_unref, PoolMask, UserPageInfo,
};
pub use page_table::{MapFlags, PageTableRoot};

/// A physical address.
pub type Paddr = usize;
/// A virtual address.
pub type Vaddr = usize;

/// Translates a physical address inside a usable region to its direct-map
/// virtual address. Returns `None` for addresses outside every region
/// (the kernel image, MMIO holes).
pub fn paddr_to_vaddr(paddr: Paddr) -> Option<Vaddr> {
    frame_pool::phys_to_virt(paddr)
}

/// Direct-map translation for addresses the caller knows are in a region.
#[track_caller]
pub fn paddr_to_vaddr_checked(paddr: Paddr) -> Vaddr {
    paddr_to_vaddr(paddr).expect("physical address outside every usable region")
}
