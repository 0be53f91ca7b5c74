//! The physical frame pool.
//!
//! Usable memory from the boot map is mapped consecutively into the
//! direct-map area and carved into power-of-two blocks kept on
//! address-ordered free lists, one list per size class. The list links
//! live at the head of each free block, so coalescing a buddy is a walk
//! of the class list and fragmentation stays bounded without a bitmap.
//!
//! Besides plain free memory, callers can permit *reclaim*: when the free
//! lists cannot satisfy a request, registered reclaimers (the page cache
//! and the inode cache) are asked to evict until the request fits. The
//! pool mask of a request says which reclaimers may run, so the caches
//! cannot recurse into evicting themselves while allocating.

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Once;

use crate::boot;
use crate::boot::memory_region::MemoryRegionType;
use crate::config::{PAGE_SIZE, VIRT_ALLOC_BASE, VIRT_MAP_BASE};
use crate::sync::SpinLock;
use crate::task::Task;
use crate::vm::page_table;
use crate::vm::{Paddr, Vaddr};

/// Size classes hold blocks of `1 << (6 + class)` bytes.
pub const NUM_CLASSES: usize = 32;
/// The class whose blocks are exactly one page.
pub const PAGE_CLASS: usize = 6;

bitflags::bitflags! {
    /// Which reserves may be tapped to satisfy an allocation. `UNUSED` is
    /// plain free memory; the other bits permit evicting from the named
    /// cache when free memory runs out.
    pub struct PoolMask: u32 {
        const UNUSED     = 1 << 0;
        const PAGE_CACHE = 1 << 1;
        const INODES     = 1 << 2;
        const ALL        = (1 << 3) - 1;
    }
}

/// Free-list links, living at the head of every free block.
#[repr(C)]
struct FreeHeader {
    prev: *mut FreeHeader,
    next: *mut FreeHeader,
}

/// Per-page metadata for pages handed to userspace.
pub struct UserPageInfo {
    refcount: AtomicU64,
    /// Futex-style waiters on a value inside this page.
    pub blockers: SpinLock<Vec<PageBlocker>>,
}

/// One thread waiting on an 8-byte value inside a user page.
pub struct PageBlocker {
    /// Byte offset of the value within the page.
    pub offset: u64,
    pub compare: u64,
    /// False: wake when the value equals `compare`. True: when it differs.
    pub wait_not_equal: bool,
    pub waiter: Arc<Task>,
}

impl UserPageInfo {
    fn new() -> Self {
        Self {
            refcount: AtomicU64::new(0),
            blockers: SpinLock::new(Vec::new()),
        }
    }
}

/// A contiguous stretch of usable physical memory and its direct mapping.
struct Region {
    virt_base: Vaddr,
    phys_base: Paddr,
    size: usize,
    page_info: Vec<UserPageInfo>,
}

struct Buckets {
    /// Address-sorted doubly-linked free lists, one per class.
    lists: [*mut FreeHeader; NUM_CLASSES],
    /// Bump pointer for never-freed virtual address space.
    next_virtual: Vaddr,
}

// Safety: the raw list pointers are only dereferenced under the pool lock.
unsafe impl Send for Buckets {}

static POOL: SpinLock<Buckets> = SpinLock::new(Buckets {
    lists: [core::ptr::null_mut(); NUM_CLASSES],
    next_virtual: VIRT_ALLOC_BASE,
});

static REGIONS: Once<Vec<Region>> = Once::new();

type Reclaimer = fn() -> bool;

/// Eviction hooks, indexed by pool bit (PAGE_CACHE, INODES).
static RECLAIMERS: SpinLock<[Option<Reclaimer>; 2]> = SpinLock::new([None; 2]);

/// Installs the eviction hook for a reclaimable reserve. The hook returns
/// true if it freed at least one block back into the pool.
pub fn register_reclaimer(mask: PoolMask, reclaimer: Reclaimer) {
    let slot = match mask {
        PoolMask::PAGE_CACHE => 0,
        PoolMask::INODES => 1,
        _ => panic!("not a reclaimable pool"),
    };
    RECLAIMERS.lock_irq_disabled()[slot] = Some(reclaimer);
}

pub const fn class_size(class: usize) -> usize {
    1 << (6 + class)
}

/// The smallest class whose blocks fit `size` bytes.
pub fn class_for_size(size: usize) -> usize {
    let size = size.max(64).next_power_of_two();
    (size.trailing_zeros() as usize) - 6
}

fn class_alignment(class: usize) -> usize {
    class_size(class).min(PAGE_SIZE)
}

/// Builds the direct map and seeds the free lists. Runs once on the boot
/// CPU, before any other pool operation.
pub(crate) fn init() {
    let mut place = boot::first_free_paddr() as Paddr;

    // Pass 1: make sure the three upper table levels exist for the whole
    // span of usable memory, placement-allocating fresh tables from the
    // area right past the kernel image.
    let mut vaddr = VIRT_MAP_BASE;
    for region in boot::memory_regions() {
        if region.typ() != MemoryRegionType::Usable {
            continue;
        }
        let mut covered = 0u64;
        while covered < region.len() {
            // Safety: the addresses walked here lie inside the dedicated
            // direct-map area.
            unsafe { page_table::ensure_tables_placement(vaddr, &mut place) };
            vaddr += 512 * PAGE_SIZE;
            covered += (512 * PAGE_SIZE) as u64;
        }
    }

    // Pass 2: install the leaf mappings, skipping everything below the
    // final placement cursor, and record the regions.
    let mut regions = Vec::new();
    let mut vaddr = VIRT_MAP_BASE;
    for region in boot::memory_regions() {
        if region.typ() != MemoryRegionType::Usable {
            continue;
        }
        let mut base = region.base() as Paddr;
        let mut len = region.len() as usize;
        if place > base {
            let delta = place - base;
            if len < delta {
                continue;
            }
            base += delta;
            len -= delta;
        }
        len &= !(PAGE_SIZE - 1);
        if len == 0 {
            continue;
        }

        log::info!(
            "frame pool: region virt {:#x} <- phys {:#x} ({} KiB)",
            vaddr,
            base,
            len / 1024
        );

        let virt_base = vaddr;
        for page in 0..len / PAGE_SIZE {
            // Safety: pass 1 created the covering tables; the target
            // addresses are inside the direct-map area.
            unsafe { page_table::map_direct_page(vaddr, base + page * PAGE_SIZE) };
            vaddr += PAGE_SIZE;
        }

        let num_pages = len / PAGE_SIZE;
        let mut page_info = Vec::with_capacity(num_pages);
        page_info.resize_with(num_pages, UserPageInfo::new);

        regions.push(Region {
            virt_base,
            phys_base: base,
            size: len,
            page_info,
        });
    }
    page_table::flush_current_root();

    let mem_size = vaddr - VIRT_MAP_BASE;
    log::info!(
        "frame pool: {} MiB of usable memory",
        mem_size / 1024 / 1024
    );

    // Carve the whole (virtually contiguous) direct map into blocks,
    // largest class first, one block per set size bit.
    {
        let mut pool = POOL.lock_irq_disabled();
        let mut cursor = VIRT_MAP_BASE;
        for class in (0..NUM_CLASSES).rev() {
            if (mem_size & class_size(class)) != 0 {
                // Safety: the carved range is mapped and otherwise unused.
                unsafe { release_into_list(&mut pool, cursor as *mut FreeHeader, class) };
                cursor += class_size(class);
            }
        }
    }

    REGIONS.call_once(|| regions);
}

fn regions() -> &'static [Region] {
    REGIONS.get().expect("frame pool not initialized")
}

/// Allocates a block of the given class out of the permitted reserves.
/// Returns the block's direct-map pointer, or `None` when nothing, not
/// even eviction, can produce one.
pub fn alloc_block(class: usize, mask: PoolMask) -> Option<NonNull<u8>> {
    loop {
        {
            let mut pool = POOL.lock_irq_disabled();
            // Safety: list manipulation under the pool lock.
            if let Some(block) = unsafe { alloc_from_list(&mut pool, class) } {
                return Some(block);
            }
        }

        // Free memory is out; ask the permitted caches to give something
        // back, without the pool lock held.
        let reclaimers = *RECLAIMERS.lock_irq_disabled();
        let mut reclaimed = false;
        for (slot, bit) in [(0, PoolMask::PAGE_CACHE), (1, PoolMask::INODES)] {
            if mask.contains(bit) {
                if let Some(reclaim) = reclaimers[slot] {
                    reclaimed |= reclaim();
                }
            }
        }
        if !reclaimed {
            return None;
        }
    }
}

/// Returns a block to the free lists.
///
/// # Safety
///
/// The block must come from `alloc_block` with exactly this class.
pub unsafe fn release_block(block: NonNull<u8>, class: usize) {
    let mut pool = POOL.lock_irq_disabled();
    release_into_list(&mut pool, block.as_ptr() as *mut FreeHeader, class);
}

/// Takes the first block of the class list, or splits a larger block.
unsafe fn alloc_from_list(pool: &mut Buckets, class: usize) -> Option<NonNull<u8>> {
    if class >= NUM_CLASSES {
        return None;
    }
    let head = pool.lists[class];
    if !head.is_null() {
        let next = (*head).next;
        if !next.is_null() {
            (*next).prev = core::ptr::null_mut();
        }
        pool.lists[class] = next;
        return NonNull::new(head as *mut u8);
    }

    // Split one block from the next class up; the lower half is the
    // result, the upper half goes back on this class's list.
    let block = alloc_from_list(pool, class + 1)?;
    let other_half = (block.as_ptr() as usize + class_size(class)) as *mut FreeHeader;
    release_into_list(pool, other_half, class);
    Some(block)
}

/// Inserts a block into its class list in address order, then tries to
/// coalesce buddies upward.
unsafe fn release_into_list(pool: &mut Buckets, block: *mut FreeHeader, class: usize) {
    let head = pool.lists[class];

    // Find the first block past the new one.
    let mut just_after = head;
    while !just_after.is_null() && just_after < block {
        just_after = (*just_after).next;
    }

    if just_after.is_null() {
        // The new block is the last (or only) one.
        if head.is_null() {
            (*block).prev = core::ptr::null_mut();
            (*block).next = core::ptr::null_mut();
            pool.lists[class] = block;
            return;
        }
        let mut last = head;
        while !(*last).next.is_null() {
            last = (*last).next;
        }
        (*block).prev = last;
        (*block).next = core::ptr::null_mut();
        (*last).next = block;
    } else {
        (*block).prev = (*just_after).prev;
        (*block).next = just_after;
        if (*just_after).prev.is_null() {
            pool.lists[class] = block;
        } else {
            (*(*just_after).prev).next = block;
        }
        (*just_after).prev = block;
    }

    merge_buddies(pool, class);
}

/// Looks for two consecutive blocks forming an aligned buddy pair and
/// promotes them one class up.
unsafe fn merge_buddies(pool: &mut Buckets, class: usize) {
    if class == NUM_CLASSES - 1 {
        return;
    }
    let next_alignment = class_alignment(class + 1);
    let this_size = class_size(class);

    let mut obj = pool.lists[class];
    while !obj.is_null() && !(*obj).next.is_null() {
        let addr = obj as usize;
        if addr & (next_alignment - 1) == 0 {
            let expected_next = (addr + this_size) as *mut FreeHeader;
            if (*obj).next == expected_next {
                // Unlink the pair and push the merged block upward.
                let after = (*expected_next).next;
                if (*obj).prev.is_null() {
                    pool.lists[class] = after;
                } else {
                    (*(*obj).prev).next = after;
                }
                if !after.is_null() {
                    (*after).prev = (*obj).prev;
                }
                release_into_list(pool, obj, class + 1);
                return;
            }
        }
        obj = (*obj).next;
    }
}

/// Reserves `size` bytes of virtual address space. Never reclaimed; used
/// for MMIO windows and the framebuffer remap.
pub fn alloc_virtual(size: usize) -> Vaddr {
    let size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let mut pool = POOL.lock_irq_disabled();
    let result = pool.next_virtual;
    pool.next_virtual += size;
    result
}

/// Direct-map translation; linear search of the regions.
pub fn phys_to_virt(paddr: Paddr) -> Option<Vaddr> {
    regions().iter().find_map(|region| {
        (paddr >= region.phys_base && paddr < region.phys_base + region.size)
            .then(|| paddr - region.phys_base + region.virt_base)
    })
}

/// The reverse translation for direct-map pointers.
pub fn virt_to_phys(vaddr: Vaddr) -> Option<Paddr> {
    regions().iter().find_map(|region| {
        (vaddr >= region.virt_base && vaddr < region.virt_base + region.size)
            .then(|| vaddr - region.virt_base + region.phys_base)
    })
}

/// Per-page metadata for a direct-map pointer into a region.
pub fn user_page_info(vaddr: Vaddr) -> Option<&'static UserPageInfo> {
    regions().iter().find_map(|region| {
        (vaddr >= region.virt_base && vaddr < region.virt_base + region.size)
            .then(|| &region.page_info[(vaddr - region.virt_base) >> 12])
    })
}

/// Allocates one user page with a refcount of 1, zeroed.
pub fn alloc_user_page() -> Option<NonNull<u8>> {
    alloc_user_page_from(PoolMask::ALL)
}

/// As `alloc_user_page`, but restricted to the given reserves. The
/// caches use this to avoid evicting themselves while they allocate.
pub fn alloc_user_page_from(mask: PoolMask) -> Option<NonNull<u8>> {
    let page = alloc_block(PAGE_CLASS, mask)?;
    let info = user_page_info(page.as_ptr() as usize).expect("fresh page outside every region");
    info.refcount.store(1, Ordering::SeqCst);
    // Safety: the page was just allocated and is exclusively ours.
    unsafe { core::ptr::write_bytes(page.as_ptr(), 0, PAGE_SIZE) };
    Some(page)
}

/// Takes another reference to a user page.
pub fn user_page_dup(vaddr: Vaddr) -> Vaddr {
    let info = user_page_info(vaddr).expect("not a user page");
    info.refcount.fetch_add(1, Ordering::SeqCst);
    vaddr
}

/// Drops a reference; the page returns to the free lists exactly when the
/// count reaches zero.
pub fn user_page_unref(vaddr: Vaddr) {
    let info = user_page_info(vaddr).expect("not a user page");
    if info.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
        // Safety: the last reference is gone and the page came from
        // `alloc_user_page`.
        unsafe {
            release_block(
                NonNull::new(vaddr as *mut u8).unwrap(),
                PAGE_CLASS,
            )
        };
    }
}

/// Current refcount of a user page, for the fork/CoW decisions.
pub fn user_page_refcount(vaddr: Vaddr) -> u64 {
    user_page_info(vaddr)
        .expect("not a user page")
        .refcount
        .load(Ordering::SeqCst)
}

#[if_cfg_ktest]
mod test {
    use super::*;

    #[ktest]
    fn class_sizing() {
        assert_eq!(class_size(0), 64);
        assert_eq!(class_size(PAGE_CLASS), PAGE_SIZE);
        assert_eq!(class_for_size(1), 0);
        assert_eq!(class_for_size(64), 0);
        assert_eq!(class_for_size(65), 1);
        assert_eq!(class_for_size(PAGE_SIZE), PAGE_CLASS);
        assert_eq!(class_for_size(PAGE_SIZE * 16), PAGE_CLASS + 4);
    }

    #[ktest]
    fn split_and_coalesce_round_trip() {
        // Two page-sized blocks out of the pool: distinct, page-aligned.
        let a = alloc_block(PAGE_CLASS, PoolMask::UNUSED).unwrap();
        let b = alloc_block(PAGE_CLASS, PoolMask::UNUSED).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(b.as_ptr() as usize % PAGE_SIZE, 0);
        unsafe {
            release_block(b, PAGE_CLASS);
            release_block(a, PAGE_CLASS);
        }
    }

    #[ktest]
    fn user_page_refcounting() {
        let page = alloc_user_page().unwrap();
        let va = page.as_ptr() as usize;
        assert_eq!(user_page_refcount(va), 1);
        user_page_dup(va);
        assert_eq!(user_page_refcount(va), 2);
        user_page_unref(va);
        assert_eq!(user_page_refcount(va), 1);
        user_page_unref(va);
    }
}
