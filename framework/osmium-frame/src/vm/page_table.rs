//! Four-level page tables addressed through the recursive self-map.
//!
//! The last top-level slot of every translation root points back at the
//! root itself. That makes the table node of any level, for any virtual
//! address, reachable at an address derived from the original one by a
//! constant shift — no walker that chases physical pointers is needed for
//! the current root. The three pointer transforms below are the only
//! place the recursion invariant is relied on; everything else goes
//! through them.
//!
//! Foreign (not currently loaded) roots are edited through the direct
//! map instead, which the frame pool guarantees covers every table ever
//! allocated from it.

use core::ptr::NonNull;

use spin::Once;
use x86_64::registers::control::Cr3;

use crate::arch::x86::mm::{
    page_index, tlb_flush, tlb_flush_all, PageTableEntry, PteFlags, PTE_ADDR_MASK,
};
use crate::config::{ENTRY_COUNT, KERNEL_HALF_BASE, PAGE_SIZE, RECURSIVE_INDEX, USER_ADDR_MAX};
use crate::cpu;
use crate::error::Error;
use crate::prelude::Result;
use crate::vm::{frame_pool, Paddr, Vaddr};

/// Top-level slot holding the shared userspace-auxiliary window (the
/// signal-return trampoline). Sits right past the 44-bit user area.
pub const AUX_PML4_INDEX: usize = 32;
/// First virtual address covered by the auxiliary slot.
pub const USER_AUX_BASE: Vaddr = AUX_PML4_INDEX << 39;

bitflags::bitflags! {
    /// Caller-facing mapping flags; translated onto PTE bits here.
    pub struct MapFlags: u64 {
        const WRITE     = 1 << 0;
        const USER      = 1 << 1;
        const NO_CACHE  = 1 << 2;
        const EXEC      = 1 << 3;
    }
}

impl MapFlags {
    fn pte_flags(self) -> PteFlags {
        let mut flags = PteFlags::PRESENT;
        if self.contains(MapFlags::WRITE) {
            flags |= PteFlags::WRITE;
        }
        if self.contains(MapFlags::USER) {
            flags |= PteFlags::USER;
        }
        if self.contains(MapFlags::NO_CACHE) {
            flags |= PteFlags::NO_CACHE;
        }
        if !self.contains(MapFlags::EXEC) {
            flags |= PteFlags::NO_EXECUTE;
        }
        flags
    }
}

/// An owned translation root for a user address space.
///
/// Dropping it frees the user-half interior tables and the root frame;
/// the leaf pages must have been unreferenced by the owner first.
pub struct PageTableRoot {
    paddr: Paddr,
}

static KERNEL_ROOT: Once<Paddr> = Once::new();
/// Permanent window onto the kernel root frame, which lives in boot
/// memory outside the direct map.
static KERNEL_ROOT_WINDOW: Once<Vaddr> = Once::new();

/// Sign-extension and the three constant-shift transforms of the
/// recursive map. `level` 1 is the leaf table, 4 the root.
fn recursive_pte_vaddr(vaddr: Vaddr, level: usize) -> Vaddr {
    const R: usize = RECURSIVE_INDEX;
    // Canonical 48-bit form, without the sign bits.
    let va = vaddr & 0x0000_FFFF_FFFF_F000;
    let addr = match level {
        1 => (R << 39) | (va >> 9),
        2 => (R << 39) | (R << 30) | (va >> 18),
        3 => (R << 39) | (R << 30) | (R << 21) | (va >> 27),
        4 => (R << 39) | (R << 30) | (R << 21) | (R << 12) | (va >> 36),
        _ => unreachable!(),
    };
    // Entries are 8 bytes; clear the low 3 bits the shifts dragged in,
    // then sign-extend.
    let addr = addr & !0x7;
    addr | 0xFFFF_0000_0000_0000
}

/// Pointer to the entry of the given level for `vaddr`, in the current
/// root, via the recursive map.
///
/// # Safety
///
/// The entry is only a valid pointer if all the levels above it are
/// present.
unsafe fn node_entry(vaddr: Vaddr, level: usize) -> *mut PageTableEntry {
    let table = recursive_pte_vaddr(vaddr, level);
    (table | (page_index(vaddr, level) << 3)) as *mut PageTableEntry
}

pub(crate) fn init() {
    let (frame, _) = Cr3::read();
    let root = frame.start_address().as_u64() as Paddr;
    KERNEL_ROOT.call_once(|| root);

    // Pre-populate every kernel-half top-level slot (except the recursive
    // one) so that cloned roots share the interior tables forever after;
    // a kernel mapping made later is then visible in every address space
    // without fixups.
    for index in ENTRY_COUNT / 2..RECURSIVE_INDEX {
        let slot_vaddr = 0xFFFF_0000_0000_0000 | (index << 39);
        // Safety: level-4 entries are always reachable via the recursion.
        let entry = unsafe { &mut *node_entry(slot_vaddr, 4) };
        if !entry.is_present() {
            let table = alloc_table_frame().expect("out of memory pre-populating kernel half");
            entry.update(table, PteFlags::PRESENT | PteFlags::WRITE);
        }
    }
    tlb_flush_all();

    let window =
        map_phys(root, PAGE_SIZE, MapFlags::WRITE).expect("failed to window the kernel root");
    KERNEL_ROOT_WINDOW.call_once(|| window);
}

/// The kernel root as a live table slice.
///
/// # Safety
///
/// Concurrent mutation is only the well-ordered boot-time population of
/// kernel-half slots; after that the upper half is effectively immutable.
unsafe fn kernel_root_table<'a>() -> &'a mut [PageTableEntry] {
    let vaddr = *KERNEL_ROOT_WINDOW.get().expect("kernel root not windowed");
    core::slice::from_raw_parts_mut(vaddr as *mut PageTableEntry, ENTRY_COUNT)
}

pub fn kernel_root() -> Paddr {
    *KERNEL_ROOT.get().expect("page tables not initialized")
}

/// Publishes the new root on this CPU's descriptor, then loads it. The
/// publish-before-load order is what keeps shootdown senders from missing
/// us: they read the published value.
pub fn set_root(root: Paddr) {
    cpu::publish_current_root(root);
    // Safety: the root came from `kernel_root` or `PageTableRoot`.
    unsafe {
        Cr3::write(
            x86_64::structures::paging::PhysFrame::containing_address(x86_64::PhysAddr::new(
                root as u64,
            )),
            x86_64::registers::control::Cr3Flags::empty(),
        );
    }
}

pub fn get_root() -> Paddr {
    Cr3::read().0.start_address().as_u64() as Paddr
}

pub(crate) fn flush_current_root() {
    tlb_flush_all();
}

/// Allocates and zeroes one interior table, returning its physical base.
fn alloc_table_frame() -> Option<Paddr> {
    let block = frame_pool::alloc_block(frame_pool::PAGE_CLASS, frame_pool::PoolMask::ALL)?;
    // Safety: freshly allocated, page-sized.
    unsafe { core::ptr::write_bytes(block.as_ptr(), 0, PAGE_SIZE) };
    frame_pool::virt_to_phys(block.as_ptr() as usize)
}

/// Walks levels 4..2 for `vaddr` in the current root, creating missing
/// interior tables. New tables covering user addresses get the USER bit.
fn ensure_tables(vaddr: Vaddr) -> Result<()> {
    let user = vaddr < KERNEL_HALF_BASE;
    for level in (2..=4).rev() {
        // Safety: higher levels were ensured by previous iterations.
        let entry = unsafe { &mut *node_entry(vaddr, level) };
        if !entry.is_present() {
            let table = alloc_table_frame().ok_or(Error::NoMemory)?;
            let mut flags = PteFlags::PRESENT | PteFlags::WRITE;
            if user {
                flags |= PteFlags::USER;
            }
            entry.update(table, flags);
            // The freshly-exposed node address may have a stale TLB entry.
            // Safety: computing the address has no side effects.
            tlb_flush(unsafe { node_entry(vaddr, level - 1) } as Vaddr & !(PAGE_SIZE - 1));
        }
    }
    Ok(())
}

/// Maps `[vaddr, vaddr + size)` to `[paddr, ...)` in the current root and
/// shoots down every CPU sharing it.
///
/// Misaligned inputs are invalid arguments; table allocation failure is
/// out-of-memory.
pub fn map_kernel(vaddr: Vaddr, paddr: Paddr, size: usize, flags: MapFlags) -> Result<()> {
    if vaddr % PAGE_SIZE != 0 || paddr % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
        return Err(Error::InvalidArgs);
    }
    let pte_flags = flags.pte_flags();
    for offset in (0..size).step_by(PAGE_SIZE) {
        let va = vaddr + offset;
        ensure_tables(va)?;
        // Safety: `ensure_tables` made every level above the leaf present.
        let entry = unsafe { &mut *node_entry(va, 1) };
        entry.update(paddr + offset, pte_flags);
        tlb_flush(va);
        cpu::shootdown_page(get_root(), va);
    }
    Ok(())
}

/// Reserves virtual space and maps an arbitrary physical range into it.
/// The physical base does not need any alignment.
pub fn map_phys(paddr: Paddr, size: usize, flags: MapFlags) -> Result<Vaddr> {
    let page_base = paddr & !(PAGE_SIZE - 1);
    let offset = paddr - page_base;
    let map_size = (size + offset + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let vaddr = frame_pool::alloc_virtual(map_size);
    map_kernel(vaddr, page_base, map_size, flags)?;
    Ok(vaddr + offset)
}

/// Reads the leaf mapping for `vaddr` in the current root.
pub fn get_phys(vaddr: Vaddr) -> Option<Paddr> {
    for level in (2..=4).rev() {
        // Safety: presence is checked top-down, so the node address is
        // valid by the time it is dereferenced.
        let entry = unsafe { &*node_entry(vaddr, level) };
        if !entry.is_present() {
            return None;
        }
    }
    // Safety: all upper levels are present.
    let entry = unsafe { &*node_entry(vaddr, 1) };
    entry
        .is_present()
        .then(|| entry.paddr() + (vaddr & (PAGE_SIZE - 1)))
}

// ---------------------------------------------------------------------
// User-half PTEs of the current root.
// ---------------------------------------------------------------------

fn check_user_addr(vaddr: Vaddr) -> Result<()> {
    if vaddr >= USER_ADDR_MAX {
        return Err(Error::InvalidArgs);
    }
    Ok(())
}

/// Reads the leaf entry for a user address in the current root.
pub fn user_pte_get(vaddr: Vaddr) -> Option<PageTableEntry> {
    check_user_addr(vaddr).ok()?;
    for level in (2..=4).rev() {
        // Safety: presence checked top-down.
        let entry = unsafe { &*node_entry(vaddr, level) };
        if !entry.is_present() {
            return None;
        }
    }
    // Safety: all upper levels present.
    let entry = unsafe { *node_entry(vaddr, 1) };
    (!entry.is_unused()).then_some(entry)
}

/// Installs a leaf entry for a user address in the current root.
pub fn user_pte_set(vaddr: Vaddr, pte: PageTableEntry) -> Result<()> {
    check_user_addr(vaddr)?;
    ensure_tables(vaddr)?;
    // Safety: `ensure_tables` succeeded.
    unsafe { *node_entry(vaddr, 1) = pte };
    tlb_flush(vaddr);
    cpu::shootdown_page(get_root(), vaddr);
    Ok(())
}

/// Rewrites a present leaf entry in place, returning the previous value.
pub fn user_pte_update(
    vaddr: Vaddr,
    f: impl FnOnce(PageTableEntry) -> PageTableEntry,
) -> Option<PageTableEntry> {
    check_user_addr(vaddr).ok()?;
    for level in (2..=4).rev() {
        // Safety: presence checked top-down.
        let entry = unsafe { &*node_entry(vaddr, level) };
        if !entry.is_present() {
            return None;
        }
    }
    // Safety: all upper levels present.
    let entry = unsafe { &mut *node_entry(vaddr, 1) };
    if entry.is_unused() {
        return None;
    }
    let old = *entry;
    *entry = f(old);
    tlb_flush(vaddr);
    cpu::shootdown_page(get_root(), vaddr);
    Some(old)
}

/// Clears a leaf entry, returning what was there.
pub fn user_pte_clear(vaddr: Vaddr) -> Option<PageTableEntry> {
    user_pte_update(vaddr, |_| PageTableEntry::empty())
        .filter(|old| !old.is_unused())
}

// ---------------------------------------------------------------------
// Foreign roots (not currently loaded), walked through the direct map.
// ---------------------------------------------------------------------

/// Table slice at a physical address, via the direct map.
///
/// # Safety
///
/// `paddr` must be a table frame allocated from the pool (or the shared
/// kernel root), and the caller must hold it exclusively.
unsafe fn table_of<'a>(paddr: Paddr) -> &'a mut [PageTableEntry] {
    let vaddr = crate::vm::paddr_to_vaddr_checked(paddr);
    core::slice::from_raw_parts_mut(vaddr as *mut PageTableEntry, ENTRY_COUNT)
}

impl PageTableRoot {
    /// Creates a root for a new address space: empty user half, the
    /// shared auxiliary slot and kernel half copied from the kernel root,
    /// and the self-reference installed last.
    pub fn new_user() -> Result<Self> {
        let root = alloc_table_frame().ok_or(Error::NoMemory)?;
        // Safety: `root` is fresh and exclusively ours; the kernel root's
        // upper half is immutable after init.
        unsafe {
            let new = table_of(root);
            let kernel = kernel_root_table();
            new[AUX_PML4_INDEX] = kernel[AUX_PML4_INDEX];
            for index in ENTRY_COUNT / 2..RECURSIVE_INDEX {
                new[index] = kernel[index];
            }
            new[RECURSIVE_INDEX] =
                PageTableEntry::new(root, PteFlags::PRESENT | PteFlags::WRITE);
        }
        Ok(Self { paddr: root })
    }

    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    /// Reads a leaf entry without this root being loaded.
    pub fn get_page(&self, vaddr: Vaddr) -> Option<PageTableEntry> {
        check_user_addr(vaddr).ok()?;
        let mut table_pa = self.paddr;
        for level in (2..=4).rev() {
            // Safety: tables reached from our root are owned by us.
            let table = unsafe { table_of(table_pa) };
            let entry = table[page_index(vaddr, level)];
            if !entry.is_present() {
                return None;
            }
            table_pa = entry.paddr();
        }
        // Safety: as above.
        let entry = unsafe { table_of(table_pa) }[page_index(vaddr, 1)];
        (!entry.is_unused()).then_some(entry)
    }

    /// Installs a leaf entry without this root being loaded, growing
    /// interior tables as needed.
    pub fn map_page(&self, vaddr: Vaddr, pte: PageTableEntry) -> Result<()> {
        check_user_addr(vaddr)?;
        let mut table_pa = self.paddr;
        for level in (2..=4).rev() {
            // Safety: tables reached from our root are owned by us.
            let table = unsafe { table_of(table_pa) };
            let entry = &mut table[page_index(vaddr, level)];
            if !entry.is_present() {
                let fresh = alloc_table_frame().ok_or(Error::NoMemory)?;
                entry.update(
                    fresh,
                    PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER,
                );
            }
            table_pa = entry.paddr();
        }
        // Safety: as above.
        let table = unsafe { table_of(table_pa) };
        table[page_index(vaddr, 1)] = pte;
        Ok(())
    }
}

impl Drop for PageTableRoot {
    fn drop(&mut self) {
        // Free the user-half interior tables; the leaf frames are
        // refcounted elsewhere and must already be unreferenced.
        fn free_level(table_pa: Paddr, level: usize) {
            // Safety: tables below a dying root are exclusively owned.
            let table = unsafe { table_of(table_pa) };
            for entry in table.iter() {
                if entry.is_present() && level > 2 {
                    free_level(entry.paddr(), level - 1);
                }
                if entry.is_present() && level >= 2 {
                    free_table_frame(entry.paddr());
                }
            }
        }

        // Safety: ditto.
        let top = unsafe { table_of(self.paddr) };
        for index in 0..AUX_PML4_INDEX {
            let entry = top[index];
            if entry.is_present() {
                free_level(entry.paddr(), 3);
                free_table_frame(entry.paddr());
            }
        }
        free_table_frame(self.paddr);
    }
}

fn free_table_frame(paddr: Paddr) {
    let vaddr = crate::vm::paddr_to_vaddr_checked(paddr);
    // Safety: table frames come from `alloc_table_frame`, page class.
    unsafe {
        frame_pool::release_block(
            NonNull::new(vaddr as *mut u8).unwrap(),
            frame_pool::PAGE_CLASS,
        )
    };
}

// ---------------------------------------------------------------------
// Early bootstrap, used by frame_pool::init before the pool exists.
// ---------------------------------------------------------------------

/// Ensures the three upper levels for `vaddr` exist, allocating fresh
/// zeroed tables by bumping the physical placement cursor.
///
/// # Safety
///
/// Only for the direct-map bootstrap: the placement cursor must point at
/// physical memory not used for anything else, identity-reachable through
/// the boot root's recursive map.
pub(crate) unsafe fn ensure_tables_placement(vaddr: Vaddr, place: &mut Paddr) {
    for level in (2..=4).rev() {
        let entry = &mut *node_entry(vaddr, level);
        if !entry.is_present() {
            let fresh = *place;
            *place += PAGE_SIZE;
            entry.update(
                fresh,
                PteFlags::PRESENT | PteFlags::WRITE | PteFlags::NO_EXECUTE,
            );
            let node_page = node_entry(vaddr, level - 1) as Vaddr & !(PAGE_SIZE - 1);
            tlb_flush(node_page);
            core::ptr::write_bytes(node_page as *mut u8, 0, PAGE_SIZE);
        }
    }
}

/// Writes one direct-map leaf PTE. Upper tables must exist.
///
/// # Safety
///
/// Direct-map bootstrap only; see `ensure_tables_placement`.
pub(crate) unsafe fn map_direct_page(vaddr: Vaddr, paddr: Paddr) {
    let entry = &mut *node_entry(vaddr, 1);
    entry.update(
        paddr,
        PteFlags::PRESENT | PteFlags::WRITE | PteFlags::NO_EXECUTE,
    );
}

#[if_cfg_ktest]
mod test {
    use super::*;

    #[ktest]
    fn recursive_transforms_agree_with_indices() {
        // The recursive address of the level-1 entry advances by 8 bytes
        // per page, and by one page per level-2 entry.
        let a = recursive_pte_vaddr(0x1000, 1) | (page_index(0x1000, 1) << 3);
        let b = recursive_pte_vaddr(0x2000, 1) | (page_index(0x2000, 1) << 3);
        assert_eq!(b - a, 8);
        assert_eq!(recursive_pte_vaddr(0, 4) & 0xFFF, 0);
    }

    #[ktest]
    fn kernel_map_rejects_misalignment() {
        assert_eq!(
            map_kernel(0x123, 0x2000, PAGE_SIZE, MapFlags::WRITE),
            Err(crate::Error::InvalidArgs)
        );
    }

    #[ktest]
    fn map_phys_round_trip() {
        // Map some physical page and read it back through the window.
        let page = crate::vm::frame_pool::alloc_user_page().unwrap();
        let pa = crate::vm::frame_pool::virt_to_phys(page.as_ptr() as usize).unwrap();
        unsafe { (page.as_ptr() as *mut u64).write(0xC0FFEE) };
        let window = map_phys(pa, 8, MapFlags::empty()).unwrap();
        assert_eq!(unsafe { *(window as *const u64) }, 0xC0FFEE);
        crate::vm::frame_pool::user_page_unref(page.as_ptr() as usize);
    }
}
