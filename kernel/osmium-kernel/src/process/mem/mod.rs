//! Process address spaces: mapping descriptors, mmap/munmap/mprotect,
//! demand paging, copy-on-write, and the fork-time clone.
//!
//! A mapping descriptor is immutable; the tree maps every page index of
//! a mapped range to a shared descriptor. The page-level state (present,
//! protection, copy-on-write) lives in the leaf PTEs: the three software
//! protection bits record what the mapping allows even while the
//! hardware write bit is clear, which is exactly what copy-on-write and
//! demand paging key off.

use align_ext::AlignExt;
use osmium_frame::arch::x86::mm::{PageTableEntry, PteFlags};
use osmium_frame::config::USER_ADDR_MAX;
use osmium_frame::vm::{self, frame_pool, page_table, PageTableRoot};

use crate::fs::vfs::inode::Inode;
use crate::fs::vfs::file::OpenFlags;
use crate::prelude::*;
use crate::process::signal::sig_info::{SigInfo, SEGV_ACCERR, SEGV_MAPERR};
use crate::process::signal::sig_num::SIGSEGV;

bitflags! {
    pub struct ProtFlags: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

bitflags! {
    pub struct MmapFlags: u32 {
        const PRIVATE = 1 << 0;
        const SHARED  = 1 << 1;
        const ANON    = 1 << 2;
        const FIXED   = 1 << 3;
    }
}

/// Where automatic (non-fixed) mappings are placed.
const MMAP_AUTO_BASE: Vaddr = 0x0800_0000_0000;

/// Access kinds a page fault may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    Exec,
}

/// An immutable description of one mmap call. Shared (via `Arc`) by all
/// the pages the call covered; dropped when the last page goes away.
pub struct MappingDesc {
    /// Backing inode; `None` for anonymous memory.
    inode: Option<Arc<Inode>>,
    /// The open flags of the description the mapping was made through.
    oflags: OpenFlags,
    /// User address corresponding to `offset`.
    addr: Vaddr,
    /// File offset corresponding to `addr`.
    offset: u64,
    flags: MmapFlags,
}

impl MappingDesc {
    fn is_private(&self) -> bool {
        self.flags.contains(MmapFlags::PRIVATE)
    }

    fn is_anon(&self) -> bool {
        self.flags.contains(MmapFlags::ANON)
    }

    /// File offset backing the page at `vaddr`.
    fn offset_of(&self, vaddr: Vaddr) -> u64 {
        self.offset + (vaddr - self.addr) as u64
    }
}

/// One process's user address space.
pub struct AddressSpace {
    root: PageTableRoot,
    /// Page index (user address >> 12) to mapping descriptor.
    mappings: Mutex<BTreeMap<usize, Arc<MappingDesc>>>,
}

fn prot_to_pte_bits(prot: ProtFlags) -> PteFlags {
    let mut bits = PteFlags::empty();
    if prot.contains(ProtFlags::READ) {
        bits |= PteFlags::PROT_READ;
    }
    if prot.contains(ProtFlags::WRITE) {
        bits |= PteFlags::PROT_WRITE;
    }
    if prot.contains(ProtFlags::EXEC) {
        bits |= PteFlags::PROT_EXEC;
    }
    bits
}

fn pte_prot(pte: PageTableEntry) -> ProtFlags {
    let flags = pte.flags();
    let mut prot = ProtFlags::empty();
    if flags.contains(PteFlags::PROT_READ) {
        prot |= ProtFlags::READ;
    }
    if flags.contains(PteFlags::PROT_WRITE) {
        prot |= ProtFlags::WRITE;
    }
    if flags.contains(PteFlags::PROT_EXEC) {
        prot |= ProtFlags::EXEC;
    }
    prot
}

/// Hardware bits for a present user page under the given logical
/// protection. `cow` forces the hardware write bit off.
fn present_pte_flags(prot: ProtFlags, cow: bool) -> PteFlags {
    let mut flags = PteFlags::PRESENT | PteFlags::USER | prot_to_pte_bits(prot);
    if prot.contains(ProtFlags::WRITE) && !cow {
        flags |= PteFlags::WRITE;
    }
    if cow {
        flags |= PteFlags::COW;
    }
    if !prot.contains(ProtFlags::EXEC) {
        flags |= PteFlags::NO_EXECUTE;
    }
    flags
}

fn segv(addr: Vaddr, code: i32) -> SigInfo {
    let mut info = SigInfo::new(SIGSEGV, code);
    info.si_addr = addr as u64;
    info
}

impl AddressSpace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            root: PageTableRoot::new_user().map_err(Error::from)?,
            mappings: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn root_paddr(&self) -> Paddr {
        self.root.paddr()
    }

    /// Creates a mapping in the *current* address space (the caller must
    /// be a thread of this process). Returns the chosen user address.
    pub fn mmap(
        &self,
        addr: Vaddr,
        length: usize,
        prot: ProtFlags,
        flags: MmapFlags,
        file_inode: Option<(Arc<Inode>, OpenFlags)>,
        offset: u64,
    ) -> Result<Vaddr> {
        if length == 0 || addr % PAGE_SIZE != 0 || offset % PAGE_SIZE as u64 != 0 {
            return_errno!(Errno::EINVAL);
        }
        // Exactly one sharing mode.
        if flags.contains(MmapFlags::PRIVATE) == flags.contains(MmapFlags::SHARED) {
            return_errno_with_message!(Errno::EINVAL, "need exactly one of private/shared");
        }
        if flags.contains(MmapFlags::ANON) != file_inode.is_none() {
            return_errno!(Errno::EINVAL);
        }
        let length = length.align_up(PAGE_SIZE);

        let mut mappings = self.mappings.lock();

        let addr = if !flags.contains(MmapFlags::FIXED) && addr == 0 {
            self.find_free_range(&mappings, length)
                .ok_or(Error::new(Errno::ENOMEM))?
        } else {
            addr
        };
        if addr.checked_add(length).map_or(true, |end| end > USER_ADDR_MAX) {
            return_errno!(Errno::ENOMEM);
        }

        let desc = Arc::new(MappingDesc {
            inode: file_inode.as_ref().map(|(inode, _)| inode.clone()),
            oflags: file_inode.map(|(_, oflags)| oflags).unwrap_or(OpenFlags::empty()),
            addr,
            offset,
            flags,
        });

        for page in (addr..addr + length).step_by(PAGE_SIZE) {
            let index = page >> 12;
            if mappings.insert(index, desc.clone()).is_some() {
                // A fixed mapping replaces whatever was there.
                self.drop_page(page);
            }
            // Record the logical protection; the page itself is faulted
            // in on first touch.
            page_table::user_pte_set(
                page,
                PageTableEntry::new(0, prot_to_pte_bits(prot)),
            )
            .map_err(Error::from)?;
        }

        Ok(addr)
    }

    /// Lowest free `length`-byte gap at or above the auto base.
    fn find_free_range(
        &self,
        mappings: &BTreeMap<usize, Arc<MappingDesc>>,
        length: usize,
    ) -> Option<Vaddr> {
        let pages = length / PAGE_SIZE;
        let mut candidate = MMAP_AUTO_BASE >> 12;
        for (&index, _) in mappings.range(candidate..) {
            if index >= candidate + pages {
                break;
            }
            if index >= candidate {
                candidate = index + 1;
            }
        }
        let addr = candidate << 12;
        (addr + length <= USER_ADDR_MAX).then_some(addr)
    }

    pub fn munmap(&self, addr: Vaddr, length: usize) -> Result<()> {
        if addr % PAGE_SIZE != 0 || length == 0 {
            return_errno!(Errno::EINVAL);
        }
        let length = length.align_up(PAGE_SIZE);
        let mut mappings = self.mappings.lock();
        for page in (addr..addr + length).step_by(PAGE_SIZE) {
            mappings.remove(&(page >> 12));
            self.drop_page(page);
        }
        Ok(())
    }

    /// Clears the leaf PTE of one page of the current space and drops
    /// the frame reference it held.
    fn drop_page(&self, page: Vaddr) {
        if let Some(old) = page_table::user_pte_clear(page) {
            if old.is_present() {
                if let Some(frame) = vm::paddr_to_vaddr(old.paddr()) {
                    frame_pool::user_page_unref(frame);
                }
            }
        }
    }

    pub fn mprotect(&self, addr: Vaddr, length: usize, prot: ProtFlags) -> Result<()> {
        if addr % PAGE_SIZE != 0 || length == 0 {
            return_errno!(Errno::EINVAL);
        }
        let length = length.align_up(PAGE_SIZE);
        let mappings = self.mappings.lock();
        for page in (addr..addr + length).step_by(PAGE_SIZE) {
            if !mappings.contains_key(&(page >> 12)) {
                return_errno!(Errno::ENOMEM);
            }
            page_table::user_pte_update(page, |old| {
                let keep_cow = old.flags().contains(PteFlags::COW);
                if old.is_present() {
                    PageTableEntry::new(old.paddr(), present_pte_flags(prot, keep_cow))
                } else {
                    PageTableEntry::new(0, prot_to_pte_bits(prot))
                }
            });
        }
        Ok(())
    }

    /// Resolves a user fault in the current space. On success the access
    /// can be retried; on failure the returned SigInfo describes the
    /// SIGSEGV to deliver.
    pub fn handle_page_fault(
        &self,
        addr: Vaddr,
        access: FaultAccess,
    ) -> core::result::Result<(), SigInfo> {
        if addr >= USER_ADDR_MAX {
            return Err(segv(addr, SEGV_MAPERR));
        }
        let page = addr & !(PAGE_SIZE - 1);
        let mappings = self.mappings.lock();
        let Some(desc) = mappings.get(&(page >> 12)).cloned() else {
            return Err(segv(addr, SEGV_MAPERR));
        };
        let pte = page_table::user_pte_get(page).unwrap_or(PageTableEntry::empty());
        let prot = pte_prot(pte);

        let allowed = match access {
            FaultAccess::Read => prot.contains(ProtFlags::READ),
            FaultAccess::Write => prot.contains(ProtFlags::WRITE),
            FaultAccess::Exec => prot.contains(ProtFlags::EXEC),
        };
        if !allowed {
            return Err(segv(addr, SEGV_ACCERR));
        }

        if pte.is_present() {
            if access == FaultAccess::Write && pte.flags().contains(PteFlags::COW) {
                self.resolve_cow(page, pte, prot);
            }
            // Otherwise another thread beat us to it; retry.
            return Ok(());
        }

        // Absent page: anonymous memory gets a zero frame, file-backed
        // memory comes out of the inode's page cache.
        if desc.is_anon() {
            let Some(frame) = frame_pool::alloc_user_page() else {
                // No memory for a zero page reads as a bus-level failure;
                // the conventional answer is SIGSEGV with the map code.
                return Err(segv(addr, SEGV_MAPERR));
            };
            let frame_pa = frame_pool::virt_to_phys(frame.as_ptr() as usize).unwrap();
            let _ = page_table::user_pte_set(
                page,
                PageTableEntry::new(frame_pa, present_pte_flags(prot, false)),
            );
            return Ok(());
        }

        let inode = desc.inode.as_ref().expect("file mapping without inode");
        let file_offset = desc.offset_of(page);
        let Ok(frame) = inode.page_cache().get_page(inode, file_offset) else {
            return Err(segv(addr, SEGV_MAPERR));
        };
        let frame_pa = frame_pool::virt_to_phys(frame).unwrap();
        frame_pool::user_page_dup(frame);

        let pte_flags = if desc.is_private() {
            // Read-only until written, then copied.
            let mut flags = present_pte_flags(prot, true);
            flags.remove(PteFlags::WRITE);
            flags
        } else {
            present_pte_flags(prot, false)
        };
        let _ = page_table::user_pte_set(page, PageTableEntry::new(frame_pa, pte_flags));
        Ok(())
    }

    /// Write fault on a copy-on-write page: last owner just takes the
    /// page writable, otherwise copy and switch the PTE over.
    fn resolve_cow(&self, page: Vaddr, pte: PageTableEntry, prot: ProtFlags) {
        let old_frame = vm::paddr_to_vaddr(pte.paddr()).expect("CoW page outside regions");
        if frame_pool::user_page_refcount(old_frame) == 1 {
            let _ = page_table::user_pte_set(
                page,
                PageTableEntry::new(pte.paddr(), present_pte_flags(prot, false)),
            );
            return;
        }
        let new_frame = frame_pool::alloc_user_page().expect("out of memory resolving CoW");
        // Safety: both pointers are direct-map page pointers.
        unsafe {
            core::ptr::copy_nonoverlapping(
                old_frame as *const u8,
                new_frame.as_ptr(),
                PAGE_SIZE,
            );
        }
        let new_pa = frame_pool::virt_to_phys(new_frame.as_ptr() as usize).unwrap();
        let _ = page_table::user_pte_set(
            page,
            PageTableEntry::new(new_pa, present_pte_flags(prot, false)),
        );
        frame_pool::user_page_unref(old_frame);
    }

    /// Clones this (current) address space into `child` for fork: the
    /// descriptors are shared, present private pages drop to read-only
    /// copy-on-write on *both* sides, shared pages alias the same frame.
    pub fn fork_into(&self, child: &AddressSpace) -> Result<()> {
        let mappings = self.mappings.lock();
        let mut child_mappings = child.mappings.lock();

        for (&index, desc) in mappings.iter() {
            child_mappings.insert(index, desc.clone());
            let page = index << 12;
            let Some(pte) = page_table::user_pte_get(page) else {
                continue;
            };

            let child_pte = if pte.is_present() {
                let frame = vm::paddr_to_vaddr(pte.paddr()).expect("mapped frame outside regions");
                frame_pool::user_page_dup(frame);

                if desc.is_private() && pte.flags().contains(PteFlags::PROT_WRITE) {
                    let prot = pte_prot(pte);
                    let downgraded = PageTableEntry::new(pte.paddr(), present_pte_flags(prot, true));
                    // The parent side loses hardware write now; the
                    // shootdown inside the update keeps other CPUs honest.
                    page_table::user_pte_update(page, |_| downgraded);
                    downgraded
                } else {
                    pte
                }
            } else {
                pte
            };
            child.root.map_page(page, child_pte).map_err(Error::from)?;
        }
        Ok(())
    }

    /// Pins one user page for a kernel access, faulting it in (and
    /// breaking copy-on-write for writes) as needed. Returns the
    /// direct-map address of the page, with one extra reference the
    /// caller gives back via `unref_user_page`.
    pub fn get_user_page(&self, uaddr: Vaddr, write: bool) -> Result<Vaddr> {
        let page = uaddr & !(PAGE_SIZE - 1);
        for _ in 0..4 {
            if let Some(pte) = page_table::user_pte_get(page) {
                let writable = pte.flags().contains(PteFlags::WRITE);
                if pte.is_present() && (!write || writable) {
                    let frame = vm::paddr_to_vaddr(pte.paddr())
                        .ok_or(Error::new(Errno::EFAULT))?;
                    return Ok(frame_pool::user_page_dup(frame));
                }
            }
            let access = if write {
                FaultAccess::Write
            } else {
                FaultAccess::Read
            };
            if self.handle_page_fault(page, access).is_err() {
                return_errno!(Errno::EFAULT);
            }
        }
        return_errno_with_message!(Errno::EFAULT, "user page would not settle")
    }

    pub fn unref_user_page(&self, frame: Vaddr) {
        frame_pool::user_page_unref(frame);
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Drop the reference each installed PTE held. The interior
        // tables go with the root.
        let mappings = self.mappings.get_mut();
        for (&index, _) in mappings.iter() {
            if let Some(pte) = self.root.get_page(index << 12) {
                if pte.is_present() {
                    if let Some(frame) = vm::paddr_to_vaddr(pte.paddr()) {
                        frame_pool::user_page_unref(frame);
                    }
                }
            }
        }
    }
}
