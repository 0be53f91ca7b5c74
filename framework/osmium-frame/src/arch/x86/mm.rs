//! x86-64 page-table entry layout.
//!
//! Besides the hardware bits, three high software bits record the
//! process-level protection the mapping was created with, and one more
//! marks copy-on-write pages. Keeping the logical protection separate from
//! the hardware write bit is what lets `fork` clear hardware write while
//! remembering that the page is logically writable.

use bitflags::bitflags;

use crate::vm::{Paddr, Vaddr};

bitflags! {
    pub struct PteFlags: u64 {
        const PRESENT     = 1 << 0;
        const WRITE       = 1 << 1;
        const USER        = 1 << 2;
        const NO_CACHE    = 1 << 4;
        /// Software: the mapping grants read.
        const PROT_READ   = 1 << 59;
        /// Software: the mapping grants write (even while hardware write is
        /// clear for copy-on-write).
        const PROT_WRITE  = 1 << 60;
        /// Software: the mapping grants execute.
        const PROT_EXEC   = 1 << 61;
        /// Software: write-fault here means copy, not violation.
        const COW         = 1 << 62;
        const NO_EXECUTE  = 1 << 63;
    }
}

/// Physical-address field of an entry.
pub const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// One entry of any of the four table levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(paddr: Paddr, flags: PteFlags) -> Self {
        Self((paddr as u64 & PTE_ADDR_MASK) | flags.bits())
    }

    pub fn paddr(&self) -> Paddr {
        (self.0 & PTE_ADDR_MASK) as Paddr
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn is_present(&self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn update(&mut self, paddr: Paddr, flags: PteFlags) {
        *self = Self::new(paddr, flags);
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Index into the table at `level` (4 = top) for a virtual address.
#[inline]
pub fn page_index(va: Vaddr, level: usize) -> usize {
    debug_assert!((1..=4).contains(&level));
    (va >> (12 + 9 * (level - 1))) & (crate::config::ENTRY_COUNT - 1)
}

/// Invalidates the TLB entry for one page on the calling CPU.
#[inline]
pub fn tlb_flush(va: Vaddr) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(va as u64));
}

/// Flushes the whole TLB (reloads CR3).
#[inline]
pub fn tlb_flush_all() {
    x86_64::instructions::tlb::flush_all();
}

#[if_cfg_ktest]
mod test {
    use super::*;

    #[ktest]
    fn page_index_extracts_nine_bit_groups() {
        let va: Vaddr = 0o777_001_002_003_0123;
        assert_eq!(page_index(va, 1), 0o003);
        assert_eq!(page_index(va, 2), 0o002);
        assert_eq!(page_index(va, 3), 0o001);
        assert_eq!(page_index(va, 4), 0o777);
    }

    #[ktest]
    fn entry_separates_address_and_flags() {
        let pte = PageTableEntry::new(
            0x1234_5000,
            PteFlags::PRESENT | PteFlags::WRITE | PteFlags::PROT_READ,
        );
        assert_eq!(pte.paddr(), 0x1234_5000);
        assert!(pte.is_present());
        assert!(pte.flags().contains(PteFlags::PROT_READ));
        assert!(!pte.flags().contains(PteFlags::COW));
    }
}
