//! The per-inode page cache: a four-level, 512-wide radix tree over the
//! file offset (9+9+9+12 bits).
//!
//! Interior slots pack the physical address of the next node (or the
//! leaf frame) with a dirty bit in bit 0, which write paths set on the
//! whole descent so a future flush can walk dirty subtrees only. Leaves
//! are refcounted user pages, so a frame can simultaneously live in the
//! cache and in any number of process mappings.

use core::ptr::NonNull;

use osmium_frame::vm::{self, frame_pool, Paddr, Vaddr};

use crate::prelude::*;

use super::inode::Inode;

const ENTRY_COUNT: usize = 512;
const DIRTY_BIT: u64 = 1;
const ADDR_MASK: u64 = !0xFFF;

/// Files are bounded by the tree's reach: 9+9+9+12 bits of offset.
pub const MAX_FILE_SIZE: u64 = 1 << 48;

/// Interior nodes and leaves come from the pool without permission to
/// evict any cache, so filling the cache cannot recurse into itself.
fn cache_pool_mask() -> frame_pool::PoolMask {
    frame_pool::PoolMask::ALL
        & !frame_pool::PoolMask::PAGE_CACHE
        & !frame_pool::PoolMask::INODES
}

struct RadixNode(*mut u64);

impl RadixNode {
    fn alloc() -> Result<Self> {
        let block = frame_pool::alloc_block(frame_pool::PAGE_CLASS, cache_pool_mask())
            .ok_or(Error::new(Errno::ENOMEM))?;
        // Safety: fresh page-sized block.
        unsafe { core::ptr::write_bytes(block.as_ptr(), 0, PAGE_SIZE) };
        Ok(Self(block.as_ptr() as *mut u64))
    }

    /// # Safety
    ///
    /// `paddr` must be a node previously created by `alloc`.
    unsafe fn from_paddr(paddr: Paddr) -> Self {
        Self(vm::paddr_to_vaddr_checked(paddr) as *mut u64)
    }

    fn paddr(&self) -> Paddr {
        frame_pool::virt_to_phys(self.0 as Vaddr).expect("radix node outside regions")
    }

    fn get(&self, index: usize) -> u64 {
        debug_assert!(index < ENTRY_COUNT);
        // Safety: nodes are page-sized u64 arrays, guarded by the
        // per-inode cache lock.
        unsafe { self.0.add(index).read() }
    }

    fn set(&self, index: usize, value: u64) {
        debug_assert!(index < ENTRY_COUNT);
        // Safety: as above.
        unsafe { self.0.add(index).write(value) }
    }
}

/// The tree itself; the root is allocated on first use.
pub struct PageCache {
    root: Mutex<Option<Paddr>>,
}

fn level_index(offset: u64, level: usize) -> usize {
    ((offset >> (12 + 9 * level)) & 0x1FF) as usize
}

impl PageCache {
    pub fn new() -> Self {
        Self {
            root: Mutex::new(None),
        }
    }

    /// Looks up (or loads) the frame backing `offset`, returning its
    /// direct-map address. The cache holds one reference to the frame;
    /// callers that keep it (mappings) take their own.
    pub fn get_page(&self, inode: &Inode, offset: u64) -> Result<Vaddr> {
        self.walk(inode, offset, false)
    }

    /// Reads out of the cache; `buf` must already be clipped to the file
    /// size by the caller.
    pub fn read(&self, inode: &Inode, mut pos: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let page = self.walk(inode, pos, false)?;
            let in_page = (pos & 0xFFF) as usize;
            let chunk = (PAGE_SIZE - in_page).min(buf.len() - done);
            // Safety: direct-map page, in-bounds chunk.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    (page + in_page) as *const u8,
                    buf[done..].as_mut_ptr(),
                    chunk,
                );
            }
            done += chunk;
            pos += chunk as u64;
        }
        Ok(())
    }

    /// Writes into the cache, marking the descended slots dirty.
    pub fn write(&self, inode: &Inode, mut pos: u64, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let page = self.walk(inode, pos, true)?;
            let in_page = (pos & 0xFFF) as usize;
            let chunk = (PAGE_SIZE - in_page).min(buf.len() - done);
            // Safety: as in read.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    buf[done..].as_ptr(),
                    (page + in_page) as *mut u8,
                    chunk,
                );
            }
            done += chunk;
            pos += chunk as u64;
        }
        Ok(())
    }

    /// The tree walk. With the cache lock held, descend (allocating
    /// interior nodes as needed), load the leaf through the driver on a
    /// miss, and propagate the dirty bit when asked to.
    fn walk(&self, inode: &Inode, offset: u64, mark_dirty: bool) -> Result<Vaddr> {
        if offset >= MAX_FILE_SIZE {
            return_errno!(Errno::EOVERFLOW);
        }
        let mut root = self.root.lock();
        let root_pa = match *root {
            Some(paddr) => paddr,
            None => {
                let node = RadixNode::alloc()?;
                let paddr = node.paddr();
                *root = Some(paddr);
                paddr
            }
        };

        // Safety: the root (and everything below) belongs to this cache,
        // and we hold its lock.
        let mut node = unsafe { RadixNode::from_paddr(root_pa) };
        for level in (1..=3).rev() {
            let index = level_index(offset, level);
            let mut entry = node.get(index);
            if entry & ADDR_MASK == 0 {
                let child = RadixNode::alloc()?;
                entry = child.paddr() as u64;
                node.set(index, entry);
            }
            if mark_dirty {
                node.set(index, entry | DIRTY_BIT);
            }
            // Safety: as above.
            node = unsafe { RadixNode::from_paddr((entry & ADDR_MASK) as Paddr) };
        }

        let index = level_index(offset, 0);
        let mut entry = node.get(index);
        if entry & ADDR_MASK == 0 {
            // Leaf miss: a fresh refcounted frame, filled by the driver.
            let frame = frame_pool::alloc_user_page_from(cache_pool_mask())
                .ok_or(Error::new(Errno::ENOMEM))?;
            let aligned = offset & !0xFFF;
            let buffer =
                // Safety: page-sized fresh frame.
                unsafe { core::slice::from_raw_parts_mut(frame.as_ptr(), PAGE_SIZE) };
            if let Err(err) = inode.fs().driver().load_page(inode, aligned, buffer) {
                frame_pool::user_page_unref(frame.as_ptr() as Vaddr);
                return Err(err);
            }
            let frame_pa = frame_pool::virt_to_phys(frame.as_ptr() as Vaddr).unwrap();
            entry = frame_pa as u64;
            node.set(index, entry);
        }
        if mark_dirty {
            node.set(index, entry | DIRTY_BIT);
        }

        Ok(vm::paddr_to_vaddr_checked((entry & ADDR_MASK) as Paddr))
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        fn free_node(node: &RadixNode, level: usize) {
            for index in 0..ENTRY_COUNT {
                let entry = node.get(index) & ADDR_MASK;
                if entry == 0 {
                    continue;
                }
                if level > 0 {
                    // Safety: interior child of a dying tree.
                    let child = unsafe { RadixNode::from_paddr(entry as Paddr) };
                    free_node(&child, level - 1);
                    release_node(child);
                } else {
                    // Leaf frames drop the cache's reference; a mapping
                    // elsewhere may keep the frame alive.
                    let vaddr = vm::paddr_to_vaddr_checked(entry as Paddr);
                    frame_pool::user_page_unref(vaddr);
                }
            }
        }

        fn release_node(node: RadixNode) {
            // Safety: node pages came from the pool's page class.
            unsafe {
                frame_pool::release_block(
                    NonNull::new(node.0 as *mut u8).unwrap(),
                    frame_pool::PAGE_CLASS,
                );
            }
        }

        let root = self.root.get_mut();
        if let Some(root_pa) = root.take() {
            // Safety: exclusive at drop time.
            let node = unsafe { RadixNode::from_paddr(root_pa) };
            free_node(&node, 3);
            release_node(node);
        }
    }
}

#[if_cfg_ktest]
mod test {
    use super::*;

    #[ktest]
    fn level_indices_slice_the_offset() {
        let offset = (3u64 << 39) | (5 << 30) | (7 << 21) | (9 << 12) | 0x123;
        assert_eq!(level_index(offset, 3), 3);
        assert_eq!(level_index(offset, 2), 5);
        assert_eq!(level_index(offset, 1), 7);
        assert_eq!(level_index(offset, 0), 9);
    }

    #[ktest]
    fn dirty_bit_is_disjoint_from_addresses() {
        assert_eq!(ADDR_MASK & DIRTY_BIT, 0);
    }
}
