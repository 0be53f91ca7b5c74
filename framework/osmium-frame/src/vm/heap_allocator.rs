//! The kernel heap: power-of-two size classes layered over the frame pool.
//!
//! The allocator starts from a static arena so that allocation works
//! before the frame pool exists; once it does, exhaustion is handled by
//! feeding page blocks from the pool into the heap.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use align_ext::AlignExt;
use buddy_system_allocator::Heap;

use crate::config::{KERNEL_HEAP_SIZE, PAGE_SIZE};
use crate::sync::SpinLock;
use crate::vm::frame_pool::{self, PoolMask};

#[global_allocator]
static HEAP_ALLOCATOR: LockedHeap<32> = LockedHeap::new();

#[alloc_error_handler]
fn handle_alloc_error(layout: Layout) -> ! {
    panic!("kernel heap exhausted, layout = {:?}", layout);
}

static mut HEAP_SPACE: [u8; KERNEL_HEAP_SIZE] = [0; KERNEL_HEAP_SIZE];

pub(crate) fn init() {
    // Safety: HEAP_SPACE is a static arena used for nothing else.
    unsafe {
        HEAP_ALLOCATOR.init(core::ptr::addr_of!(HEAP_SPACE) as *const u8, KERNEL_HEAP_SIZE);
    }
}

struct LockedHeap<const ORDER: usize>(SpinLock<Heap<ORDER>>);

impl<const ORDER: usize> LockedHeap<ORDER> {
    const fn new() -> Self {
        LockedHeap(SpinLock::new(Heap::<ORDER>::new()))
    }

    /// # Safety
    ///
    /// `[start, start + size)` must be an unused memory range.
    unsafe fn init(&self, start: *const u8, size: usize) {
        self.0.lock_irq_disabled().init(start as usize, size);
    }

    /// Pulls page blocks out of the frame pool to satisfy `layout`.
    fn rescue(&self, layout: &Layout) -> bool {
        let size = layout
            .size()
            .max(layout.align())
            .align_up(PAGE_SIZE)
            // Refill generously so small allocations do not hit the pool
            // every time.
            .max(PAGE_SIZE * 16);
        let class = frame_pool::class_for_size(size);
        let Some(block) = frame_pool::alloc_block(class, PoolMask::ALL) else {
            return false;
        };
        let start = block.as_ptr() as usize;
        // Safety: the block came straight out of the frame pool and is
        // handed to the heap whole.
        unsafe {
            self.0
                .lock_irq_disabled()
                .add_to_heap(start, start + frame_pool::class_size(class));
        }
        true
    }
}

unsafe impl<const ORDER: usize> GlobalAlloc for LockedHeap<ORDER> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        loop {
            if let Ok(allocation) = self.0.lock_irq_disabled().alloc(layout) {
                return allocation.as_ptr();
            }
            if !self.rescue(&layout) {
                return core::ptr::null_mut();
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        debug_assert!(!ptr.is_null());
        self.0
            .lock_irq_disabled()
            .dealloc(NonNull::new_unchecked(ptr), layout)
    }
}
