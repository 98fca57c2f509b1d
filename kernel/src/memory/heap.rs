//! Kernel heap
//!
//! A linked-list heap over a frame range carved out during boot. Under
//! the hosted test harness the std allocator is already in place, so
//! the global allocator and its error handler are compiled out.

#[cfg(not(test))]
use linked_list_allocator::LockedHeap;

#[cfg(not(test))]
#[global_allocator]
static KERNEL_HEAP: LockedHeap = LockedHeap::empty();

/// Hand the heap its backing range. Called once during boot, after the
/// frame allocator has reserved the range.
///
/// # Safety
/// `base..base+size` must be mapped, writable, and unused by anything
/// else for the lifetime of the kernel.
#[cfg(not(test))]
pub unsafe fn init(base: *mut u8, size: usize) {
    KERNEL_HEAP.lock().init(base, size);
}
