//! Physical memory management
//!
//! The frame allocator owns every byte of conventional RAM reported by
//! the boot loader and hands out 4 KiB frames. The kernel heap sits on
//! top of a boot-time frame range.

pub mod address;
pub mod frame_allocator;
pub mod heap;

pub use address::{PhysAddr, VirtAddr};
pub use frame_allocator::{AllocKind, FrameAllocator};

pub use crate::config::PAGE_SIZE;

/// Round a byte count up to whole pages.
#[inline]
pub const fn page_count(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

/// Round an address or size up to the next page boundary.
#[inline]
pub const fn page_align_up(value: u64) -> u64 {
    (value + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// True if the value sits on a page boundary.
#[inline]
pub const fn page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE as u64 - 1) == 0
}
