//! Kernel configuration constants

use static_assertions::const_assert;

/// Size of a physical frame and the virtual page granule.
pub const PAGE_SIZE: usize = 4096;

/// Number of scheduler priority levels. Priority 0 is the highest.
pub const NUM_PRIORITIES: usize = 32;

// The run-queue bitmap is one u32 wide, and page math assumes a
// power-of-two granule.
const_assert!(NUM_PRIORITIES <= 32);
const_assert!(PAGE_SIZE.is_power_of_two());

/// Priority assigned to threads that do not ask for one.
pub const DEFAULT_PRIORITY: u8 = 16;

/// Handle-table indices start here; index 0 is never a valid handle.
pub const FIRST_HANDLE_INDEX: u32 = 1;

/// Initial capacity of a process's handle table.
pub const HANDLE_TABLE_INITIAL: usize = 16;

/// Most data bytes a single mailbox message may carry.
pub const MAILBOX_MAX_DATA: usize = 4096;

/// Most handles a single mailbox message may carry.
pub const MAILBOX_MAX_HANDLES: usize = 8;

/// Size of the system log ring buffer in bytes.
pub const SYSLOG_RING_SIZE: usize = 64 * 1024;

/// Smallest channel ring: one page. Rings must be powers of two.
pub const CHANNEL_MIN_SIZE: usize = PAGE_SIZE;

/// Start of the kernel half of the address space. User pointers at or
/// above this are rejected at the syscall gate.
pub const KERNEL_SPACE_BASE: u64 = 0xffff_8000_0000_0000;

/// Lowest mappable user address; the zero page stays unmapped.
pub const USER_SPACE_BASE: u64 = 0x0000_0000_0000_1000;

/// Top of the canonical user half.
pub const USER_SPACE_TOP: u64 = 0x0000_7fff_ffff_ffff;

/// Where the kernel starts placing VMAs when the caller passes
/// address 0 ("choose for me").
pub const VMA_AREA_BASE: u64 = 0x0000_2000_0000_0000;
