//! Syscall numbers
//!
//! The numbered surface of the kernel. These values are ABI: the VDSO
//! exposes one `__sys_j6_<name>` stub per entry, with the number in
//! the conventional return register on entry.

pub const SYS_NOOP: u64 = 0;
pub const SYS_LOG: u64 = 1;

pub const SYS_HANDLE_LIST: u64 = 2;
pub const SYS_HANDLE_CLONE: u64 = 3;
pub const SYS_HANDLE_CLOSE: u64 = 4;

pub const SYS_OBJECT_WAIT: u64 = 5;

pub const SYS_EVENT_CREATE: u64 = 6;
pub const SYS_EVENT_SIGNAL: u64 = 7;

pub const SYS_MAILBOX_CREATE: u64 = 8;
pub const SYS_MAILBOX_CALL: u64 = 9;
pub const SYS_MAILBOX_RESPOND: u64 = 10;

pub const SYS_CHANNEL_CREATE: u64 = 11;

pub const SYS_VMA_CREATE: u64 = 12;
pub const SYS_VMA_CREATE_MAP: u64 = 13;
pub const SYS_VMA_MAP: u64 = 14;
pub const SYS_VMA_UNMAP: u64 = 15;
pub const SYS_VMA_RESIZE: u64 = 16;

pub const SYS_PROCESS_CREATE: u64 = 17;
pub const SYS_PROCESS_KILL: u64 = 18;
pub const SYS_PROCESS_EXIT: u64 = 19;

pub const SYS_THREAD_CREATE: u64 = 20;
pub const SYS_THREAD_KILL: u64 = 21;
pub const SYS_THREAD_EXIT: u64 = 22;
pub const SYS_THREAD_SLEEP: u64 = 23;
pub const SYS_THREAD_JOIN: u64 = 24;

pub const SYS_FUTEX_WAIT: u64 = 25;
pub const SYS_FUTEX_WAKE: u64 = 26;

pub const SYS_SYSTEM_GET_LOG: u64 = 27;
pub const SYS_SYSTEM_BIND_IRQ: u64 = 28;
pub const SYS_SYSTEM_MAP_PHYS: u64 = 29;
pub const SYS_SYSTEM_REQUEST_IOPL: u64 = 30;

/// One past the largest valid syscall number.
pub const SYS_MAX: u64 = 31;
