//! Capability masks
//!
//! A handle's high 32 bits are a capability mask. Bits 0-7 gate
//! operations common to every object type; bits 8 and up are defined
//! per type, in the same overlay style as the signal bits. A syscall's
//! required mask must be a subset of the handle's granted mask, and no
//! operation ever widens a mask.

use bitflags::bitflags;

bitflags! {
    /// Capability bits carried in the high half of a handle.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u32 {
        // Common to all object types
        /// May duplicate this handle with `handle_clone`
        const CLONE = 1 << 0;
        /// May transfer this handle in a mailbox message
        const TRANSFER = 1 << 1;
        /// May wait on the object's signals
        const WAIT = 1 << 2;
        /// May set the object's user signal bits
        const SIGNAL = 1 << 3;

        // VMA
        /// May map the VMA into a process
        const VMA_MAP = 1 << 8;
        /// May remove the VMA from a process
        const VMA_UNMAP = 1 << 9;
        /// May grow or shrink the VMA
        const VMA_RESIZE = 1 << 10;

        // Mailbox
        /// May send requests with `mailbox_call`
        const MAILBOX_CALL = 1 << 8;
        /// May serve requests with `mailbox_respond`
        const MAILBOX_RESPOND = 1 << 9;

        // Channel endpoint
        /// May reserve and commit into the send ring
        const CHANNEL_SEND = 1 << 8;
        /// May read and consume from the receive ring
        const CHANNEL_RECV = 1 << 9;

        // Process
        /// May kill the process
        const PROCESS_KILL = 1 << 8;
        /// May create threads in the process
        const PROCESS_CREATE_THREAD = 1 << 9;

        // Thread
        /// May kill the thread
        const THREAD_KILL = 1 << 8;
        /// May join the thread's exit
        const THREAD_JOIN = 1 << 9;

        // System object
        /// May read the system log ring
        const SYSTEM_GET_LOG = 1 << 8;
        /// May bind hardware vectors to mailboxes
        const SYSTEM_BIND_IRQ = 1 << 9;
        /// May map physical ranges into VMAs
        const SYSTEM_MAP_PHYS = 1 << 10;
        /// May raise the caller's I/O privilege level
        const SYSTEM_IOPL = 1 << 11;
    }
}

impl Caps {
    /// True if this mask grants everything `required` asks for.
    #[inline]
    pub const fn grants(self, required: Caps) -> bool {
        self.bits() & required.bits() == required.bits()
    }

    /// Narrow this mask to the intersection with `mask`. Used by clone
    /// and transfer; the result never exceeds `self`.
    #[inline]
    pub const fn narrow(self, mask: Caps) -> Caps {
        Caps::from_bits_truncate(self.bits() & mask.bits())
    }
}
