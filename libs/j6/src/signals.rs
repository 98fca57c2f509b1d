//! Signal bit assignments
//!
//! Every object carries a 64-bit signal word. Bits 0-7 are common to
//! all object types, bits 8-47 are defined per type, and bits 48-63
//! belong to user space.

/// Set when no more handles refer to the object
pub const NO_HANDLES: u64 = 1 << 0;

/// Set when the object is destroyed; wakes all waiters
pub const CLOSED: u64 = 1 << 1;

// Per-type signals occupy bits 16-47.

/// System: log entries are available to read
pub const SYSTEM_HAS_LOG: u64 = 1 << 16;

/// Channel: the send ring has free space
pub const CHANNEL_CAN_SEND: u64 = 1 << 16;

/// Channel: the receive ring holds data
pub const CHANNEL_CAN_RECV: u64 = 1 << 17;

/// Event signals: one bit per event line, bits 16-47
#[inline]
pub const fn event(n: u8) -> u64 {
    debug_assert!(n < 32);
    1 << (16 + n as u64)
}

/// First user-defined signal bit
pub const USER0: u64 = 1 << 48;

/// Mask of all user-defined signal bits (48-63)
pub const USER_MASK: u64 = 0xffff << 48;

/// Mask of the system-reserved common bits (0-7)
pub const COMMON_MASK: u64 = 0xff;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_layout() {
        assert_eq!(NO_HANDLES, 1);
        assert_eq!(CLOSED, 2);
        assert_eq!(SYSTEM_HAS_LOG, 0x1_0000);
        assert_eq!(CHANNEL_CAN_RECV, 0x2_0000);
        assert_eq!(event(0), CHANNEL_CAN_SEND);
        assert_eq!(USER0 & USER_MASK, USER0);
        assert_eq!(USER_MASK & COMMON_MASK, 0);
    }
}
