//! Status codes returned by every syscall
//!
//! A status is a 64-bit value. `Ok` is zero; warnings occupy
//! `0x1000..0x1fff` and leave the high bit clear; errors set the high
//! bit. The numeric values are ABI and must not change.

/// The error flag. Any status with this bit set is an error.
pub const ERROR_BIT: u64 = 0x8000_0000_0000_0000;

/// Syscall status codes.
///
/// Warnings (`Closed` through `FutexChanged`) report conditions the
/// caller is expected to handle in the normal course of events; errors
/// mean the operation had no effect.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,

    // Warnings: 1000h-1fffh, clear of the libc errno range
    /// The referenced object has been destroyed
    Closed = 0x1000,
    /// The object was destroyed as a result of this call
    Destroyed = 0x1001,
    /// The requested resource already exists
    Exists = 0x1002,
    /// A non-blocking operation would have blocked
    WouldBlock = 0x1003,
    /// The futex word did not hold the expected value
    FutexChanged = 0x1004,

    // Errors: high bit set
    /// Not yet implemented, or unknown syscall number
    Nyi = ERROR_BIT | 0x0001,
    /// Internal inconsistency surfaced to the caller
    Unexpected = ERROR_BIT | 0x0002,
    /// A bad argument: pointer, alignment, flag, handle index, or type
    InvalidArg = ERROR_BIT | 0x0003,
    /// The object is not in a state where the operation applies
    NotReady = ERROR_BIT | 0x0004,
    /// Out of memory, or a caller buffer was too small
    Insufficient = ERROR_BIT | 0x0005,
    /// A blocking call's deadline elapsed
    TimedOut = ERROR_BIT | 0x0006,
    /// The handle lacks a required capability
    Denied = ERROR_BIT | 0x0007,
    /// A name or address collided with an existing one
    Collision = ERROR_BIT | 0x0008,
}

impl Status {
    /// True if this status is an error (high bit set). Warnings and
    /// `Ok` are not errors.
    #[inline]
    pub const fn is_error(self) -> bool {
        (self as u64) & ERROR_BIT != 0
    }

    /// The raw ABI value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self as u64
    }
}

impl From<Status> for u64 {
    fn from(s: Status) -> u64 {
        s as u64
    }
}

/// Every fallible kernel path returns this.
pub type Result<T> = core::result::Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_bit() {
        assert!(Status::InvalidArg.is_error());
        assert!(Status::Denied.is_error());
        assert!(!Status::Ok.is_error());
        assert!(!Status::WouldBlock.is_error());
        assert!(!Status::Closed.is_error());
    }

    #[test]
    fn abi_values() {
        assert_eq!(Status::Ok.as_u64(), 0);
        assert_eq!(Status::Closed.as_u64(), 0x1000);
        assert_eq!(Status::FutexChanged.as_u64(), 0x1004);
        assert_eq!(Status::Nyi.as_u64(), 0x8000_0000_0000_0001);
        assert_eq!(Status::Collision.as_u64(), 0x8000_0000_0000_0008);
    }
}
