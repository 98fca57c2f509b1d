//! Protocol ids
//!
//! A protocol is named `"jsix.protocol.<name>"` and identified on the
//! wire by the 64-bit FNV-1a hash of that name. Hashing is a const fn
//! so ids are compile-time constants on both sides.

/// FNV-1a offset basis (64-bit).
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a prime (64-bit).
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a over a byte string.
pub const fn hash(name: &str) -> u64 {
    let bytes = name.as_bytes();
    let mut h = FNV_OFFSET;
    let mut i = 0;
    while i < bytes.len() {
        h ^= bytes[i] as u64;
        h = h.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    h
}

/// Whether a protocol converses over a mailbox or a channel.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Mailbox = 0,
    Channel = 1,
}

/// Base message tags common to every mailbox protocol.
pub mod base_tag {
    /// Generic status reply
    pub const STATUS: u64 = 0;
    /// Ask a server which protocol it speaks
    pub const GET_PROTO_ID: u64 = 1;
    /// Reply carrying a protocol id
    pub const PROTO_ID: u64 = 2;
    /// Ask a server to open a channel
    pub const OPEN_CHANNEL: u64 = 3;
    /// Reply carrying channel endpoint handles
    pub const OPENED_CHANNEL: u64 = 4;
    /// First tag available to protocol-specific messages
    pub const FIRST_PROTO_TAG: u64 = 5;
}

/// The service locator, spoken by init to hand out server handles.
pub const SERVICE_LOCATOR_ID: u64 = hash("jsix.protocol.service_locator");

/// The VFS protocol, spoken by the initrd server.
pub const VFS_ID: u64 = hash("jsix.protocol.vfs");

/// The system log stream.
pub const SYSLOG_ID: u64 = hash("jsix.protocol.syslog");
