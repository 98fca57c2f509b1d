//! Channel endpoint objects
//!
//! A channel is the asynchronous bulk complement to the mailbox: two
//! endpoints, each backed by a "ring" VMA laid out as a futex mutex, a
//! futex condition word, and a bipartite circular buffer. The two
//! endpoints are created together, but each is its own handle so one
//! side can be transferred to another process.
//!
//! Each endpoint owns the ring it sends into; receiving reads the
//! peer's ring. The kernel initializes the ring layout when it builds
//! the VMAs; after that, the discipline below is exactly what user
//! space runs over the shared mapping.

use alloc::vec;
use alloc::vec::Vec;

use j6::{signals, Koid, Status};

use crate::config::CHANNEL_MIN_SIZE;
use crate::util::BipBuffer;

/// Byte offsets of the control words at the head of a ring VMA.
pub const RING_MUTEX_OFFSET: u64 = 0;
pub const RING_COND_OFFSET: u64 = 4;

/// One direction's ring: bip-buffer bookkeeping plus its bytes.
///
/// In a running system this state lives at the head of the ring VMA
/// and is shared with user space; the kernel touches it only to
/// initialize it and to run the same discipline on behalf of hosted
/// tests.
#[derive(Debug)]
pub struct ChannelRing {
    bip: BipBuffer,
    storage: Vec<u8>,
}

impl ChannelRing {
    /// Ring sizes must be powers of two no smaller than a page.
    pub fn new(size: usize) -> Result<Self, Status> {
        if size < CHANNEL_MIN_SIZE || !size.is_power_of_two() {
            return Err(Status::InvalidArg);
        }
        Ok(Self {
            bip: BipBuffer::new(size),
            storage: vec![0; size],
        })
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.bip.buffer_size()
    }

    /// Bytes committed and unconsumed.
    #[inline]
    pub fn len(&self) -> usize {
        self.bip.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bip.size() == 0
    }

    /// Largest write `reserve` could satisfy contiguously right now.
    #[inline]
    pub fn write_available(&self) -> usize {
        self.bip.write_available()
    }

    /// Reserve `size` contiguous bytes for writing. `WouldBlock` when
    /// the ring cannot currently hold the write; `Insufficient` when
    /// it never could.
    pub fn reserve(&mut self, size: usize) -> Result<(usize, &mut [u8]), Status> {
        if size > self.bip.buffer_size() {
            return Err(Status::Insufficient);
        }
        if self.bip.write_available() < size {
            return Err(Status::WouldBlock);
        }

        let (offset, len) = self.bip.reserve(size).ok_or(Status::WouldBlock)?;
        Ok((offset, &mut self.storage[offset..offset + len]))
    }

    /// Commit the first `size` bytes of the reservation.
    pub fn commit(&mut self, size: usize) {
        self.bip.commit(size);
    }

    /// The contiguous block of readable bytes at the front.
    pub fn get_block(&self) -> (usize, &[u8]) {
        let (offset, len) = self.bip.get_block();
        (offset, &self.storage[offset..offset + len])
    }

    /// Consume `size` bytes from the front.
    pub fn consume(&mut self, size: usize) {
        self.bip.consume(size);
    }

    /// Reserve, copy, commit in one step.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), Status> {
        let n = bytes.len();
        let (_, area) = self.reserve(n)?;
        area[..n].copy_from_slice(bytes);
        self.commit(n);
        Ok(())
    }

    /// Copy up to `out.len()` bytes from the front and consume them.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let (_, block) = self.get_block();
        let n = block.len().min(out.len());
        out[..n].copy_from_slice(&block[..n]);
        self.consume(n);
        n
    }

    /// The signal bits this ring's state implies for the endpoint that
    /// sends into it and the endpoint that receives from it.
    pub fn ready_signals(&self) -> u64 {
        let mut bits = 0;
        if self.write_available() > 0 {
            bits |= signals::CHANNEL_CAN_SEND;
        }
        if self.len() > 0 {
            bits |= signals::CHANNEL_CAN_RECV;
        }
        bits
    }
}

/// One endpoint of a channel pair.
pub struct ChannelEnd {
    /// The peer endpoint's koid; 0 once the peer is destroyed
    peer: Koid,

    /// The ring VMA backing this endpoint's send direction
    vma: Koid,

    /// This endpoint's send ring
    pub ring: ChannelRing,
}

impl ChannelEnd {
    pub fn new(vma: Koid, ring: ChannelRing) -> Self {
        Self { peer: 0, vma, ring }
    }

    #[inline]
    pub fn peer(&self) -> Koid {
        self.peer
    }

    pub fn set_peer(&mut self, peer: Koid) {
        self.peer = peer;
    }

    /// Called when the peer endpoint is destroyed.
    pub fn clear_peer(&mut self) {
        self.peer = 0;
    }

    #[inline]
    pub fn vma(&self) -> Koid {
        self.vma
    }
}

impl core::fmt::Debug for ChannelEnd {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelEnd")
            .field("peer", &self.peer)
            .field("vma", &self.vma)
            .field("buffered", &self.ring.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_size_must_be_power_of_two_page() {
        assert!(ChannelRing::new(4096).is_ok());
        assert!(ChannelRing::new(8192).is_ok());
        assert_eq!(ChannelRing::new(2048).unwrap_err(), Status::InvalidArg);
        assert_eq!(ChannelRing::new(12288).unwrap_err(), Status::InvalidArg);
    }

    #[test]
    fn oversized_write_is_insufficient_not_would_block() {
        let mut ring = ChannelRing::new(4096).unwrap();
        assert_eq!(ring.reserve(4097).unwrap_err(), Status::Insufficient);
    }

    #[test]
    fn full_ring_would_block() {
        let mut ring = ChannelRing::new(4096).unwrap();
        let (_, area) = ring.reserve(3000).unwrap();
        area.fill(1);
        ring.commit(3000);

        // Tail has 1096, lead has 0: a 2000-byte write cannot proceed
        assert_eq!(ring.reserve(2000).unwrap_err(), Status::WouldBlock);
    }

    #[test]
    fn wrap_discipline_matches_ring_layout() {
        let mut ring = ChannelRing::new(4096).unwrap();

        let (off, area) = ring.reserve(3000).unwrap();
        assert_eq!(off, 0);
        area.fill(7);
        ring.commit(3000);

        let mut sink = [0u8; 2048];
        assert_eq!(ring.read(&mut sink), 2048);

        // Tail 1096 < lead 2048: the reserve wraps to offset 0
        let (off, area) = ring.reserve(2000).unwrap();
        assert_eq!(off, 0);
        area.fill(9);
        ring.commit(2000);

        // First the 952 old bytes, then the 2000 new ones
        let (off, block) = ring.get_block();
        assert_eq!(off, 2048);
        assert_eq!(block.len(), 952);
        assert!(block.iter().all(|&b| b == 7));
        ring.consume(952);

        let (off, block) = ring.get_block();
        assert_eq!(off, 0);
        assert_eq!(block.len(), 2000);
        assert!(block.iter().all(|&b| b == 9));
    }

    #[test]
    fn byte_stream_preserves_commit_order() {
        let mut ring = ChannelRing::new(4096).unwrap();
        ring.write(b"hello ").unwrap();
        ring.write(b"channel ").unwrap();
        ring.write(b"world").unwrap();

        let mut out = [0u8; 64];
        let mut total = 0;
        loop {
            let n = ring.read(&mut out[total..]);
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(&out[..total], b"hello channel world");
    }

    #[test]
    fn ready_signals_track_state() {
        let mut ring = ChannelRing::new(4096).unwrap();
        assert_eq!(ring.ready_signals(), signals::CHANNEL_CAN_SEND);

        ring.write(&[0; 100]).unwrap();
        assert_eq!(
            ring.ready_signals(),
            signals::CHANNEL_CAN_SEND | signals::CHANNEL_CAN_RECV
        );
    }
}
