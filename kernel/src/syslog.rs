//! The system log ring
//!
//! A bounded ring of log entries over a bip buffer: writers frame a
//! header and message into a contiguous reservation; the reader (the
//! log pump holding a system capability) consumes entries in order.
//! On overrun the oldest whole entries are dropped to make room, so
//! the reader observes an increasing-id gap but never a torn entry.

use alloc::vec;
use alloc::vec::Vec;

use j6::syslog::{Area, EntryHeader, Severity, MAX_MESSAGE};
use j6::Status;

use crate::util::BipBuffer;

/// The bounded log ring.
pub struct LogRing {
    bip: BipBuffer,
    storage: Vec<u8>,
    next_id: u64,
}

impl LogRing {
    pub fn new(size: usize) -> Self {
        Self {
            bip: BipBuffer::new(size),
            storage: vec![0; size],
            next_id: 1,
        }
    }

    /// Append an entry, dropping the oldest entries if the ring is
    /// full. Messages longer than [`MAX_MESSAGE`] are truncated.
    /// Returns the new entry's id.
    pub fn append(&mut self, area: Area, severity: Severity, message: &[u8]) -> u64 {
        let len = message.len().min(MAX_MESSAGE);
        let frame = EntryHeader::SIZE + len;

        let (offset, _) = loop {
            match self.bip.reserve(frame) {
                Some((offset, got)) if got >= frame => break (offset, got),
                Some(_) => {
                    // A short region is useless for a whole frame
                    self.bip.commit(0);
                    self.drop_oldest();
                }
                None => self.drop_oldest(),
            }
        };

        let id = self.next_id;
        self.next_id += 1;

        let header = EntryHeader {
            id,
            bytes: len as u16,
            area: area as u8,
            severity: severity as u8,
            _reserved: 0,
        };

        self.storage[offset..offset + EntryHeader::SIZE]
            .copy_from_slice(&encode_header(&header));
        self.storage[offset + EntryHeader::SIZE..offset + frame]
            .copy_from_slice(&message[..len]);
        self.bip.commit(frame);

        id
    }

    /// Drop the whole entry at the front of the ring.
    fn drop_oldest(&mut self) {
        let (offset, avail) = self.bip.get_block();
        debug_assert!(avail >= EntryHeader::SIZE, "torn entry in log ring");
        let header = decode_header(&self.storage[offset..offset + EntryHeader::SIZE]);
        self.bip.consume(EntryHeader::SIZE + header.bytes as usize);
    }

    /// Read the next entry with id greater than `after_id` into
    /// `buf`, consuming it and everything older. Returns the header
    /// and the number of message bytes written.
    ///
    /// `Insufficient` reports the required size in the header without
    /// consuming the entry; an empty ring is `NotReady` (callers wait
    /// on the `has_log` signal instead of polling).
    pub fn read_next(
        &mut self,
        after_id: u64,
        buf: &mut [u8],
    ) -> Result<(EntryHeader, usize), Status> {
        loop {
            let (offset, avail) = self.bip.get_block();
            if avail == 0 {
                return Err(Status::NotReady);
            }

            debug_assert!(avail >= EntryHeader::SIZE);
            let header = decode_header(&self.storage[offset..offset + EntryHeader::SIZE]);
            let frame = EntryHeader::SIZE + header.bytes as usize;

            if header.id <= after_id {
                // Already seen; discard and keep looking
                self.bip.consume(frame);
                continue;
            }

            let len = header.bytes as usize;
            if buf.len() < len {
                return Err(Status::Insufficient);
            }

            let start = offset + EntryHeader::SIZE;
            buf[..len].copy_from_slice(&self.storage[start..start + len]);
            self.bip.consume(frame);
            return Ok((header, len));
        }
    }

    /// True when at least one entry is pending.
    pub fn has_entries(&self) -> bool {
        self.bip.size() != 0
    }

    /// Id of the most recently appended entry, 0 if none yet.
    pub fn last_id(&self) -> u64 {
        self.next_id - 1
    }
}

fn encode_header(h: &EntryHeader) -> [u8; EntryHeader::SIZE] {
    let mut out = [0u8; EntryHeader::SIZE];
    out[0..8].copy_from_slice(&h.id.to_le_bytes());
    out[8..10].copy_from_slice(&h.bytes.to_le_bytes());
    out[10] = h.area;
    out[11] = h.severity;
    out
}

fn decode_header(bytes: &[u8]) -> EntryHeader {
    EntryHeader {
        id: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
        bytes: u16::from_le_bytes(bytes[8..10].try_into().unwrap()),
        area: bytes[10],
        severity: bytes[11],
        _reserved: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_round_trip() {
        let mut ring = LogRing::new(4096);
        let id = ring.append(Area::Boot, Severity::Info, b"kernel starting");
        assert_eq!(id, 1);

        let mut buf = [0u8; 64];
        let (header, len) = ring.read_next(0, &mut buf).unwrap();
        assert_eq!(header.id, 1);
        assert_eq!(header.area, Area::Boot as u8);
        assert_eq!(&buf[..len], b"kernel starting");

        assert_eq!(ring.read_next(1, &mut buf).unwrap_err(), Status::NotReady);
    }

    #[test]
    fn after_id_skips_older_entries() {
        let mut ring = LogRing::new(4096);
        for i in 0..5u8 {
            ring.append(Area::Sched, Severity::Verbose, &[b'0' + i]);
        }

        let mut buf = [0u8; 16];
        let (header, len) = ring.read_next(3, &mut buf).unwrap();
        assert_eq!(header.id, 4);
        assert_eq!(&buf[..len], b"3");
    }

    #[test]
    fn overrun_drops_oldest_and_leaves_id_gap() {
        let mut ring = LogRing::new(256);
        // Each entry is 16 + 48 = 64 bytes; the ring holds at most 4
        for _ in 0..12 {
            ring.append(Area::Ipc, Severity::Spam, &[0x55; 48]);
        }

        let mut buf = [0u8; 64];
        let (header, _) = ring.read_next(0, &mut buf).unwrap();
        assert!(header.id > 1, "oldest entries should have been dropped");

        // Remaining ids are contiguous after the gap
        let mut last = header.id;
        while let Ok((h, _)) = ring.read_next(last, &mut buf) {
            assert_eq!(h.id, last + 1);
            last = h.id;
        }
        assert_eq!(last, 12);
    }

    #[test]
    fn small_buffer_is_insufficient_without_consuming() {
        let mut ring = LogRing::new(4096);
        ring.append(Area::User, Severity::Info, b"twelve bytes");

        let mut tiny = [0u8; 4];
        assert_eq!(
            ring.read_next(0, &mut tiny).unwrap_err(),
            Status::Insufficient
        );

        // Entry is still there for a properly sized read
        let mut buf = [0u8; 16];
        let (header, len) = ring.read_next(0, &mut buf).unwrap();
        assert_eq!(header.id, 1);
        assert_eq!(&buf[..len], b"twelve bytes");
    }

    #[test]
    fn long_messages_truncate() {
        let mut ring = LogRing::new(4096);
        let long = [0x41u8; 500];
        ring.append(Area::User, Severity::Warn, &long);

        let mut buf = [0u8; 512];
        let (header, len) = ring.read_next(0, &mut buf).unwrap();
        assert_eq!(len, MAX_MESSAGE);
        assert_eq!(header.bytes as usize, MAX_MESSAGE);
    }
}
