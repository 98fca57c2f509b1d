//! Bipartite circular buffer
//!
//! A ring that hands writers contiguous regions by keeping at most two
//! live spans in the underlying array: span A, and span B before it
//! once writes have wrapped. Writers reserve a region, fill it, then
//! commit; readers take the front of A and consume. For more on the
//! structure see
//! <https://www.codeproject.com/Articles/3479/The-Bip-Buffer-The-Circular-Buffer-with-a-Twist>
//!
//! This type owns only the index bookkeeping; the byte storage is a
//! caller-provided region, so the same code runs over kernel heap
//! memory (the log ring) and over shared channel VMAs.

/// Index state of a bip buffer over `buffer_size` bytes of storage.
///
/// Invariants: `size_a + size_b <= buffer_size`, and `size_r` is
/// non-zero only while a single reservation is outstanding.
#[derive(Debug, Clone, Copy)]
pub struct BipBuffer {
    start_a: usize,
    start_b: usize,
    start_r: usize,
    size_a: usize,
    size_b: usize,
    size_r: usize,
    buffer_size: usize,
}

impl BipBuffer {
    /// Create bookkeeping for a buffer of `size` bytes.
    pub const fn new(size: usize) -> Self {
        Self {
            start_a: 0,
            start_b: 0,
            start_r: 0,
            size_a: 0,
            size_b: 0,
            size_r: 0,
            buffer_size: size,
        }
    }

    /// Total bytes committed and not yet consumed.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size_a + self.size_b
    }

    /// Bytes of storage not holding committed data.
    #[inline]
    pub const fn free_space(&self) -> usize {
        self.buffer_size - self.size()
    }

    /// Total size of the underlying storage.
    #[inline]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// The largest contiguous region a reserve could return right now.
    pub fn write_available(&self) -> usize {
        if self.size_b != 0 {
            return self.start_a - self.start_b - self.size_b;
        }
        let tail = self.buffer_size - self.start_a - self.size_a;
        let lead = self.start_a;
        if tail >= lead { tail } else { lead }
    }

    /// Reserve a contiguous region for a write.
    ///
    /// Returns the offset and length of the reserved region, which may
    /// be shorter than `size`. Returns `None` when a reservation is
    /// already outstanding or no space is free. If B exists the region
    /// goes after B; otherwise it goes after A, unless the gap before A
    /// is larger than the tail, in which case the write wraps to
    /// offset 0 and will become span B on commit.
    pub fn reserve(&mut self, size: usize) -> Option<(usize, usize)> {
        if self.size_r != 0 {
            return None;
        }

        let remaining;
        if self.size_b != 0 {
            // B exists, append there: the space between the end of B
            // and the start of A.
            remaining = self.start_a - self.start_b - self.size_b;
            self.start_r = self.start_b + self.size_b;
        } else {
            let tail = self.buffer_size - self.start_a - self.size_a;
            self.start_r = self.start_a + self.size_a;
            if tail < size && self.start_a > tail {
                remaining = self.start_a;
                self.start_r = 0;
            } else {
                remaining = tail;
            }
        }

        if remaining == 0 {
            return None;
        }

        self.size_r = remaining.min(size);
        Some((self.start_r, self.size_r))
    }

    /// Commit the first `size` bytes of the outstanding reservation.
    ///
    /// A commit of 0 abandons the reservation.
    pub fn commit(&mut self, size: usize) {
        debug_assert!(size <= self.size_r, "commit larger than reservation");
        if self.size_r != 0 {
            if self.start_r == self.start_a + self.size_a {
                self.size_a += size;
            } else {
                debug_assert_eq!(self.start_r, self.start_b + self.size_b);
                self.size_b += size;
            }
        }
        self.start_r = 0;
        self.size_r = 0;
    }

    /// The contiguous block of readable data at the front: offset and
    /// length of span A. Length 0 means the buffer is empty.
    #[inline]
    pub const fn get_block(&self) -> (usize, usize) {
        (self.start_a, self.size_a)
    }

    /// Mark `size` bytes at the front of A consumed. Consuming all of
    /// A promotes B to be the new A.
    pub fn consume(&mut self, size: usize) {
        debug_assert!(size <= self.size_a, "consumed more bytes than exist in A");
        if size >= self.size_a {
            if self.size_r != 0 && self.start_r == self.start_a + self.size_a {
                // A is still being appended to
                self.start_a = self.start_r;
                self.size_a = 0;
            } else {
                // A is done, B becomes A
                self.start_a = self.start_b;
                self.size_a = self.size_b;
                self.start_b = 0;
                self.size_b = 0;
            }
        } else {
            self.start_a += size;
            self.size_a -= size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_reserve_commit_consume() {
        let mut buf = BipBuffer::new(4096);
        let (off, len) = buf.reserve(100).unwrap();
        assert_eq!((off, len), (0, 100));
        buf.commit(100);
        assert_eq!(buf.size(), 100);

        assert_eq!(buf.get_block(), (0, 100));
        buf.consume(100);
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn short_reserve_at_tail() {
        let mut buf = BipBuffer::new(4096);
        let (_, len) = buf.reserve(3000).unwrap();
        buf.commit(len);

        // Tail is 1096 and nothing has been consumed, so the lead gap
        // is 0: the reserve is truncated to the tail.
        let (off, len) = buf.reserve(2000).unwrap();
        assert_eq!(off, 3000);
        assert_eq!(len, 1096);
        buf.commit(0); // abandon
    }

    #[test]
    fn wraps_to_front_when_lead_is_larger() {
        let mut buf = BipBuffer::new(4096);
        let (_, len) = buf.reserve(3000).unwrap();
        assert_eq!(len, 3000);
        buf.commit(3000);
        buf.consume(2048);

        // Tail after A is 1096, the gap before A is 2048: the write
        // wraps and becomes span B.
        let (off, len) = buf.reserve(2000).unwrap();
        assert_eq!(off, 0);
        assert_eq!(len, 2000);
        buf.commit(2000);

        // A is the 952 unconsumed bytes at 2048; B holds the new 2000.
        assert_eq!(buf.get_block(), (2048, 952));
        buf.consume(952);

        // B has been promoted to A.
        assert_eq!(buf.get_block(), (0, 2000));
    }

    #[test]
    fn only_one_reservation_at_a_time() {
        let mut buf = BipBuffer::new(4096);
        assert!(buf.reserve(16).is_some());
        assert!(buf.reserve(16).is_none());
        buf.commit(16);
        assert!(buf.reserve(16).is_some());
    }

    #[test]
    fn consume_all_of_a_while_reserved() {
        let mut buf = BipBuffer::new(256);
        let (_, len) = buf.reserve(64).unwrap();
        buf.commit(len);

        // Keep a reservation contiguous with A open across the consume
        let (off, _) = buf.reserve(32).unwrap();
        assert_eq!(off, 64);
        buf.consume(64);

        // A restarted at the reservation point
        buf.commit(32);
        assert_eq!(buf.get_block(), (64, 32));
    }

    #[test]
    fn write_available_tracks_regions() {
        let mut buf = BipBuffer::new(1024);
        assert_eq!(buf.write_available(), 1024);
        let (_, len) = buf.reserve(1000).unwrap();
        buf.commit(len);
        buf.consume(500);
        // Tail is 24, lead is 500
        assert_eq!(buf.write_available(), 500);
    }
}
