use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Ordered queue of byte chunks with a running byte count.
///
/// Used on both sides of a connection: the framing layer keeps received
/// chunks here while a message is incomplete, and the send path keeps
/// outbound segments here until the socket accepts them.
///
/// Extracting bytes that lie within the first chunk is zero-copy; a range
/// spanning several chunks is copied into one contiguous `Bytes`.
#[derive(Debug, Default, Clone)]
pub struct SegmentedBuffer {
    chunks: VecDeque<Bytes>,
    total: usize,
}

impl SegmentedBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            total: 0,
        }
    }

    /// Buffered bytes across all chunks.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.total
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Number of chunks currently queued.
    #[inline]
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Append a chunk. Empty chunks are dropped.
    #[inline]
    pub fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.total += chunk.len();
            self.chunks.push_back(chunk);
        }
    }

    /// First chunk, if any.
    #[inline]
    #[must_use]
    pub fn front(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Split up to `max` bytes off the first chunk.
    fn split_front(&mut self, max: usize) -> Bytes {
        let Some(first) = self.chunks.front_mut() else {
            return Bytes::new();
        };
        let piece = if max >= first.len() {
            let whole = std::mem::take(first);
            self.chunks.pop_front();
            whole
        } else {
            first.split_to(max)
        };
        self.total -= piece.len();
        piece
    }

    /// Drop the first `n` bytes, releasing fully consumed chunks.
    ///
    /// # Panics
    ///
    /// Panics if `n > self.len()`.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.total, "advance past end of buffer");
        let mut left = n;
        while left > 0 {
            left -= self.split_front(left).len();
        }
    }

    /// Take exactly `n` bytes from the front.
    ///
    /// Returns `None` if fewer than `n` bytes are buffered.
    pub fn take_bytes(&mut self, n: usize) -> Option<Bytes> {
        if n > self.total {
            return None;
        }
        if self.chunks.front().map_or(true, |first| first.len() >= n) {
            return Some(self.split_front(n));
        }

        let mut joined = BytesMut::with_capacity(n);
        while joined.len() < n {
            let piece = self.split_front(n - joined.len());
            joined.extend_from_slice(&piece);
        }
        Some(joined.freeze())
    }

    /// Take everything, leaving the buffer empty.
    pub fn take_all(&mut self) -> Bytes {
        self.take_bytes(self.total).unwrap_or_default()
    }

    /// Take everything followed by `tail`, as one contiguous message.
    ///
    /// Zero-copy when only one of the two parts is non-empty and the buffer
    /// holds a single chunk.
    pub fn take_all_with(&mut self, tail: Bytes) -> Bytes {
        match (self.is_empty(), tail.is_empty()) {
            (true, _) => tail,
            (false, true) => self.take_all(),
            (false, false) => {
                let mut joined = BytesMut::with_capacity(self.total + tail.len());
                for chunk in self.chunks.drain(..) {
                    joined.extend_from_slice(&chunk);
                }
                self.total = 0;
                joined.extend_from_slice(&tail);
                joined.freeze()
            }
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total = 0;
    }
}
