//! Delimiter framing.
//!
//! Messages on the wire are separated by a fixed byte sequence. The framer
//! keeps state across reads so that a delimiter split over several chunks,
//! or several messages arriving in one chunk, are handled without ever
//! copying the stream into one contiguous buffer.
//!
//! Matching is a plain forward scan that restarts one byte after a failed
//! candidate. Self-overlapping delimiters such as `aab` are matched
//! correctly; pathological inputs can make the scan quadratic in the
//! delimiter length.

use bytes::Bytes;
use smallvec::SmallVec;
use streamconn_core::buffer::SegmentedBuffer;
use streamconn_core::message::Message;
use tracing::trace;

use crate::protocol::{Protocol, ProtocolCallback, ProtocolFactory};

/// Where a message ends, relative to the chunk being scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// The delimiter began in bytes buffered from earlier chunks,
    /// `prefix_len` bytes before the end of the buffered data.
    Split { prefix_len: usize },
    /// The delimiter begins at `offset` in the current chunk.
    InBuffer { offset: usize },
}

/// Boundaries found in one chunk, in stream order.
pub type Boundaries = SmallVec<[Boundary; 4]>;

/// Stateful delimiter framer.
#[derive(Debug, Clone)]
pub struct DelimiterFramer {
    delimiter: Bytes,
    /// Delimiter bytes matched at the tail of the data seen so far.
    /// Empty when no match is pending.
    partial: SmallVec<[u8; 16]>,
    /// Undelivered bytes of the message being assembled. Always ends with
    /// `partial`.
    buffered: SegmentedBuffer,
}

impl DelimiterFramer {
    #[must_use]
    pub fn new(delimiter: impl Into<Bytes>) -> Self {
        Self {
            delimiter: delimiter.into(),
            partial: SmallVec::new(),
            buffered: SegmentedBuffer::new(),
        }
    }

    #[must_use]
    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Number of delimiter bytes matched across the last chunk boundary.
    #[must_use]
    pub fn pending_match(&self) -> Option<usize> {
        (!self.partial.is_empty()).then_some(self.partial.len())
    }

    /// Bytes received but not delivered yet.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Locate message ends in `chunk` and update the pending match state.
    ///
    /// Does not touch the buffered data; [`receive`](Self::receive) uses the
    /// result to cut messages.
    pub fn find_end_of_message(&mut self, chunk: &[u8]) -> Boundaries {
        let mut boundaries = Boundaries::new();
        let delimiter = self.delimiter.clone();
        if delimiter.is_empty() {
            if !chunk.is_empty() {
                boundaries.push(Boundary::InBuffer {
                    offset: chunk.len(),
                });
            }
            return boundaries;
        }

        let mut start = 0;
        let mut rescan: SmallVec<[u8; 16]> = SmallVec::new();
        if !self.partial.is_empty() {
            let matched = self.partial.len();
            let rest = &delimiter[matched..];
            let n = rest.len().min(chunk.len());
            if chunk[..n] == rest[..n] {
                if n == rest.len() {
                    boundaries.push(Boundary::Split {
                        prefix_len: matched,
                    });
                    self.partial.clear();
                    start = n;
                } else {
                    // Chunk ended inside the delimiter again.
                    self.partial.extend_from_slice(&chunk[..n]);
                    return boundaries;
                }
            } else {
                // A later start inside the old partial may still match.
                rescan.extend_from_slice(&self.partial[1..]);
                self.partial.clear();
            }
        }

        if rescan.is_empty() {
            self.scan(&delimiter, chunk, start, 0, &mut boundaries);
        } else {
            let mut joined = Vec::with_capacity(rescan.len() + chunk.len());
            joined.extend_from_slice(&rescan);
            joined.extend_from_slice(chunk);
            self.scan(&delimiter, &joined, 0, rescan.len(), &mut boundaries);
        }
        boundaries
    }

    /// Scan `data` from `pos`. The first `carried` bytes of `data` are
    /// already buffered.
    fn scan(
        &mut self,
        delimiter: &[u8],
        data: &[u8],
        mut pos: usize,
        carried: usize,
        boundaries: &mut Boundaries,
    ) {
        let first = delimiter[0];
        while pos < data.len() {
            let Some(found) = data[pos..].iter().position(|&b| b == first) else {
                return;
            };
            pos += found;

            let n = delimiter.len().min(data.len() - pos);
            if data[pos..pos + n] != delimiter[..n] {
                pos += 1;
                continue;
            }
            if n < delimiter.len() {
                self.partial.extend_from_slice(&data[pos..]);
                return;
            }

            boundaries.push(if pos < carried {
                Boundary::Split {
                    prefix_len: carried - pos,
                }
            } else {
                Boundary::InBuffer {
                    offset: pos - carried,
                }
            });
            pos += delimiter.len();
        }
    }

    /// Feed one chunk and hand every completed message to `deliver`.
    pub fn receive(&mut self, chunk: Bytes, mut deliver: impl FnMut(Bytes)) {
        if chunk.is_empty() {
            return;
        }

        let boundaries = self.find_end_of_message(&chunk);
        trace!(
            chunk = chunk.len(),
            boundaries = boundaries.len(),
            buffered = self.buffered.len(),
            "delimiter scan"
        );

        let mut cursor = 0;
        for boundary in boundaries {
            match boundary {
                Boundary::Split { prefix_len } => {
                    debug_assert!(prefix_len <= self.buffered.len());
                    let content = self.buffered.len().saturating_sub(prefix_len);
                    let message = self.buffered.take_bytes(content).unwrap_or_default();
                    // What is left is the head of the delimiter.
                    self.buffered.clear();
                    cursor = self.delimiter.len() - prefix_len;
                    deliver(message);
                }
                Boundary::InBuffer { offset } => {
                    let message = self.buffered.take_all_with(chunk.slice(cursor..offset));
                    cursor = offset + self.delimiter.len();
                    deliver(message);
                }
            }
        }

        if cursor < chunk.len() {
            self.buffered.push(chunk.slice(cursor..));
        }
    }

    /// Drop buffered data and any pending match.
    pub fn reset(&mut self) {
        self.partial.clear();
        self.buffered.clear();
    }
}

/// Protocol framing messages with a delimiter.
#[derive(Debug, Clone)]
pub struct ProtocolDelimiter {
    framer: DelimiterFramer,
}

impl ProtocolDelimiter {
    #[must_use]
    pub fn new(delimiter: impl Into<Bytes>) -> Self {
        Self {
            framer: DelimiterFramer::new(delimiter),
        }
    }

    #[must_use]
    pub fn delimiter(&self) -> &[u8] {
        self.framer.delimiter()
    }
}

impl Protocol for ProtocolDelimiter {
    fn create_message(&self) -> Message {
        Message::with_capacity(2)
    }

    fn receive(&mut self, chunk: Bytes, callback: &mut dyn ProtocolCallback) {
        self.framer
            .receive(chunk, |payload| callback.received(Message::from_received(payload)));
    }

    fn prepare_message_to_send(&self, message: &mut Message) {
        if message.was_sent() {
            return;
        }
        message.append_to_tail(self.framer.delimiter());
        message.mark_sent();
    }

    fn socket_disconnected(&mut self, callback: &mut dyn ProtocolCallback) {
        self.framer.reset();
        callback.disconnected();
    }
}

/// Creates a [`ProtocolDelimiter`] per connection.
#[derive(Debug, Clone)]
pub struct ProtocolDelimiterFactory {
    delimiter: Bytes,
}

impl ProtocolDelimiterFactory {
    #[must_use]
    pub fn new(delimiter: impl Into<Bytes>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }
}

impl ProtocolFactory for ProtocolDelimiterFactory {
    fn create_protocol(&self) -> Box<dyn Protocol> {
        Box::new(ProtocolDelimiter::new(self.delimiter.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CollectingCallback;

    fn frame(delimiter: &'static [u8], chunks: &[&[u8]]) -> Vec<Bytes> {
        let mut framer = DelimiterFramer::new(Bytes::from_static(delimiter));
        let mut out = Vec::new();
        for chunk in chunks {
            framer.receive(Bytes::copy_from_slice(chunk), |m| out.push(m));
        }
        out
    }

    /// Feeds `stream` split at every cut in `cuts` and compares with one-shot framing.
    fn assert_chunking_invariant(delimiter: &'static [u8], stream: &[u8], cuts: &[usize]) {
        let whole = frame(delimiter, &[stream]);
        let mut chunks = Vec::new();
        let mut last = 0;
        for &cut in cuts {
            chunks.push(&stream[last..cut]);
            last = cut;
        }
        chunks.push(&stream[last..]);
        assert_eq!(
            frame(delimiter, &chunks),
            whole,
            "delimiter {:?} cuts {:?}",
            String::from_utf8_lossy(delimiter),
            cuts
        );
    }

    #[test]
    fn test_message_split_over_reads() {
        let messages = frame(b"\n", &[b"AB", b"CD\nEF\n"]);
        assert_eq!(messages, vec![Bytes::from_static(b"ABCD"), Bytes::from_static(b"EF")]);
    }

    #[test]
    fn test_delimiter_split_over_reads() {
        let mut framer = DelimiterFramer::new(Bytes::from_static(b"||"));
        let mut out = Vec::new();
        framer.receive(Bytes::from_static(b"x|"), |m| out.push(m));
        assert_eq!(framer.pending_match(), Some(1));
        framer.receive(Bytes::from_static(b"|y||z"), |m| out.push(m));

        assert_eq!(out, vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")]);
        assert_eq!(framer.pending_match(), None);
        assert_eq!(framer.buffered_len(), 1);
    }

    #[test]
    fn test_split_boundary_reported_as_tagged_result() {
        let mut framer = DelimiterFramer::new(Bytes::from_static(b"||"));
        assert!(framer.find_end_of_message(b"x|").is_empty());
        let boundaries = framer.find_end_of_message(b"|y||z");
        assert_eq!(
            boundaries.as_slice(),
            &[Boundary::Split { prefix_len: 1 }, Boundary::InBuffer { offset: 2 }]
        );
    }

    #[test]
    fn test_self_overlapping_delimiter() {
        assert_eq!(frame(b"aaab", &[b"aaaab"]), vec![Bytes::from_static(b"a")]);
        assert_eq!(frame(b"aab", &[b"aa", b"ab"]), vec![Bytes::from_static(b"a")]);
        assert_eq!(
            frame(b"aab", &[b"a", b"a", b"a", b"b"]),
            vec![Bytes::from_static(b"a")]
        );
    }

    #[test]
    fn test_empty_messages_between_delimiters() {
        assert_eq!(
            frame(b"\n", &[b"a\n\nb\n"]),
            vec![Bytes::from_static(b"a"), Bytes::new(), Bytes::from_static(b"b")]
        );
    }

    #[test]
    fn test_empty_delimiter_delivers_chunks() {
        assert_eq!(
            frame(b"", &[b"abc", b"", b"de"]),
            vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")]
        );
    }

    #[test]
    fn test_long_delimiter_over_many_reads() {
        let delimiter: &'static [u8] = b"lolololololololololololololololololololololololololo\n";
        let mut stream = Vec::new();
        for i in 0..5 {
            stream.extend_from_slice(format!("message {i}").as_bytes());
            stream.extend_from_slice(delimiter);
        }
        let chunks: Vec<&[u8]> = stream.chunks(7).collect();
        let messages = frame(delimiter, &chunks);
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[4], Bytes::from_static(b"message 4"));
    }

    #[test]
    fn test_every_two_way_split_matches_one_shot() {
        let cases: &[(&'static [u8], &[u8])] = &[
            (b"\n", b"AB\nCD\n\nEF"),
            (b"||", b"x|||y||z|"),
            (b"aab", b"aaabaabaaaab"),
            (b"aaab", b"aaaabaaab"),
            (b"abab", b"abababcababab"),
            (b"xyz", b"no delimiter here"),
        ];
        for &(delimiter, stream) in cases {
            for cut in 0..=stream.len() {
                assert_chunking_invariant(delimiter, stream, &[cut]);
            }
        }
    }

    #[test]
    fn test_byte_at_a_time_matches_one_shot() {
        let cases: &[(&'static [u8], &[u8])] = &[
            (b"aab", b"aaabaabaaaab"),
            (b"aaa", b"aaaaaaaabaaa"),
            (b"\r\n", b"GET /\r\nHost: x\r\n\r\n"),
        ];
        for &(delimiter, stream) in cases {
            let cuts: Vec<usize> = (1..stream.len()).collect();
            assert_chunking_invariant(delimiter, stream, &cuts);
        }
    }

    #[test]
    fn test_pseudo_random_chunking_matches_one_shot() {
        let stream: Vec<u8> = (0..2000u32)
            .map(|i| [b'a', b'b', b'a', b'a', b'c'][(i * 7 + i / 3) as usize % 5])
            .collect();
        let mut seed = 0x2545_f491_u32;
        for _ in 0..50 {
            let mut cuts = Vec::new();
            let mut pos = 0;
            loop {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                pos += 1 + (seed % 9) as usize;
                if pos >= stream.len() {
                    break;
                }
                cuts.push(pos);
            }
            assert_chunking_invariant(b"aab", &stream, &cuts);
            assert_chunking_invariant(b"aaca", &stream, &cuts);
        }
    }

    #[test]
    fn test_prepare_message_is_idempotent() {
        let protocol = ProtocolDelimiter::new(Bytes::from_static(b"\n"));
        let mut message = protocol.create_message().push_str("hello");
        protocol.prepare_message_to_send(&mut message);
        protocol.prepare_message_to_send(&mut message);
        assert!(message.was_sent());
        assert_eq!(message.to_bytes(), Bytes::from_static(b"hello\n"));
    }

    #[test]
    fn test_protocol_delivers_messages_to_callback() {
        let factory = ProtocolDelimiterFactory::new(Bytes::from_static(b"\n"));
        let mut protocol = factory.create_protocol();
        let mut callback = CollectingCallback::default();

        protocol.socket_connected(&mut callback);
        protocol.receive(Bytes::from_static(b"one\ntw"), &mut callback);
        protocol.receive(Bytes::from_static(b"o\n"), &mut callback);
        protocol.socket_disconnected(&mut callback);

        assert_eq!(callback.connected, 1);
        assert_eq!(callback.disconnected, 1);
        assert_eq!(
            callback.payloads(),
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
    }
}
