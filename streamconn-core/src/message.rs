//! Messages exchanged over a connection.
//!
//! An outgoing [`Message`] is a chain of send segments that a framing
//! protocol may extend once (for example with a delimiter) right before the
//! message is handed to the connection. An incoming message carries the
//! reassembled receive payload.

use bytes::{Bytes, BytesMut};

/// Message payload with send and receive buffers.
///
/// # Examples
///
/// ```
/// use streamconn_core::message::Message;
///
/// let msg = Message::new().push_str("hello").push_str(" world");
/// assert_eq!(msg.len(), 11);
/// assert_eq!(msg.to_bytes(), "hello world");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Message {
    segments: Vec<Bytes>,
    received: Bytes,
    sent: bool,
}

impl Message {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segments: Vec::new(),
            received: Bytes::new(),
            sent: false,
        }
    }

    /// Message with room for `segments` send segments.
    #[must_use]
    pub fn with_capacity(segments: usize) -> Self {
        Self {
            segments: Vec::with_capacity(segments),
            ..Self::new()
        }
    }

    /// Incoming message wrapping a reassembled payload.
    #[must_use]
    pub fn from_received(payload: Bytes) -> Self {
        Self {
            received: payload,
            ..Self::new()
        }
    }

    /// Add a send segment.
    #[must_use]
    pub fn push(mut self, segment: impl Into<Bytes>) -> Self {
        self.add_segment(segment);
        self
    }

    /// Add a UTF-8 send segment.
    #[must_use]
    pub fn push_str(self, segment: &str) -> Self {
        self.push(Bytes::copy_from_slice(segment.as_bytes()))
    }

    pub fn add_segment(&mut self, segment: impl Into<Bytes>) {
        self.segments.push(segment.into());
    }

    #[must_use]
    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    #[must_use]
    pub fn into_segments(self) -> Vec<Bytes> {
        self.segments
    }

    /// Total length of all send segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `bytes` to the last send segment, or as the only segment of an
    /// empty message.
    pub fn append_to_tail(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        match self.segments.last_mut() {
            Some(last) => {
                let mut tail = BytesMut::with_capacity(last.len() + bytes.len());
                tail.extend_from_slice(last);
                tail.extend_from_slice(bytes);
                *last = tail.freeze();
            }
            None => self.segments.push(Bytes::copy_from_slice(bytes)),
        }
    }

    /// Whether the message was already prepared for sending.
    #[must_use]
    pub const fn was_sent(&self) -> bool {
        self.sent
    }

    pub fn mark_sent(&mut self) {
        self.sent = true;
    }

    /// Send segments as one contiguous buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match self.segments.as_slice() {
            [] => Bytes::new(),
            [only] => only.clone(),
            many => {
                let mut out = BytesMut::with_capacity(self.len());
                for seg in many {
                    out.extend_from_slice(seg);
                }
                out.freeze()
            }
        }
    }

    /// Reassembled payload of an incoming message.
    #[must_use]
    pub fn received(&self) -> &Bytes {
        &self.received
    }

    #[must_use]
    pub fn into_received(self) -> Bytes {
        self.received
    }

    /// Incoming payload as UTF-8, if valid.
    #[must_use]
    pub fn received_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.received).ok()
    }
}
