//! Pass-through protocol: every received chunk is one message.

use bytes::Bytes;
use streamconn_core::message::Message;

use crate::protocol::{Protocol, ProtocolCallback, ProtocolFactory};

#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolStream;

impl Protocol for ProtocolStream {
    fn receive(&mut self, chunk: Bytes, callback: &mut dyn ProtocolCallback) {
        if !chunk.is_empty() {
            callback.received(Message::from_received(chunk));
        }
    }

    fn prepare_message_to_send(&self, message: &mut Message) {
        message.mark_sent();
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolStreamFactory;

impl ProtocolFactory for ProtocolStreamFactory {
    fn create_protocol(&self) -> Box<dyn Protocol> {
        Box::new(ProtocolStream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CollectingCallback;

    #[test]
    fn test_chunks_pass_through() {
        let mut protocol = ProtocolStreamFactory.create_protocol();
        let mut callback = CollectingCallback::default();
        protocol.receive(Bytes::from_static(b"ab\n"), &mut callback);
        protocol.receive(Bytes::new(), &mut callback);
        protocol.receive(Bytes::from_static(b"cd"), &mut callback);
        assert_eq!(
            callback.payloads(),
            vec![Bytes::from_static(b"ab\n"), Bytes::from_static(b"cd")]
        );
    }

    #[test]
    fn test_prepare_leaves_payload_untouched() {
        let protocol = ProtocolStream;
        let mut message = Message::new().push_str("raw");
        protocol.prepare_message_to_send(&mut message);
        protocol.prepare_message_to_send(&mut message);
        assert!(message.was_sent());
        assert_eq!(message.to_bytes(), Bytes::from_static(b"raw"));
    }
}
