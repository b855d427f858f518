//! Protocol plug-in interface.
//!
//! A [`ProtocolFactory`] creates one stateful [`Protocol`] per connection.
//! The protocol turns received byte chunks into messages, prepares
//! outgoing messages, and forwards connect/disconnect notifications to a
//! [`ProtocolCallback`].

use bytes::Bytes;
use streamconn_core::message::Message;

/// Receives what a protocol produces.
pub trait ProtocolCallback {
    fn connected(&mut self);
    fn disconnected(&mut self);
    /// One complete message.
    fn received(&mut self, message: Message);
}

/// Framing state of one connection.
pub trait Protocol: Send {
    /// Fresh outgoing message for this protocol.
    fn create_message(&self) -> Message {
        Message::new()
    }

    /// Feed one received chunk; complete messages go to `callback` in order.
    fn receive(&mut self, chunk: Bytes, callback: &mut dyn ProtocolCallback);

    /// Finish `message` for the wire. Must be idempotent: a message that
    /// was already prepared is left unchanged.
    fn prepare_message_to_send(&self, message: &mut Message);

    fn socket_connected(&mut self, callback: &mut dyn ProtocolCallback) {
        callback.connected();
    }

    fn socket_disconnected(&mut self, callback: &mut dyn ProtocolCallback) {
        callback.disconnected();
    }
}

/// Creates one protocol instance per connection.
pub trait ProtocolFactory: Send + Sync {
    fn create_protocol(&self) -> Box<dyn Protocol>;
}

impl<F> ProtocolFactory for F
where
    F: Fn() -> Box<dyn Protocol> + Send + Sync,
{
    fn create_protocol(&self) -> Box<dyn Protocol> {
        self()
    }
}

/// Collects protocol output; handy for tests and synchronous decoding.
#[derive(Debug, Default)]
pub struct CollectingCallback {
    pub connected: usize,
    pub disconnected: usize,
    pub messages: Vec<Message>,
}

impl CollectingCallback {
    /// Received payloads in arrival order.
    #[must_use]
    pub fn payloads(&self) -> Vec<Bytes> {
        self.messages.iter().map(|m| m.received().clone()).collect()
    }
}

impl ProtocolCallback for CollectingCallback {
    fn connected(&mut self) {
        self.connected += 1;
    }

    fn disconnected(&mut self) {
        self.disconnected += 1;
    }

    fn received(&mut self, message: Message) {
        self.messages.push(message);
    }
}
