//! Callbacks of the raw stream container.

use std::io::{self, Read};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use streamconn_core::socket::Socket;

use crate::connection::Connection;

/// Per-connection event handler of a [`ConnectionContainer`](crate::ConnectionContainer).
///
/// All methods run on the poll loop thread. `connected` is called at most
/// once, then any number of `received`, then `disconnected` at most once.
pub trait StreamCallback: Send + Sync {
    fn connected(&self, _connection: &Connection) {}

    fn disconnected(&self, _connection: &Connection) {}

    /// `bytes_to_read` bytes can be received from `reader` without blocking.
    ///
    /// The callback does the receive itself. Bytes left unread are reported
    /// again.
    fn received(&self, connection: &Connection, reader: &mut SocketReader<'_>, bytes_to_read: usize);
}

/// Creates the callback of each connection accepted on a bound endpoint.
pub type CallbackFactory = Arc<dyn Fn() -> Arc<dyn StreamCallback> + Send + Sync>;

/// Factory handing the same callback to every accepted connection.
#[must_use]
pub fn shared_callback(callback: Arc<dyn StreamCallback>) -> CallbackFactory {
    Arc::new(move || Arc::clone(&callback))
}

/// Receive side of a connection's socket, lent to [`StreamCallback::received`].
///
/// Remembers whether the peer closed the stream or the receive failed so
/// the loop can disconnect once the callback returns.
pub struct SocketReader<'a> {
    socket: &'a mut Socket,
    closed: bool,
    failed: bool,
    received: usize,
}

impl<'a> SocketReader<'a> {
    pub(crate) fn new(socket: &'a mut Socket) -> Self {
        Self {
            socket,
            closed: false,
            failed: false,
            received: 0,
        }
    }

    /// Receive into `buf`. `Ok(0)` means the peer closed the stream.
    pub fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.socket.receive(buf) {
            Ok(0) if !buf.is_empty() => {
                self.closed = true;
                Ok(0)
            }
            Ok(n) => {
                self.received += n;
                Ok(n)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Err(e)
            }
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    /// Receive up to `max` bytes into a fresh buffer.
    ///
    /// Returns an empty buffer when nothing was available.
    pub fn receive_bytes(&mut self, max: usize) -> io::Result<Bytes> {
        let mut buf = BytesMut::zeroed(max);
        let n = match self.receive(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e),
        };
        buf.truncate(n);
        Ok(buf.freeze())
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.failed
    }

    /// Bytes received through this reader.
    #[must_use]
    pub const fn received(&self) -> usize {
        self.received
    }

    pub(crate) const fn should_disconnect(&self) -> bool {
        self.is_closed() || self.is_failed()
    }
}

impl Read for SocketReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.receive(buf)
    }
}
