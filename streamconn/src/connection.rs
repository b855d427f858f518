//! Connection handles.
//!
//! A [`Connection`] is a cheap, cloneable handle. The container keeps one in
//! its registry while the connection is live; callers may keep theirs past
//! removal, after which the handle reports [`ConnectionState::Disconnected`]
//! and refuses to send.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use streamconn_core::buffer::SegmentedBuffer;
use streamconn_core::connection_data::{ConnectionData, ConnectionId, ConnectionState};
use streamconn_core::error::{Result, StreamError};
use streamconn_core::message::Message;
use streamconn_core::poller::{PollWaker, Poller};
use streamconn_core::reconnect::ReconnectState;
use streamconn_core::socket::Socket;
use streamconn_core::sys::INVALID_FD;
use streamconn_core::tls::CertificateData;
use tracing::trace;

use crate::callback::StreamCallback;

/// Socket side of a connection. Only the loop thread touches it.
#[derive(Debug)]
pub(crate) struct ConnectionIo {
    pub(crate) socket: Option<Socket>,
    /// TCP connect finished; a TLS handshake may still be running.
    pub(crate) tcp_established: bool,
    pub(crate) ever_connected: bool,
    pub(crate) reconnect: ReconnectState,
}

pub(crate) struct ConnectionShared {
    pub(crate) id: ConnectionId,
    pub(crate) data: Mutex<ConnectionData>,
    /// Bytes waiting for the socket. Lock order: `io`, then `outbound`, then the poller.
    pub(crate) outbound: Mutex<SegmentedBuffer>,
    pub(crate) io: Mutex<ConnectionIo>,
    pub(crate) callback: Arc<dyn StreamCallback>,
    pub(crate) tls: Option<CertificateData>,
    /// Descriptor currently registered with the poller.
    pub(crate) fd: AtomicI32,
    pub(crate) connect_requested: AtomicBool,
    pub(crate) disconnect_requested: AtomicBool,
    /// `disconnected` was delivered.
    pub(crate) finished: AtomicBool,
    pub(crate) poller: Arc<Poller>,
    pub(crate) waker: PollWaker,
}

/// Handle to one connection of a container.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<ConnectionShared>,
}

impl Connection {
    pub(crate) fn new(
        data: ConnectionData,
        callback: Arc<dyn StreamCallback>,
        tls: Option<CertificateData>,
        poller: &Arc<Poller>,
    ) -> Self {
        let reconnect = ReconnectState::new(data.reconnect);
        Self {
            shared: Arc::new(ConnectionShared {
                id: data.connection_id,
                data: Mutex::new(data),
                outbound: Mutex::new(SegmentedBuffer::new()),
                io: Mutex::new(ConnectionIo {
                    socket: None,
                    tcp_established: false,
                    ever_connected: false,
                    reconnect,
                }),
                callback,
                tls,
                fd: AtomicI32::new(INVALID_FD),
                connect_requested: AtomicBool::new(false),
                disconnect_requested: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                poller: Arc::clone(poller),
                waker: poller.waker(),
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Snapshot of the connection's data.
    #[must_use]
    pub fn data(&self) -> ConnectionData {
        self.shared.data.lock().clone()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.data.lock().state
    }

    /// Endpoint string given to bind or connect.
    #[must_use]
    pub fn endpoint(&self) -> String {
        self.shared.data.lock().endpoint.clone()
    }

    #[must_use]
    pub fn is_incoming(&self) -> bool {
        self.shared.data.lock().incoming
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Bytes queued but not yet accepted by the socket.
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.shared.outbound.lock().len()
    }

    /// Ask the loop to start connecting a `Created` connection.
    ///
    /// Does nothing for connections already connecting, connected or gone.
    pub fn connect(&self) {
        {
            let mut data = self.shared.data.lock();
            if data.state != ConnectionState::Created {
                trace!(connection_id = self.id(), state = %data.state, "connect ignored");
                return;
            }
            data.state = ConnectionState::Connecting;
        }
        self.shared.connect_requested.store(true, Ordering::Release);
        self.shared.waker.release_wait();
    }

    /// Ask the loop to close this connection. Callable from any thread.
    ///
    /// An explicitly disconnected connection is never reconnected.
    pub fn disconnect(&self) {
        self.shared.disconnect_requested.store(true, Ordering::Release);
        self.shared.waker.release_wait();
    }

    /// Queue `message` for sending.
    ///
    /// Messages sent before the connection is established are flushed
    /// right after it connects. Fails once the connection is disconnected.
    pub fn send_message(&self, message: Message) -> Result<()> {
        let mut outbound = self.shared.outbound.lock();
        let state = self.state();
        if state == ConnectionState::Disconnected {
            return Err(StreamError::ConnectionClosed(self.id()));
        }
        for segment in message.into_segments() {
            outbound.push(segment);
        }
        if state == ConnectionState::Connected {
            self.shared.poller.enable_write(self.fd());
        }
        Ok(())
    }

    /// Queue raw bytes for sending.
    pub fn send(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.send_message(Message::new().push(bytes))
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.shared.fd.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.shared.data.lock().state = state;
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.shared.data.lock();
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("endpoint", &data.endpoint)
            .field("incoming", &data.incoming)
            .field("state", &data.state)
            .finish()
    }
}
