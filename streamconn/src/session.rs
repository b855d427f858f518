//! Framed container.
//!
//! [`ProtocolSessionContainer`] runs a [`ConnectionContainer`] and puts one
//! protocol instance between each connection and the application, so
//! callbacks see whole messages instead of raw bytes.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;
use streamconn_core::connection_data::{ConnectionId, ConnectionState};
use streamconn_core::error::{Result, StreamError};
use streamconn_core::message::Message;
use streamconn_core::monitor::ConnectionMonitor;
use streamconn_core::options::ConnectOptions;
use streamconn_core::tls::CertificateData;
use streamconn_proto::protocol::{Protocol, ProtocolCallback, ProtocolFactory};
use tracing::{debug, trace};

use crate::callback::{CallbackFactory, SocketReader, StreamCallback};
use crate::connection::Connection;
use crate::container::ConnectionContainer;

/// Message level event handler.
///
/// Runs on the poll loop thread with the same ordering guarantees as
/// [`StreamCallback`].
pub trait SessionCallback: Send + Sync {
    fn connected(&self, _session: &Session) {}

    fn disconnected(&self, _session: &Session) {}

    fn received(&self, session: &Session, message: Message);
}

type SharedProtocol = Arc<Mutex<Box<dyn Protocol>>>;
type SessionMap = Arc<Mutex<HashMap<ConnectionId, Session>>>;

/// A connection together with its protocol instance.
#[derive(Clone)]
pub struct Session {
    connection: Connection,
    protocol: SharedProtocol,
}

impl Session {
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Empty message suited to this session's protocol.
    #[must_use]
    pub fn create_message(&self) -> Message {
        self.protocol.lock().create_message()
    }

    /// Frame `message` and queue it.
    pub fn send_message(&self, mut message: Message) -> Result<()> {
        self.protocol.lock().prepare_message_to_send(&mut message);
        self.connection.send_message(message)
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

enum ProtocolEvent {
    Connected,
    Disconnected,
    Received(Message),
}

/// Collects protocol output so callbacks run after the protocol lock is released.
#[derive(Default)]
struct EventQueue(Vec<ProtocolEvent>);

impl ProtocolCallback for EventQueue {
    fn connected(&mut self) {
        self.0.push(ProtocolEvent::Connected);
    }

    fn disconnected(&mut self) {
        self.0.push(ProtocolEvent::Disconnected);
    }

    fn received(&mut self, message: Message) {
        self.0.push(ProtocolEvent::Received(message));
    }
}

/// Raw stream callback feeding one protocol instance.
struct ProtocolBridge {
    protocol: SharedProtocol,
    callback: Arc<dyn SessionCallback>,
    sessions: SessionMap,
    read_chunk_size: usize,
}

impl ProtocolBridge {
    fn session(&self, connection: &Connection) -> Session {
        Session {
            connection: connection.clone(),
            protocol: Arc::clone(&self.protocol),
        }
    }

    fn drive(&self, session: &Session, f: impl FnOnce(&mut dyn Protocol, &mut EventQueue)) {
        let mut queue = EventQueue::default();
        {
            let mut protocol = self.protocol.lock();
            f(&mut **protocol, &mut queue);
        }
        for event in queue.0 {
            match event {
                ProtocolEvent::Connected => self.callback.connected(session),
                ProtocolEvent::Disconnected => self.callback.disconnected(session),
                ProtocolEvent::Received(message) => self.callback.received(session, message),
            }
        }
    }
}

impl StreamCallback for ProtocolBridge {
    fn connected(&self, connection: &Connection) {
        let session = self.session(connection);
        self.sessions.lock().insert(session.id(), session.clone());
        self.drive(&session, |protocol, queue| protocol.socket_connected(queue));
    }

    fn disconnected(&self, connection: &Connection) {
        let session = self.session(connection);
        self.sessions.lock().remove(&session.id());
        self.drive(&session, |protocol, queue| protocol.socket_disconnected(queue));
    }

    fn received(&self, connection: &Connection, reader: &mut SocketReader<'_>, bytes_to_read: usize) {
        let chunk = match reader.receive_bytes(bytes_to_read.min(self.read_chunk_size)) {
            Ok(chunk) => chunk,
            Err(e) => {
                trace!(connection_id = connection.id(), error = %e, "receive failed");
                return;
            }
        };
        if chunk.is_empty() {
            return;
        }
        let session = self.session(connection);
        self.drive(&session, |protocol, queue| protocol.receive(chunk, queue));
    }
}

/// Container delivering framed messages.
pub struct ProtocolSessionContainer {
    container: ConnectionContainer,
    sessions: SessionMap,
}

impl ProtocolSessionContainer {
    #[must_use]
    pub fn new() -> Self {
        Self::with_container(ConnectionContainer::new())
    }

    /// Framed container over `container`. Sessions are forgotten when its
    /// loop stops, since shutdown delivers no `disconnected` callbacks.
    #[must_use]
    pub fn with_container(container: ConnectionContainer) -> Self {
        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
        let stale = Arc::downgrade(&sessions);
        container.on_loop_stopped(move || {
            if let Some(sessions) = stale.upgrade() {
                let dropped = std::mem::take(&mut *sessions.lock());
                debug!(sessions = dropped.len(), "session registry cleared");
            }
        });
        Self { container, sessions }
    }

    /// The raw container underneath.
    #[must_use]
    pub fn container(&self) -> &ConnectionContainer {
        &self.container
    }

    pub fn init(&self, cycle_time: Duration, check_reconnect_interval: Duration) -> Result<()> {
        self.container.init(cycle_time, check_reconnect_interval)
    }

    pub fn spawn(&self) -> Result<JoinHandle<()>> {
        self.container.spawn()
    }

    pub fn run(&self) -> Result<()> {
        self.container.run()
    }

    pub fn terminate_poller_loop(&self, timeout: Duration) -> bool {
        self.container.terminate_poller_loop(timeout)
    }

    /// Listen on `endpoint`; each accepted connection gets a protocol from `factory`.
    pub fn bind(
        &self,
        endpoint: &str,
        callback: Arc<dyn SessionCallback>,
        factory: Arc<dyn ProtocolFactory>,
    ) -> Result<()> {
        self.container
            .bind_each(endpoint, self.bridge_factory(callback, factory), None)
    }

    pub fn bind_tls(
        &self,
        endpoint: &str,
        callback: Arc<dyn SessionCallback>,
        factory: Arc<dyn ProtocolFactory>,
        certificate_data: &CertificateData,
    ) -> Result<()> {
        self.container.bind_each(
            endpoint,
            self.bridge_factory(callback, factory),
            Some(certificate_data),
        )
    }

    pub fn unbind(&self, endpoint: &str) -> bool {
        self.container.unbind(endpoint)
    }

    /// Connect to `endpoint` speaking `protocol`.
    pub fn connect(
        &self,
        endpoint: &str,
        callback: Arc<dyn SessionCallback>,
        protocol: Box<dyn Protocol>,
        options: ConnectOptions,
    ) -> Result<Session> {
        let bridge = self.bridge(callback, protocol);
        let protocol = Arc::clone(&bridge.protocol);
        let connection = self.container.create_connection(endpoint, bridge, options)?;
        let session = Session {
            connection,
            protocol,
        };
        {
            // Checked under the lock the stop hook clears with.
            let mut sessions = self.sessions.lock();
            if self.container.is_stopping() {
                return Err(StreamError::PollerTerminated);
            }
            sessions.insert(session.id(), session.clone());
        }
        session.connection.connect();
        Ok(session)
    }

    #[must_use]
    pub fn get_session(&self, id: ConnectionId) -> Option<Session> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Live sessions ordered by id.
    #[must_use]
    pub fn get_all_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.lock().values().cloned().collect();
        sessions.sort_by_key(Session::id);
        sessions
    }

    #[must_use]
    pub fn monitor(&self) -> ConnectionMonitor {
        self.container.monitor()
    }

    fn bridge(&self, callback: Arc<dyn SessionCallback>, protocol: Box<dyn Protocol>) -> Arc<ProtocolBridge> {
        Arc::new(ProtocolBridge {
            protocol: Arc::new(Mutex::new(protocol)),
            callback,
            sessions: Arc::clone(&self.sessions),
            read_chunk_size: self.container.config().read_chunk_size,
        })
    }

    fn bridge_factory(
        &self,
        callback: Arc<dyn SessionCallback>,
        factory: Arc<dyn ProtocolFactory>,
    ) -> CallbackFactory {
        let sessions = Arc::clone(&self.sessions);
        let read_chunk_size = self.container.config().read_chunk_size;
        Arc::new(move || -> Arc<dyn StreamCallback> {
            Arc::new(ProtocolBridge {
                protocol: Arc::new(Mutex::new(factory.create_protocol())),
                callback: Arc::clone(&callback),
                sessions: Arc::clone(&sessions),
                read_chunk_size,
            })
        })
    }
}

impl Default for ProtocolSessionContainer {
    fn default() -> Self {
        Self::new()
    }
}
