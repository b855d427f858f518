//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use streamconn::prelude::*;
use streamconn::ConnectionId;

pub const TIMEOUT: Duration = Duration::from_secs(10);

const CERT_DER: &[u8] = include_bytes!("../certs/cert.der");
const KEY_DER: &[u8] = include_bytes!("../certs/key.der");

/// Bind and connect endpoints for a free loopback port.
pub fn tcp_endpoints() -> (String, String) {
    let port = portpicker::pick_unused_port().expect("no free port");
    (format!("tcp://*:{port}"), format!("tcp://localhost:{port}"))
}

pub fn ipc_endpoint(name: &str) -> String {
    let path = std::env::temp_dir().join(format!("streamconn-{name}-{}.sock", std::process::id()));
    format!("ipc://{}", path.display())
}

pub fn server_certificate() -> CertificateData {
    CertificateData::server(
        vec![CertificateDer::from(CERT_DER.to_vec())],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(KEY_DER.to_vec())),
    )
}

pub fn client_certificate() -> CertificateData {
    CertificateData::client(vec![CertificateDer::from(CERT_DER.to_vec())])
}

/// Initialized container with a running loop and short timings.
pub fn start_container() -> (ConnectionContainer, JoinHandle<()>) {
    streamconn::dev_tracing::init_tracing();
    let container = ConnectionContainer::new();
    container
        .init(Duration::from_millis(5), Duration::from_millis(5))
        .unwrap();
    let handle = container.spawn().unwrap();
    (container, handle)
}

pub fn stop_container(container: &ConnectionContainer, handle: JoinHandle<()>) {
    assert!(container.terminate_poller_loop(TIMEOUT));
    handle.join().unwrap();
}

/// Poll `condition` until it holds or `TIMEOUT` passes.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected(ConnectionId),
    Received(ConnectionId, Bytes),
    Disconnected(ConnectionId),
}

/// Raw stream callback forwarding everything it sees into a channel.
pub struct Recorder {
    events: flume::Sender<Event>,
    /// Echo received bytes back to the sender.
    echo: bool,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, flume::Receiver<Event>) {
        let (events, receiver) = flume::unbounded();
        (Arc::new(Self { events, echo: false }), receiver)
    }

    pub fn echo() -> (Arc<Self>, flume::Receiver<Event>) {
        let (events, receiver) = flume::unbounded();
        (Arc::new(Self { events, echo: true }), receiver)
    }
}

impl StreamCallback for Recorder {
    fn connected(&self, connection: &Connection) {
        let _ = self.events.send(Event::Connected(connection.id()));
    }

    fn disconnected(&self, connection: &Connection) {
        let _ = self.events.send(Event::Disconnected(connection.id()));
    }

    fn received(&self, connection: &Connection, reader: &mut SocketReader<'_>, bytes_to_read: usize) {
        let Ok(data) = reader.receive_bytes(bytes_to_read) else {
            return;
        };
        if data.is_empty() {
            return;
        }
        if self.echo {
            connection.send(data.clone()).unwrap();
        }
        let _ = self.events.send(Event::Received(connection.id(), data));
    }
}

pub fn next_event(events: &flume::Receiver<Event>) -> Event {
    events.recv_timeout(TIMEOUT).expect("no event in time")
}

/// Collect received bytes of `id` until `len` bytes arrived.
pub fn collect_bytes(events: &flume::Receiver<Event>, id: ConnectionId, len: usize) -> Bytes {
    let mut out = BytesMut::with_capacity(len);
    while out.len() < len {
        match next_event(events) {
            Event::Received(from, data) if from == id => out.extend_from_slice(&data),
            Event::Received(..) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }
    out.freeze()
}

#[derive(Debug)]
pub enum SessionEvent {
    Connected(ConnectionId),
    Received(ConnectionId, Message),
    Disconnected(ConnectionId),
}

/// Session callback forwarding into a channel.
pub struct SessionRecorder {
    events: flume::Sender<SessionEvent>,
    echo: bool,
}

impl SessionRecorder {
    pub fn new() -> (Arc<Self>, flume::Receiver<SessionEvent>) {
        let (events, receiver) = flume::unbounded();
        (Arc::new(Self { events, echo: false }), receiver)
    }

    pub fn echo() -> (Arc<Self>, flume::Receiver<SessionEvent>) {
        let (events, receiver) = flume::unbounded();
        (Arc::new(Self { events, echo: true }), receiver)
    }
}

impl SessionCallback for SessionRecorder {
    fn connected(&self, session: &Session) {
        let _ = self.events.send(SessionEvent::Connected(session.id()));
    }

    fn disconnected(&self, session: &Session) {
        let _ = self.events.send(SessionEvent::Disconnected(session.id()));
    }

    fn received(&self, session: &Session, message: Message) {
        if self.echo {
            let reply = session.create_message().push(message.received().clone());
            session.send_message(reply).unwrap();
        }
        let _ = self.events.send(SessionEvent::Received(session.id(), message));
    }
}

pub fn next_session_event(events: &flume::Receiver<SessionEvent>) -> SessionEvent {
    events.recv_timeout(TIMEOUT).expect("no session event in time")
}
