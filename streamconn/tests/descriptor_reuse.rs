//! Descriptor Reuse Integration Tests
//!
//! A descriptor closed while a batch is handled may be handed to a new
//! socket before the batch ends. Kept in its own binary so no other test
//! allocates descriptors concurrently.

mod common;

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use common::{next_event, start_container, stop_container, tcp_endpoints, Event, TIMEOUT};
use streamconn::prelude::*;

const HOLD: Duration = Duration::from_millis(400);

/// Records events and hands out every accepted connection. Receiving
/// `hold` blocks the loop thread for [`HOLD`].
struct Holding {
    events: flume::Sender<Event>,
    accepted: flume::Sender<Connection>,
}

impl StreamCallback for Holding {
    fn connected(&self, connection: &Connection) {
        let _ = self.accepted.send(connection.clone());
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
        if data.as_ref() == b"hold" {
            std::thread::sleep(HOLD);
        }
        let _ = self.events.send(Event::Received(connection.id(), data));
    }
}

#[test]
fn test_reused_descriptor_ignores_stale_hangup() {
    let (container, handle) = start_container();
    let (events_tx, events) = flume::unbounded();
    let (accepted_tx, accepted) = flume::unbounded();
    let server = Arc::new(Holding {
        events: events_tx,
        accepted: accepted_tx,
    });
    let (bind, _) = tcp_endpoints();
    container.bind(&bind, server).unwrap();
    let port: u16 = bind.rsplit(':').next().unwrap().parse().unwrap();

    let mut holder = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let holder_id = accepted.recv_timeout(TIMEOUT).unwrap().id();
    let first = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let first_server = accepted.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(next_event(&events), Event::Connected(holder_id));
    assert_eq!(next_event(&events), Event::Connected(first_server.id()));

    // While the loop sleeps in a callback: ask for a disconnect, queue a new
    // connection and make the doomed one report a hangup. The next batch
    // then carries the hangup after the accept that reuses its descriptor.
    holder.write_all(b"hold").unwrap();
    std::thread::sleep(HOLD / 4);
    first_server.disconnect();
    let mut second = TcpStream::connect(("127.0.0.1", port)).unwrap();
    first.shutdown(Shutdown::Write).unwrap();

    let second_server = accepted.recv_timeout(TIMEOUT).unwrap();
    assert_ne!(second_server.id(), first_server.id());
    let mut seen = Vec::new();
    while !seen.contains(&Event::Connected(second_server.id())) {
        seen.push(next_event(&events));
    }
    assert!(seen.contains(&Event::Disconnected(first_server.id())));

    // Give a stale teardown the chance to happen.
    std::thread::sleep(Duration::from_millis(100));
    assert!(second_server.is_connected());
    assert!(events.try_iter().all(|e| e != Event::Disconnected(second_server.id())));

    second
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let mut buf = [0u8; 8];
    match second.read(&mut buf) {
        Err(e) => assert!(matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)),
        Ok(n) => panic!("server closed the new connection, read returned {n}"),
    }

    second.write_all(b"alive").unwrap();
    assert_eq!(
        next_event(&events),
        Event::Received(second_server.id(), Bytes::from_static(b"alive"))
    );
    stop_container(&container, handle);
}
