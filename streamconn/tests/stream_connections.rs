//! Raw Stream Connection Integration Tests
//!
//! Accept/connect ordering, sending, disconnects and lookups over real
//! loopback and Unix-domain sockets.

mod common;

use bytes::{BufMut, Bytes, BytesMut};
use common::{
    collect_bytes, ipc_endpoint, next_event, start_container, stop_container, tcp_endpoints,
    wait_until, Event, Recorder,
};
use streamconn::prelude::*;
use streamconn::StreamError;

/// Connect a client to a freshly bound endpoint and wait for both `connected` callbacks.
fn connected_pair(
    container: &ConnectionContainer,
    server: std::sync::Arc<Recorder>,
    server_events: &flume::Receiver<Event>,
    client: std::sync::Arc<Recorder>,
    client_events: &flume::Receiver<Event>,
) -> (Connection, u64) {
    let (bind, connect) = tcp_endpoints();
    container.bind(&bind, server).unwrap();
    let connection = container
        .connect(&connect, client, ConnectOptions::default())
        .unwrap();

    assert_eq!(next_event(client_events), Event::Connected(connection.id()));
    let Event::Connected(accepted) = next_event(server_events) else {
        panic!("server did not see a connection first");
    };
    (connection, accepted)
}

#[test]
fn test_connected_once_before_received() {
    let (container, handle) = start_container();
    let (server, server_events) = Recorder::new();
    let (client, client_events) = Recorder::new();
    let (connection, accepted) =
        connected_pair(&container, server, &server_events, client, &client_events);

    assert_ne!(connection.id(), accepted);
    assert!(connection.is_connected());
    assert!(!connection.is_incoming());

    connection.send(Bytes::from_static(b"ping")).unwrap();
    assert_eq!(
        next_event(&server_events),
        Event::Received(accepted, Bytes::from_static(b"ping"))
    );
    // No second connected on either side.
    assert!(server_events.try_recv().is_err());
    assert!(client_events.try_recv().is_err());
    stop_container(&container, handle);
}

#[test]
fn test_echo_round_trip() {
    let (container, handle) = start_container();
    let (server, server_events) = Recorder::echo();
    let (client, client_events) = Recorder::new();
    let (connection, _) =
        connected_pair(&container, server, &server_events, client, &client_events);

    connection.send(Bytes::from_static(b"hello")).unwrap();
    assert_eq!(
        collect_bytes(&client_events, connection.id(), 5),
        Bytes::from_static(b"hello")
    );
    stop_container(&container, handle);
}

#[test]
fn test_send_before_connect_is_queued() {
    let (container, handle) = start_container();
    let (server, server_events) = Recorder::new();
    let (client, _client_events) = Recorder::new();
    let (bind, connect) = tcp_endpoints();
    container.bind(&bind, server).unwrap();

    let connection = container
        .create_connection(&connect, client, ConnectOptions::default())
        .unwrap();
    assert_eq!(connection.state(), ConnectionState::Created);
    connection.send(Bytes::from_static(b"early")).unwrap();
    assert_eq!(connection.queued_bytes(), 5);

    connection.connect();
    let Event::Connected(accepted) = next_event(&server_events) else {
        panic!("expected connected");
    };
    assert_eq!(
        collect_bytes(&server_events, accepted, 5),
        Bytes::from_static(b"early")
    );
    stop_container(&container, handle);
}

#[test]
fn test_thousand_messages_in_order() {
    let (container, handle) = start_container();
    let (server, server_events) = Recorder::new();
    let (client, client_events) = Recorder::new();
    let (connection, accepted) =
        connected_pair(&container, server, &server_events, client, &client_events);

    let mut expected = BytesMut::new();
    for i in 0..1000u32 {
        let message = format!("message {i:04};");
        expected.put_slice(message.as_bytes());
        connection.send(message).unwrap();
    }

    let received = collect_bytes(&server_events, accepted, expected.len());
    assert_eq!(received, expected.freeze());
    stop_container(&container, handle);
}

#[test]
fn test_large_messages() {
    let (container, handle) = start_container();
    let (server, server_events) = Recorder::new();
    let (client, client_events) = Recorder::new();
    let (connection, accepted) =
        connected_pair(&container, server, &server_events, client, &client_events);

    const SIZE: usize = 500 * 1024;
    let mut expected = BytesMut::with_capacity(SIZE * 100);
    for i in 0..100u8 {
        let payload = Bytes::from(vec![i; SIZE]);
        expected.put_slice(&payload);
        connection.send(payload).unwrap();
    }

    let received = collect_bytes(&server_events, accepted, expected.len());
    assert_eq!(received.len(), expected.len());
    assert!(received == expected.freeze(), "payload corrupted or reordered");
    assert!(wait_until(|| connection.queued_bytes() == 0));
    stop_container(&container, handle);
}

#[test]
fn test_explicit_disconnect() {
    let (container, handle) = start_container();
    let (server, server_events) = Recorder::new();
    let (client, client_events) = Recorder::new();
    let (connection, accepted) =
        connected_pair(&container, server, &server_events, client, &client_events);

    connection.disconnect();
    assert_eq!(next_event(&client_events), Event::Disconnected(connection.id()));
    assert_eq!(next_event(&server_events), Event::Disconnected(accepted));

    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(container.get_connection(connection.id()).is_none());
    assert!(matches!(
        connection.send(Bytes::from_static(b"late")),
        Err(StreamError::ConnectionClosed(_))
    ));
    // Disconnecting again changes nothing.
    connection.disconnect();
    assert!(client_events
        .recv_timeout(std::time::Duration::from_millis(50))
        .is_err());
    stop_container(&container, handle);
}

#[test]
fn test_get_connections() {
    let (container, handle) = start_container();
    let (server, server_events) = Recorder::new();
    let (client, client_events) = Recorder::new();
    let (connection, accepted) =
        connected_pair(&container, server, &server_events, client, &client_events);

    let all = container.get_all_connections();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id(), connection.id());
    assert_eq!(all[1].id(), accepted);

    let incoming = container.get_connection(accepted).unwrap();
    assert!(incoming.is_incoming());
    let data = incoming.data();
    assert!(data.endpoint_peer.starts_with("tcp://127.0.0.1:"));
    assert_eq!(data.state, ConnectionState::Connected);
    assert_eq!(container.get_connection(connection.id()).unwrap(), connection);
    stop_container(&container, handle);
}

#[test]
fn test_peer_close_disconnects_server_side() {
    let (container, handle) = start_container();
    let (server, server_events) = Recorder::new();
    let (bind, connect) = tcp_endpoints();
    container.bind(&bind, server).unwrap();

    let port: u16 = connect.rsplit(':').next().unwrap().parse().unwrap();
    let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    let Event::Connected(accepted) = next_event(&server_events) else {
        panic!("expected connected");
    };

    std::io::Write::write_all(&mut stream, b"bye").unwrap();
    assert_eq!(
        collect_bytes(&server_events, accepted, 3),
        Bytes::from_static(b"bye")
    );
    drop(stream);
    assert_eq!(next_event(&server_events), Event::Disconnected(accepted));
    assert!(container.get_connection(accepted).is_none());
    stop_container(&container, handle);
}

#[test]
fn test_ipc_connection() {
    let (container, handle) = start_container();
    let (server, server_events) = Recorder::new();
    let (client, client_events) = Recorder::new();
    let endpoint = ipc_endpoint("stream");

    container.bind(&endpoint, server).unwrap();
    let connection = container
        .connect(&endpoint, client, ConnectOptions::default())
        .unwrap();
    assert_eq!(next_event(&client_events), Event::Connected(connection.id()));
    let Event::Connected(accepted) = next_event(&server_events) else {
        panic!("expected connected");
    };

    connection.send(Bytes::from_static(b"over ipc")).unwrap();
    assert_eq!(
        collect_bytes(&server_events, accepted, 8),
        Bytes::from_static(b"over ipc")
    );

    assert!(container.unbind(&endpoint));
    let path = endpoint.trim_start_matches("ipc://");
    assert!(!std::path::Path::new(path).exists());
    stop_container(&container, handle);
}
