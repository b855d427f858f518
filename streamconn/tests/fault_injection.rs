//! Fault Injection Integration Tests
//!
//! Real sockets behind a syscall layer that fails chosen calls.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{next_event, tcp_endpoints, wait_until, Event, Recorder, TIMEOUT};
use streamconn::prelude::*;
use streamconn::StreamError;
use streamconn_core::sys::{self, FaultInjection, SharedSyscall, SyscallKind};

fn start(faults: &Arc<FaultInjection>) -> (ConnectionContainer, std::thread::JoinHandle<()>) {
    streamconn::dev_tracing::init_tracing();
    let sys: SharedSyscall = faults.clone();
    let container = ConnectionContainer::with_syscall(sys);
    container
        .init(Duration::from_millis(5), Duration::from_millis(5))
        .unwrap();
    let handle = container.spawn().unwrap();
    (container, handle)
}

fn faults() -> Arc<FaultInjection> {
    Arc::new(FaultInjection::new(sys::os()))
}

#[test]
fn test_socket_failure_fails_bind() {
    let faults = faults();
    let (container, handle) = start(&faults);
    let (callback, _events) = Recorder::new();
    let (bind, _) = tcp_endpoints();

    faults.fail_next(SyscallKind::Socket, libc::EMFILE);
    assert!(matches!(
        container.bind(&bind, callback.clone()),
        Err(StreamError::Io(_))
    ));
    assert!(!container.is_bound(&bind));
    container.bind(&bind, callback).unwrap();

    assert!(container.terminate_poller_loop(TIMEOUT));
    handle.join().unwrap();
}

#[test]
fn test_refused_connect_disconnects() {
    let faults = faults();
    let (container, handle) = start(&faults);
    let (server, server_events) = Recorder::new();
    let (client, client_events) = Recorder::new();
    let (bind, connect) = tcp_endpoints();
    container.bind(&bind, server).unwrap();

    faults.fail_next(SyscallKind::Connect, libc::ECONNREFUSED);
    let connection = container
        .connect(&connect, client, ConnectOptions::default())
        .unwrap();

    assert_eq!(next_event(&client_events), Event::Disconnected(connection.id()));
    assert!(server_events.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(faults.calls(SyscallKind::Connect), 1);

    assert!(container.terminate_poller_loop(TIMEOUT));
    handle.join().unwrap();
}

#[test]
fn test_refused_connect_is_retried() {
    let faults = faults();
    let (container, handle) = start(&faults);
    let monitor = container.monitor();
    let (server, server_events) = Recorder::new();
    let (client, client_events) = Recorder::new();
    let (bind, connect) = tcp_endpoints();
    container.bind(&bind, server).unwrap();

    faults.fail_next(SyscallKind::Connect, libc::ECONNREFUSED);
    faults.fail_next(SyscallKind::Connect, libc::ECONNREFUSED);
    let options = ConnectOptions::default().with_reconnect_interval(Duration::from_millis(5));
    let connection = container.connect(&connect, client, options).unwrap();

    assert_eq!(next_event(&client_events), Event::Connected(connection.id()));
    assert!(matches!(next_event(&server_events), Event::Connected(_)));
    assert_eq!(faults.calls(SyscallKind::Connect), 3);

    let failures = monitor
        .drain()
        .filter(|e| matches!(e, ConnectionEvent::ConnectFailed { .. }))
        .count();
    assert_eq!(failures, 2);

    assert!(container.terminate_poller_loop(TIMEOUT));
    handle.join().unwrap();
}

#[test]
fn test_transient_accept_failure_is_recovered() {
    let faults = faults();
    let (container, handle) = start(&faults);
    let (server, server_events) = Recorder::new();
    let (client, client_events) = Recorder::new();
    let (bind, connect) = tcp_endpoints();
    container.bind(&bind, server).unwrap();

    faults.fail_next(SyscallKind::Accept, libc::EMFILE);
    let connection = container
        .connect(&connect, client, ConnectOptions::default())
        .unwrap();

    // The listener stays readable, so the next wait accepts.
    assert!(matches!(next_event(&server_events), Event::Connected(_)));
    assert_eq!(next_event(&client_events), Event::Connected(connection.id()));
    assert!(faults.calls(SyscallKind::Accept) >= 2);

    assert!(container.terminate_poller_loop(TIMEOUT));
    handle.join().unwrap();
}

#[test]
fn test_interrupted_wait_keeps_looping() {
    let faults = faults();
    faults.fail_next(SyscallKind::EpollWait, libc::EINTR);
    let (container, handle) = start(&faults);
    let (server, server_events) = Recorder::new();
    let (client, _client_events) = Recorder::new();
    let (bind, connect) = tcp_endpoints();

    container.bind(&bind, server).unwrap();
    container
        .connect(&connect, client, ConnectOptions::default())
        .unwrap();
    assert!(matches!(next_event(&server_events), Event::Connected(_)));
    assert!(!container.is_terminated());

    assert!(container.terminate_poller_loop(TIMEOUT));
    handle.join().unwrap();
}

#[test]
fn test_wait_failure_stops_loop() {
    let faults = faults();
    let (container, handle) = start(&faults);
    let (server, server_events) = Recorder::new();
    let (client, client_events) = Recorder::new();
    let (bind, connect) = tcp_endpoints();
    container.bind(&bind, server).unwrap();
    let connection = container
        .connect(&connect, client, ConnectOptions::default())
        .unwrap();
    assert_eq!(next_event(&client_events), Event::Connected(connection.id()));
    assert!(matches!(next_event(&server_events), Event::Connected(_)));

    // The next cycle's wait fails.
    faults.fail_always(SyscallKind::EpollWait, libc::EBADF);

    assert!(wait_until(|| container.is_terminated()));
    handle.join().unwrap();
    // Shutdown closes sockets without further callbacks.
    assert!(client_events.try_recv().is_err());
    assert!(container.terminate_poller_loop(Duration::from_millis(1)));
}
