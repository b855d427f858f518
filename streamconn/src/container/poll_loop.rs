//! The poll loop.
//!
//! One iteration waits on the poller, handles cross-thread requests when
//! the wake channel fired, dispatches every ready descriptor to its
//! connection, pending TLS accept or listening socket, and finally scans
//! reconnecting connections when the check interval has elapsed.
//!
//! Descriptors are looked up again for every event, so a connection torn
//! down earlier in the same batch is simply skipped. Descriptors closed
//! after the wait returned are remembered until the next wait: the number
//! may already belong to a freshly accepted socket, and the batch entry
//! still describes the old one.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashSet;
use streamconn_core::connection_data::{ConnectionData, ConnectionState};
use streamconn_core::endpoint::peer_endpoint;
use streamconn_core::error::StreamError;
use streamconn_core::monitor::ConnectionEvent;
use streamconn_core::options::ContainerConfig;
use streamconn_core::poller::{DescriptorInfo, PollOutcome};
use streamconn_core::reconnect::ReconnectAction;
use streamconn_core::socket::Socket;
use streamconn_core::sys::INVALID_FD;
use streamconn_core::tls::IoState;
use tracing::{debug, error, info, trace, warn};

use super::registry::{BindEntry, PendingAccept, Route};
use super::{remove_ipc_file, Inner};
use crate::callback::{CallbackFactory, SocketReader};
use crate::connection::Connection;

enum ReadOutcome {
    Drained,
    /// TLS plaintext is still buffered after the read cap.
    Pending,
    Disconnect(String),
}

enum ConnectStep {
    Waiting,
    Connected,
    Failed(String),
}

pub(super) struct PollLoop {
    inner: Arc<Inner>,
    config: ContainerConfig,
    last_reconnect_check: Instant,
    /// Connections to read again without waiting for readiness.
    deferred_reads: Vec<Connection>,
    /// Descriptors closed since the last wait returned.
    released: HashSet<RawFd>,
}

impl PollLoop {
    pub(super) fn new(inner: Arc<Inner>) -> Self {
        let config = inner.config.read().clone();
        Self {
            inner,
            config,
            last_reconnect_check: Instant::now(),
            deferred_reads: Vec::new(),
            released: HashSet::new(),
        }
    }

    pub(super) fn run(mut self) {
        info!(
            cycle_time = ?self.config.cycle_time,
            check_reconnect_interval = ?self.config.check_reconnect_interval,
            "poll loop started"
        );
        self.process_requests();

        while !self.inner.terminate.load(Ordering::Acquire) {
            let timeout = if self.deferred_reads.is_empty() {
                self.config.cycle_time
            } else {
                Duration::ZERO
            };
            let result = self.inner.poller.wait(timeout);
            // Closes from earlier iterations happened before this wait.
            self.released = std::mem::take(&mut *self.inner.released_fds.lock());
            if result.release_wait {
                self.process_requests();
            }

            match result.outcome {
                PollOutcome::Timeout => {}
                PollOutcome::Error(e) => {
                    error!(error = %e, "poller wait failed, stopping poll loop");
                    break;
                }
                PollOutcome::Ready(infos) => {
                    for info in infos {
                        self.dispatch(info);
                    }
                }
            }

            self.run_deferred_reads();

            if self.last_reconnect_check.elapsed() >= self.config.check_reconnect_interval {
                self.check_reconnects();
                self.last_reconnect_check = Instant::now();
            }
        }

        // Also set when the wait failed, so late requests see the loop as gone.
        self.inner.terminate.store(true, Ordering::Release);
        self.shutdown();
        self.inner.run_stop_hooks();
        self.inner.mark_stopped();
        info!("poll loop stopped");
    }

    /// Handle connect and disconnect requests made from other threads.
    fn process_requests(&mut self) {
        let connections: Vec<Connection> =
            self.inner.registry.lock().connections.values().cloned().collect();
        for connection in connections {
            let shared = &connection.shared;
            if shared.disconnect_requested.swap(false, Ordering::AcqRel) {
                self.drop_connection(&connection, true, "disconnect requested");
                continue;
            }
            if shared.connect_requested.swap(false, Ordering::AcqRel)
                && connection.state() == ConnectionState::Connecting
            {
                self.start_connect(&connection);
            }
        }
    }

    fn dispatch(&mut self, info: DescriptorInfo) {
        let route = if self.is_released(info.fd) {
            Route::Unknown
        } else {
            self.inner.registry.lock().route(info.fd)
        };
        match route {
            Route::Connection(connection) => match connection.state() {
                ConnectionState::Connecting => self.on_connecting(&connection, info),
                ConnectionState::Connected => self.on_connected(&connection, info),
                _ => skip_stale(info.fd),
            },
            Route::PendingAccept => {
                if info.disconnected {
                    self.discard_pending_accept(info.fd, "peer closed during tls accept");
                } else {
                    self.advance_accept(info.fd);
                }
            }
            Route::Bind(bind) => {
                if info.readable {
                    self.accept(&bind);
                } else if info.disconnected {
                    warn!(fd = info.fd, endpoint = %bind.data.endpoint, "error on listening socket");
                }
            }
            Route::Unknown => skip_stale(info.fd),
        }
    }

    /// Whether `fd` was closed after the current batch was fetched, by the
    /// loop or by an `unbind` on another thread.
    fn is_released(&self, fd: RawFd) -> bool {
        self.released.contains(&fd) || self.inner.released_fds.lock().contains(&fd)
    }

    fn close_descriptor(&mut self, socket: &mut Socket) {
        let fd = socket.fd();
        self.inner.poller.remove_socket(fd);
        self.released.insert(fd);
        socket.destroy();
    }

    // Outgoing connections

    fn start_connect(&mut self, connection: &Connection) {
        let data = connection.data();
        connection.set_state(ConnectionState::Connecting);

        let sys = Arc::clone(&self.inner.sys);
        let created = match &connection.shared.tls {
            Some(cert) => Socket::create_tls_client(
                sys,
                data.domain,
                data.socket_type,
                data.protocol,
                cert,
                &data.hostname,
            ),
            None => Socket::create(sys, data.domain, data.socket_type, data.protocol)
                .map_err(StreamError::from),
        };
        let socket = match created {
            Ok(socket) => socket,
            Err(e) => {
                self.drop_connection(connection, false, &e.to_string());
                return;
            }
        };
        if data.is_tcp() {
            if let Err(e) = socket.set_nodelay(true) {
                debug!(connection_id = connection.id(), error = %e, "cannot set TCP_NODELAY");
            }
        }
        if let Err(e) = socket.connect(&data.address) {
            drop(socket);
            self.drop_connection(connection, false, &e.to_string());
            return;
        }

        let fd = socket.fd();
        let attempt = {
            let mut io = connection.shared.io.lock();
            io.reconnect.record_attempt();
            io.tcp_established = false;
            io.socket = Some(socket);
            io.reconnect.attempt()
        };
        connection.shared.fd.store(fd, Ordering::Release);
        self.inner.registry.lock().by_fd.insert(fd, connection.clone());
        self.inner.poller.add_socket(fd);
        self.inner.poller.enable_write(fd);
        debug!(
            connection_id = connection.id(),
            endpoint = %data.endpoint,
            fd,
            attempt,
            "connecting"
        );
    }

    fn on_connecting(&mut self, connection: &Connection, info: DescriptorInfo) {
        let step = {
            let mut guard = connection.shared.io.lock();
            let io = &mut *guard;
            let Some(socket) = io.socket.as_mut() else {
                return;
            };

            if info.disconnected {
                let reason = match socket.take_error() {
                    Ok(Some(e)) | Err(e) => e.to_string(),
                    Ok(None) => "connection closed while connecting".to_string(),
                };
                ConnectStep::Failed(reason)
            } else if !io.tcp_established && !info.writable {
                ConnectStep::Waiting
            } else {
                let established = if io.tcp_established {
                    Ok(())
                } else {
                    match socket.take_error() {
                        Ok(None) => Ok(()),
                        Ok(Some(e)) | Err(e) => Err(e.to_string()),
                    }
                };
                match established {
                    Err(reason) => ConnectStep::Failed(reason),
                    Ok(()) => {
                        io.tcp_established = true;
                        match socket.tls_connecting() {
                            IoState::Success => ConnectStep::Connected,
                            IoState::WantRead => {
                                self.inner.poller.disable_write(socket.fd());
                                ConnectStep::Waiting
                            }
                            IoState::WantWrite => {
                                self.inner.poller.enable_write(socket.fd());
                                ConnectStep::Waiting
                            }
                            IoState::Error => ConnectStep::Failed("tls handshake failed".to_string()),
                        }
                    }
                }
            }
        };

        match step {
            ConnectStep::Waiting => {}
            ConnectStep::Connected => self.mark_connected(connection),
            ConnectStep::Failed(reason) => self.drop_connection(connection, false, &reason),
        }
    }

    fn mark_connected(&mut self, connection: &Connection) {
        let (local, tls) = {
            let mut io = connection.shared.io.lock();
            io.ever_connected = true;
            io.reconnect.reset();
            let socket = io.socket.as_ref();
            (
                socket
                    .and_then(|s| s.local_addr().ok())
                    .map(|addr| peer_endpoint(&addr))
                    .unwrap_or_default(),
                socket.is_some_and(Socket::is_tls),
            )
        };
        let endpoint = {
            let mut data = connection.shared.data.lock();
            data.state = ConnectionState::Connected;
            data.endpoint_local = local;
            data.endpoint.clone()
        };

        info!(connection_id = connection.id(), %endpoint, tls, "connected");
        self.inner.emit(ConnectionEvent::Connected {
            id: connection.id(),
            endpoint,
        });
        connection.shared.callback.connected(connection);
        self.flush(connection);
        if tls {
            // Application data may have arrived with the last handshake flight.
            self.deferred_reads.push(connection.clone());
        }
    }

    fn check_reconnects(&mut self) {
        let now = Instant::now();
        let waiting: Vec<Connection> = self
            .inner
            .registry
            .lock()
            .connections
            .values()
            .filter(|c| c.state() == ConnectionState::Reconnecting)
            .cloned()
            .collect();

        for connection in waiting {
            let action = connection.shared.io.lock().reconnect.next_action(now);
            match action {
                ReconnectAction::Wait => {}
                ReconnectAction::Attempt => {
                    trace!(connection_id = connection.id(), "reconnecting");
                    self.start_connect(&connection);
                }
                ReconnectAction::GiveUp => {
                    let endpoint = connection.endpoint();
                    warn!(connection_id = connection.id(), %endpoint, "reconnect budget exhausted");
                    self.inner.emit(ConnectionEvent::ReconnectGaveUp {
                        id: connection.id(),
                        endpoint,
                    });
                    self.finish(&connection);
                }
            }
        }
    }

    // Established connections

    fn on_connected(&mut self, connection: &Connection, info: DescriptorInfo) {
        if info.disconnected {
            self.drop_connection(connection, false, "peer closed or socket error");
            return;
        }

        if info.writable {
            let read_too = self.with_socket(connection, |s| s.is_read_when_writable());
            self.flush(connection);
            if read_too == Some(true) {
                self.read(connection, 0);
            }
        }

        if info.readable {
            let write_too = self.with_socket(connection, |s| s.is_write_when_readable());
            self.read(connection, info.bytes_to_read);
            if write_too == Some(true) {
                self.flush(connection);
            }
        }
    }

    fn with_socket<T>(&self, connection: &Connection, f: impl FnOnce(&Socket) -> T) -> Option<T> {
        connection.shared.io.lock().socket.as_ref().map(f)
    }

    /// Hand readable data to the callback, at most `max_reads_per_event` times.
    fn read(&mut self, connection: &Connection, reported: usize) {
        if connection.state() != ConnectionState::Connected {
            return;
        }
        let max_reads = self.config.max_reads_per_event.max(1);

        let outcome = {
            let mut io = connection.shared.io.lock();
            let Some(socket) = io.socket.as_mut() else {
                return;
            };
            read_socket(connection, socket, reported, max_reads)
        };

        match outcome {
            ReadOutcome::Drained => {}
            ReadOutcome::Pending => self.deferred_reads.push(connection.clone()),
            ReadOutcome::Disconnect(reason) => self.drop_connection(connection, false, &reason),
        }
    }

    fn run_deferred_reads(&mut self) {
        if self.deferred_reads.is_empty() {
            return;
        }
        let deferred = std::mem::take(&mut self.deferred_reads);
        for connection in deferred {
            self.read(&connection, 0);
        }
    }

    /// Push queued bytes until the socket would block.
    fn flush(&mut self, connection: &Connection) {
        let result = {
            let mut io = connection.shared.io.lock();
            let Some(socket) = io.socket.as_mut() else {
                return;
            };
            self.write_outbound(connection, socket)
        };
        if let Err(e) = result {
            self.drop_connection(connection, false, &e.to_string());
        }
    }

    fn write_outbound(&self, connection: &Connection, socket: &mut Socket) -> io::Result<()> {
        let fd = socket.fd();
        let mut outbound = connection.shared.outbound.lock();
        while let Some(front) = outbound.front().cloned() {
            match socket.send(&front) {
                Ok(0) => break,
                Ok(n) => outbound.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if socket.has_pending_output() {
            socket.flush()?;
        }

        // Decided under the outbound lock so a concurrent send cannot be missed.
        if outbound.is_empty() && !socket.has_pending_output() {
            self.inner.poller.disable_write(fd);
        } else {
            trace!(fd, queued = outbound.len(), "send blocked");
            self.inner.poller.enable_write(fd);
        }
        Ok(())
    }

    // Incoming connections

    fn accept(&mut self, bind: &Arc<BindEntry>) {
        let accepted = bind.socket.lock().accept();
        let (socket, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(StreamError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(endpoint = %bind.data.endpoint, error = %e, "accept failed");
                return;
            }
        };

        let mut data = bind.data.accepted(self.inner.next_id(), peer);
        data.endpoint_local = socket
            .local_addr()
            .map(|addr| peer_endpoint(&addr))
            .unwrap_or_default();
        if data.is_tcp() {
            if let Err(e) = socket.set_nodelay(true) {
                debug!(fd = socket.fd(), error = %e, "cannot set TCP_NODELAY");
            }
        }

        if !socket.is_tls() {
            self.register_accepted(socket, data, &bind.factory);
            return;
        }

        let fd = socket.fd();
        data.state = ConnectionState::Connecting;
        debug!(fd, peer = %data.endpoint_peer, "tls accept started");
        self.inner.registry.lock().pending_accepts.insert(
            fd,
            PendingAccept {
                socket,
                data,
                factory: Arc::clone(&bind.factory),
            },
        );
        self.inner.poller.add_socket(fd);
        self.advance_accept(fd);
    }

    /// Drive the server handshake of a pending TLS accept by one step.
    fn advance_accept(&mut self, fd: RawFd) {
        let Some(mut pending) = self.inner.registry.lock().pending_accepts.remove(&fd) else {
            return;
        };
        match pending.socket.tls_accepting() {
            IoState::WantRead => {
                self.inner.poller.disable_write(fd);
                self.inner.registry.lock().pending_accepts.insert(fd, pending);
            }
            IoState::WantWrite => {
                self.inner.poller.enable_write(fd);
                self.inner.registry.lock().pending_accepts.insert(fd, pending);
            }
            IoState::Success => {
                self.inner.poller.disable_write(fd);
                pending.data.state = ConnectionState::Connected;
                let connection = self.register_accepted(pending.socket, pending.data, &pending.factory);
                self.deferred_reads.push(connection);
            }
            IoState::Error => {
                debug!(fd, peer = %pending.data.endpoint_peer, "tls accept failed");
                self.close_descriptor(&mut pending.socket);
            }
        }
    }

    fn discard_pending_accept(&mut self, fd: RawFd, reason: &str) {
        let Some(mut pending) = self.inner.registry.lock().pending_accepts.remove(&fd) else {
            return;
        };
        debug!(fd, reason, "pending tls accept dropped");
        self.close_descriptor(&mut pending.socket);
    }

    fn register_accepted(
        &mut self,
        socket: Socket,
        data: ConnectionData,
        factory: &CallbackFactory,
    ) -> Connection {
        let fd = socket.fd();
        let peer = data.endpoint_peer.clone();
        let connection = Connection::new(data, factory(), None, &self.inner.poller);
        {
            let mut io = connection.shared.io.lock();
            io.socket = Some(socket);
            io.tcp_established = true;
            io.ever_connected = true;
        }
        connection.shared.fd.store(fd, Ordering::Release);
        {
            let mut registry = self.inner.registry.lock();
            registry.insert_connection(connection.clone());
            registry.by_fd.insert(fd, connection.clone());
        }
        self.inner.poller.add_socket(fd);

        info!(connection_id = connection.id(), %peer, fd, "accepted");
        self.inner.emit(ConnectionEvent::Accepted {
            id: connection.id(),
            peer,
        });
        connection.shared.callback.connected(&connection);
        connection
    }

    // Teardown

    /// Close the socket of `connection`. An outgoing connection that never
    /// connected goes to `Reconnecting` while its budget lasts; everything
    /// else is finished.
    fn drop_connection(&mut self, connection: &Connection, explicit: bool, reason: &str) {
        let now = Instant::now();
        let incoming = connection.is_incoming();
        let (retry, socket) = {
            let mut io = connection.shared.io.lock();
            let retry = !explicit && !incoming && !io.ever_connected && {
                io.reconnect.record_failure(now);
                io.reconnect.can_retry(now)
            };
            io.tcp_established = false;
            (retry, io.socket.take())
        };
        if let Some(socket) = socket {
            self.release_socket(connection, socket);
        }

        if retry {
            let endpoint = connection.endpoint();
            connection.set_state(ConnectionState::Reconnecting);
            debug!(connection_id = connection.id(), %endpoint, reason, "connect failed, will retry");
            self.inner.emit(ConnectionEvent::ConnectFailed {
                id: connection.id(),
                endpoint,
                reason: reason.to_string(),
            });
            return;
        }

        if !explicit && !incoming && connection.state() == ConnectionState::Connecting {
            self.inner.emit(ConnectionEvent::ConnectFailed {
                id: connection.id(),
                endpoint: connection.endpoint(),
                reason: reason.to_string(),
            });
        }
        debug!(connection_id = connection.id(), reason, "disconnecting");
        self.finish(connection);
    }

    fn release_socket(&mut self, connection: &Connection, mut socket: Socket) {
        self.inner.registry.lock().by_fd.remove(&socket.fd());
        connection.shared.fd.store(INVALID_FD, Ordering::Release);
        self.close_descriptor(&mut socket);
    }

    /// Remove `connection` for good and deliver `disconnected` once.
    fn finish(&mut self, connection: &Connection) {
        self.inner.registry.lock().remove_connection(connection);
        connection.set_state(ConnectionState::Disconnected);
        connection.shared.outbound.lock().clear();
        connection.shared.fd.store(INVALID_FD, Ordering::Release);

        if !connection.shared.finished.swap(true, Ordering::AcqRel) {
            let endpoint = connection.endpoint();
            info!(connection_id = connection.id(), %endpoint, "disconnected");
            self.inner.emit(ConnectionEvent::Disconnected {
                id: connection.id(),
                endpoint,
            });
            connection.shared.callback.disconnected(connection);
        }
    }

    /// Close every socket when the loop exits. No callbacks are delivered.
    fn shutdown(&mut self) {
        let (connections, binds, pending) = {
            let mut registry = self.inner.registry.lock();
            registry.by_fd.clear();
            (
                registry.connections.drain().map(|(_, c)| c).collect::<Vec<_>>(),
                registry.binds.drain().map(|(_, b)| b).collect::<Vec<_>>(),
                registry.pending_accepts.drain().map(|(_, p)| p).collect::<Vec<_>>(),
            )
        };

        for connection in connections {
            let socket = connection.shared.io.lock().socket.take();
            if let Some(mut socket) = socket {
                self.inner.poller.remove_socket(socket.fd());
                socket.destroy();
            }
            connection.set_state(ConnectionState::Disconnected);
            connection.shared.outbound.lock().clear();
            connection.shared.fd.store(INVALID_FD, Ordering::Release);
        }
        for bind in binds {
            let mut socket = bind.socket.lock();
            self.inner.poller.remove_socket(socket.fd());
            socket.destroy();
            remove_ipc_file(&bind.data);
        }
        for mut accept in pending {
            self.inner.poller.remove_socket(accept.socket.fd());
            accept.socket.destroy();
        }
    }
}

fn skip_stale(fd: RawFd) {
    trace!(fd, "stale event skipped");
}

/// Receive loop of one readiness event.
fn read_socket(
    connection: &Connection,
    socket: &mut Socket,
    reported: usize,
    max_reads: usize,
) -> ReadOutcome {
    let mut bytes = match socket.readable_bytes(reported) {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
        Err(e) => return ReadOutcome::Disconnect(e.to_string()),
    };

    let mut reads = 0;
    while bytes > 0 && reads < max_reads {
        let mut reader = SocketReader::new(socket);
        connection
            .shared
            .callback
            .received(connection, &mut reader, bytes);
        reads += 1;
        if reader.should_disconnect() {
            return ReadOutcome::Disconnect("peer closed or receive failed".to_string());
        }
        bytes = match socket.pending_read() {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return ReadOutcome::Disconnect(e.to_string()),
        };
    }

    if bytes > 0 && socket.is_tls() {
        trace!(connection_id = connection.id(), bytes, "read cap reached with tls data buffered");
        ReadOutcome::Pending
    } else {
        ReadOutcome::Drained
    }
}
