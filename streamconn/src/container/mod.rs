//! Connection container.
//!
//! Owns a [`Poller`], the listening sockets and the live connections of one
//! single-threaded poll loop. Any thread may bind, connect, send or request
//! disconnects; the loop thread performs all socket I/O and runs every
//! callback.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use streamconn::prelude::*;
//!
//! struct Echo;
//!
//! impl StreamCallback for Echo {
//!     fn received(&self, connection: &Connection, reader: &mut SocketReader<'_>, bytes: usize) {
//!         if let Ok(data) = reader.receive_bytes(bytes) {
//!             let _ = connection.send(data);
//!         }
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let container = ConnectionContainer::new();
//! container.init(Duration::from_millis(100), Duration::from_secs(1))?;
//! container.bind("tcp://*:3333", Arc::new(Echo))?;
//! let poll_thread = container.spawn()?;
//! # container.terminate_poller_loop(Duration::from_secs(1));
//! # poll_thread.join().ok();
//! # Ok(())
//! # }
//! ```

mod poll_loop;
mod registry;

use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex, RwLock};
use streamconn_core::connection_data::{ConnectionData, ConnectionId};
use streamconn_core::endpoint::peer_endpoint;
use streamconn_core::error::{Result, StreamError};
use streamconn_core::monitor::{create_monitor, ConnectionEvent, ConnectionEventSender, ConnectionMonitor};
use streamconn_core::options::{ConnectOptions, ContainerConfig};
use streamconn_core::poller::Poller;
use streamconn_core::socket::Socket;
use streamconn_core::sys::{self, SharedSyscall};
use streamconn_core::tls::CertificateData;
use tracing::{debug, info};

use crate::callback::{shared_callback, CallbackFactory, StreamCallback};
use crate::connection::Connection;
use poll_loop::PollLoop;
use registry::{BindEntry, Registry};

type StopHook = Box<dyn FnOnce() + Send>;

/// State shared between the container handle and its loop thread.
pub(crate) struct Inner {
    pub(crate) sys: SharedSyscall,
    pub(crate) poller: Arc<Poller>,
    pub(crate) config: RwLock<ContainerConfig>,
    pub(crate) registry: Mutex<Registry>,
    /// Listening descriptors closed by `unbind` since the loop last waited.
    pub(crate) released_fds: Mutex<HashSet<RawFd>>,
    next_id: AtomicU64,
    pub(crate) terminate: AtomicBool,
    running: AtomicBool,
    stopped: Mutex<bool>,
    stopped_cv: Condvar,
    monitor: Mutex<Option<ConnectionEventSender>>,
    /// Run on the loop thread after shutdown, before the loop reports stopped.
    stop_hooks: Mutex<Vec<StopHook>>,
}

impl Inner {
    pub(crate) fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        if let Some(sender) = self.monitor.lock().as_ref() {
            // A dropped receiver only means nobody is listening.
            let _ = sender.send(event);
        }
    }

    fn run_stop_hooks(&self) {
        let hooks = std::mem::take(&mut *self.stop_hooks.lock());
        for hook in hooks {
            hook();
        }
    }

    fn mark_stopped(&self) {
        *self.stopped.lock() = true;
        self.stopped_cv.notify_all();
    }
}

/// Remove the socket file of an IPC endpoint, ignoring a missing file.
pub(crate) fn remove_ipc_file(data: &ConnectionData) {
    if let Some(path) = &data.path {
        remove_file_quietly(path);
    }
}

fn remove_file_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed ipc socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "cannot remove ipc socket file"),
    }
}

/// Single-threaded epoll connection runtime with raw stream callbacks.
///
/// Dropping the container asks its loop to stop without waiting for it.
pub struct ConnectionContainer {
    inner: Arc<Inner>,
}

impl ConnectionContainer {
    /// Container over the OS syscall layer with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_syscall(sys::os())
    }

    /// Container over a custom syscall layer, e.g. one injecting faults.
    #[must_use]
    pub fn with_syscall(sys: SharedSyscall) -> Self {
        Self::with_config(sys, ContainerConfig::default())
    }

    #[must_use]
    pub fn with_config(sys: SharedSyscall, config: ContainerConfig) -> Self {
        let poller = Arc::new(Poller::with_capacity(Arc::clone(&sys), config.max_events));
        Self {
            inner: Arc::new(Inner {
                sys,
                poller,
                config: RwLock::new(config),
                registry: Mutex::new(Registry::default()),
                released_fds: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(1),
                terminate: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stopped: Mutex::new(false),
                stopped_cv: Condvar::new(),
                monitor: Mutex::new(None),
                stop_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Set the poll timeout and reconnect scan cadence and create the poller.
    ///
    /// Must be called before [`run`](Self::run) or [`spawn`](Self::spawn).
    pub fn init(&self, cycle_time: Duration, check_reconnect_interval: Duration) -> Result<()> {
        {
            let mut config = self.inner.config.write();
            config.cycle_time = cycle_time;
            config.check_reconnect_interval = check_reconnect_interval;
        }
        self.inner.poller.init()?;
        debug!(?cycle_time, ?check_reconnect_interval, "container initialized");
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> ContainerConfig {
        self.inner.config.read().clone()
    }

    /// Run the poll loop on the calling thread until terminated.
    pub fn run(&self) -> Result<()> {
        self.claim_loop()?;
        PollLoop::new(Arc::clone(&self.inner)).run();
        Ok(())
    }

    /// Run the poll loop on a new thread.
    pub fn spawn(&self) -> Result<JoinHandle<()>> {
        self.claim_loop()?;
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("streamconn-poll".to_string())
            .spawn(move || PollLoop::new(inner).run());
        match handle {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    fn claim_loop(&self) -> Result<()> {
        if !self.inner.poller.is_initialized() {
            return Err(StreamError::NotInitialized);
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(StreamError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "poll loop already running",
            )));
        }
        Ok(())
    }

    /// Ask the loop to stop and wait up to `timeout` for it to finish.
    ///
    /// Returns whether the loop stopped in time.
    pub fn terminate_poller_loop(&self, timeout: Duration) -> bool {
        self.inner.terminate.store(true, Ordering::Release);
        self.inner.poller.release_wait();
        let mut stopped = self.inner.stopped.lock();
        if !*stopped {
            self.inner
                .stopped_cv
                .wait_while_for(&mut stopped, |stopped| !*stopped, timeout);
        }
        *stopped
    }

    /// Whether the loop has exited, after termination or a fatal wait error.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Termination was requested or the loop is already shutting down.
    pub(crate) fn is_stopping(&self) -> bool {
        self.inner.terminate.load(Ordering::Acquire)
    }

    /// Call `hook` once on the loop thread when the loop exits.
    pub(crate) fn on_loop_stopped(&self, hook: impl FnOnce() + Send + 'static) {
        self.inner.stop_hooks.lock().push(Box::new(hook));
    }

    /// Listen on `endpoint`; every accepted connection shares `callback`.
    pub fn bind(&self, endpoint: &str, callback: Arc<dyn StreamCallback>) -> Result<()> {
        self.bind_each(endpoint, shared_callback(callback), None)
    }

    /// Listen on `endpoint` with TLS; connections are announced once their
    /// handshake completes.
    pub fn bind_tls(
        &self,
        endpoint: &str,
        callback: Arc<dyn StreamCallback>,
        certificate_data: &CertificateData,
    ) -> Result<()> {
        self.bind_each(endpoint, shared_callback(callback), Some(certificate_data))
    }

    /// Listen on `endpoint`, creating one callback per accepted connection.
    pub fn bind_each(
        &self,
        endpoint: &str,
        factory: CallbackFactory,
        certificate_data: Option<&CertificateData>,
    ) -> Result<()> {
        self.ensure_initialized()?;
        if self.is_bound(endpoint) {
            return Err(StreamError::AlreadyBound(endpoint.to_string()));
        }

        let mut data = ConnectionData::from_endpoint(endpoint)?;
        data.tls = certificate_data.is_some();
        let sys = Arc::clone(&self.inner.sys);
        let mut socket = match certificate_data {
            Some(cert) => Socket::create_tls_server(
                sys,
                data.domain,
                data.socket_type,
                data.protocol,
                cert,
            )?,
            None => Socket::create(sys, data.domain, data.socket_type, data.protocol)?,
        };
        if data.is_tcp() {
            socket.set_reuse_address(true)?;
        }
        remove_ipc_file(&data);
        let backlog = self.inner.config.read().listen_backlog;
        socket.bind(&data.address)?;
        socket.listen(backlog)?;
        data.endpoint_local = socket
            .local_addr()
            .map(|addr| peer_endpoint(&addr))
            .unwrap_or_default();

        let fd = socket.fd();
        {
            let mut registry = self.inner.registry.lock();
            if registry.bind_by_endpoint(endpoint).is_some() {
                drop(registry);
                socket.destroy();
                return Err(StreamError::AlreadyBound(endpoint.to_string()));
            }
            registry.binds.insert(
                fd,
                Arc::new(BindEntry {
                    data,
                    socket: Mutex::new(socket),
                    factory,
                }),
            );
        }
        self.inner.poller.add_socket(fd);

        info!(endpoint, fd, tls = certificate_data.is_some(), "bound");
        self.inner.emit(ConnectionEvent::Bound(endpoint.to_string()));
        Ok(())
    }

    /// Stop listening on `endpoint`. Connections accepted earlier stay open.
    ///
    /// Returns `false` when nothing was bound there.
    pub fn unbind(&self, endpoint: &str) -> bool {
        let entry = {
            let mut registry = self.inner.registry.lock();
            let Some(fd) = registry.bind_by_endpoint(endpoint) else {
                return false;
            };
            registry.binds.remove(&fd)
        };
        let Some(entry) = entry else {
            return false;
        };

        let mut socket = entry.socket.lock();
        let fd = socket.fd();
        // Recorded before closing so a batch fetched earlier cannot hand the
        // listener's stale entry to a socket that reuses the number.
        self.inner.released_fds.lock().insert(fd);
        self.inner.poller.remove_socket(fd);
        socket.destroy();
        remove_ipc_file(&entry.data);

        info!(endpoint, "unbound");
        self.inner.emit(ConnectionEvent::Unbound(endpoint.to_string()));
        true
    }

    #[must_use]
    pub fn is_bound(&self, endpoint: &str) -> bool {
        self.inner.registry.lock().bind_by_endpoint(endpoint).is_some()
    }

    /// Local address a bound endpoint listens on, e.g. `tcp://0.0.0.0:3333`.
    #[must_use]
    pub fn local_endpoint(&self, endpoint: &str) -> Option<String> {
        let registry = self.inner.registry.lock();
        let fd = registry.bind_by_endpoint(endpoint)?;
        registry.binds.get(&fd).map(|entry| entry.data.endpoint_local.clone())
    }

    /// Register an outgoing connection in `Created` state.
    ///
    /// Nothing touches the network until [`Connection::connect`].
    pub fn create_connection(
        &self,
        endpoint: &str,
        callback: Arc<dyn StreamCallback>,
        options: ConnectOptions,
    ) -> Result<Connection> {
        self.ensure_initialized()?;
        let mut data = ConnectionData::from_endpoint(endpoint)?;
        data.connection_id = self.inner.next_id();
        data.endpoint_peer = peer_endpoint(&data.address);
        data.tls = options.tls.is_some();
        data.reconnect = options.reconnect;

        let connection = Connection::new(data, callback, options.tls, &self.inner.poller);
        self.inner.registry.lock().insert_connection(connection.clone());
        debug!(connection_id = connection.id(), endpoint, "connection created");
        Ok(connection)
    }

    /// Create an outgoing connection and start connecting it.
    pub fn connect(
        &self,
        endpoint: &str,
        callback: Arc<dyn StreamCallback>,
        options: ConnectOptions,
    ) -> Result<Connection> {
        let connection = self.create_connection(endpoint, callback, options)?;
        connection.connect();
        Ok(connection)
    }

    #[must_use]
    pub fn get_connection(&self, id: ConnectionId) -> Option<Connection> {
        self.inner.registry.lock().connections.get(&id).cloned()
    }

    /// Live connections ordered by id.
    #[must_use]
    pub fn get_all_connections(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> =
            self.inner.registry.lock().connections.values().cloned().collect();
        connections.sort_by_key(Connection::id);
        connections
    }

    /// Receive lifecycle events from now on. Replaces any earlier monitor.
    #[must_use]
    pub fn monitor(&self) -> ConnectionMonitor {
        let (sender, receiver) = create_monitor();
        *self.inner.monitor.lock() = Some(sender);
        receiver
    }

    /// Bind and connect need an initialized poller and a loop that has not stopped.
    fn ensure_initialized(&self) -> Result<()> {
        if !self.inner.poller.is_initialized() {
            return Err(StreamError::NotInitialized);
        }
        if self.is_terminated() {
            return Err(StreamError::PollerTerminated);
        }
        Ok(())
    }
}

impl Default for ConnectionContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionContainer {
    fn drop(&mut self) {
        self.inner.terminate.store(true, Ordering::Release);
        self.inner.poller.release_wait();
    }
}

impl std::fmt::Debug for ConnectionContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("ConnectionContainer")
            .field("binds", &registry.binds.len())
            .field("connections", &registry.connections.len())
            .field("terminated", &*self.inner.stopped.lock())
            .finish()
    }
}
