//! Bookkeeping of bound endpoints, live connections and pending TLS accepts.
//!
//! Guarded by one mutex in the container; held only for map operations,
//! never across socket I/O or callbacks.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use streamconn_core::connection_data::{ConnectionData, ConnectionId};
use streamconn_core::socket::Socket;

use crate::callback::CallbackFactory;
use crate::connection::Connection;

/// One listening socket.
pub(crate) struct BindEntry {
    /// Template copied into every accepted connection.
    pub(crate) data: ConnectionData,
    pub(crate) socket: Mutex<Socket>,
    pub(crate) factory: CallbackFactory,
}

/// Accepted TLS socket whose handshake has not completed.
pub(crate) struct PendingAccept {
    pub(crate) socket: Socket,
    pub(crate) data: ConnectionData,
    pub(crate) factory: CallbackFactory,
}

/// Who owns a ready descriptor.
pub(crate) enum Route {
    Connection(Connection),
    PendingAccept,
    Bind(Arc<BindEntry>),
    Unknown,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) connections: HashMap<ConnectionId, Connection>,
    pub(crate) by_fd: HashMap<RawFd, Connection>,
    pub(crate) binds: HashMap<RawFd, Arc<BindEntry>>,
    pub(crate) pending_accepts: HashMap<RawFd, PendingAccept>,
}

impl Registry {
    pub(crate) fn route(&self, fd: RawFd) -> Route {
        if let Some(connection) = self.by_fd.get(&fd) {
            return Route::Connection(connection.clone());
        }
        if self.pending_accepts.contains_key(&fd) {
            return Route::PendingAccept;
        }
        if let Some(bind) = self.binds.get(&fd) {
            return Route::Bind(Arc::clone(bind));
        }
        Route::Unknown
    }

    pub(crate) fn bind_by_endpoint(&self, endpoint: &str) -> Option<RawFd> {
        self.binds
            .iter()
            .find(|(_, entry)| entry.data.endpoint == endpoint)
            .map(|(fd, _)| *fd)
    }

    pub(crate) fn insert_connection(&mut self, connection: Connection) {
        self.connections.insert(connection.id(), connection);
    }

    /// Forget a connection entirely, including its descriptor mapping.
    pub(crate) fn remove_connection(&mut self, connection: &Connection) {
        self.connections.remove(&connection.id());
        self.by_fd.retain(|_, c| c != connection);
    }
}
