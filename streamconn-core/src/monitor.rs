//! Connection event monitoring.
//!
//! A container can publish lifecycle events on a channel so tooling and
//! tests can observe binds, accepts, connects and disconnects without
//! installing callbacks.

use std::fmt;

use crate::connection_data::ConnectionId;

/// Connection lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Listening socket created for an endpoint.
    Bound(String),

    /// Listening socket removed.
    Unbound(String),

    /// Incoming connection accepted and announced.
    Accepted { id: ConnectionId, peer: String },

    /// Outgoing connection established.
    Connected { id: ConnectionId, endpoint: String },

    /// Connect attempt failed; a reconnect may follow.
    ConnectFailed {
        id: ConnectionId,
        endpoint: String,
        reason: String,
    },

    /// Reconnect budget exhausted.
    ReconnectGaveUp { id: ConnectionId, endpoint: String },

    /// Connection removed from the container.
    Disconnected { id: ConnectionId, endpoint: String },
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bound(ep) => write!(f, "Bound to {ep}"),
            Self::Unbound(ep) => write!(f, "Unbound from {ep}"),
            Self::Accepted { id, peer } => write!(f, "Accepted connection {id} from {peer}"),
            Self::Connected { id, endpoint } => write!(f, "Connection {id} connected to {endpoint}"),
            Self::ConnectFailed {
                id,
                endpoint,
                reason,
            } => write!(f, "Connection {id} failed to connect to {endpoint}: {reason}"),
            Self::ReconnectGaveUp { id, endpoint } => {
                write!(f, "Connection {id} gave up reconnecting to {endpoint}")
            }
            Self::Disconnected { id, endpoint } => {
                write!(f, "Connection {id} disconnected from {endpoint}")
            }
        }
    }
}

/// Receiving side of a monitor channel.
pub type ConnectionMonitor = flume::Receiver<ConnectionEvent>;

/// Sending side of a monitor channel.
pub type ConnectionEventSender = flume::Sender<ConnectionEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (ConnectionEventSender, ConnectionMonitor) {
    flume::unbounded()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        let event = ConnectionEvent::Connected {
            id: 3,
            endpoint: "tcp://localhost:3333".to_string(),
        };
        assert_eq!(
            event.to_string(),
            "Connection 3 connected to tcp://localhost:3333"
        );
    }

    #[test]
    fn test_monitor_channel() {
        let (sender, receiver) = create_monitor();
        sender
            .send(ConnectionEvent::Bound("tcp://*:3333".to_string()))
            .unwrap();
        assert_eq!(
            receiver.recv().unwrap(),
            ConnectionEvent::Bound("tcp://*:3333".to_string())
        );
    }
}
