//! Identity and lifecycle data of one connection.

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use socket2::{Domain, Protocol, SockAddr, Type};

use crate::endpoint::{peer_endpoint, port_of, Endpoint};
use crate::error::Result;
use crate::reconnect::ReconnectPolicy;

/// Identifier unique within one container, assigned in increasing order.
pub type ConnectionId = u64;

/// Lifecycle state of a connection.
///
/// `Created -> Connecting -> Connected -> Disconnected`. An outgoing
/// connection whose connect fails goes to `Reconnecting` while its
/// reconnect budget lasts, and back to `Connecting` on the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Created,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Everything known about one connection or listening endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionData {
    /// Endpoint string as given to bind or connect
    pub endpoint: String,
    pub domain: Domain,
    pub socket_type: Type,
    pub protocol: Option<Protocol>,
    /// Host part of a TCP endpoint, empty for IPC
    pub hostname: String,
    pub port: u16,
    /// Socket path of an IPC endpoint
    pub path: Option<PathBuf>,
    /// Resolved bind or connect address
    pub address: SockAddr,
    pub endpoint_local: String,
    pub endpoint_peer: String,
    /// Raw peer address of an accepted connection
    pub address_peer: Option<SockAddr>,
    pub port_peer: u16,
    pub connection_id: ConnectionId,
    pub incoming: bool,
    pub tls: bool,
    pub reconnect: ReconnectPolicy,
    pub start_time: SystemTime,
    pub state: ConnectionState,
}

impl ConnectionData {
    /// Parse and resolve `endpoint` into a fresh record in `Created` state.
    pub fn from_endpoint(endpoint: &str) -> Result<Self> {
        let parsed = Endpoint::parse(endpoint)?;
        let address = parsed.resolve()?;

        let (hostname, port, path) = match &parsed {
            Endpoint::Tcp { host, port } => (host.clone(), *port, None),
            #[cfg(unix)]
            Endpoint::Ipc(path) => (String::new(), 0, Some(path.clone())),
        };

        Ok(Self {
            endpoint: endpoint.to_string(),
            domain: parsed.domain(&address),
            socket_type: parsed.socket_type(),
            protocol: parsed.protocol(),
            hostname,
            port,
            path,
            address,
            endpoint_local: String::new(),
            endpoint_peer: String::new(),
            address_peer: None,
            port_peer: 0,
            connection_id: 0,
            incoming: false,
            tls: false,
            reconnect: ReconnectPolicy::disabled(),
            start_time: SystemTime::now(),
            state: ConnectionState::Created,
        })
    }

    /// Record for a connection accepted on the listening endpoint `self`.
    #[must_use]
    pub fn accepted(&self, connection_id: ConnectionId, peer: SockAddr) -> Self {
        let mut data = self.clone();
        data.connection_id = connection_id;
        data.incoming = true;
        data.endpoint_peer = peer_endpoint(&peer);
        data.port_peer = port_of(&peer);
        data.address_peer = Some(peer);
        data.start_time = SystemTime::now();
        data.state = ConnectionState::Connected;
        data
    }

    #[must_use]
    pub fn is_tcp(&self) -> bool {
        self.protocol == Some(Protocol::TCP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn test_from_tcp_endpoint() {
        let data = ConnectionData::from_endpoint("tcp://*:3333").unwrap();
        assert_eq!(data.endpoint, "tcp://*:3333");
        assert_eq!(data.hostname, "*");
        assert_eq!(data.port, 3333);
        assert_eq!(data.domain, Domain::IPV4);
        assert!(data.is_tcp());
        assert_eq!(data.state, ConnectionState::Created);
    }

    #[cfg(unix)]
    #[test]
    fn test_from_ipc_endpoint() {
        let data = ConnectionData::from_endpoint("ipc:///tmp/streamconn.sock").unwrap();
        assert_eq!(data.domain, Domain::UNIX);
        assert_eq!(data.path, Some(PathBuf::from("/tmp/streamconn.sock")));
        assert!(!data.is_tcp());
    }

    #[test]
    fn test_accepted_copies_template() {
        let template = ConnectionData::from_endpoint("tcp://*:3333").unwrap();
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let data = template.accepted(4, SockAddr::from(peer));

        assert_eq!(data.endpoint, "tcp://*:3333");
        assert_eq!(data.connection_id, 4);
        assert!(data.incoming);
        assert_eq!(data.endpoint_peer, "tcp://127.0.0.1:50000");
        assert_eq!(data.port_peer, 50000);
        assert_eq!(data.state, ConnectionState::Connected);
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(ConnectionData::from_endpoint("udp://x:1").is_err());
    }
}
