//! Endpoint abstraction for transport-agnostic socket addressing.
//!
//! Endpoints are written `<scheme>://<address>`:
//! - `tcp://host:port`, where `*` as host means the any address and
//!   names are resolved through the system resolver
//! - `ipc:///path/to/socket`, a Unix domain stream socket

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
#[cfg(unix)]
use std::path::PathBuf;
use std::str::FromStr;

use socket2::{Domain, Protocol, SockAddr, Type};

/// Host token that binds to every local address.
pub const ANY_HOST: &str = "*";

/// Transport endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP transport: `tcp://host:port`
    Tcp {
        /// Host name, literal address or `*`
        host: String,
        /// Port number
        port: u16,
    },
    /// IPC transport (Unix domain socket): `ipc:///path/to/socket`
    #[cfg(unix)]
    Ipc(PathBuf),
}

impl Endpoint {
    /// Parse an endpoint from a string.
    ///
    /// # Examples
    ///
    /// ```
    /// use streamconn_core::endpoint::Endpoint;
    ///
    /// let endpoint = Endpoint::parse("tcp://*:3333").unwrap();
    /// assert!(endpoint.is_tcp());
    ///
    /// let endpoint = Endpoint::parse("tcp://localhost:3333").unwrap();
    /// assert_eq!(endpoint.to_string(), "tcp://localhost:3333");
    /// ```
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    /// Returns true if this is a TCP endpoint.
    pub fn is_tcp(&self) -> bool {
        matches!(self, Endpoint::Tcp { .. })
    }

    /// Returns true if this is an IPC endpoint.
    #[cfg(unix)]
    pub fn is_ipc(&self) -> bool {
        matches!(self, Endpoint::Ipc(_))
    }

    /// Socket type used for this transport.
    pub fn socket_type(&self) -> Type {
        Type::STREAM
    }

    /// Transport protocol used for this transport.
    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            Endpoint::Tcp { .. } => Some(Protocol::TCP),
            #[cfg(unix)]
            Endpoint::Ipc(_) => None,
        }
    }

    /// Resolve the endpoint into a socket address.
    ///
    /// IPv4 results are preferred when a name resolves to both families.
    pub fn resolve(&self) -> Result<SockAddr, EndpointError> {
        match self {
            Endpoint::Tcp { host, port } => {
                let addr = resolve_host(host, *port)?;
                Ok(SockAddr::from(addr))
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => SockAddr::unix(path).map_err(EndpointError::Io),
        }
    }

    /// Address family for a resolved address of this endpoint.
    pub fn domain(&self, addr: &SockAddr) -> Domain {
        match self {
            Endpoint::Tcp { .. } => addr.domain(),
            #[cfg(unix)]
            Endpoint::Ipc(_) => Domain::UNIX,
        }
    }
}

fn resolve_host(host: &str, port: u16) -> Result<SocketAddr, EndpointError> {
    if host == ANY_HOST {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let candidates: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    candidates
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| EndpointError::Unresolved(host.to_string()))
}

/// Endpoint string for a peer address, e.g. `tcp://127.0.0.1:40122`.
///
/// Unnamed Unix sockets render as `ipc://`.
pub fn peer_endpoint(addr: &SockAddr) -> String {
    if let Some(sa) = addr.as_socket() {
        return format!("tcp://{sa}");
    }
    #[cfg(unix)]
    if addr.is_unix() {
        return match addr.as_pathname() {
            Some(path) => format!("ipc://{}", path.display()),
            None => "ipc://".to_string(),
        };
    }
    String::new()
}

/// Port of an inet address, zero for anything else.
pub fn port_of(addr: &SockAddr) -> u16 {
    addr.as_socket().map_or(0, |sa| sa.port())
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((scheme, address)) = s.split_once("://") else {
            return Err(EndpointError::InvalidScheme(s.to_string()));
        };
        match scheme {
            "tcp" => parse_tcp(address),
            #[cfg(unix)]
            "ipc" if address.is_empty() => Err(EndpointError::InvalidIpcPath(s.to_string())),
            #[cfg(unix)]
            "ipc" => Ok(Endpoint::Ipc(PathBuf::from(address))),
            #[cfg(not(unix))]
            "ipc" => Err(EndpointError::IpcNotSupported),
            _ => Err(EndpointError::InvalidScheme(s.to_string())),
        }
    }
}

/// `host:port`, with IPv6 literals in brackets.
fn parse_tcp(address: &str) -> Result<Endpoint, EndpointError> {
    let invalid = || EndpointError::InvalidTcpAddress(address.to_string());
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok(Endpoint::Tcp {
        host: host.to_string(),
        port,
    })
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{host}]:{port}")
            }
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            #[cfg(unix)]
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

/// Errors that can occur when parsing or resolving endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("unknown endpoint scheme in {0}, use tcp:// or ipc://")]
    InvalidScheme(String),

    #[error("expected host:port, got {0}")]
    InvalidTcpAddress(String),

    #[error("empty ipc path in {0}")]
    InvalidIpcPath(String),

    #[error("cannot resolve host {0}")]
    Unresolved(String),

    #[error("ipc endpoints need Unix domain sockets")]
    IpcNotSupported,

    #[error("address error: {0}")]
    Io(#[from] std::io::Error),
}
