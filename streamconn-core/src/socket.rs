//! Non-blocking socket over a plain or TLS transport.
//!
//! The transport is picked at construction. Both variants expose the same
//! operations, so callers drive them without branching: a plain socket
//! reports its handshake as immediately complete and never sets the TLS
//! read/write cross-dependency flags.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use rustls::ServerConfig;
use socket2::{Domain, Protocol, SockAddr, Type};
use tracing::{debug, trace};

use crate::error::Result;
use crate::sys::{is_in_progress, SharedSyscall, INVALID_FD};
use crate::tls::{CertificateData, FdIo, IoState, TlsSession};

enum Transport {
    Plain,
    /// Listening socket handing out server sessions on accept.
    TlsListener(Arc<ServerConfig>),
    Tls(Box<TlsSession>),
}

/// Owns one descriptor and, for TLS, one session.
///
/// The descriptor is closed exactly once, by [`destroy`](Self::destroy) or on drop.
pub struct Socket {
    sys: SharedSyscall,
    fd: RawFd,
    transport: Transport,
}

impl Socket {
    /// Create a non-blocking plain socket.
    pub fn create(
        sys: SharedSyscall,
        domain: Domain,
        ty: Type,
        protocol: Option<Protocol>,
    ) -> io::Result<Self> {
        let fd = sys.socket(domain, ty, protocol)?;
        let socket = Self::attach(sys, fd);
        socket.sys.set_nonblocking(fd, true)?;
        Ok(socket)
    }

    /// Create a listening-side TLS socket. Accepted sockets run the server handshake.
    pub fn create_tls_server(
        sys: SharedSyscall,
        domain: Domain,
        ty: Type,
        protocol: Option<Protocol>,
        certificate_data: &CertificateData,
    ) -> Result<Self> {
        let config = certificate_data.server_config()?;
        let mut socket = Self::create(sys, domain, ty, protocol)?;
        socket.transport = Transport::TlsListener(config);
        Ok(socket)
    }

    /// Create a connecting TLS socket verifying the peer as `server_name`.
    pub fn create_tls_client(
        sys: SharedSyscall,
        domain: Domain,
        ty: Type,
        protocol: Option<Protocol>,
        certificate_data: &CertificateData,
        server_name: &str,
    ) -> Result<Self> {
        let config = certificate_data.client_config()?;
        let name = certificate_data.server_name.as_deref().unwrap_or(server_name);
        let session = TlsSession::client(config, name)?;
        let mut socket = Self::create(sys, domain, ty, protocol)?;
        socket.transport = Transport::Tls(Box::new(session));
        Ok(socket)
    }

    /// Take ownership of an existing descriptor as a plain socket.
    #[must_use]
    pub fn attach(sys: SharedSyscall, fd: RawFd) -> Self {
        Self {
            sys,
            fd,
            transport: Transport::Plain,
        }
    }

    #[inline]
    #[must_use]
    pub const fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.fd != INVALID_FD
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        !matches!(self.transport, Transport::Plain)
    }

    pub fn bind(&self, addr: &SockAddr) -> io::Result<()> {
        self.sys.bind(self.fd, addr)
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.sys.listen(self.fd, backlog)
    }

    /// Start a non-blocking connect.
    ///
    /// "In progress" is success; completion is signaled by the first
    /// writable readiness event.
    pub fn connect(&self, addr: &SockAddr) -> io::Result<()> {
        match self.sys.connect(self.fd, addr) {
            Ok(()) => Ok(()),
            Err(e) if is_in_progress(&e) => {
                trace!(fd = self.fd, "connect in progress");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Accept one pending connection. Sockets accepted from a TLS listener
    /// start their server handshake on the first [`tls_accepting`](Self::tls_accepting).
    pub fn accept(&self) -> Result<(Self, SockAddr)> {
        let (fd, peer) = self.sys.accept(self.fd)?;
        let mut accepted = Self::attach(Arc::clone(&self.sys), fd);
        if let Transport::TlsListener(config) = &self.transport {
            accepted.transport = Transport::Tls(Box::new(TlsSession::server(Arc::clone(config))?));
        }
        Ok((accepted, peer))
    }

    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let sys = Arc::clone(&self.sys);
        match &mut self.transport {
            Transport::Tls(session) => session.send(&mut FdIo { sys: &*sys, fd: self.fd }, buf),
            _ => sys.send(self.fd, buf),
        }
    }

    /// Receive into `buf`. `Ok(0)` means the peer closed the stream.
    pub fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let sys = Arc::clone(&self.sys);
        match &mut self.transport {
            Transport::Tls(session) => session.receive(&mut FdIo { sys: &*sys, fd: self.fd }, buf),
            _ => sys.recv(self.fd, buf),
        }
    }

    /// Bytes readable without blocking. For TLS this is decrypted data.
    pub fn pending_read(&mut self) -> io::Result<usize> {
        let sys = Arc::clone(&self.sys);
        match &mut self.transport {
            Transport::Tls(session) => session.pending_read(&mut FdIo { sys: &*sys, fd: self.fd }),
            _ => sys.bytes_available(self.fd),
        }
    }

    /// Readable bytes after a readiness event that reported `reported` raw
    /// bytes. Plain sockets trust the report; TLS sockets decrypt first.
    pub fn readable_bytes(&mut self, reported: usize) -> io::Result<usize> {
        if self.is_tls() {
            self.pending_read()
        } else {
            Ok(reported)
        }
    }

    /// Advance the server side handshake by one non-blocking step.
    pub fn tls_accepting(&mut self) -> IoState {
        match &self.transport {
            Transport::Tls(session) if !session.is_server() => IoState::Error,
            _ => self.handshake(),
        }
    }

    /// Advance the client side handshake by one non-blocking step.
    pub fn tls_connecting(&mut self) -> IoState {
        match &self.transport {
            Transport::Tls(session) if session.is_server() => IoState::Error,
            _ => self.handshake(),
        }
    }

    /// Advance whichever handshake this socket runs. Plain sockets succeed at once.
    pub fn handshake(&mut self) -> IoState {
        let sys = Arc::clone(&self.sys);
        match &mut self.transport {
            Transport::Tls(session) => session.handshake(&mut FdIo { sys: &*sys, fd: self.fd }),
            Transport::Plain => IoState::Success,
            Transport::TlsListener(_) => IoState::Error,
        }
    }

    /// A receive must be retried once the socket is writable.
    #[must_use]
    pub fn is_read_when_writable(&self) -> bool {
        match &self.transport {
            Transport::Tls(session) => session.is_read_when_writable(),
            _ => false,
        }
    }

    /// A send must be retried once the socket is readable.
    #[must_use]
    pub fn is_write_when_readable(&self) -> bool {
        match &self.transport {
            Transport::Tls(session) => session.is_write_when_readable(),
            _ => false,
        }
    }

    /// Encrypted output the transport has not accepted yet.
    #[must_use]
    pub fn has_pending_output(&self) -> bool {
        match &self.transport {
            Transport::Tls(session) => session.has_pending_output(),
            _ => false,
        }
    }

    /// Push buffered TLS records to the transport.
    pub fn flush(&mut self) -> io::Result<()> {
        let sys = Arc::clone(&self.sys);
        match &mut self.transport {
            Transport::Tls(session) => session.flush(&mut FdIo { sys: &*sys, fd: self.fd }),
            _ => Ok(()),
        }
    }

    pub fn local_addr(&self) -> io::Result<SockAddr> {
        self.sys.local_addr(self.fd)
    }

    /// Pending socket error, used to check the outcome of a connect.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.sys.take_error(self.fd)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.sys.set_nodelay(self.fd, nodelay)
    }

    pub fn set_reuse_address(&self, reuse: bool) -> io::Result<()> {
        self.sys.set_reuse_address(self.fd, reuse)
    }

    /// Close the descriptor and drop the TLS session. Idempotent.
    pub fn destroy(&mut self) {
        if self.fd == INVALID_FD {
            return;
        }
        let sys = Arc::clone(&self.sys);
        if let Transport::Tls(session) = &mut self.transport {
            if !session.is_handshaking() {
                session.close(&mut FdIo { sys: &*sys, fd: self.fd });
            }
        }
        if let Err(e) = sys.close(self.fd) {
            debug!(fd = self.fd, error = %e, "close failed");
        }
        self.fd = INVALID_FD;
        self.transport = Transport::Plain;
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fd)
            .field("tls", &self.is_tls())
            .finish()
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::sys;
    use std::net::SocketAddr;

    fn loopback_listener() -> (Socket, SockAddr) {
        let listener = Socket::create(sys::os(), Domain::IPV4, Type::STREAM, None).unwrap();
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        listener.bind(&SockAddr::from(any)).unwrap();
        listener.listen(16).unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn test_connect_in_progress_is_ok() {
        let (listener, addr) = loopback_listener();
        let client = Socket::create(sys::os(), Domain::IPV4, Type::STREAM, None).unwrap();
        client.connect(&addr).unwrap();
        assert!(client.is_valid());
        assert!(!client.is_tls());
        drop(listener);
    }

    #[test]
    fn test_plain_handshake_is_immediate() {
        let mut socket = Socket::create(sys::os(), Domain::IPV4, Type::STREAM, None).unwrap();
        assert_eq!(socket.handshake(), IoState::Success);
        assert_eq!(socket.tls_connecting(), IoState::Success);
        assert!(!socket.is_read_when_writable());
        assert!(!socket.is_write_when_readable());
        assert_eq!(socket.readable_bytes(42).unwrap(), 42);
    }

    #[test]
    fn test_send_receive_over_loopback() {
        let (listener, addr) = loopback_listener();
        let mut client = Socket::create(sys::os(), Domain::IPV4, Type::STREAM, None).unwrap();
        client.connect(&addr).unwrap();

        let mut server = loop {
            match listener.accept() {
                Ok((socket, _)) => break socket,
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(1)),
            }
        };

        while client.send(b"ping").is_err() {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let mut buf = [0u8; 16];
        let n = loop {
            match server.receive(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("receive failed: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(server.pending_read().unwrap(), 0);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut socket = Socket::create(sys::os(), Domain::IPV4, Type::STREAM, None).unwrap();
        socket.destroy();
        assert!(!socket.is_valid());
        socket.destroy();
    }
}
