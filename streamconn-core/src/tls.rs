//! TLS sessions over non-blocking descriptors.
//!
//! [`CertificateData`] is the opaque TLS configuration handed to TLS binds
//! and connects. [`TlsSession`] drives a `rustls` connection over a raw
//! descriptor through the syscall layer: handshake steps, record pumping,
//! and the read/write cross-dependencies surfaced as
//! `read_when_writable` / `write_when_readable`.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use tracing::{debug, trace};

use crate::error::{Result, StreamError};
use crate::sys::Syscall;

/// Outcome of one non-blocking handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    /// Wait for the descriptor to become readable, then call again.
    WantRead,
    /// Wait for the descriptor to become writable, then call again.
    WantWrite,
    Success,
    Error,
}

/// Certificates and keys for TLS binds and connects.
///
/// All material is DER encoded. A listening socket needs a certificate
/// chain and private key. A connecting socket needs trust roots and may
/// present a chain and key as client identity.
#[derive(Default)]
pub struct CertificateData {
    pub certificate_chain: Vec<CertificateDer<'static>>,
    pub private_key: Option<PrivateKeyDer<'static>>,
    pub trust_roots: Vec<CertificateDer<'static>>,
    /// Name verified against the server certificate. Defaults to the endpoint host.
    pub server_name: Option<String>,
}

impl CertificateData {
    /// Server identity from a certificate chain and its private key.
    #[must_use]
    pub fn server(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self {
            certificate_chain: chain,
            private_key: Some(key),
            ..Self::default()
        }
    }

    /// Client trusting the given roots.
    #[must_use]
    pub fn client(trust_roots: Vec<CertificateDer<'static>>) -> Self {
        Self {
            trust_roots,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    fn provider() -> Arc<rustls::crypto::CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    /// Build the server side configuration.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| StreamError::tls("server certificate data has no private key"))?;
        if self.certificate_chain.is_empty() {
            return Err(StreamError::tls("server certificate data has no certificate"));
        }
        let config = ServerConfig::builder_with_provider(Self::provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.certificate_chain.clone(), key.clone_key())?;
        Ok(Arc::new(config))
    }

    /// Build the client side configuration.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        for root in &self.trust_roots {
            roots.add(root.clone())?;
        }
        let builder = ClientConfig::builder_with_provider(Self::provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);
        let config = match &self.private_key {
            Some(key) if !self.certificate_chain.is_empty() => {
                builder.with_client_auth_cert(self.certificate_chain.clone(), key.clone_key())?
            }
            _ => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }
}

impl Clone for CertificateData {
    fn clone(&self) -> Self {
        Self {
            certificate_chain: self.certificate_chain.clone(),
            private_key: self.private_key.as_ref().map(PrivateKeyDer::clone_key),
            trust_roots: self.trust_roots.clone(),
            server_name: self.server_name.clone(),
        }
    }
}

impl fmt::Debug for CertificateData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateData")
            .field("certificate_chain", &self.certificate_chain.len())
            .field("private_key", &self.private_key.is_some())
            .field("trust_roots", &self.trust_roots.len())
            .field("server_name", &self.server_name)
            .finish()
    }
}

/// Blocking-free `Read`/`Write` view of a descriptor.
pub(crate) struct FdIo<'a> {
    pub(crate) sys: &'a dyn Syscall,
    pub(crate) fd: RawFd,
}

impl Read for FdIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.sys.recv(self.fd, buf)
    }
}

impl Write for FdIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sys.send(self.fd, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One TLS session bound to a socket.
pub struct TlsSession {
    conn: Connection,
    /// Transport reached end of stream.
    eof: bool,
    read_when_writable: bool,
    write_when_readable: bool,
}

impl TlsSession {
    pub fn server(config: Arc<ServerConfig>) -> Result<Self> {
        Ok(Self::wrap(ServerConnection::new(config)?.into()))
    }

    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| StreamError::tls(format!("invalid server name {server_name}: {e}")))?;
        Ok(Self::wrap(ClientConnection::new(config, name)?.into()))
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn,
            eof: false,
            read_when_writable: false,
            write_when_readable: false,
        }
    }

    #[must_use]
    pub fn is_server(&self) -> bool {
        matches!(self.conn, Connection::Server(_))
    }

    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    #[must_use]
    pub const fn is_read_when_writable(&self) -> bool {
        self.read_when_writable
    }

    #[must_use]
    pub const fn is_write_when_readable(&self) -> bool {
        self.write_when_readable
    }

    /// Encrypted output still waiting for the transport.
    #[must_use]
    pub fn has_pending_output(&self) -> bool {
        self.conn.wants_write()
    }

    /// Advance the handshake as far as the descriptor allows.
    pub(crate) fn handshake(&mut self, io: &mut FdIo<'_>) -> IoState {
        loop {
            while self.conn.wants_write() {
                match self.conn.write_tls(io) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoState::WantWrite,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!(fd = io.fd, error = %e, "tls handshake write failed");
                        return IoState::Error;
                    }
                }
            }

            if !self.conn.is_handshaking() {
                return IoState::Success;
            }

            match self.conn.read_tls(io) {
                Ok(0) => {
                    debug!(fd = io.fd, "peer closed during tls handshake");
                    self.eof = true;
                    return IoState::Error;
                }
                Ok(_) => {
                    if let Err(e) = self.conn.process_new_packets() {
                        debug!(fd = io.fd, error = %e, "tls handshake rejected");
                        // Best effort: let the peer see the alert.
                        let _ = self.conn.write_tls(io);
                        return IoState::Error;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoState::WantRead,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(fd = io.fd, error = %e, "tls handshake read failed");
                    return IoState::Error;
                }
            }
        }
    }

    /// Move records from the transport into the session until plaintext is
    /// available or the transport would block.
    fn pump(&mut self, io: &mut FdIo<'_>) -> io::Result<usize> {
        loop {
            let state = self
                .conn
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let available = state.plaintext_bytes_to_read();
            if available > 0 || self.eof || state.peer_has_closed() {
                self.flush(io)?;
                return Ok(available);
            }
            match self.conn.read_tls(io) {
                Ok(0) => self.eof = true,
                Ok(n) => trace!(fd = io.fd, bytes = n, "tls records read"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.flush(io)?;
                    return Ok(0);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Plaintext bytes readable now. Fails once the peer closed and
    /// everything was consumed.
    pub(crate) fn pending_read(&mut self, io: &mut FdIo<'_>) -> io::Result<usize> {
        let available = self.pump(io)?;
        if available == 0 && (self.eof || self.conn.process_new_packets().is_ok_and(|s| s.peer_has_closed())) {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        Ok(available)
    }

    pub(crate) fn receive(&mut self, io: &mut FdIo<'_>, buf: &mut [u8]) -> io::Result<usize> {
        match self.conn.reader().read(buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            other => return other,
        }
        if self.pump(io)? == 0 {
            if self.eof {
                return Ok(0);
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        self.conn.reader().read(buf)
    }

    pub(crate) fn send(&mut self, io: &mut FdIo<'_>, buf: &[u8]) -> io::Result<usize> {
        if self.conn.is_handshaking() {
            self.write_when_readable = true;
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        self.write_when_readable = false;
        let accepted = self.conn.writer().write(buf)?;
        self.flush(io)?;
        if accepted == 0 && !buf.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        Ok(accepted)
    }

    /// Write buffered records until done or the transport would block.
    pub(crate) fn flush(&mut self, io: &mut FdIo<'_>) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(io) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.read_when_writable = true;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.read_when_writable = false;
        Ok(())
    }

    pub(crate) fn close(&mut self, io: &mut FdIo<'_>) {
        self.conn.send_close_notify();
        let _ = self.flush(io);
    }
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSession")
            .field("server", &self.is_server())
            .field("handshaking", &self.is_handshaking())
            .field("eof", &self.eof)
            .finish()
    }
}
