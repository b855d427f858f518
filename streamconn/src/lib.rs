//! # Streamconn
//!
//! A single-threaded, epoll driven connection runtime.
//!
//! ## Architecture
//!
//! - **`streamconn-core`**: syscall layer, poller, plain/TLS sockets, connection data
//! - **`streamconn-proto`**: message framing (delimiter, raw stream)
//! - **`streamconn`**: containers running the poll loop (this crate)
//!
//! One [`ConnectionContainer`] owns one poll loop thread. Foreign threads
//! bind, connect, send and disconnect through thread-safe handles; the loop
//! thread does every socket operation and runs every callback.
//! [`ProtocolSessionContainer`] layers a [`Protocol`](streamconn_proto::protocol::Protocol)
//! per connection on top, delivering whole messages.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use streamconn::prelude::*;
//!
//! struct Printer;
//!
//! impl SessionCallback for Printer {
//!     fn received(&self, session: &Session, message: Message) {
//!         println!("{}: {:?}", session.id(), message.received());
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let container = ProtocolSessionContainer::new();
//! container.init(Duration::from_millis(100), Duration::from_secs(1))?;
//! container.bind(
//!     "tcp://*:3333",
//!     Arc::new(Printer),
//!     Arc::new(ProtocolDelimiterFactory::new(&b"\n"[..])),
//! )?;
//! let _poll_thread = container.spawn()?;
//!
//! let session = container.connect(
//!     "tcp://localhost:3333",
//!     Arc::new(Printer),
//!     Box::new(ProtocolDelimiter::new(&b"\n"[..])),
//!     ConnectOptions::default(),
//! )?;
//! session.send_message(session.create_message().push_str("hello"))?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::module_name_repetitions)]

pub mod callback;
pub mod connection;
pub mod container;
pub mod dev_tracing;
pub mod session;

pub use callback::{shared_callback, CallbackFactory, SocketReader, StreamCallback};
pub use connection::Connection;
pub use container::ConnectionContainer;
pub use session::{ProtocolSessionContainer, Session, SessionCallback};

pub use streamconn_core::connection_data::{ConnectionData, ConnectionId, ConnectionState};
pub use streamconn_core::error::{Result, StreamError};
pub use streamconn_core::message::Message;
pub use streamconn_core::monitor::{ConnectionEvent, ConnectionMonitor};
pub use streamconn_core::options::{ConnectOptions, ContainerConfig};
pub use streamconn_core::tls::CertificateData;

/// Convenient imports.
pub mod prelude {
    pub use crate::{
        CertificateData, ConnectOptions, Connection, ConnectionContainer, ConnectionEvent,
        ConnectionState, ContainerConfig, Message, ProtocolSessionContainer, Session, SessionCallback,
        SocketReader, StreamCallback,
    };
    pub use bytes::Bytes;
    pub use streamconn_proto::prelude::*;
}
