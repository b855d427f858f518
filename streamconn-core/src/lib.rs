//! Streamconn Core
//!
//! Building blocks of the streamconn runtime that do not depend on a
//! framing protocol:
//! - Replaceable system call layer with an OS and a fault injecting implementation (`sys`)
//! - Epoll poller with a cross-thread wake channel (`poller`)
//! - Non-blocking plain/TLS socket (`socket`, `tls`)
//! - Endpoint parsing and address helpers (`endpoint`)
//! - Connection identity and state (`connection_data`)
//! - Chunk queue used by framing and send paths (`buffer`)
//! - Messages, reconnect timing, options, monitor events, errors

// Only the OS syscall layer talks to libc directly
#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod connection_data;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod monitor;
pub mod options;
pub mod poller;
pub mod reconnect;
pub mod socket;
pub mod sys;
pub mod tls;

pub mod prelude {
    pub use crate::buffer::SegmentedBuffer;
    pub use crate::connection_data::{ConnectionData, ConnectionId, ConnectionState};
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{Result, StreamError};
    pub use crate::message::Message;
    pub use crate::monitor::{ConnectionEvent, ConnectionMonitor};
    pub use crate::options::{ConnectOptions, ContainerConfig};
    pub use crate::poller::{DescriptorInfo, PollOutcome, Poller, PollerResult};
    pub use crate::reconnect::{ReconnectAction, ReconnectPolicy, ReconnectState};
    pub use crate::socket::Socket;
    pub use crate::sys::{SharedSyscall, Syscall};
    pub use crate::tls::{CertificateData, IoState};
}
