//! Streamconn Protocols
//!
//! Message framing on top of raw byte streams:
//! - Protocol and factory traits (`protocol`)
//! - Delimiter framing tolerant of arbitrary read boundaries (`delimiter`)
//! - One-message-per-chunk pass-through (`stream`)

#![allow(clippy::module_name_repetitions)]

pub mod delimiter;
pub mod protocol;
pub mod stream;

pub mod prelude {
    pub use crate::delimiter::{Boundary, DelimiterFramer, ProtocolDelimiter, ProtocolDelimiterFactory};
    pub use crate::protocol::{Protocol, ProtocolCallback, ProtocolFactory};
    pub use crate::stream::{ProtocolStream, ProtocolStreamFactory};
}
