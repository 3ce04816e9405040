//! Wire-level boundary between the platmc manager and remote termini.
//!
//! - **[`Transport`]**: the single request/response I/O primitive the
//!   manager depends on. Implementations own bus addressing and framing.
//! - **[`message`]**: three-byte header framing, instance ids and
//!   completion codes.
//! - **[`commands`]**: typed payloads for discovery (`GetTID`, `SetTID`,
//!   `GetPLDMTypes`), enumeration (`GetPDR`) and reads.
//! - **[`pdr`]**: data-record codecs for numeric/state sensors and
//!   effecters plus opaque OEM records.
//! - **`loopback`** (feature `loopback`): an in-memory bus with scripted
//!   termini, used by tests and the demo runner.

pub mod commands;
pub mod endpoint;
pub mod error;
#[cfg(feature = "loopback")]
pub mod loopback;
pub mod message;
pub mod pdr;
pub mod transport;
mod wire;

pub use endpoint::{Eid, EndpointAddress, EndpointDescriptor};
pub use error::{CodecError, Error};
pub use message::{CompletionCode, InstanceId, PldmType, Request, Response};
pub use transport::Transport;
