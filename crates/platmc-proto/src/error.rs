use thiserror::Error;

use crate::endpoint::EndpointAddress;

/// Top-level error type for the `platmc-proto` crate.
///
/// Covers the transport boundary and every decode failure. `platmc-core`
/// folds these into its own taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// No response arrived within the per-request timeout.
    #[error("Request to {endpoint} timed out after {timeout_ms}ms")]
    Timeout {
        endpoint: EndpointAddress,
        timeout_ms: u64,
    },

    /// The endpoint is not (or no longer) reachable on the bus.
    #[error("Endpoint {endpoint} is not reachable")]
    Disconnected { endpoint: EndpointAddress },

    /// Lower-level I/O failure reported by the transport implementation.
    #[error("Transport I/O error: {0}")]
    Io(String),

    // ── Encoding ────────────────────────────────────────────────────
    /// The response bytes could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Decode failures for headers, command payloads and data records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Truncated {what}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        what: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("Invalid message header: {0}")]
    InvalidHeader(&'static str),

    #[error("Unexpected value {value:#x} for {field}")]
    UnexpectedValue { field: &'static str, value: u32 },

    #[error("Record length mismatch: header declares {declared} bytes, body has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

impl Error {
    /// Whether the failure is a timeout rather than a hard transport fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
