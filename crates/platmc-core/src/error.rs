// ── Core error types ──
//
// Errors raised while talking to termini. Discovery and enumeration never
// hand these to a caller: they are retried, logged, and folded into the
// terminus state. The orchestrator's public operations stay infallible.

use platmc_proto::{CodecError, CompletionCode, EndpointAddress};
use thiserror::Error;

use crate::model::Tid;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Transport ────────────────────────────────────────────────────
    #[error("Request to {endpoint} timed out after {timeout_ms}ms")]
    TransportTimeout {
        endpoint: EndpointAddress,
        timeout_ms: u64,
    },

    #[error("Endpoint {endpoint} is unreachable: {reason}")]
    Unreachable {
        endpoint: EndpointAddress,
        reason: String,
    },

    // ── Protocol ─────────────────────────────────────────────────────
    #[error("Malformed response from {endpoint}: {reason}")]
    MalformedResponse {
        endpoint: EndpointAddress,
        reason: String,
    },

    #[error("{endpoint} rejected command {command:#04x} with completion code {code}")]
    ProtocolRejection {
        endpoint: EndpointAddress,
        command: u8,
        code: CompletionCode,
    },

    // ── Resources ────────────────────────────────────────────────────
    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    #[error("Unknown terminus {tid}")]
    UnknownTerminus { tid: Tid },

    #[error("Endpoint {endpoint} already has a live terminus ({tid})")]
    AlreadyRegistered { endpoint: EndpointAddress, tid: Tid },

    // ── Lifecycle ────────────────────────────────────────────────────
    #[error("Discovery of {endpoint} was cancelled")]
    Cancelled { endpoint: EndpointAddress },
}

impl CoreError {
    /// Failures worth another attempt: the device may answer next time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportTimeout { .. } | Self::MalformedResponse { .. }
        )
    }

    pub(crate) fn malformed(endpoint: EndpointAddress, err: &CodecError) -> Self {
        Self::MalformedResponse {
            endpoint,
            reason: err.to_string(),
        }
    }

    /// Attach the endpoint to a transport-layer error.
    pub(crate) fn transport(endpoint: EndpointAddress, err: platmc_proto::Error) -> Self {
        match err {
            platmc_proto::Error::Timeout {
                endpoint,
                timeout_ms,
            } => Self::TransportTimeout {
                endpoint,
                timeout_ms,
            },
            platmc_proto::Error::Disconnected { endpoint } => Self::Unreachable {
                endpoint,
                reason: "not attached".into(),
            },
            platmc_proto::Error::Io(reason) => Self::Unreachable { endpoint, reason },
            platmc_proto::Error::Codec(e) => Self::malformed(endpoint, &e),
        }
    }
}
