// ── Manager events ──

use platmc_proto::EndpointAddress;
use serde::Serialize;

use crate::model::{FaultKind, TerminusState, Tid};

/// Lifecycle notifications broadcast by the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ManagerEvent {
    /// Identity exchange finished; the terminus is in the registry.
    Discovered { tid: Tid, endpoint: EndpointAddress },
    /// Enumeration settled on `state` with `capabilities` entries.
    Enumerated {
        tid: Tid,
        state: TerminusState,
        capabilities: usize,
    },
    /// The endpoint never made it into the registry.
    DiscoveryFailed {
        endpoint: EndpointAddress,
        reason: String,
    },
    AvailabilityChanged { tid: Tid, available: bool },
    Fault { tid: Tid, fault: FaultKind },
    Removed { tid: Tid, endpoint: EndpointAddress },
}
