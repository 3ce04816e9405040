// ── Endpoint addressing ──
//
// Bus-level identity of a remote endpoint, as handed to us by the
// transport discovery collaborator. Stable while the endpoint is attached.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Eid ─────────────────────────────────────────────────────────────

/// Transport endpoint id, unique within one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Eid(pub u8);

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── EndpointAddress ─────────────────────────────────────────────────

/// Fully qualified endpoint address: `(network, eid)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub network: u32,
    pub eid: Eid,
}

impl EndpointAddress {
    pub const fn new(network: u32, eid: u8) -> Self {
        Self {
            network,
            eid: Eid(eid),
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.eid)
    }
}

/// Error returned when parsing an `EndpointAddress` from `"net:eid"` text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid endpoint address '{0}', expected <network>:<eid>")]
pub struct ParseEndpointError(String);

impl FromStr for EndpointAddress {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseEndpointError(s.to_owned());
        let (net, eid) = s.split_once(':').ok_or_else(err)?;
        let network = net.trim().parse().map_err(|_| err())?;
        let eid = eid.trim().parse().map_err(|_| err())?;
        Ok(Self::new(network, eid))
    }
}

// ── EndpointDescriptor ──────────────────────────────────────────────

/// One element of an attach/detach batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub address: EndpointAddress,
    /// Endpoint UUID as reported by the transport, if known.
    pub uuid: Option<Uuid>,
    /// Physical medium label (e.g. "i2c", "pcie-vdm"); informational only.
    pub medium: Option<String>,
}

impl EndpointDescriptor {
    pub fn new(address: EndpointAddress) -> Self {
        Self {
            address,
            uuid: None,
            medium: None,
        }
    }
}

impl From<EndpointAddress> for EndpointDescriptor {
    fn from(address: EndpointAddress) -> Self {
        Self::new(address)
    }
}
