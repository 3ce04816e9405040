// ── Readings and faults ──

use serde::{Deserialize, Serialize};

/// One decoded value published for a composite sensor id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reading {
    /// Engineering value after resolution, offset and unit modifier.
    Numeric { value: f64, unit: u8 },
    /// Present state of one state-set element.
    State {
        state: u8,
        /// Vendor or standard label for `state`, when one is known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    /// The terminus reported the sensor as not enabled.
    Unavailable { operational_state: u8 },
}

impl Reading {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Why a fault was published for a terminus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FaultKind {
    /// Consecutive failed reads crossed the configured threshold.
    PollingFailures { consecutive: u32 },
    /// Enumeration failed before any capability was recorded.
    EnumerationFailed,
}
