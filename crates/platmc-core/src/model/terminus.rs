// ── Terminus domain types ──

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use platmc_proto::commands::base::SupportedTypes;
use platmc_proto::{EndpointAddress, EndpointDescriptor, PldmType};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::capability::Catalog;

// ── Tid ──────────────────────────────────────────────────────────────

/// Terminus identifier, unique among live termini.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tid(u8);

impl Tid {
    /// Lowest assignable identifier (0 means "unassigned").
    pub const MIN: u8 = 1;
    /// Highest assignable identifier (255 is reserved).
    pub const MAX: u8 = 254;

    pub const fn new(raw: u8) -> Option<Self> {
        if raw >= Self::MIN && raw <= Self::MAX {
            Some(Self(raw))
        } else {
            None
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid-{}", self.0)
    }
}

/// Registry identity of one terminus instance.
///
/// A TID can be reused after its terminus is evicted; the generation
/// tells a stale holder that the slot now belongs to someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TerminusKey {
    pub tid: Tid,
    pub generation: u64,
}

// ── TerminusState ────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TerminusState {
    Discovering,
    Active,
    Unavailable,
    Removed,
}

// ── Terminus ─────────────────────────────────────────────────────────

/// One live terminus.
///
/// Owned by the registry; everything else holds a [`Tid`] and looks the
/// terminus up when it needs it. Mutable fields sit behind `watch`
/// channels so readers observe changes without locking the registry.
pub struct Terminus {
    key: TerminusKey,
    endpoint: EndpointDescriptor,
    discovered_at: DateTime<Utc>,
    state: watch::Sender<TerminusState>,
    available: watch::Sender<bool>,
    poll_interval: watch::Sender<Option<Duration>>,
    types: OnceLock<SupportedTypes>,
    catalog: OnceLock<Arc<Catalog>>,
}

impl Terminus {
    pub(crate) fn new(key: TerminusKey, endpoint: EndpointDescriptor) -> Self {
        let (state, _) = watch::channel(TerminusState::Discovering);
        let (available, _) = watch::channel(true);
        let (poll_interval, _) = watch::channel(None);
        Self {
            key,
            endpoint,
            discovered_at: Utc::now(),
            state,
            available,
            poll_interval,
            types: OnceLock::new(),
            catalog: OnceLock::new(),
        }
    }

    pub fn tid(&self) -> Tid {
        self.key.tid
    }

    pub fn key(&self) -> TerminusKey {
        self.key
    }

    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    pub fn address(&self) -> EndpointAddress {
        self.endpoint.address
    }

    pub fn discovered_at(&self) -> DateTime<Utc> {
        self.discovered_at
    }

    pub fn state(&self) -> TerminusState {
        *self.state.borrow()
    }

    pub fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    /// Polling cadence override, if one was set.
    pub fn poll_interval(&self) -> Option<Duration> {
        *self.poll_interval.borrow()
    }

    /// Whether the terminus advertised `pldm_type` during discovery.
    /// `false` until the type query has completed.
    pub fn supports(&self, pldm_type: PldmType) -> bool {
        self.types.get().is_some_and(|t| t.contains(pldm_type))
    }

    /// Capability catalog, installed once enumeration finishes.
    pub fn catalog(&self) -> Option<Arc<Catalog>> {
        self.catalog.get().cloned()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TerminusState> {
        self.state.subscribe()
    }

    pub fn subscribe_availability(&self) -> watch::Receiver<bool> {
        self.available.subscribe()
    }

    // ── Registry-only mutation ───────────────────────────────────────

    /// Returns `true` when the state changed.
    pub(crate) fn set_state(&self, state: TerminusState) -> bool {
        self.state.send_if_modified(|s| {
            let changed = *s != state;
            *s = state;
            changed
        })
    }

    pub(crate) fn set_available(&self, available: bool) -> bool {
        self.available.send_if_modified(|a| {
            let changed = *a != available;
            *a = available;
            changed
        })
    }

    pub(crate) fn set_poll_interval(&self, interval: Option<Duration>) {
        self.poll_interval.send_replace(interval);
    }

    pub(crate) fn set_types(&self, types: SupportedTypes) {
        let _ = self.types.set(types);
    }

    /// First install wins; the catalog is immutable afterwards.
    pub(crate) fn install_catalog(&self, catalog: Catalog) -> bool {
        self.catalog.set(Arc::new(catalog)).is_ok()
    }
}

impl fmt::Debug for Terminus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminus")
            .field("tid", &self.key.tid)
            .field("endpoint", &self.endpoint.address)
            .field("state", &self.state())
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}
