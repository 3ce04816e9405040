// ── Terminus registry ──
//
// Sole owner of live termini. Lookups go through `DashMap`; every
// mutation rebuilds a snapshot pushed through a `watch` channel so
// observers see membership and state changes without polling.
// TID allocation and insertion happen under one lock, which keeps
// TIDs unique among live termini even when probes race.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use platmc_proto::commands::base::SupportedTypes;
use platmc_proto::{EndpointAddress, EndpointDescriptor};
use tokio::sync::watch;
use tracing::debug;

use crate::error::CoreError;
use crate::model::{Catalog, Terminus, TerminusKey, TerminusState, Tid};

/// Shared store of live termini, keyed by [`Tid`].
pub struct TerminusRegistry {
    by_tid: DashMap<Tid, Arc<Terminus>>,

    /// Secondary index: endpoint -> TID.
    by_endpoint: DashMap<EndpointAddress, Tid>,

    /// Serialises allocate-and-insert.
    allocation: Mutex<()>,

    generation: AtomicU64,

    version: watch::Sender<u64>,
    snapshot: watch::Sender<Arc<Vec<Arc<Terminus>>>>,
}

impl Default for TerminusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminusRegistry {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0u64);
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));

        Self {
            by_tid: DashMap::new(),
            by_endpoint: DashMap::new(),
            allocation: Mutex::new(()),
            generation: AtomicU64::new(0),
            version,
            snapshot,
        }
    }

    // ── Allocation ───────────────────────────────────────────────────

    /// Allocate a TID for `endpoint` and insert a `Discovering` terminus.
    ///
    /// `preferred` (the TID the device already holds) is kept when it is
    /// assignable and free; otherwise the lowest free TID is used.
    pub(crate) fn register(
        &self,
        endpoint: EndpointDescriptor,
        preferred: Option<u8>,
    ) -> Result<Arc<Terminus>, CoreError> {
        let _guard = self
            .allocation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(tid) = self.tid_for(endpoint.address) {
            return Err(CoreError::AlreadyRegistered {
                endpoint: endpoint.address,
                tid,
            });
        }

        let tid = preferred
            .and_then(Tid::new)
            .filter(|tid| !self.by_tid.contains_key(tid))
            .or_else(|| {
                (Tid::MIN..=Tid::MAX)
                    .filter_map(Tid::new)
                    .find(|tid| !self.by_tid.contains_key(tid))
            })
            .ok_or_else(|| CoreError::ResourceExhausted {
                resource: format!("no free TID for {}", endpoint.address),
            })?;

        let key = TerminusKey {
            tid,
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
        };
        let address = endpoint.address;
        let terminus = Arc::new(Terminus::new(key, endpoint));
        self.by_tid.insert(tid, Arc::clone(&terminus));
        self.by_endpoint.insert(address, tid);
        debug!(%tid, endpoint = %address, "terminus registered");

        self.changed();
        Ok(terminus)
    }

    // ── Removal ──────────────────────────────────────────────────────

    /// Evict a terminus. Its state is set to `Removed` so holders of a
    /// stale `Arc` can tell.
    pub(crate) fn remove(&self, tid: Tid) -> Option<Arc<Terminus>> {
        let (_, terminus) = self.by_tid.remove(&tid)?;
        self.evicted(&terminus);
        Some(terminus)
    }

    /// Evict `terminus` only if it still occupies its TID.
    pub(crate) fn remove_instance(&self, terminus: &Arc<Terminus>) -> bool {
        let removed = self
            .by_tid
            .remove_if(&terminus.tid(), |_, live| Arc::ptr_eq(live, terminus))
            .is_some();
        if removed {
            self.evicted(terminus);
        }
        removed
    }

    fn evicted(&self, terminus: &Terminus) {
        self.by_endpoint
            .remove_if(&terminus.address(), |_, tid| *tid == terminus.tid());
        terminus.set_state(TerminusState::Removed);
        terminus.set_available(false);
        debug!(tid = %terminus.tid(), endpoint = %terminus.address(), "terminus evicted");
        self.changed();
    }

    // ── Lookups ──────────────────────────────────────────────────────

    pub fn get(&self, tid: Tid) -> Option<Arc<Terminus>> {
        self.by_tid.get(&tid).map(|r| Arc::clone(r.value()))
    }

    /// Look up by key; `None` once the TID has been reused.
    pub fn get_key(&self, key: TerminusKey) -> Option<Arc<Terminus>> {
        self.get(key.tid).filter(|t| t.key() == key)
    }

    pub fn contains(&self, tid: Tid) -> bool {
        self.by_tid.contains_key(&tid)
    }

    pub fn tid_for(&self, endpoint: EndpointAddress) -> Option<Tid> {
        self.by_endpoint.get(&endpoint).map(|r| *r.value())
    }

    pub fn len(&self) -> usize {
        self.by_tid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tid.is_empty()
    }

    pub fn tids(&self) -> Vec<Tid> {
        let mut tids: Vec<Tid> = self.by_tid.iter().map(|r| *r.key()).collect();
        tids.sort_unstable();
        tids
    }

    /// Current snapshot, ordered by TID.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Terminus>>> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<Terminus>>>> {
        self.snapshot.subscribe()
    }

    /// Bumped on every membership or state change.
    pub fn version(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    // ── Mutation by TID ──────────────────────────────────────────────
    //
    // All of these are no-ops on an unknown TID.

    pub(crate) fn set_state(&self, tid: Tid, state: TerminusState) -> bool {
        let changed = self.get(tid).is_some_and(|t| t.set_state(state));
        if changed {
            self.changed();
        }
        changed
    }

    /// Flip the availability flag. `Active` and `Unavailable` follow it;
    /// other states are left alone.
    pub(crate) fn set_availability(&self, tid: Tid, available: bool) -> bool {
        let Some(terminus) = self.get(tid) else {
            return false;
        };
        let changed = terminus.set_available(available);
        match (terminus.state(), available) {
            (TerminusState::Unavailable, true) => {
                terminus.set_state(TerminusState::Active);
            }
            (TerminusState::Active, false) => {
                terminus.set_state(TerminusState::Unavailable);
            }
            _ => {}
        }
        if changed {
            self.changed();
        }
        changed
    }

    pub(crate) fn set_types(&self, tid: Tid, types: SupportedTypes) -> bool {
        self.get(tid).map(|t| t.set_types(types)).is_some()
    }

    pub(crate) fn install_catalog(&self, tid: Tid, catalog: Catalog) -> bool {
        let installed = self.get(tid).is_some_and(|t| t.install_catalog(catalog));
        if installed {
            self.changed();
        }
        installed
    }

    pub(crate) fn set_poll_interval(&self, tid: Tid, interval: Option<Duration>) -> bool {
        self.get(tid).map(|t| t.set_poll_interval(interval)).is_some()
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn changed(&self) {
        let mut values: Vec<Arc<Terminus>> =
            self.by_tid.iter().map(|r| Arc::clone(r.value())).collect();
        values.sort_unstable_by_key(|t| t.tid());
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
        self.version.send_modify(|v| *v += 1);
    }
}
