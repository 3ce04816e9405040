// ── Terminus discovery ──
//
// Turns an attached endpoint into a registered terminus: GetTID,
// allocate-and-insert, SetTID, GetPLDMTypes. Every in-flight probe is
// tracked by endpoint so a detach can cancel it; cancellation is
// checked after each suspension point, and a probe cancelled after it
// inserted its terminus takes the entry back out.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use platmc_proto::commands::base;
use platmc_proto::{EndpointAddress, EndpointDescriptor, PldmType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ManagerConfig;
use crate::error::CoreError;
use crate::model::{Terminus, Tid};
use crate::registry::TerminusRegistry;
use crate::requester::Requester;

struct Probe {
    id: u64,
    cancel: CancellationToken,
}

/// Handle on one in-progress bring-up. Stays valid (and cancellable)
/// until passed to [`TerminusManager::finish`].
#[derive(Debug)]
pub struct DiscoveryTicket {
    id: u64,
    endpoint: EndpointDescriptor,
    cancel: CancellationToken,
}

impl DiscoveryTicket {
    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    pub fn address(&self) -> EndpointAddress {
        self.endpoint.address
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// `Err(Cancelled)` once a detach has claimed this probe.
    pub(crate) fn check(&self) -> Result<(), CoreError> {
        if self.cancel.is_cancelled() {
            Err(CoreError::Cancelled {
                endpoint: self.endpoint.address,
            })
        } else {
            Ok(())
        }
    }
}

pub struct TerminusManager {
    registry: Arc<TerminusRegistry>,
    requester: Arc<Requester>,
    config: Arc<ManagerConfig>,
    probes: DashMap<EndpointAddress, Probe>,
    next_probe: AtomicU64,
}

impl TerminusManager {
    pub(crate) fn new(
        registry: Arc<TerminusRegistry>,
        requester: Arc<Requester>,
        config: Arc<ManagerConfig>,
    ) -> Self {
        Self {
            registry,
            requester,
            config,
            probes: DashMap::new(),
            next_probe: AtomicU64::new(0),
        }
    }

    /// Start tracking a probe for `endpoint`. `None` when the endpoint
    /// is already being probed or already owns a live terminus.
    pub fn begin(&self, endpoint: &EndpointDescriptor) -> Option<DiscoveryTicket> {
        let address = endpoint.address;
        if let Some(tid) = self.registry.tid_for(address) {
            debug!(endpoint = %address, %tid, "endpoint already registered, ignoring attach");
            return None;
        }
        match self.probes.entry(address) {
            Entry::Occupied(_) => {
                debug!(endpoint = %address, "endpoint already being probed, ignoring attach");
                None
            }
            Entry::Vacant(slot) => {
                let id = self.next_probe.fetch_add(1, Ordering::Relaxed);
                let cancel = CancellationToken::new();
                slot.insert(Probe {
                    id,
                    cancel: cancel.clone(),
                });
                Some(DiscoveryTicket {
                    id,
                    endpoint: endpoint.clone(),
                    cancel,
                })
            }
        }
    }

    /// Stop tracking a probe. Only removes the entry the ticket created.
    pub fn finish(&self, ticket: DiscoveryTicket) {
        self.probes
            .remove_if(&ticket.endpoint.address, |_, probe| probe.id == ticket.id);
    }

    /// Cancel the in-flight probe for `endpoint`, if any.
    pub fn cancel(&self, endpoint: EndpointAddress) -> bool {
        match self.probes.remove(&endpoint) {
            Some((_, probe)) => {
                probe.cancel.cancel();
                debug!(%endpoint, "probe cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_probing(&self, endpoint: EndpointAddress) -> bool {
        self.probes.contains_key(&endpoint)
    }

    /// Identify the terminus behind `ticket` and register it.
    ///
    /// On any error the registry holds no entry for the endpoint.
    pub async fn discover(&self, ticket: &DiscoveryTicket) -> Result<Arc<Terminus>, CoreError> {
        let address = ticket.address();

        let response = self
            .requester
            .send_with_retry(
                address,
                &base::get_tid_request(),
                self.config.discovery_attempts,
                &self.config.retry,
                ticket.token(),
            )
            .await?;
        let reported =
            base::decode_get_tid(response.payload).map_err(|e| CoreError::malformed(address, &e))?;
        ticket.check()?;

        let terminus = self
            .registry
            .register(ticket.endpoint().clone(), Some(reported))?;

        // A detach may have landed between the check and the insert.
        if let Err(e) = ticket.check() {
            self.registry.remove_instance(&terminus);
            return Err(e);
        }

        if let Err(e) = self.identify(ticket, &terminus, reported).await {
            self.registry.remove_instance(&terminus);
            self.requester.forget(address);
            return Err(e);
        }

        info!(tid = %terminus.tid(), endpoint = %address, "terminus discovered");
        Ok(terminus)
    }

    async fn identify(
        &self,
        ticket: &DiscoveryTicket,
        terminus: &Terminus,
        reported: u8,
    ) -> Result<(), CoreError> {
        let address = ticket.address();
        let tid = terminus.tid();

        if reported != tid.get() {
            debug!(endpoint = %address, reported, assigned = tid.get(), "assigning TID");
            self.requester
                .send_with_retry(
                    address,
                    &base::set_tid_request(tid.get()),
                    self.config.discovery_attempts,
                    &self.config.retry,
                    ticket.token(),
                )
                .await?;
            ticket.check()?;
        }

        let response = self
            .requester
            .send_with_retry(
                address,
                &base::get_types_request(),
                self.config.discovery_attempts,
                &self.config.retry,
                ticket.token(),
            )
            .await?;
        let types = base::decode_get_types(response.payload)
            .map_err(|e| CoreError::malformed(address, &e))?;
        ticket.check()?;

        self.registry.set_types(tid, types);
        debug!(
            %tid,
            platform = types.contains(PldmType::PLATFORM),
            "message types recorded"
        );
        Ok(())
    }

    /// Evict a terminus and drop its endpoint state.
    pub fn retire(&self, tid: Tid) -> Option<Arc<Terminus>> {
        let terminus = self.registry.remove(tid)?;
        self.requester.forget(terminus.address());
        info!(%tid, endpoint = %terminus.address(), "terminus removed");
        Some(terminus)
    }

    /// Evict `terminus` unless its TID has already moved on.
    pub(crate) fn retire_instance(&self, terminus: &Arc<Terminus>) -> bool {
        let removed = self.registry.remove_instance(terminus);
        if removed {
            self.requester.forget(terminus.address());
        }
        removed
    }
}
