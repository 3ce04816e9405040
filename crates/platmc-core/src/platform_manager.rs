// ── Capability enumeration ──
//
// Walks the terminus's record repository with GetPDR, from handle 0
// until the terminus reports no next record. Records of types the
// manager does not interpret are skipped; vendor records go through the
// resolver. A failure part-way keeps whatever was read before it.

use std::sync::Arc;

use platmc_proto::PldmType;
use platmc_proto::commands::platform;
use platmc_proto::pdr::{Pdr, PdrRecord};
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::CoreError;
use crate::model::{CapabilityDescriptor, Catalog, Terminus, TerminusState, Tid};
use crate::oem::CapabilityResolver;
use crate::registry::TerminusRegistry;
use crate::requester::Requester;
use crate::terminus_manager::DiscoveryTicket;

/// Result of walking a terminus's records.
#[derive(Debug)]
pub(crate) struct Enumeration {
    pub descriptors: Vec<CapabilityDescriptor>,
    /// IANA numbers of vendor records seen, resolved or not.
    pub vendors: Vec<u32>,
    /// Records skipped because their type is not interpreted.
    pub skipped: usize,
    /// The error that cut the walk short, if any.
    pub error: Option<CoreError>,
}

/// How an enumeration settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumerationReport {
    pub state: TerminusState,
    /// Catalog size, injected capabilities included.
    pub capabilities: usize,
    /// `false` when an error cut the walk short.
    pub complete: bool,
}

pub struct PlatformManager {
    registry: Arc<TerminusRegistry>,
    requester: Arc<Requester>,
    resolver: Arc<dyn CapabilityResolver>,
    config: Arc<ManagerConfig>,
}

impl PlatformManager {
    pub(crate) fn new(
        registry: Arc<TerminusRegistry>,
        requester: Arc<Requester>,
        resolver: Arc<dyn CapabilityResolver>,
        config: Arc<ManagerConfig>,
    ) -> Self {
        Self {
            registry,
            requester,
            resolver,
            config,
        }
    }

    /// Build and install the catalog for `tid`, settling its state on
    /// `Active` or `Unavailable`.
    ///
    /// Only cancellation and an unknown TID are returned as errors;
    /// protocol failures are folded into the resulting state.
    pub async fn enumerate(
        &self,
        ticket: &DiscoveryTicket,
        tid: Tid,
    ) -> Result<EnumerationReport, CoreError> {
        let terminus = self
            .registry
            .get(tid)
            .ok_or(CoreError::UnknownTerminus { tid })?;

        if !terminus.supports(PldmType::PLATFORM) {
            info!(%tid, "terminus does not support platform monitoring");
            self.registry.install_catalog(tid, Catalog::default());
            self.registry.set_availability(tid, false);
            self.registry.set_state(tid, TerminusState::Unavailable);
            return Ok(EnumerationReport {
                state: TerminusState::Unavailable,
                capabilities: 0,
                complete: true,
            });
        }

        let walk = self.walk(ticket, &terminus).await;
        ticket.check()?;

        let Enumeration {
            mut descriptors,
            vendors,
            skipped,
            error,
        } = walk;
        let read = descriptors.len();
        let extra = self.resolver.extra_records(tid, &vendors, &descriptors);
        descriptors.extend(extra);

        let state = match &error {
            Some(e) if read == 0 => {
                warn!(%tid, error = %e, "enumeration failed");
                TerminusState::Unavailable
            }
            Some(e) => {
                warn!(%tid, records = read, error = %e, "enumeration incomplete, keeping partial catalog");
                TerminusState::Active
            }
            None => TerminusState::Active,
        };
        // Availability cleared while discovery was still running.
        let state = if state == TerminusState::Active && !terminus.is_available() {
            debug!(%tid, "availability cleared during discovery, settling unavailable");
            TerminusState::Unavailable
        } else {
            state
        };

        let complete = error.is_none();
        let count = descriptors.len();
        self.registry.install_catalog(tid, Catalog::new(descriptors));
        if state == TerminusState::Unavailable {
            self.registry.set_availability(tid, false);
        }
        self.registry.set_state(tid, state);
        info!(%tid, capabilities = count, skipped, %state, "enumeration finished");
        Ok(EnumerationReport {
            state,
            capabilities: count,
            complete,
        })
    }

    /// Read records until the end marker, an error, or the record bound.
    async fn walk(&self, ticket: &DiscoveryTicket, terminus: &Terminus) -> Enumeration {
        let tid = terminus.tid();
        let address = terminus.address();
        let mut out = Enumeration {
            descriptors: Vec::new(),
            vendors: Vec::new(),
            skipped: 0,
            error: None,
        };

        let mut handle = 0u32;
        let mut records = 0usize;
        loop {
            if records >= self.config.max_records {
                out.error = Some(CoreError::ResourceExhausted {
                    resource: format!(
                        "record bound of {} reached on {tid}",
                        self.config.max_records
                    ),
                });
                break;
            }

            let response = match self
                .requester
                .send_with_retry(
                    address,
                    &platform::get_pdr_request(handle),
                    self.config.discovery_attempts,
                    &self.config.retry,
                    ticket.token(),
                )
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    out.error = Some(e);
                    break;
                }
            };
            if ticket.is_cancelled() {
                break;
            }

            let decoded = platform::decode_get_pdr(response.payload).and_then(|part| {
                PdrRecord::decode(part.record).map(|record| (part.next_record_handle, record))
            });
            let (next, record) = match decoded {
                Ok(r) => r,
                Err(e) => {
                    out.error = Some(CoreError::malformed(address, &e));
                    break;
                }
            };
            records += 1;

            match &record.body {
                Pdr::Oem(oem) => {
                    if !out.vendors.contains(&oem.vendor_iana) {
                        out.vendors.push(oem.vendor_iana);
                    }
                    match self.resolver.resolve_composite(tid, oem) {
                        Some(desc) => out.descriptors.push(desc),
                        None => out.skipped += 1,
                    }
                }
                body => match CapabilityDescriptor::from_pdr(body) {
                    Some(desc) => out.descriptors.push(desc),
                    None => {
                        debug!(%tid, pdr_type = body.pdr_type(), handle = record.record_handle, "skipping record");
                        out.skipped += 1;
                    }
                },
            }

            if next == 0 {
                break;
            }
            if next == handle {
                out.error = Some(CoreError::MalformedResponse {
                    endpoint: address,
                    reason: format!("record handle {handle} points at itself"),
                });
                break;
            }
            handle = next;
        }
        out
    }
}
