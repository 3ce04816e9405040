// ── Manager ──
//
// Entry point for the hosting process. Receives attach/detach batches
// from the transport, drives discovery → enumeration → polling for each
// endpoint, and exposes per-terminus control. Attach batches run one at
// a time with their hooks; detaches are never held up behind them.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use platmc_proto::{EndpointDescriptor, Transport};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::CoreError;
use crate::event::ManagerEvent;
use crate::model::{FaultKind, Terminus, TerminusState, Tid};
use crate::oem::{CapabilityResolver, StandardResolver};
use crate::platform_manager::PlatformManager;
use crate::registry::TerminusRegistry;
use crate::requester::Requester;
use crate::sensor_manager::SensorManager;
use crate::telemetry::{Telemetry, TracingTelemetry};
use crate::terminus_manager::{DiscoveryTicket, TerminusManager};

/// Error type returned by discovery hooks.
pub type HookError = Box<dyn StdError + Send + Sync>;

/// Extension points around each attach batch.
///
/// `before_discovery` runs once before the first probe of a batch,
/// `after_discovery` once every member has settled. A failing hook is
/// logged; the batch proceeds regardless.
#[async_trait]
pub trait DiscoveryHooks: Send + Sync {
    async fn before_discovery(&self, _batch: &[EndpointDescriptor]) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_discovery(&self, _discovered: &[Tid]) -> Result<(), HookError> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl DiscoveryHooks for NoHooks {}

// ── Builder ──────────────────────────────────────────────────────────

/// Assembles a [`Manager`]. Only the transport is required.
pub struct ManagerBuilder {
    transport: Arc<dyn Transport>,
    config: ManagerConfig,
    resolver: Arc<dyn CapabilityResolver>,
    telemetry: Arc<dyn Telemetry>,
    hooks: Arc<dyn DiscoveryHooks>,
}

impl ManagerBuilder {
    #[must_use]
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn CapabilityResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn DiscoveryHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> Manager {
        let config = Arc::new(self.config);
        let registry = Arc::new(TerminusRegistry::new());
        let requester = Arc::new(Requester::new(self.transport, config.request_timeout));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let terminus_manager = TerminusManager::new(
            Arc::clone(&registry),
            Arc::clone(&requester),
            Arc::clone(&config),
        );
        let platform_manager = PlatformManager::new(
            Arc::clone(&registry),
            Arc::clone(&requester),
            Arc::clone(&self.resolver),
            Arc::clone(&config),
        );
        let sensor_manager = SensorManager::new(
            Arc::clone(&registry),
            requester,
            self.resolver,
            Arc::clone(&self.telemetry),
            events.clone(),
            Arc::clone(&config),
        );

        Manager {
            inner: Arc::new(ManagerInner {
                config,
                registry,
                terminus_manager,
                platform_manager,
                sensor_manager,
                telemetry: self.telemetry,
                hooks: self.hooks,
                events,
                batch: Mutex::new(()),
            }),
        }
    }
}

// ── Manager ──────────────────────────────────────────────────────────

/// Cheaply cloneable handle; clones share all state.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: Arc<ManagerConfig>,
    registry: Arc<TerminusRegistry>,
    terminus_manager: TerminusManager,
    platform_manager: PlatformManager,
    sensor_manager: SensorManager,
    telemetry: Arc<dyn Telemetry>,
    hooks: Arc<dyn DiscoveryHooks>,
    events: broadcast::Sender<ManagerEvent>,
    /// Held for the whole of an attach batch.
    batch: Mutex<()>,
}

impl Manager {
    pub fn builder(transport: Arc<dyn Transport>) -> ManagerBuilder {
        ManagerBuilder {
            transport,
            config: ManagerConfig::default(),
            resolver: Arc::new(StandardResolver),
            telemetry: Arc::new(TracingTelemetry),
            hooks: Arc::new(NoHooks),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    // ── Transport notifications ──────────────────────────────────────

    /// Bring up every endpoint in `batch`. Members are probed
    /// concurrently; one member's failure does not affect the others.
    /// Returns once every member has settled and the hooks have run.
    pub async fn on_endpoints_added(&self, batch: Vec<EndpointDescriptor>) -> Vec<Tid> {
        let _batch = self.inner.batch.lock().await;
        debug!(endpoints = batch.len(), "attach batch");

        if let Err(e) = self.inner.hooks.before_discovery(&batch).await {
            warn!(error = %e, "pre-discovery hook failed");
        }

        let results = join_all(batch.iter().map(|endpoint| self.bring_up(endpoint))).await;
        let discovered: Vec<Tid> = results.into_iter().flatten().collect();

        if let Err(e) = self.inner.hooks.after_discovery(&discovered).await {
            warn!(error = %e, "post-discovery hook failed");
        }
        info!(
            requested = batch.len(),
            discovered = discovered.len(),
            "attach batch settled"
        );
        discovered
    }

    /// Tear down every endpoint in `batch`: cancel in-flight probes,
    /// stop polling, then evict. Unknown endpoints are ignored.
    pub async fn on_endpoints_removed(&self, batch: Vec<EndpointDescriptor>) {
        debug!(endpoints = batch.len(), "detach batch");
        join_all(batch.iter().map(|endpoint| self.tear_down(endpoint))).await;
    }

    async fn bring_up(&self, endpoint: &EndpointDescriptor) -> Option<Tid> {
        let ticket = self.inner.terminus_manager.begin(endpoint)?;
        let result = self.pipeline(&ticket).await;
        self.inner.terminus_manager.finish(ticket);

        match result {
            Ok(tid) => Some(tid),
            Err(CoreError::Cancelled { endpoint }) => {
                debug!(%endpoint, "bring-up abandoned after detach");
                None
            }
            Err(e) => {
                warn!(endpoint = %endpoint.address, error = %e, "discovery failed");
                self.emit(ManagerEvent::DiscoveryFailed {
                    endpoint: endpoint.address,
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    async fn pipeline(&self, ticket: &DiscoveryTicket) -> Result<Tid, CoreError> {
        let inner = &self.inner;
        let terminus = inner.terminus_manager.discover(ticket).await?;
        let tid = terminus.tid();
        self.emit(ManagerEvent::Discovered {
            tid,
            endpoint: ticket.address(),
        });

        let report = match inner.platform_manager.enumerate(ticket, tid).await {
            Ok(report) => report,
            Err(e) => {
                // Detach normally evicts; make sure nothing is left if it
                // raced the registry insert.
                inner.terminus_manager.retire_instance(&terminus);
                return Err(e);
            }
        };
        self.emit(ManagerEvent::Enumerated {
            tid,
            state: report.state,
            capabilities: report.capabilities,
        });
        if report.state == TerminusState::Unavailable && !report.complete {
            let fault = FaultKind::EnumerationFailed;
            inner.telemetry.publish_fault(tid, fault);
            self.emit(ManagerEvent::Fault { tid, fault });
        }

        ticket.check()?;
        if report.state == TerminusState::Active {
            inner.sensor_manager.start_polling(tid);
        }
        Ok(tid)
    }

    async fn tear_down(&self, endpoint: &EndpointDescriptor) {
        let address = endpoint.address;
        let inner = &self.inner;
        inner.terminus_manager.cancel(address);

        let Some(tid) = inner.registry.tid_for(address) else {
            debug!(endpoint = %address, "detach for unknown endpoint");
            return;
        };
        inner.sensor_manager.detach(tid).await;
        if inner.terminus_manager.retire(tid).is_some() {
            self.emit(ManagerEvent::Removed {
                tid,
                endpoint: address,
            });
        }
    }

    // ── Administrative control ───────────────────────────────────────
    //
    // Idempotent; unknown TIDs are silently ignored.

    pub fn start_polling(&self, tid: Tid) {
        self.inner.sensor_manager.start_polling(tid);
    }

    /// Returns once the task has exited; no reading for `tid` is
    /// published afterwards.
    pub async fn stop_polling(&self, tid: Tid) {
        self.inner.sensor_manager.stop_polling(tid).await;
    }

    /// Gate polling of `tid`. Setting it makes an `Active` terminus
    /// without a polling task start one, unless polling was stopped
    /// with [`stop_polling`](Self::stop_polling).
    pub fn set_availability(&self, tid: Tid, available: bool) {
        if self.inner.registry.set_availability(tid, available) {
            info!(%tid, available, "availability changed");
            self.emit(ManagerEvent::AvailabilityChanged { tid, available });
        }
        if available {
            self.inner.sensor_manager.resume(tid);
        }
    }

    /// Override the polling cadence of one terminus; `None` restores
    /// the default. Takes effect from the next cycle.
    pub fn set_poll_interval(&self, tid: Tid, interval: Option<Duration>) {
        self.inner.registry.set_poll_interval(tid, interval);
    }

    /// Stop every polling task. Termini stay registered.
    pub async fn shutdown(&self) {
        self.inner.sensor_manager.stop_all().await;
        info!("manager shut down");
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    pub fn terminus(&self, tid: Tid) -> Option<Arc<Terminus>> {
        self.inner.registry.get(tid)
    }

    pub fn termini(&self) -> Arc<Vec<Arc<Terminus>>> {
        self.inner.registry.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<Terminus>>>> {
        self.inner.registry.subscribe()
    }

    pub fn registry(&self) -> &TerminusRegistry {
        &self.inner.registry
    }

    pub fn is_polling(&self, tid: Tid) -> bool {
        self.inner.sensor_manager.is_polling(tid)
    }

    fn emit(&self, event: ManagerEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}
