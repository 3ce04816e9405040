// ── Sensor polling ──
//
// One background task per terminus. A task holds only the terminus key
// and looks the terminus up each cycle, so eviction never leaves it
// with a dangling reference. Tasks stop at suspension points: while
// gated on the availability flag, between reads, and while sleeping
// until the next cycle. A read already on the wire is allowed to
// finish; its result is dropped if a stop arrived meanwhile.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use platmc_proto::EndpointAddress;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::CoreError;
use crate::event::ManagerEvent;
use crate::model::{Catalog, FaultKind, TerminusKey, TerminusState, Tid};
use crate::oem::CapabilityResolver;
use crate::registry::TerminusRegistry;
use crate::requester::Requester;
use crate::telemetry::Telemetry;

struct PollTask {
    key: TerminusKey,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Everything a polling task needs, cloned into it at spawn time.
#[derive(Clone)]
struct PollContext {
    key: TerminusKey,
    registry: Arc<TerminusRegistry>,
    requester: Arc<Requester>,
    resolver: Arc<dyn CapabilityResolver>,
    telemetry: Arc<dyn Telemetry>,
    events: broadcast::Sender<ManagerEvent>,
    config: Arc<ManagerConfig>,
}

pub struct SensorManager {
    registry: Arc<TerminusRegistry>,
    requester: Arc<Requester>,
    resolver: Arc<dyn CapabilityResolver>,
    telemetry: Arc<dyn Telemetry>,
    events: broadcast::Sender<ManagerEvent>,
    config: Arc<ManagerConfig>,
    tasks: DashMap<Tid, PollTask>,
    /// Termini whose polling was stopped administratively. Keyed by TID,
    /// holding the key so a later holder of the TID is not affected.
    halted: DashMap<Tid, TerminusKey>,
}

impl SensorManager {
    pub(crate) fn new(
        registry: Arc<TerminusRegistry>,
        requester: Arc<Requester>,
        resolver: Arc<dyn CapabilityResolver>,
        telemetry: Arc<dyn Telemetry>,
        events: broadcast::Sender<ManagerEvent>,
        config: Arc<ManagerConfig>,
    ) -> Self {
        Self {
            registry,
            requester,
            resolver,
            telemetry,
            events,
            config,
            tasks: DashMap::new(),
            halted: DashMap::new(),
        }
    }

    /// Spawn the polling task for `tid`. Returns `false` for an unknown
    /// TID or when a live task already polls this terminus.
    pub fn start_polling(&self, tid: Tid) -> bool {
        let Some(terminus) = self.registry.get(tid) else {
            debug!(%tid, "start_polling on unknown terminus ignored");
            return false;
        };
        let key = terminus.key();
        self.halted.remove(&tid);

        match self.tasks.entry(tid) {
            Entry::Occupied(mut slot) => {
                let task = slot.get();
                if task.key == key && !task.handle.is_finished() {
                    debug!(%tid, "already polling");
                    return false;
                }
                // Left over from an earlier holder of this TID.
                let stale = slot.insert(self.spawn(key));
                stale.cancel.cancel();
            }
            Entry::Vacant(slot) => {
                slot.insert(self.spawn(key));
            }
        }
        info!(%tid, "polling started");
        true
    }

    /// Stop the polling task for `tid` and wait for it to exit. After
    /// this returns no further reading is published for `tid`, and
    /// re-enabling availability does not restart polling until
    /// [`start_polling`](Self::start_polling) is called.
    pub async fn stop_polling(&self, tid: Tid) -> bool {
        if let Some(terminus) = self.registry.get(tid) {
            self.halted.insert(tid, terminus.key());
        }
        self.join(tid).await
    }

    /// Stop polling ahead of eviction.
    pub(crate) async fn detach(&self, tid: Tid) -> bool {
        self.halted.remove(&tid);
        self.join(tid).await
    }

    /// Start polling a terminus that just became available, unless it
    /// already has a task, is not `Active`, or was stopped explicitly.
    pub(crate) fn resume(&self, tid: Tid) -> bool {
        let Some(terminus) = self.registry.get(tid) else {
            return false;
        };
        if terminus.state() != TerminusState::Active || self.is_polling(tid) {
            return false;
        }
        if self
            .halted
            .get(&tid)
            .is_some_and(|key| *key == terminus.key())
        {
            debug!(%tid, "polling stopped explicitly, not resuming");
            return false;
        }
        self.start_polling(tid)
    }

    async fn join(&self, tid: Tid) -> bool {
        let Some((_, task)) = self.tasks.remove(&tid) else {
            return false;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            if e.is_panic() {
                warn!(%tid, "polling task panicked");
            }
        }
        info!(%tid, "polling stopped");
        true
    }

    pub async fn stop_all(&self) {
        let tids: Vec<Tid> = self.tasks.iter().map(|r| *r.key()).collect();
        for tid in tids {
            self.stop_polling(tid).await;
        }
    }

    pub fn is_polling(&self, tid: Tid) -> bool {
        self.tasks
            .get(&tid)
            .is_some_and(|task| !task.handle.is_finished())
    }

    fn spawn(&self, key: TerminusKey) -> PollTask {
        let cancel = CancellationToken::new();
        let ctx = PollContext {
            key,
            registry: Arc::clone(&self.registry),
            requester: Arc::clone(&self.requester),
            resolver: Arc::clone(&self.resolver),
            telemetry: Arc::clone(&self.telemetry),
            events: self.events.clone(),
            config: Arc::clone(&self.config),
        };
        let handle = tokio::spawn(poll_loop(ctx, cancel.clone()));
        PollTask {
            key,
            cancel,
            handle,
        }
    }
}

// ── Polling loop ─────────────────────────────────────────────────────

enum Cycle {
    Completed,
    /// Availability cleared part-way through.
    Suspended,
    /// Failure threshold crossed; availability has been cleared.
    Faulted,
    Stopped,
}

impl PollContext {
    fn interval(&self) -> Duration {
        self.registry
            .get_key(self.key)
            .and_then(|t| t.poll_interval())
            .unwrap_or(self.config.poll_interval)
    }

    /// Sleep until `from + interval`. `false` when stopped meanwhile.
    async fn sleep_from(&self, from: Instant, cancel: &CancellationToken) -> bool {
        self.sleep_until(from + self.interval(), cancel).await
    }

    async fn sleep_until(&self, deadline: Instant, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            () = tokio::time::sleep_until(deadline) => true,
        }
    }

    /// First cycle boundary strictly after now on the schedule that
    /// started at `anchor`. Without an anchor, one interval from now.
    fn next_boundary(&self, anchor: Option<Instant>) -> Instant {
        let now = Instant::now();
        let interval = self.interval();
        let Some(anchor) = anchor else {
            return now + interval;
        };
        let period = interval.as_nanos().max(1);
        let into_cycle = now.saturating_duration_since(anchor).as_nanos() % period;
        let wait = u64::try_from(period - into_cycle).unwrap_or(u64::MAX);
        now + Duration::from_nanos(wait)
    }

    /// Park until the availability flag is set again. A fault-triggered
    /// suspension ends by itself once the configured cooldown elapses.
    async fn wait_available(
        &self,
        available: &mut watch::Receiver<bool>,
        cancel: &CancellationToken,
        faulted: bool,
    ) -> bool {
        let cooldown = self.config.fault_cooldown.filter(|_| faulted);
        let cooled = async {
            match cooldown {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            changed = available.wait_for(|a| *a) => changed.is_ok(),
            () = cooled => {
                let tid = self.key.tid;
                if self.registry.get_key(self.key).is_none() {
                    return false;
                }
                info!(%tid, "fault cooldown elapsed, re-enabling polling");
                if self.registry.set_availability(tid, true) {
                    let _ = self.events.send(ManagerEvent::AvailabilityChanged {
                        tid,
                        available: true,
                    });
                }
                true
            }
        }
    }

    fn trip(&self, consecutive: u32) {
        let tid = self.key.tid;
        warn!(%tid, consecutive, "failure threshold crossed, marking terminus unavailable");
        if self.registry.set_availability(tid, false) {
            let _ = self.events.send(ManagerEvent::AvailabilityChanged {
                tid,
                available: false,
            });
        }
        let fault = FaultKind::PollingFailures { consecutive };
        self.telemetry.publish_fault(tid, fault);
        let _ = self.events.send(ManagerEvent::Fault { tid, fault });
    }

    async fn run_cycle(
        &self,
        address: EndpointAddress,
        catalog: &Catalog,
        available: &watch::Receiver<bool>,
        cancel: &CancellationToken,
        failures: &mut u32,
    ) -> Cycle {
        let tid = self.key.tid;
        for desc in catalog {
            if cancel.is_cancelled() {
                return Cycle::Stopped;
            }
            if !*available.borrow() {
                return Cycle::Suspended;
            }

            let result = self.requester.send(address, desc.read_request()).await;
            if cancel.is_cancelled() {
                return Cycle::Stopped;
            }

            let readings = result.and_then(|response| {
                desc.decode_response(response.payload)
                    .map_err(|e| CoreError::malformed(address, &e))
            });
            match readings {
                Ok(readings) => {
                    *failures = 0;
                    for (id, reading) in readings {
                        let reading = self.resolver.decode_reading(&id, reading);
                        self.telemetry.publish_reading(tid, id, &reading);
                    }
                }
                Err(e) => {
                    *failures += 1;
                    debug!(
                        %tid,
                        id = desc.id,
                        kind = %desc.kind,
                        failures = *failures,
                        error = %e,
                        "read failed"
                    );
                    if *failures >= self.config.failure_threshold.max(1) {
                        self.trip(*failures);
                        *failures = 0;
                        return Cycle::Faulted;
                    }
                }
            }
        }
        Cycle::Completed
    }
}

async fn poll_loop(ctx: PollContext, cancel: CancellationToken) {
    let tid = ctx.key.tid;
    let Some(mut available) = ctx
        .registry
        .get_key(ctx.key)
        .map(|t| t.subscribe_availability())
    else {
        return;
    };
    let mut failures = 0u32;
    let mut faulted = false;
    let mut last_started: Option<Instant> = None;
    debug!(%tid, "poll loop running");

    loop {
        if !*available.borrow_and_update() {
            debug!(%tid, "polling suspended");
            if !ctx.wait_available(&mut available, &cancel, faulted).await {
                break;
            }
            faulted = false;
            failures = 0;
            debug!(%tid, "polling resumed");
            // Pick the schedule back up at its next boundary; skipped
            // cycles are not made up.
            if !ctx.sleep_until(ctx.next_boundary(last_started), &cancel).await {
                break;
            }
            continue;
        }

        let Some(terminus) = ctx.registry.get_key(ctx.key) else {
            debug!(%tid, "terminus gone, poll loop exiting");
            break;
        };
        let address = terminus.address();
        let catalog = terminus.catalog().unwrap_or_default();
        drop(terminus);

        let started = Instant::now();
        last_started = Some(started);
        match ctx
            .run_cycle(address, &catalog, &available, &cancel, &mut failures)
            .await
        {
            Cycle::Stopped => break,
            Cycle::Suspended => continue,
            Cycle::Faulted => {
                faulted = true;
                continue;
            }
            Cycle::Completed => {}
        }

        if !ctx.sleep_from(started, &cancel).await {
            break;
        }
    }
    debug!(%tid, "poll loop exited");
}
