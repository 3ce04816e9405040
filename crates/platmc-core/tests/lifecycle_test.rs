#![allow(clippy::unwrap_used)]
// Attach/detach lifecycle driven through the public manager API against
// the loopback bus. Time is paused, so timeouts and retries resolve
// instantly and deterministically.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast::{self, error::TryRecvError};

use platmc_core::{
    ChannelTelemetry, CompositeId, DiscoveryHooks, HookError, Manager, ManagerEvent, Reading,
    TelemetryEvent, TerminusState, Tid,
};
use platmc_proto::commands::base;
use platmc_proto::loopback::{LoopbackBus, SimTerminus};
use platmc_proto::pdr::EntityRef;
use platmc_proto::{EndpointAddress, EndpointDescriptor, PldmType};

fn entity(entity_type: u16, instance: u16) -> EntityRef {
    EntityRef {
        entity_type,
        entity_instance: instance,
        container_id: 0,
    }
}

fn setup() -> (Arc<LoopbackBus>, Arc<ChannelTelemetry>, Manager) {
    let bus = Arc::new(LoopbackBus::new());
    let telemetry = Arc::new(ChannelTelemetry::new(4096));
    let manager = Manager::builder(bus.clone())
        .telemetry(telemetry.clone())
        .build();
    (bus, telemetry, manager)
}

fn drain(rx: &mut broadcast::Receiver<TelemetryEvent>) {
    loop {
        match rx.try_recv() {
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
}

async fn next_event(
    rx: &mut broadcast::Receiver<ManagerEvent>,
    matches: impl Fn(&ManagerEvent) -> bool,
) -> ManagerEvent {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = rx.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_attach_poll_detach_end_to_end() {
    let e1 = EndpointAddress::new(1, 8);
    let (bus, telemetry, manager) = setup();
    bus.attach(
        SimTerminus::new(e1)
            .with_tid(5)
            .with_numeric_sensor(1, entity(64, 0), 42)
            .with_state_sensor(2, entity(120, 0), &[(1, 2)])
            .with_numeric_effecter(3, entity(66, 0), 7),
    );
    let mut readings = telemetry.subscribe();

    let tids = manager.on_endpoints_added(vec![e1.into()]).await;
    let tid = Tid::new(5).unwrap();
    assert_eq!(tids, vec![tid]);

    let terminus = manager.terminus(tid).unwrap();
    assert_eq!(terminus.state(), TerminusState::Active);
    assert_eq!(terminus.catalog().unwrap().len(), 3);
    assert_eq!(bus.tid_of(e1), Some(5));

    let mut seen = Vec::new();
    for _ in 0..3 {
        match readings.recv().await.unwrap() {
            TelemetryEvent::Reading {
                tid: from,
                id,
                reading,
                ..
            } => {
                assert_eq!(from, tid);
                seen.push((id, reading));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    seen.sort_by_key(|(id, _)| *id);
    assert_eq!(
        seen,
        vec![
            (
                CompositeId::new(64, 0, 0),
                Reading::Numeric {
                    value: 42.0,
                    unit: 2
                }
            ),
            (
                CompositeId::new(66, 0, 0),
                Reading::Numeric {
                    value: 7.0,
                    unit: 2
                }
            ),
            (
                CompositeId::new(120, 0, 1),
                Reading::State {
                    state: 2,
                    label: None
                }
            ),
        ]
    );

    manager.on_endpoints_removed(vec![e1.into()]).await;
    assert!(manager.terminus(tid).is_none());
    assert_eq!(terminus.state(), TerminusState::Removed);
    assert!(!manager.is_polling(tid));

    drain(&mut readings);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(matches!(readings.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_endpoint_does_not_block_batch() {
    let dead = EndpointAddress::new(1, 20);
    let alive = EndpointAddress::new(1, 21);
    let (bus, _telemetry, manager) = setup();
    bus.attach(SimTerminus::new(dead).unresponsive());
    bus.attach(SimTerminus::new(alive).with_numeric_sensor(1, entity(64, 0), 1));
    let mut events = manager.events();

    let tids = manager
        .on_endpoints_added(vec![dead.into(), alive.into()])
        .await;

    assert_eq!(tids.len(), 1);
    assert_eq!(manager.terminus(tids[0]).unwrap().address(), alive);
    assert!(manager.registry().tid_for(dead).is_none());

    let failed = next_event(&mut events, |e| {
        matches!(e, ManagerEvent::DiscoveryFailed { .. })
    })
    .await;
    assert_eq!(
        failed,
        ManagerEvent::DiscoveryFailed {
            endpoint: dead,
            reason: "Request to 1:20 timed out after 500ms".into(),
        }
    );
    let get_tid_attempts = bus
        .requests(dead)
        .iter()
        .filter(|r| **r == (PldmType::BASE, base::GET_TID))
        .count();
    assert_eq!(get_tid_attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_detach_during_probe_leaves_no_entry() {
    let ep = EndpointAddress::new(1, 30);
    let (bus, _telemetry, manager) = setup();
    bus.attach(
        SimTerminus::new(ep)
            .with_delay(Duration::from_millis(300))
            .with_numeric_sensor(1, entity(64, 0), 1),
    );

    let attach = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.on_endpoints_added(vec![ep.into()]).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.on_endpoints_removed(vec![ep.into()]).await;

    assert!(attach.await.unwrap().is_empty());
    assert!(manager.registry().is_empty());
    // the probe stopped after GetTID; no TID was ever assigned
    assert_eq!(bus.tid_of(ep), Some(base::TID_UNASSIGNED));
}

#[tokio::test(start_paused = true)]
async fn test_detach_during_enumeration_evicts() {
    let ep = EndpointAddress::new(1, 31);
    let (bus, _telemetry, manager) = setup();
    let mut sim = SimTerminus::new(ep).with_delay(Duration::from_millis(100));
    for id in 0..8 {
        sim = sim.with_numeric_sensor(id, entity(64, id), 1);
    }
    bus.attach(sim);

    let attach = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.on_endpoints_added(vec![ep.into()]).await })
    };
    // GetTID, SetTID, GetPLDMTypes and a few records in
    tokio::time::sleep(Duration::from_millis(550)).await;
    assert_eq!(manager.registry().len(), 1);
    manager.on_endpoints_removed(vec![ep.into()]).await;

    assert!(attach.await.unwrap().is_empty());
    assert!(manager.registry().is_empty());
    assert!(manager.termini().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_attach_is_ignored() {
    let ep = EndpointAddress::new(1, 40);
    let (bus, _telemetry, manager) = setup();
    bus.attach(SimTerminus::new(ep).with_numeric_sensor(1, entity(64, 0), 1));

    let first = manager.on_endpoints_added(vec![ep.into(), ep.into()]).await;
    assert_eq!(first.len(), 1);

    let again = manager.on_endpoints_added(vec![ep.into()]).await;
    assert!(again.is_empty());
    assert_eq!(manager.registry().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reattach_after_detach_is_a_fresh_discovery() {
    let ep = EndpointAddress::new(1, 41);
    let (bus, _telemetry, manager) = setup();
    bus.attach(SimTerminus::new(ep).with_numeric_sensor(1, entity(64, 0), 1));

    let tid = manager.on_endpoints_added(vec![ep.into()]).await[0];
    let old = manager.terminus(tid).unwrap();
    manager.on_endpoints_removed(vec![ep.into()]).await;

    let tid_again = manager.on_endpoints_added(vec![ep.into()]).await[0];
    let new = manager.terminus(tid_again).unwrap();
    assert_ne!(old.key(), new.key());
    assert_eq!(old.state(), TerminusState::Removed);
    assert_eq!(new.state(), TerminusState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_detach_of_unknown_endpoint_is_noop() {
    let (_bus, _telemetry, manager) = setup();
    let mut events = manager.events();
    manager
        .on_endpoints_removed(vec![EndpointAddress::new(9, 9).into()])
        .await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_terminus_without_platform_support_stays_registered() {
    let ep = EndpointAddress::new(1, 50);
    let (bus, _telemetry, manager) = setup();
    bus.attach(SimTerminus::new(ep).without_platform());

    let tid = manager.on_endpoints_added(vec![ep.into()]).await[0];
    let terminus = manager.terminus(tid).unwrap();
    assert_eq!(terminus.state(), TerminusState::Unavailable);
    assert!(terminus.catalog().unwrap().is_empty());
    assert!(!manager.is_polling(tid));
}

// ── Hooks ───────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    log: Mutex<Vec<String>>,
}

#[async_trait]
impl DiscoveryHooks for Recorder {
    async fn before_discovery(&self, batch: &[EndpointDescriptor]) -> Result<(), HookError> {
        self.log.lock().unwrap().push(format!("before:{}", batch.len()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    async fn after_discovery(&self, discovered: &[Tid]) -> Result<(), HookError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("after:{}", discovered.len()));
        Err("snapshot store offline".into())
    }
}

#[tokio::test(start_paused = true)]
async fn test_hooks_bracket_each_batch() {
    let bus = Arc::new(LoopbackBus::new());
    let hooks = Arc::new(Recorder::default());
    let manager = Manager::builder(bus.clone()).hooks(hooks.clone()).build();

    let a = EndpointAddress::new(1, 60);
    let b = EndpointAddress::new(1, 61);
    let c = EndpointAddress::new(1, 62);
    for ep in [a, b, c] {
        bus.attach(SimTerminus::new(ep).with_delay(Duration::from_millis(20)));
    }

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.on_endpoints_added(vec![a.into(), b.into()]).await })
    };
    let second = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.on_endpoints_added(vec![c.into()]).await })
    };
    first.await.unwrap();
    second.await.unwrap();

    // batches never interleave, and a failing hook does not stop the next one
    let log = hooks.log.lock().unwrap().clone();
    assert_eq!(log.len(), 4);
    for pair in log.chunks(2) {
        assert!(pair[0].starts_with("before:"));
        assert!(pair[1].starts_with("after:"));
        assert_eq!(&pair[0][7..], &pair[1][6..]);
    }
    assert_eq!(manager.registry().len(), 3);
}

// ── Randomised interleaving ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_tids_stay_unique_under_random_interleaving() {
    let mut rng = StdRng::seed_from_u64(0x504c_444d);
    let (bus, _telemetry, manager) = setup();

    let endpoints: Vec<EndpointAddress> = (0..40u8)
        .map(|i| EndpointAddress::new(2, 10 + i))
        .collect();
    for &ep in &endpoints {
        bus.attach(
            SimTerminus::new(ep)
                .with_tid(rng.gen_range(0..=8))
                .with_delay(Duration::from_millis(rng.gen_range(0..200)))
                .with_numeric_sensor(1, entity(64, 0), 1),
        );
    }

    let mut batches = Vec::new();
    for chunk in endpoints.chunks(10) {
        let manager = manager.clone();
        let batch: Vec<EndpointDescriptor> = chunk.iter().map(|&ep| ep.into()).collect();
        batches.push(tokio::spawn(
            async move { manager.on_endpoints_added(batch).await },
        ));
    }

    let mut removed = HashSet::new();
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(rng.gen_range(0..400))).await;
        let ep = endpoints[rng.gen_range(0..endpoints.len())];
        bus.detach(ep);
        manager.on_endpoints_removed(vec![ep.into()]).await;
        removed.insert(ep);
    }
    for batch in batches {
        batch.await.unwrap();
    }

    let live = manager.termini();
    let tids: HashSet<Tid> = live.iter().map(|t| t.tid()).collect();
    assert_eq!(tids.len(), live.len());
    assert_eq!(live.len(), endpoints.len() - removed.len());
    for terminus in live.iter() {
        assert!(!removed.contains(&terminus.address()));
        assert_eq!(bus.tid_of(terminus.address()), Some(terminus.tid().get()));
    }
}
