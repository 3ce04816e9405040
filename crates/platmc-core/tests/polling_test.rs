#![allow(clippy::unwrap_used)]
// Polling scheduler behaviour: availability gating, stop semantics,
// failure threshold and vendor decoding, observed through the loopback
// bus request log and the telemetry channel.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::broadcast::{self, error::TryRecvError};

use platmc_core::oem::ibm::{BOOT_STATE, ENTITY_FIRMWARE_UPDATE, FIRMWARE_UPDATE_STATE, IBM_IANA};
use platmc_core::{
    ChannelTelemetry, CompositeId, FaultKind, IbmResolver, Manager, ManagerConfig, ManagerEvent,
    Reading, TelemetryEvent, TerminusState, Tid,
};
use platmc_proto::loopback::{LoopbackBus, SimTerminus};
use platmc_proto::pdr::EntityRef;
use platmc_proto::EndpointAddress;

const EP: EndpointAddress = EndpointAddress::new(3, 8);

const SENSOR_ENTITY: EntityRef = EntityRef {
    entity_type: 64,
    entity_instance: 0,
    container_id: 0,
};

struct Rig {
    bus: Arc<LoopbackBus>,
    telemetry: Arc<ChannelTelemetry>,
    manager: Manager,
}

impl Rig {
    fn new(config: ManagerConfig) -> Self {
        let bus = Arc::new(LoopbackBus::new());
        let telemetry = Arc::new(ChannelTelemetry::new(4096));
        let manager = Manager::builder(bus.clone())
            .config(config)
            .telemetry(telemetry.clone())
            .build();
        Self {
            bus,
            telemetry,
            manager,
        }
    }

    async fn attach(&self, sim: SimTerminus) -> Tid {
        let address = sim.address();
        self.bus.attach(sim);
        self.manager.on_endpoints_added(vec![address.into()]).await[0]
    }
}

fn one_sensor() -> SimTerminus {
    SimTerminus::new(EP).with_numeric_sensor(1, SENSOR_ENTITY, 30)
}

fn drain(rx: &mut broadcast::Receiver<TelemetryEvent>) -> usize {
    let mut n = 0;
    loop {
        match rx.try_recv() {
            Ok(_) => n += 1,
            Err(TryRecvError::Lagged(_)) => {}
            Err(_) => return n,
        }
    }
}

async fn next_event(
    rx: &mut broadcast::Receiver<ManagerEvent>,
    matches: impl Fn(&ManagerEvent) -> bool,
) -> ManagerEvent {
    tokio::time::timeout(Duration::from_secs(120), async {
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
async fn test_clearing_availability_pauses_requests() {
    let rig = Rig::new(ManagerConfig::default());
    let tid = rig.attach(one_sensor()).await;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    let before = rig.bus.read_count(EP);
    assert!(before >= 2, "expected a few cycles, got {before}");

    rig.manager.set_availability(tid, false);
    assert_eq!(
        rig.manager.terminus(tid).unwrap().state(),
        TerminusState::Unavailable
    );
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(rig.bus.read_count(EP), before);
    // catalog survives the pause
    assert_eq!(rig.manager.terminus(tid).unwrap().catalog().unwrap().len(), 1);

    // Cycles ran at 0s, 1s and 2s; resuming at 7.5s picks the schedule
    // up at 8s rather than polling at once or a full interval later.
    rig.manager.set_availability(tid, true);
    assert_eq!(
        rig.manager.terminus(tid).unwrap().state(),
        TerminusState::Active
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.bus.read_count(EP), before, "resumed retroactively");
    tokio::time::sleep(rig.manager.config().poll_interval - Duration::from_millis(100)).await;
    assert!(
        rig.bus.read_count(EP) > before,
        "no read within one poll interval of resuming"
    );
}

#[tokio::test(start_paused = true)]
async fn test_re_enabling_unavailable_terminus_starts_polling() {
    let rig = Rig::new(ManagerConfig::default());
    let tid = rig
        .attach(SimTerminus::new(EP).with_corrupt_record())
        .await;
    assert!(!rig.manager.is_polling(tid));

    rig.manager.set_availability(tid, true);
    let terminus = rig.manager.terminus(tid).unwrap();
    assert_eq!(terminus.state(), TerminusState::Active);
    assert!(terminus.is_available());
    assert!(rig.manager.is_polling(tid));

    rig.manager.set_availability(tid, false);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        rig.manager.terminus(tid).unwrap().state(),
        TerminusState::Unavailable
    );
    assert!(rig.manager.is_polling(tid), "paused, not stopped");
}

#[tokio::test(start_paused = true)]
async fn test_re_enabling_does_not_undo_stop_polling() {
    let rig = Rig::new(ManagerConfig::default());
    let tid = rig.attach(one_sensor()).await;

    rig.manager.stop_polling(tid).await;
    rig.manager.set_availability(tid, false);
    rig.manager.set_availability(tid, true);
    assert!(!rig.manager.is_polling(tid));

    let before = rig.bus.read_count(EP);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(rig.bus.read_count(EP), before);

    rig.manager.start_polling(tid);
    assert!(rig.manager.is_polling(tid));
}

#[tokio::test(start_paused = true)]
async fn test_availability_cleared_during_discovery_settles_unavailable() {
    let rig = Rig::new(ManagerConfig::default());
    rig.bus
        .attach(one_sensor().with_delay(Duration::from_millis(100)));
    let manager = rig.manager.clone();
    let attach = tokio::spawn(async move { manager.on_endpoints_added(vec![EP.into()]).await });

    let tid = loop {
        if let Some(t) = rig.manager.termini().first() {
            assert_eq!(t.state(), TerminusState::Discovering);
            break t.tid();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    rig.manager.set_availability(tid, false);
    assert_eq!(attach.await.unwrap(), vec![tid]);

    let terminus = rig.manager.terminus(tid).unwrap();
    assert_eq!(terminus.state(), TerminusState::Unavailable);
    assert!(!terminus.is_available());
    assert!(!rig.manager.is_polling(tid));
    assert_eq!(terminus.catalog().unwrap().len(), 1);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(rig.bus.read_count(EP), 0);

    rig.manager.set_availability(tid, true);
    assert_eq!(
        rig.manager.terminus(tid).unwrap().state(),
        TerminusState::Active
    );
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(rig.bus.read_count(EP) > 0);
}

#[tokio::test(start_paused = true)]
async fn test_availability_calls_are_idempotent() {
    let rig = Rig::new(ManagerConfig::default());
    let tid = rig.attach(one_sensor()).await;
    let mut events = rig.manager.events();

    rig.manager.set_availability(tid, false);
    rig.manager.set_availability(tid, false);
    rig.manager.set_availability(tid, true);
    rig.manager.set_availability(tid, true);

    let mut changes = Vec::new();
    while let Ok(event) = events.try_recv() {
        changes.push(event);
    }
    assert_eq!(
        changes,
        vec![
            ManagerEvent::AvailabilityChanged {
                tid,
                available: false
            },
            ManagerEvent::AvailabilityChanged {
                tid,
                available: true
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_polling_silences_terminus() {
    let rig = Rig::new(ManagerConfig::default());
    let mut readings = rig.telemetry.subscribe();
    let tid = rig.attach(one_sensor()).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    rig.manager.stop_polling(tid).await;
    assert!(!rig.manager.is_polling(tid));
    drain(&mut readings);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(drain(&mut readings), 0);
    // stopping is not removal
    assert_eq!(
        rig.manager.terminus(tid).unwrap().state(),
        TerminusState::Active
    );

    rig.manager.start_polling(tid);
    rig.manager.start_polling(tid);
    assert!(rig.manager.is_polling(tid));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(drain(&mut readings), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_read() {
    let rig = Rig::new(ManagerConfig::default());
    let mut readings = rig.telemetry.subscribe();
    let tid = rig
        .attach(one_sensor().with_delay(Duration::from_millis(200)))
        .await;

    // 1.1s after attach the second cycle's read is on the wire
    tokio::time::sleep(Duration::from_millis(1100)).await;
    drain(&mut readings);
    rig.manager.stop_polling(tid).await;

    // the read finished but its result was dropped
    assert_eq!(drain(&mut readings), 0);
}

#[tokio::test(start_paused = true)]
async fn test_control_calls_on_unknown_tid_are_noops() {
    let rig = Rig::new(ManagerConfig::default());
    let mut events = rig.manager.events();
    let ghost = Tid::new(77).unwrap();

    rig.manager.start_polling(ghost);
    rig.manager.set_availability(ghost, false);
    rig.manager.set_poll_interval(ghost, Some(Duration::from_secs(3)));
    rig.manager.stop_polling(ghost).await;

    assert!(!rig.manager.is_polling(ghost));
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_failure_threshold_raises_fault_without_removal() {
    let rig = Rig::new(ManagerConfig {
        failure_threshold: 3,
        ..ManagerConfig::default()
    });
    let mut readings = rig.telemetry.subscribe();
    let mut events = rig.manager.events();
    let tid = rig.attach(one_sensor()).await;
    rig.bus.set_reads_failing(EP, true);

    let fault = next_event(&mut events, |e| matches!(e, ManagerEvent::Fault { .. })).await;
    assert_eq!(
        fault,
        ManagerEvent::Fault {
            tid,
            fault: FaultKind::PollingFailures { consecutive: 3 }
        }
    );
    let terminus = rig.manager.terminus(tid).unwrap();
    assert_eq!(terminus.state(), TerminusState::Unavailable);
    assert!(!terminus.is_available());

    let published_fault = loop {
        match readings.recv().await.unwrap() {
            TelemetryEvent::Fault { fault, .. } => break fault,
            TelemetryEvent::Reading { .. } => {}
        }
    };
    assert_eq!(published_fault, FaultKind::PollingFailures { consecutive: 3 });

    // no cooldown configured: stays parked
    let parked = rig.bus.read_count(EP);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(rig.bus.read_count(EP), parked);

    rig.bus.set_reads_failing(EP, false);
    rig.manager.set_availability(tid, true);
    drain(&mut readings);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(drain(&mut readings) >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_fault_cooldown_re_enables_polling() {
    let rig = Rig::new(ManagerConfig {
        failure_threshold: 2,
        fault_cooldown: Some(Duration::from_secs(10)),
        ..ManagerConfig::default()
    });
    let mut events = rig.manager.events();
    let tid = rig.attach(one_sensor()).await;
    rig.bus.set_reads_failing(EP, true);

    next_event(&mut events, |e| matches!(e, ManagerEvent::Fault { .. })).await;
    rig.bus.set_reads_failing(EP, false);

    let back = next_event(&mut events, |e| {
        matches!(
            e,
            ManagerEvent::AvailabilityChanged {
                available: true,
                ..
            }
        )
    })
    .await;
    assert_eq!(
        back,
        ManagerEvent::AvailabilityChanged {
            tid,
            available: true
        }
    );
    assert_eq!(
        rig.manager.terminus(tid).unwrap().state(),
        TerminusState::Active
    );
}

#[tokio::test(start_paused = true)]
async fn test_poll_interval_override() {
    let rig = Rig::new(ManagerConfig::default());
    let tid = rig.attach(one_sensor()).await;
    rig.manager
        .set_poll_interval(tid, Some(Duration::from_secs(5)));

    // let the pending 1s sleep run out, then count over 20s
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let start = rig.bus.read_count(EP);
    tokio::time::sleep(Duration::from_secs(20)).await;
    let reads = rig.bus.read_count(EP) - start;
    assert!((3..=5).contains(&reads), "got {reads} reads");
}

#[tokio::test(start_paused = true)]
async fn test_enumeration_failure_publishes_fault() {
    let rig = Rig::new(ManagerConfig::default());
    let mut events = rig.manager.events();
    let tid = rig
        .attach(SimTerminus::new(EP).with_corrupt_record())
        .await;

    assert_eq!(
        rig.manager.terminus(tid).unwrap().state(),
        TerminusState::Unavailable
    );
    assert!(!rig.manager.is_polling(tid));
    next_event(&mut events, |e| {
        *e == ManagerEvent::Fault {
            tid,
            fault: FaultKind::EnumerationFailed,
        }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_ibm_code_update_sensors_are_injected_and_labelled() {
    let bus = Arc::new(LoopbackBus::new());
    let telemetry = Arc::new(ChannelTelemetry::new(256));
    let manager = Manager::builder(bus.clone())
        .telemetry(telemetry.clone())
        .resolver(Arc::new(IbmResolver::new(0xff00)))
        .build();
    let mut readings = telemetry.subscribe();

    bus.attach(
        SimTerminus::new(EP)
            .with_oem_record(IBM_IANA, &[0xde, 0xad])
            .with_unlisted_state_sensor(0xff00, &[(BOOT_STATE, 2)])
            .with_unlisted_state_sensor(0xff01, &[(FIRMWARE_UPDATE_STATE, 5)]),
    );
    let tid = manager.on_endpoints_added(vec![EP.into()]).await[0];
    assert_eq!(manager.terminus(tid).unwrap().catalog().unwrap().len(), 2);

    let mut seen = Vec::new();
    for _ in 0..2 {
        if let TelemetryEvent::Reading { id, reading, .. } = readings.recv().await.unwrap() {
            seen.push((id, reading));
        }
    }
    seen.sort_by_key(|(id, _)| *id);
    assert_eq!(
        seen,
        vec![
            (
                CompositeId::new(ENTITY_FIRMWARE_UPDATE, 0, BOOT_STATE),
                Reading::State {
                    state: 2,
                    label: Some("t-side".into())
                }
            ),
            (
                CompositeId::new(ENTITY_FIRMWARE_UPDATE, 1, FIRMWARE_UPDATE_STATE),
                Reading::State {
                    state: 5,
                    label: Some("accept".into())
                }
            ),
        ]
    );
}
