//! `platmc demo`: run the manager against the loopback bus.
//!
//! Each `[[demo.endpoints]]` entry becomes a simulated terminus. The
//! manager discovers and enumerates them, polls for `--duration`, then
//! prints what it saw.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tabled::Tabled;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use platmc_config::{Config, DemoEndpoint, DemoNumeric, DemoState};
use platmc_core::{
    ChannelTelemetry, CompositeId, Manager, Reading, TelemetryEvent, Terminus, Tid,
};
use platmc_proto::loopback::{LoopbackBus, SimTerminus};
use platmc_proto::pdr::EntityRef;
use platmc_proto::{EndpointAddress, EndpointDescriptor};

use crate::cli::{DemoArgs, GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

const ENTITY_PROCESSOR: u16 = 135;
const ENTITY_POWER_SUPPLY: u16 = 120;
const STATE_SET_HEALTH: u16 = 1;
const STATE_NORMAL: u8 = 1;

/// Starter termini written by `config init` and used when the config
/// names none.
pub fn sample_endpoints() -> Vec<DemoEndpoint> {
    vec![
        DemoEndpoint {
            address: "0:8".into(),
            tid: 0,
            latency: Some(Duration::from_millis(5)),
            numeric_sensors: vec![
                DemoNumeric {
                    id: 1,
                    entity_type: ENTITY_PROCESSOR,
                    entity_instance: 0,
                    raw: 48,
                },
                DemoNumeric {
                    id: 2,
                    entity_type: ENTITY_PROCESSOR,
                    entity_instance: 1,
                    raw: 51,
                },
            ],
            state_sensors: vec![DemoState {
                id: 3,
                entity_type: ENTITY_PROCESSOR,
                entity_instance: 0,
                state_set: STATE_SET_HEALTH,
                state: STATE_NORMAL,
            }],
        },
        DemoEndpoint {
            address: "0:9".into(),
            tid: 0,
            latency: Some(Duration::from_millis(5)),
            numeric_sensors: vec![DemoNumeric {
                id: 1,
                entity_type: ENTITY_POWER_SUPPLY,
                entity_instance: 0,
                raw: 36,
            }],
            state_sensors: Vec::new(),
        },
    ]
}

fn entity(entity_type: u16, entity_instance: u16) -> EntityRef {
    EntityRef {
        entity_type,
        entity_instance,
        container_id: 0,
    }
}

fn sim_terminus(ep: &DemoEndpoint) -> Result<SimTerminus, platmc_config::ConfigError> {
    let mut sim = SimTerminus::new(ep.endpoint()?).with_tid(ep.tid);
    if let Some(latency) = ep.latency {
        sim = sim.with_delay(latency);
    }
    for n in &ep.numeric_sensors {
        sim = sim.with_numeric_sensor(n.id, entity(n.entity_type, n.entity_instance), n.raw);
    }
    for s in &ep.state_sensors {
        sim = sim.with_state_sensor(
            s.id,
            entity(s.entity_type, s.entity_instance),
            &[(s.state_set, s.state)],
        );
    }
    Ok(sim)
}

// ── Summary rows ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Tabled)]
struct TerminusRow {
    #[tabled(rename = "TID")]
    tid: Tid,
    #[tabled(rename = "Endpoint")]
    endpoint: EndpointAddress,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Available")]
    available: bool,
    #[tabled(rename = "Capabilities")]
    capabilities: usize,
    #[tabled(rename = "Polling")]
    polling: bool,
}

impl TerminusRow {
    fn new(manager: &Manager, terminus: &Terminus) -> Self {
        Self {
            tid: terminus.tid(),
            endpoint: terminus.address(),
            state: terminus.state().to_string(),
            available: terminus.is_available(),
            capabilities: terminus.catalog().map_or(0, |c| c.len()),
            polling: manager.is_polling(terminus.tid()),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct ReadingRow {
    #[tabled(rename = "TID")]
    tid: Tid,
    #[tabled(rename = "Sensor")]
    sensor: CompositeId,
    #[tabled(rename = "Value")]
    #[serde(skip)]
    value: String,
    #[tabled(skip)]
    reading: Reading,
    #[tabled(rename = "Samples")]
    samples: u64,
}

#[derive(Debug, Serialize)]
struct Summary {
    termini: Vec<TerminusRow>,
    readings: Vec<ReadingRow>,
    faults: Vec<FaultRow>,
}

#[derive(Debug, Serialize, Tabled)]
struct FaultRow {
    #[tabled(rename = "TID")]
    tid: Tid,
    #[tabled(rename = "Fault")]
    fault: String,
}

fn describe(reading: &Reading) -> String {
    match reading {
        Reading::Numeric { value, unit: 2 } => format!("{value:.2} °C"),
        Reading::Numeric { value, unit } => format!("{value:.2} (unit {unit})"),
        Reading::State {
            state,
            label: Some(label),
        } => format!("state {state} ({label})"),
        Reading::State { state, label: None } => format!("state {state}"),
        Reading::Unavailable { operational_state } => {
            format!("unavailable (op state {operational_state})")
        }
    }
}

/// Latest value and sample count per composite sensor.
#[derive(Default)]
struct Collector {
    latest: BTreeMap<(Tid, CompositeId), (Reading, u64)>,
    faults: Vec<FaultRow>,
}

impl Collector {
    fn record(&mut self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::Reading {
                tid, id, reading, ..
            } => {
                let slot = self.latest.entry((tid, id)).or_insert((reading.clone(), 0));
                slot.0 = reading;
                slot.1 += 1;
            }
            TelemetryEvent::Fault { tid, fault, .. } => self.faults.push(FaultRow {
                tid,
                fault: fault.to_string(),
            }),
        }
    }

    fn into_rows(self) -> (Vec<ReadingRow>, Vec<FaultRow>) {
        let readings = self
            .latest
            .into_iter()
            .map(|((tid, sensor), (reading, samples))| ReadingRow {
                tid,
                sensor,
                value: describe(&reading),
                reading,
                samples,
            })
            .collect();
        (readings, self.faults)
    }
}

fn follow_line(format: OutputFormat, item: &impl Serialize, text: impl FnOnce() -> String) -> String {
    match format {
        OutputFormat::Table => text(),
        _ => serde_json::to_string(item).unwrap_or_default(),
    }
}

// ── Handler ──────────────────────────────────────────────────────────

pub async fn handle(args: DemoArgs, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let path = global.config_path();
    let mut manager_config = cfg.to_manager_config().map_err(|e| CliError::config(&path, e))?;
    if let Some(interval) = args.interval {
        manager_config.poll_interval = interval;
    }
    let resolver = cfg.resolver().map_err(|e| CliError::config(&path, e))?;

    let endpoints = if cfg.demo.endpoints.is_empty() {
        sample_endpoints()
    } else {
        cfg.demo.endpoints.clone()
    };

    let bus = Arc::new(LoopbackBus::new());
    let mut batch = Vec::with_capacity(endpoints.len());
    for ep in &endpoints {
        let sim = sim_terminus(ep).map_err(|e| CliError::config(&path, e))?;
        batch.push(EndpointDescriptor::new(sim.address()));
        bus.attach(sim);
    }

    let telemetry = Arc::new(ChannelTelemetry::new(1024));
    let mut readings = telemetry.subscribe();
    let manager = Manager::builder(bus)
        .config(manager_config)
        .resolver(resolver)
        .telemetry(telemetry)
        .build();
    let mut events = manager.events();

    let attempted = batch.len();
    let online = manager.on_endpoints_added(batch).await;
    info!(online = online.len(), attempted, "discovery batch finished");
    if online.is_empty() {
        manager.shutdown().await;
        return Err(CliError::NoTermini { attempted });
    }

    let mut collector = Collector::default();
    let follow = args.follow && !global.quiet;
    let deadline = tokio::time::sleep(args.duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            () = &mut deadline => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if follow {
                        println!("{}", follow_line(global.output, &event, || format!("{event:?}")));
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event receiver lagged"),
                Err(RecvError::Closed) => break,
            },
            item = readings.recv() => match item {
                Ok(item) => {
                    if follow {
                        println!("{}", follow_line(global.output, &item, || telemetry_line(&item)));
                    }
                    collector.record(item);
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "telemetry receiver lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let termini: Vec<TerminusRow> = manager
        .termini()
        .iter()
        .map(|t| TerminusRow::new(&manager, t))
        .collect();
    manager.shutdown().await;

    let (readings, faults) = collector.into_rows();
    let summary = Summary {
        termini,
        readings,
        faults,
    };

    let rendered = match output::render_structured(global.output, &summary)? {
        Some(s) => s,
        None => {
            let mut out = output::render_table(&summary.termini);
            if !summary.readings.is_empty() {
                out.push('\n');
                out.push_str(&output::render_table(&summary.readings));
            }
            if !summary.faults.is_empty() {
                out.push('\n');
                out.push_str(&output::render_table(&summary.faults));
            }
            out
        }
    };
    output::print_output(&rendered, global.quiet);
    Ok(())
}

fn telemetry_line(item: &TelemetryEvent) -> String {
    match item {
        TelemetryEvent::Reading {
            tid, id, reading, ..
        } => format!("{tid} {id} = {}", describe(reading)),
        TelemetryEvent::Fault { tid, fault, .. } => format!("{tid} FAULT {fault}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sample_endpoints_are_valid() {
        for ep in sample_endpoints() {
            assert!(sim_terminus(&ep).is_ok(), "{}", ep.address);
        }
    }

    #[test]
    fn readings_are_described_for_humans() {
        assert_eq!(describe(&Reading::Numeric { value: 41.5, unit: 2 }), "41.50 °C");
        assert_eq!(
            describe(&Reading::State {
                state: 2,
                label: Some("t-side".into())
            }),
            "state 2 (t-side)"
        );
        assert_eq!(
            describe(&Reading::Unavailable { operational_state: 1 }),
            "unavailable (op state 1)"
        );
    }

    #[test]
    fn collector_keeps_latest_and_counts() {
        let tid = Tid::new(3).unwrap();
        let id = CompositeId::new(135, 0, 0);
        let mut c = Collector::default();
        for value in [1.0, 2.0] {
            c.record(TelemetryEvent::Reading {
                tid,
                id,
                reading: Reading::Numeric { value, unit: 2 },
                at: chrono::Utc::now(),
            });
        }
        let (rows, faults) = c.into_rows();
        assert!(faults.is_empty());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].samples, 2);
        assert_eq!(rows[0].value, "2.00 °C");
    }
}
