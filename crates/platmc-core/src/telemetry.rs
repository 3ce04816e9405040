// ── Telemetry sinks ──
//
// Where readings and faults go. Publishing is synchronous and must not
// block: the polling loop calls it between requests.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::model::{CompositeId, FaultKind, Reading, Tid};

/// Consumer of published readings and faults.
pub trait Telemetry: Send + Sync {
    fn publish_reading(&self, tid: Tid, id: CompositeId, reading: &Reading);
    fn publish_fault(&self, tid: Tid, fault: FaultKind);
}

/// One published item, as delivered by [`ChannelTelemetry`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Reading {
        tid: Tid,
        id: CompositeId,
        reading: Reading,
        at: DateTime<Utc>,
    },
    Fault {
        tid: Tid,
        fault: FaultKind,
        at: DateTime<Utc>,
    },
}

impl TelemetryEvent {
    pub fn tid(&self) -> Tid {
        match self {
            Self::Reading { tid, .. } | Self::Fault { tid, .. } => *tid,
        }
    }
}

// ── ChannelTelemetry ─────────────────────────────────────────────────

/// Fans published items out to any number of broadcast receivers.
/// Slow receivers lag rather than block the publisher.
#[derive(Debug, Clone)]
pub struct ChannelTelemetry {
    tx: broadcast::Sender<TelemetryEvent>,
}

impl ChannelTelemetry {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }
}

impl Telemetry for ChannelTelemetry {
    fn publish_reading(&self, tid: Tid, id: CompositeId, reading: &Reading) {
        // No receivers is fine.
        let _ = self.tx.send(TelemetryEvent::Reading {
            tid,
            id,
            reading: reading.clone(),
            at: Utc::now(),
        });
    }

    fn publish_fault(&self, tid: Tid, fault: FaultKind) {
        let _ = self.tx.send(TelemetryEvent::Fault {
            tid,
            fault,
            at: Utc::now(),
        });
    }
}

// ── TracingTelemetry ─────────────────────────────────────────────────

/// Writes every reading and fault to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn publish_reading(&self, tid: Tid, id: CompositeId, reading: &Reading) {
        match reading {
            Reading::Numeric { value, unit } => {
                info!(%tid, sensor = %id, value, unit, "reading");
            }
            Reading::State { state, label } => {
                info!(%tid, sensor = %id, state, label = label.as_deref(), "reading");
            }
            Reading::Unavailable { operational_state } => {
                info!(%tid, sensor = %id, operational_state, "sensor unavailable");
            }
        }
    }

    fn publish_fault(&self, tid: Tid, fault: FaultKind) {
        warn!(%tid, %fault, "terminus fault");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn channel_delivers_to_every_subscriber() {
        let telemetry = ChannelTelemetry::new(8);
        let mut a = telemetry.subscribe();
        let mut b = telemetry.subscribe();
        let tid = Tid::new(3).unwrap();

        telemetry.publish_fault(tid, FaultKind::PollingFailures { consecutive: 3 });

        for rx in [&mut a, &mut b] {
            let event = rx.try_recv().unwrap();
            assert_eq!(event.tid(), tid);
            assert!(matches!(
                event,
                TelemetryEvent::Fault {
                    fault: FaultKind::PollingFailures { consecutive: 3 },
                    ..
                }
            ));
        }
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        ChannelTelemetry::new(1).publish_reading(
            Tid::new(1).unwrap(),
            CompositeId::new(1, 1, 0),
            &Reading::Numeric {
                value: 1.0,
                unit: 2,
            },
        );
    }
}
