// ── Capability catalog ──
//
// Built once per terminus during enumeration. Each descriptor carries
// everything needed to issue its read command and turn the response
// into readings, so the polling loop never revisits the raw records.

use std::fmt;

use bytes::Bytes;
use platmc_proto::commands::{operational_state, platform};
use platmc_proto::pdr::{EntityRef, NumericPdr, Pdr, StatePdr};
use platmc_proto::{CodecError, Request};
use serde::{Deserialize, Serialize};

use super::reading::Reading;

// ── CompositeId ──────────────────────────────────────────────────────

/// Key under which readings are published.
///
/// Numeric capabilities use state set `0`; state capabilities publish
/// one id per composite element.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CompositeId {
    pub entity_type: u16,
    pub entity_instance: u16,
    pub state_set_id: u16,
}

impl CompositeId {
    pub const fn new(entity_type: u16, entity_instance: u16, state_set_id: u16) -> Self {
        Self {
            entity_type,
            entity_instance,
            state_set_id,
        }
    }

    fn of(entity: EntityRef, state_set_id: u16) -> Self {
        Self::new(entity.entity_type, entity.entity_instance, state_set_id)
    }
}

impl fmt::Display for CompositeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}/{}",
            self.entity_type, self.entity_instance, self.state_set_id
        )
    }
}

// ── Descriptor ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CapabilityKind {
    NumericSensor,
    StateSensor,
    NumericEffecter,
    StateEffecter,
}

/// Conversion from raw numeric counts to engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericFormat {
    pub base_unit: u8,
    pub unit_modifier: i8,
    pub resolution: f32,
    pub offset: f32,
}

impl NumericFormat {
    /// `(raw × resolution + offset) × 10^unit_modifier`
    pub fn convert(&self, raw: i64) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let raw = raw as f64;
        (raw * f64::from(self.resolution) + f64::from(self.offset))
            * 10f64.powi(i32::from(self.unit_modifier))
    }
}

impl From<&NumericPdr> for NumericFormat {
    fn from(pdr: &NumericPdr) -> Self {
        Self {
            base_unit: pdr.base_unit,
            unit_modifier: pdr.unit_modifier,
            resolution: pdr.resolution,
            offset: pdr.offset,
        }
    }
}

/// How raw responses for a capability are interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decoder {
    Numeric(NumericFormat),
    /// One state set per composite element, in wire order.
    State { state_sets: Vec<u16> },
}

/// One sensor or effecter a terminus exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub kind: CapabilityKind,
    /// Sensor or effecter id, scoped to the terminus.
    pub id: u16,
    pub entity: EntityRef,
    pub decoder: Decoder,
}

impl CapabilityDescriptor {
    /// Descriptor for a standard record; `None` for OEM and unknown types.
    pub fn from_pdr(pdr: &Pdr) -> Option<Self> {
        match pdr {
            Pdr::NumericSensor(p) => Some(Self::numeric(CapabilityKind::NumericSensor, p)),
            Pdr::NumericEffecter(p) => Some(Self::numeric(CapabilityKind::NumericEffecter, p)),
            Pdr::StateSensor(p) => Some(Self::state(CapabilityKind::StateSensor, p)),
            Pdr::StateEffecter(p) => Some(Self::state(CapabilityKind::StateEffecter, p)),
            Pdr::Oem(_) | Pdr::Unsupported { .. } => None,
        }
    }

    fn numeric(kind: CapabilityKind, pdr: &NumericPdr) -> Self {
        Self {
            kind,
            id: pdr.id,
            entity: pdr.entity,
            decoder: Decoder::Numeric(pdr.into()),
        }
    }

    fn state(kind: CapabilityKind, pdr: &StatePdr) -> Self {
        Self {
            kind,
            id: pdr.id,
            entity: pdr.entity,
            decoder: Decoder::State {
                state_sets: pdr.composite.iter().map(|s| s.state_set_id).collect(),
            },
        }
    }

    /// State sensor built outside a record (vendor-injected capabilities).
    pub fn state_sensor(id: u16, entity: EntityRef, state_sets: Vec<u16>) -> Self {
        Self {
            kind: CapabilityKind::StateSensor,
            id,
            entity,
            decoder: Decoder::State { state_sets },
        }
    }

    pub fn is_effecter(&self) -> bool {
        matches!(
            self.kind,
            CapabilityKind::NumericEffecter | CapabilityKind::StateEffecter
        )
    }

    pub fn composite_ids(&self) -> Vec<CompositeId> {
        match &self.decoder {
            Decoder::Numeric(_) => vec![CompositeId::of(self.entity, 0)],
            Decoder::State { state_sets } => state_sets
                .iter()
                .map(|&set| CompositeId::of(self.entity, set))
                .collect(),
        }
    }

    /// The read command for this capability.
    pub fn read_request(&self) -> Request {
        match self.kind {
            CapabilityKind::NumericSensor => platform::get_sensor_reading_request(self.id),
            CapabilityKind::NumericEffecter => {
                platform::get_numeric_effecter_value_request(self.id)
            }
            CapabilityKind::StateSensor => platform::get_state_sensor_readings_request(self.id),
            CapabilityKind::StateEffecter => platform::get_state_effecter_states_request(self.id),
        }
    }

    /// Decode a successful read response into per-composite readings.
    ///
    /// State responses carrying fewer fields than the record declared
    /// yield readings only for the fields present.
    pub fn decode_response(&self, payload: Bytes) -> Result<Vec<(CompositeId, Reading)>, CodecError> {
        match &self.decoder {
            Decoder::Numeric(format) => {
                let numeric = match self.kind {
                    CapabilityKind::NumericEffecter => {
                        platform::decode_get_numeric_effecter_value(payload)?
                    }
                    _ => platform::decode_get_sensor_reading(payload)?,
                };
                let reading = if numeric.operational_state == operational_state::ENABLED {
                    Reading::Numeric {
                        value: format.convert(numeric.raw),
                        unit: format.base_unit,
                    }
                } else {
                    Reading::Unavailable {
                        operational_state: numeric.operational_state,
                    }
                };
                Ok(vec![(CompositeId::of(self.entity, 0), reading)])
            }
            Decoder::State { state_sets } => {
                let fields = match self.kind {
                    CapabilityKind::StateEffecter => {
                        platform::decode_get_state_effecter_states(payload)?
                    }
                    _ => platform::decode_get_state_sensor_readings(payload)?,
                };
                Ok(state_sets
                    .iter()
                    .zip(fields)
                    .map(|(&set, field)| {
                        let reading = if field.operational_state == operational_state::ENABLED {
                            Reading::State {
                                state: field.present_state,
                                label: None,
                            }
                        } else {
                            Reading::Unavailable {
                                operational_state: field.operational_state,
                            }
                        };
                        (CompositeId::of(self.entity, set), reading)
                    })
                    .collect())
            }
        }
    }
}

// ── Catalog ──────────────────────────────────────────────────────────

/// Everything enumeration learned about one terminus. Immutable once
/// installed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    entries: Vec<CapabilityDescriptor>,
}

impl Catalog {
    pub fn new(entries: Vec<CapabilityDescriptor>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CapabilityDescriptor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sensors(&self) -> impl Iterator<Item = &CapabilityDescriptor> {
        self.entries.iter().filter(|d| !d.is_effecter())
    }

    pub fn effecters(&self) -> impl Iterator<Item = &CapabilityDescriptor> {
        self.entries.iter().filter(|d| d.is_effecter())
    }

    /// Every composite id in catalog order.
    pub fn composite_ids(&self) -> Vec<CompositeId> {
        self.entries
            .iter()
            .flat_map(CapabilityDescriptor::composite_ids)
            .collect()
    }

    /// The descriptor publishing `id`, if any.
    pub fn find(&self, id: CompositeId) -> Option<&CapabilityDescriptor> {
        self.entries
            .iter()
            .find(|d| d.composite_ids().contains(&id))
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a CapabilityDescriptor;
    type IntoIter = std::slice::Iter<'a, CapabilityDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use platmc_proto::commands::platform::{NumericReading, StateField};
    use platmc_proto::pdr::{NumericDataSize, StateSetDef};
    use pretty_assertions::assert_eq;

    const ENTITY: EntityRef = EntityRef {
        entity_type: 64,
        entity_instance: 1,
        container_id: 0,
    };

    fn numeric_pdr() -> NumericPdr {
        NumericPdr {
            terminus_handle: 0,
            id: 3,
            entity: ENTITY,
            base_unit: 2,
            unit_modifier: -1,
            data_size: NumericDataSize::S16,
            resolution: 0.5,
            offset: 10.0,
        }
    }

    #[test]
    fn numeric_conversion_applies_resolution_offset_and_modifier() {
        let format = NumericFormat::from(&numeric_pdr());
        // (100 × 0.5 + 10) × 10^-1
        assert!((format.convert(100) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn state_sensor_publishes_one_id_per_element() {
        let pdr = Pdr::StateSensor(StatePdr {
            terminus_handle: 0,
            id: 9,
            entity: ENTITY,
            composite: vec![
                StateSetDef {
                    state_set_id: 11,
                    possible_states: Bytes::from_static(&[0x3]),
                },
                StateSetDef {
                    state_set_id: 12,
                    possible_states: Bytes::from_static(&[0x3]),
                },
            ],
        });
        let desc = CapabilityDescriptor::from_pdr(&pdr).unwrap();
        assert_eq!(
            desc.composite_ids(),
            vec![CompositeId::new(64, 1, 11), CompositeId::new(64, 1, 12)]
        );
    }

    #[test]
    fn numeric_capability_uses_state_set_zero() {
        let desc = CapabilityDescriptor::from_pdr(&Pdr::NumericSensor(numeric_pdr())).unwrap();
        assert_eq!(desc.composite_ids(), vec![CompositeId::new(64, 1, 0)]);
        assert_eq!(desc.read_request().command, platform::GET_SENSOR_READING);
    }

    #[test]
    fn disabled_sensor_decodes_as_unavailable() {
        let desc = CapabilityDescriptor::from_pdr(&Pdr::NumericSensor(numeric_pdr())).unwrap();
        let payload = platform::encode_get_sensor_reading_response(
            NumericDataSize::S16,
            NumericReading {
                operational_state: operational_state::DISABLED,
                raw: 5,
            },
        );
        let readings = desc.decode_response(payload).unwrap();
        assert_eq!(
            readings,
            vec![(
                CompositeId::new(64, 1, 0),
                Reading::Unavailable {
                    operational_state: operational_state::DISABLED
                }
            )]
        );
    }

    #[test]
    fn short_state_response_yields_present_fields_only() {
        let desc = CapabilityDescriptor::state_sensor(4, ENTITY, vec![1, 2, 3]);
        let payload = platform::encode_get_state_sensor_readings_response(&[StateField {
            operational_state: operational_state::ENABLED,
            present_state: 2,
        }]);
        let readings = desc.decode_response(payload).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(
            readings[0].1,
            Reading::State {
                state: 2,
                label: None
            }
        );
    }

    #[test]
    fn oem_records_have_no_standard_descriptor() {
        let pdr = Pdr::Oem(platmc_proto::pdr::OemPdr {
            vendor_iana: 2,
            data: Bytes::new(),
        });
        assert!(CapabilityDescriptor::from_pdr(&pdr).is_none());
    }

    #[test]
    fn catalog_splits_sensors_and_effecters() {
        let catalog = Catalog::new(vec![
            CapabilityDescriptor::from_pdr(&Pdr::NumericSensor(numeric_pdr())).unwrap(),
            CapabilityDescriptor::from_pdr(&Pdr::NumericEffecter(numeric_pdr())).unwrap(),
        ]);
        assert_eq!(catalog.sensors().count(), 1);
        assert_eq!(catalog.effecters().count(), 1);
        assert!(catalog.find(CompositeId::new(64, 1, 0)).is_some());
    }
}
