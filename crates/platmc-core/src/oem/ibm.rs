// ── IBM code-update profile ──
//
// IBM termini report code-update progress and the running boot side
// through two vendor state sets on the firmware-update entity. Both
// sensors are implied by the vendor rather than described by standard
// records, so they are injected once an IBM record shows up.

use bytes::Buf;
use platmc_proto::pdr::{EntityRef, OemPdr};
use tracing::debug;

use super::CapabilityResolver;
use crate::model::{CapabilityDescriptor, CompositeId, Reading, Tid};

pub const IBM_IANA: u32 = 2;

pub const FIRMWARE_UPDATE_STATE: u16 = 32768;
pub const BOOT_STATE: u16 = 32769;

pub const ENTITY_FIRMWARE_UPDATE: u16 = 24577;
pub const ENTITY_INSTANCE_0: u16 = 0;
pub const ENTITY_INSTANCE_1: u16 = 1;

/// Length of the vendor record body this profile understands:
/// sensor id, entity type, entity instance, state set (all `u16` LE).
const RECORD_LEN: usize = 8;

/// Resolver for IBM termini.
#[derive(Debug, Clone, Copy)]
pub struct IbmResolver {
    /// Sensor id of the injected boot-side sensor; the code-update
    /// sensor uses the next id.
    first_sensor_id: u16,
}

impl Default for IbmResolver {
    fn default() -> Self {
        Self::new(0xff00)
    }
}

impl IbmResolver {
    pub const fn new(first_sensor_id: u16) -> Self {
        Self { first_sensor_id }
    }

    fn injected(&self) -> [CapabilityDescriptor; 2] {
        let entity = |instance| EntityRef {
            entity_type: ENTITY_FIRMWARE_UPDATE,
            entity_instance: instance,
            container_id: 0,
        };
        [
            CapabilityDescriptor::state_sensor(
                self.first_sensor_id,
                entity(ENTITY_INSTANCE_0),
                vec![BOOT_STATE],
            ),
            CapabilityDescriptor::state_sensor(
                self.first_sensor_id.wrapping_add(1),
                entity(ENTITY_INSTANCE_1),
                vec![FIRMWARE_UPDATE_STATE],
            ),
        ]
    }
}

fn boot_side_label(state: u8) -> Option<&'static str> {
    match state {
        1 => Some("p-side"),
        2 => Some("t-side"),
        _ => None,
    }
}

fn update_label(state: u8) -> Option<&'static str> {
    match state {
        1 => Some("start"),
        2 => Some("end"),
        3 => Some("fail"),
        4 => Some("abort"),
        5 => Some("accept"),
        6 => Some("reject"),
        _ => None,
    }
}

impl CapabilityResolver for IbmResolver {
    fn resolve_composite(&self, tid: Tid, record: &OemPdr) -> Option<CapabilityDescriptor> {
        if record.vendor_iana != IBM_IANA || record.data.len() < RECORD_LEN {
            return None;
        }
        let mut data = record.data.clone();
        let id = data.get_u16_le();
        let entity = EntityRef {
            entity_type: data.get_u16_le(),
            entity_instance: data.get_u16_le(),
            container_id: 0,
        };
        let state_set = data.get_u16_le();
        debug!(%tid, id, state_set, "resolved IBM vendor record");
        Some(CapabilityDescriptor::state_sensor(id, entity, vec![state_set]))
    }

    fn extra_records(
        &self,
        tid: Tid,
        vendors: &[u32],
        found: &[CapabilityDescriptor],
    ) -> Vec<CapabilityDescriptor> {
        if !vendors.contains(&IBM_IANA) {
            return Vec::new();
        }
        let known: Vec<CompositeId> = found
            .iter()
            .flat_map(CapabilityDescriptor::composite_ids)
            .collect();
        let extra: Vec<CapabilityDescriptor> = self
            .injected()
            .into_iter()
            .filter(|d| d.composite_ids().iter().all(|id| !known.contains(id)))
            .collect();
        debug!(%tid, count = extra.len(), "injecting IBM code-update sensors");
        extra
    }

    fn decode_reading(&self, id: &CompositeId, reading: Reading) -> Reading {
        let Reading::State { state, label: None } = reading else {
            return reading;
        };
        let label = match (id.entity_type, id.state_set_id) {
            (ENTITY_FIRMWARE_UPDATE, BOOT_STATE) => boot_side_label(state),
            (ENTITY_FIRMWARE_UPDATE, FIRMWARE_UPDATE_STATE) => update_label(state),
            _ => None,
        };
        Reading::State {
            state,
            label: label.map(str::to_owned),
        }
    }
}
