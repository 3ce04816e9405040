// ── In-memory bus ──
//
// A `Transport` backed by scripted termini living in the same process.
// Each simulated terminus answers the discovery, enumeration and read
// commands the manager issues, and can be told to drop requests, stall,
// or serve a corrupt record so failure paths are reproducible.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::commands::base::{self, SupportedTypes};
use crate::commands::platform::{self, NumericReading, StateField};
use crate::commands::{decode_id_request, operational_state};
use crate::endpoint::EndpointAddress;
use crate::error::Error;
use crate::message::{CompletionCode, PldmType, Request, Response};
use crate::pdr::{EntityRef, NumericDataSize, NumericPdr, OemPdr, Pdr, PdrRecord, StatePdr, StateSetDef};
use crate::transport::Transport;

/// Base unit code for degrees Celsius.
const UNIT_DEGREES_C: u8 = 2;

enum SimRecord {
    Valid(PdrRecord),
    Corrupt,
}

// ── SimTerminus ─────────────────────────────────────────────────────

/// A scripted terminus. Built up front, then attached to a [`LoopbackBus`].
pub struct SimTerminus {
    address: EndpointAddress,
    tid: u8,
    types: SupportedTypes,
    records: Vec<SimRecord>,
    numeric: HashMap<u16, (NumericDataSize, NumericReading)>,
    states: HashMap<u16, Vec<StateField>>,
    drop_first: u32,
    unresponsive: bool,
    reads_failing: bool,
    delay: Duration,
    log: Vec<(PldmType, u8)>,
}

impl SimTerminus {
    pub fn new(address: EndpointAddress) -> Self {
        Self {
            address,
            tid: base::TID_UNASSIGNED,
            types: SupportedTypes::from_types(&[PldmType::BASE, PldmType::PLATFORM]),
            records: Vec::new(),
            numeric: HashMap::new(),
            states: HashMap::new(),
            drop_first: 0,
            unresponsive: false,
            reads_failing: false,
            delay: Duration::ZERO,
            log: Vec::new(),
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    /// TID the terminus reports before the manager assigns one.
    #[must_use]
    pub fn with_tid(mut self, tid: u8) -> Self {
        self.tid = tid;
        self
    }

    /// Report only the base message type (no platform monitoring).
    #[must_use]
    pub fn without_platform(mut self) -> Self {
        self.types = SupportedTypes::from_types(&[PldmType::BASE]);
        self
    }

    #[must_use]
    pub fn with_record(mut self, body: Pdr) -> Self {
        let handle = u32::try_from(self.records.len() + 1).unwrap_or(u32::MAX);
        self.records
            .push(SimRecord::Valid(PdrRecord::new(handle, body)));
        self
    }

    /// Serve a record whose body cannot be decoded.
    #[must_use]
    pub fn with_corrupt_record(mut self) -> Self {
        self.records.push(SimRecord::Corrupt);
        self
    }

    #[must_use]
    pub fn with_numeric_sensor(mut self, sensor_id: u16, entity: EntityRef, raw: i64) -> Self {
        let size = NumericDataSize::S32;
        self.numeric.insert(
            sensor_id,
            (
                size,
                NumericReading {
                    operational_state: operational_state::ENABLED,
                    raw,
                },
            ),
        );
        self.with_record(Pdr::NumericSensor(numeric_pdr(sensor_id, entity, size)))
    }

    #[must_use]
    pub fn with_numeric_effecter(mut self, effecter_id: u16, entity: EntityRef, raw: i64) -> Self {
        let size = NumericDataSize::U16;
        self.numeric.insert(
            effecter_id,
            (
                size,
                NumericReading {
                    operational_state: operational_state::ENABLED,
                    raw,
                },
            ),
        );
        self.with_record(Pdr::NumericEffecter(numeric_pdr(effecter_id, entity, size)))
    }

    /// State sensor with one composite element per `(state_set_id, present_state)`.
    #[must_use]
    pub fn with_state_sensor(mut self, sensor_id: u16, entity: EntityRef, sets: &[(u16, u8)]) -> Self {
        self.states.insert(sensor_id, state_fields(sets));
        self.with_record(Pdr::StateSensor(state_pdr(sensor_id, entity, sets)))
    }

    #[must_use]
    pub fn with_state_effecter(mut self, effecter_id: u16, entity: EntityRef, sets: &[(u16, u8)]) -> Self {
        self.states.insert(effecter_id, state_fields(sets));
        self.with_record(Pdr::StateEffecter(state_pdr(effecter_id, entity, sets)))
    }

    /// Answer state reads for `sensor_id` without serving a record for it.
    #[must_use]
    pub fn with_unlisted_state_sensor(mut self, sensor_id: u16, sets: &[(u16, u8)]) -> Self {
        self.states.insert(sensor_id, state_fields(sets));
        self
    }

    #[must_use]
    pub fn with_oem_record(self, vendor_iana: u32, data: &'static [u8]) -> Self {
        self.with_record(Pdr::Oem(OemPdr {
            vendor_iana,
            data: Bytes::from_static(data),
        }))
    }

    /// Silently drop the first `count` requests (they time out).
    #[must_use]
    pub fn dropping_first(mut self, count: u32) -> Self {
        self.drop_first = count;
        self
    }

    /// Never answer anything.
    #[must_use]
    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    /// Delay every answer by `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn respond(&mut self, request: &Request) -> Option<Response> {
        self.log.push((request.pldm_type, request.command));

        if self.unresponsive {
            return None;
        }
        if self.drop_first > 0 {
            self.drop_first -= 1;
            return None;
        }

        let payload = request.payload.clone();
        let reply = |cc: CompletionCode, body: Bytes| Some(Response::to(request, cc, body));
        let ok = |body: Bytes| reply(CompletionCode::SUCCESS, body);
        let err = |cc: CompletionCode| reply(cc, Bytes::new());

        match (request.pldm_type, request.command) {
            (PldmType::BASE, base::GET_TID) => ok(base::encode_get_tid_response(self.tid)),
            (PldmType::BASE, base::SET_TID) => match base::decode_set_tid_request(payload) {
                Ok(tid) if tid != base::TID_UNASSIGNED && tid != base::TID_RESERVED => {
                    self.tid = tid;
                    ok(Bytes::new())
                }
                _ => err(CompletionCode::ERROR_INVALID_DATA),
            },
            (PldmType::BASE, base::GET_PLDM_TYPES) => {
                ok(base::encode_get_types_response(self.types))
            }
            (PldmType::PLATFORM, platform::GET_PDR) => {
                let Ok(handle) = platform::decode_get_pdr_request(payload) else {
                    return err(CompletionCode::ERROR_INVALID_LENGTH);
                };
                self.get_pdr(handle)
                    .map_or_else(|| err(CompletionCode::INVALID_RECORD_HANDLE), ok)
            }
            (PldmType::PLATFORM, _) if self.reads_failing => None,
            (PldmType::PLATFORM, platform::GET_SENSOR_READING) => {
                match decode_id_request(payload).ok().and_then(|id| self.numeric.get(&id)) {
                    Some(&(size, reading)) => {
                        ok(platform::encode_get_sensor_reading_response(size, reading))
                    }
                    None => err(CompletionCode::INVALID_SENSOR_ID),
                }
            }
            (PldmType::PLATFORM, platform::GET_NUMERIC_EFFECTER_VALUE) => {
                match decode_id_request(payload).ok().and_then(|id| self.numeric.get(&id)) {
                    Some(&(size, reading)) => {
                        ok(platform::encode_get_numeric_effecter_value_response(size, reading))
                    }
                    None => err(CompletionCode::INVALID_SENSOR_ID),
                }
            }
            (PldmType::PLATFORM, platform::GET_STATE_SENSOR_READINGS) => {
                match decode_id_request(payload).ok().and_then(|id| self.states.get(&id)) {
                    Some(fields) => {
                        ok(platform::encode_get_state_sensor_readings_response(fields))
                    }
                    None => err(CompletionCode::INVALID_SENSOR_ID),
                }
            }
            (PldmType::PLATFORM, platform::GET_STATE_EFFECTER_STATES) => {
                match decode_id_request(payload).ok().and_then(|id| self.states.get(&id)) {
                    Some(fields) => {
                        ok(platform::encode_get_state_effecter_states_response(fields))
                    }
                    None => err(CompletionCode::INVALID_SENSOR_ID),
                }
            }
            _ => err(CompletionCode::ERROR_UNSUPPORTED_CMD),
        }
    }

    /// Handles run 1..=N; handle 0 means "first record".
    fn get_pdr(&self, handle: u32) -> Option<Bytes> {
        let index = if handle == 0 {
            0
        } else {
            usize::try_from(handle).ok()?.checked_sub(1)?
        };
        let record = self.records.get(index)?;
        let next = if index + 1 < self.records.len() {
            u32::try_from(index + 2).unwrap_or(0)
        } else {
            0
        };
        let data = match record {
            SimRecord::Valid(record) => record.encode(),
            // header claims a numeric sensor but the body is three bytes short
            SimRecord::Corrupt => {
                let handle = u32::try_from(index + 1).unwrap_or(u32::MAX).to_le_bytes();
                let mut raw = handle.to_vec();
                raw.extend_from_slice(&[1, crate::pdr::pdr_type::NUMERIC_SENSOR, 0, 0, 3, 0]);
                raw.extend_from_slice(&[0, 0, 0]);
                Bytes::from(raw)
            }
        };
        Some(platform::encode_get_pdr_response(next, &data))
    }
}

fn numeric_pdr(id: u16, entity: EntityRef, data_size: NumericDataSize) -> NumericPdr {
    NumericPdr {
        terminus_handle: 0,
        id,
        entity,
        base_unit: UNIT_DEGREES_C,
        unit_modifier: 0,
        data_size,
        resolution: 1.0,
        offset: 0.0,
    }
}

fn state_pdr(id: u16, entity: EntityRef, sets: &[(u16, u8)]) -> StatePdr {
    StatePdr {
        terminus_handle: 0,
        id,
        entity,
        composite: sets
            .iter()
            .map(|&(state_set_id, _)| StateSetDef {
                state_set_id,
                possible_states: Bytes::from_static(&[0xff]),
            })
            .collect(),
    }
}

fn state_fields(sets: &[(u16, u8)]) -> Vec<StateField> {
    sets.iter()
        .map(|&(_, present_state)| StateField {
            operational_state: operational_state::ENABLED,
            present_state,
        })
        .collect()
}

// ── LoopbackBus ─────────────────────────────────────────────────────

/// In-process bus holding any number of [`SimTerminus`] instances.
#[derive(Default)]
pub struct LoopbackBus {
    termini: Mutex<HashMap<EndpointAddress, SimTerminus>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EndpointAddress, SimTerminus>> {
        self.termini.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plug a terminus into the bus, replacing any previous one at its address.
    pub fn attach(&self, terminus: SimTerminus) {
        self.lock().insert(terminus.address, terminus);
    }

    /// Unplug the terminus at `address`; later requests fail as disconnected.
    pub fn detach(&self, address: EndpointAddress) -> bool {
        self.lock().remove(&address).is_some()
    }

    /// Make platform reads (not enumeration) time out, or recover them.
    pub fn set_reads_failing(&self, address: EndpointAddress, failing: bool) {
        if let Some(t) = self.lock().get_mut(&address) {
            t.reads_failing = failing;
        }
    }

    pub fn set_unresponsive(&self, address: EndpointAddress, unresponsive: bool) {
        if let Some(t) = self.lock().get_mut(&address) {
            t.unresponsive = unresponsive;
        }
    }

    /// Change the present value of a numeric sensor or effecter.
    pub fn set_numeric(&self, address: EndpointAddress, id: u16, raw: i64) {
        if let Some((_, reading)) = self
            .lock()
            .get_mut(&address)
            .and_then(|t| t.numeric.get_mut(&id))
        {
            reading.raw = raw;
        }
    }

    /// Every `(type, command)` the terminus at `address` has received.
    pub fn requests(&self, address: EndpointAddress) -> Vec<(PldmType, u8)> {
        self.lock()
            .get(&address)
            .map(|t| t.log.clone())
            .unwrap_or_default()
    }

    /// Number of platform read commands (excluding enumeration) received.
    pub fn read_count(&self, address: EndpointAddress) -> usize {
        self.requests(address)
            .iter()
            .filter(|(t, c)| *t == PldmType::PLATFORM && *c != platform::GET_PDR)
            .count()
    }

    /// TID currently held by the terminus at `address`.
    pub fn tid_of(&self, address: EndpointAddress) -> Option<u8> {
        self.lock().get(&address).map(|t| t.tid)
    }
}

#[async_trait]
impl Transport for LoopbackBus {
    async fn send_request(
        &self,
        endpoint: EndpointAddress,
        request: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, Error> {
        let request = Request::decode(request)?;

        let (response, delay) = {
            let mut termini = self.lock();
            let Some(terminus) = termini.get_mut(&endpoint) else {
                return Err(Error::Disconnected { endpoint });
            };
            (terminus.respond(&request), terminus.delay)
        };

        trace!(%endpoint, command = request.command, answered = response.is_some(), "loopback request");

        match response {
            Some(response) if delay < timeout => {
                tokio::time::sleep(delay).await;
                Ok(response.encode())
            }
            _ => {
                tokio::time::sleep(timeout).await;
                Err(Error::Timeout {
                    endpoint,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}
