// ── Command payloads ──
//
// Typed builders for the requests the manager issues and decoders for
// their responses. Response encoders exist for in-process responders
// (the loopback bus) and tests.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::message::{PldmType, Request};
use crate::pdr::NumericDataSize;
use crate::wire;

/// Sensor operational states as reported in readings.
pub mod operational_state {
    pub const ENABLED: u8 = 0;
    pub const DISABLED: u8 = 1;
    pub const UNAVAILABLE: u8 = 2;
    pub const STATUS_UNKNOWN: u8 = 3;
    pub const FAILED: u8 = 4;
}

/// Decode a request whose payload starts with a 16-bit sensor/effecter id.
pub fn decode_id_request(mut payload: Bytes) -> Result<u16, CodecError> {
    wire::u16(&mut payload, "request id")
}

// ── Base (type 0) ───────────────────────────────────────────────────

pub mod base {
    use super::{BufMut, Bytes, BytesMut, CodecError, PldmType, Request, wire};

    pub const SET_TID: u8 = 0x01;
    pub const GET_TID: u8 = 0x02;
    pub const GET_PLDM_TYPES: u8 = 0x04;

    /// TID value meaning "not yet assigned".
    pub const TID_UNASSIGNED: u8 = 0x00;
    /// Reserved TID, never assignable.
    pub const TID_RESERVED: u8 = 0xff;

    pub fn get_tid_request() -> Request {
        Request::new(PldmType::BASE, GET_TID, Bytes::new())
    }

    pub fn decode_get_tid(mut payload: Bytes) -> Result<u8, CodecError> {
        wire::u8(&mut payload, "GetTID response")
    }

    pub fn encode_get_tid_response(tid: u8) -> Bytes {
        Bytes::copy_from_slice(&[tid])
    }

    pub fn set_tid_request(tid: u8) -> Request {
        Request::new(PldmType::BASE, SET_TID, Bytes::copy_from_slice(&[tid]))
    }

    pub fn decode_set_tid_request(mut payload: Bytes) -> Result<u8, CodecError> {
        wire::u8(&mut payload, "SetTID request")
    }

    pub fn get_types_request() -> Request {
        Request::new(PldmType::BASE, GET_PLDM_TYPES, Bytes::new())
    }

    /// Bitfield of message types a terminus supports.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct SupportedTypes(u64);

    impl SupportedTypes {
        pub fn from_types(types: &[PldmType]) -> Self {
            Self(
                types
                    .iter()
                    .filter(|t| t.0 < 64)
                    .fold(0, |acc, t| acc | (1u64 << t.0)),
            )
        }

        pub fn contains(self, pldm_type: PldmType) -> bool {
            pldm_type.0 < 64 && self.0 & (1u64 << pldm_type.0) != 0
        }
    }

    pub fn decode_get_types(mut payload: Bytes) -> Result<SupportedTypes, CodecError> {
        let raw = wire::bytes(&mut payload, 8, "GetPLDMTypes response")?;
        let mut bits = [0u8; 8];
        bits.copy_from_slice(&raw);
        Ok(SupportedTypes(u64::from_le_bytes(bits)))
    }

    pub fn encode_get_types_response(types: SupportedTypes) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64_le(types.0);
        buf.freeze()
    }
}

// ── Platform (type 2) ───────────────────────────────────────────────

pub mod platform {
    use super::{
        BufMut, Bytes, BytesMut, CodecError, Deserialize, NumericDataSize, PldmType, Request,
        Serialize, operational_state, wire,
    };

    pub const GET_SENSOR_READING: u8 = 0x11;
    pub const GET_STATE_SENSOR_READINGS: u8 = 0x21;
    pub const GET_NUMERIC_EFFECTER_VALUE: u8 = 0x32;
    pub const GET_STATE_EFFECTER_STATES: u8 = 0x39;
    pub const GET_PDR: u8 = 0x51;

    const TRANSFER_OP_GET_FIRST_PART: u8 = 0x01;
    const TRANSFER_FLAG_START_AND_END: u8 = 0x05;

    // ── GetPDR ──

    /// Single-part GetPDR response.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct GetPdrResponse {
        /// Handle of the next record; `0` marks the last record.
        pub next_record_handle: u32,
        pub record: Bytes,
    }

    pub fn get_pdr_request(record_handle: u32) -> Request {
        let mut buf = BytesMut::with_capacity(13);
        buf.put_u32_le(record_handle);
        buf.put_u32_le(0); // data transfer handle
        buf.put_u8(TRANSFER_OP_GET_FIRST_PART);
        buf.put_u16_le(u16::MAX); // request count
        buf.put_u16_le(0); // record change number
        Request::new(PldmType::PLATFORM, GET_PDR, buf.freeze())
    }

    pub fn decode_get_pdr_request(mut payload: Bytes) -> Result<u32, CodecError> {
        wire::u32(&mut payload, "GetPDR request")
    }

    pub fn decode_get_pdr(mut payload: Bytes) -> Result<GetPdrResponse, CodecError> {
        let next_record_handle = wire::u32(&mut payload, "GetPDR response")?;
        let _next_transfer_handle = wire::u32(&mut payload, "GetPDR response")?;
        let flag = wire::u8(&mut payload, "GetPDR response")?;
        if flag != TRANSFER_FLAG_START_AND_END {
            return Err(CodecError::UnexpectedValue {
                field: "transfer flag",
                value: u32::from(flag),
            });
        }
        let count = usize::from(wire::u16(&mut payload, "GetPDR response")?);
        let record = wire::bytes(&mut payload, count, "GetPDR record data")?;
        Ok(GetPdrResponse {
            next_record_handle,
            record,
        })
    }

    pub fn encode_get_pdr_response(next_record_handle: u32, record: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(11 + record.len());
        buf.put_u32_le(next_record_handle);
        buf.put_u32_le(0);
        buf.put_u8(TRANSFER_FLAG_START_AND_END);
        buf.put_u16_le(u16::try_from(record.len()).unwrap_or(u16::MAX));
        buf.put_slice(record);
        buf.freeze()
    }

    // ── Numeric reads ──

    /// Present value of a numeric sensor or effecter, raw (undecoded).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct NumericReading {
        pub operational_state: u8,
        pub raw: i64,
    }

    pub fn get_sensor_reading_request(sensor_id: u16) -> Request {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u16_le(sensor_id);
        buf.put_u8(0); // no rearm
        Request::new(PldmType::PLATFORM, GET_SENSOR_READING, buf.freeze())
    }

    pub fn decode_get_sensor_reading(mut payload: Bytes) -> Result<NumericReading, CodecError> {
        let size = NumericDataSize::from_code(wire::u8(&mut payload, "GetSensorReading")?)?;
        let operational_state = wire::u8(&mut payload, "GetSensorReading")?;
        // event enable, present/previous/event states
        let _ = wire::bytes(&mut payload, 4, "GetSensorReading")?;
        let raw = size.read(&mut payload, "GetSensorReading value")?;
        Ok(NumericReading {
            operational_state,
            raw,
        })
    }

    pub fn encode_get_sensor_reading_response(
        size: NumericDataSize,
        reading: NumericReading,
    ) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        buf.put_u8(size.code());
        buf.put_u8(reading.operational_state);
        buf.put_slice(&[0, 0, 0, 0]);
        size.write(&mut buf, reading.raw);
        buf.freeze()
    }

    pub fn get_numeric_effecter_value_request(effecter_id: u16) -> Request {
        let mut buf = BytesMut::with_capacity(2);
        buf.put_u16_le(effecter_id);
        Request::new(PldmType::PLATFORM, GET_NUMERIC_EFFECTER_VALUE, buf.freeze())
    }

    /// Effecter operational states are folded onto the sensor scale.
    fn effecter_operational_state(raw: u8) -> u8 {
        match raw {
            0 | 1 => operational_state::ENABLED,
            2 => operational_state::DISABLED,
            3 => operational_state::UNAVAILABLE,
            _ => operational_state::STATUS_UNKNOWN,
        }
    }

    pub fn decode_get_numeric_effecter_value(
        mut payload: Bytes,
    ) -> Result<NumericReading, CodecError> {
        let size = NumericDataSize::from_code(wire::u8(&mut payload, "GetNumericEffecterValue")?)?;
        let state = wire::u8(&mut payload, "GetNumericEffecterValue")?;
        let _pending = size.read(&mut payload, "GetNumericEffecterValue pending")?;
        let raw = size.read(&mut payload, "GetNumericEffecterValue present")?;
        Ok(NumericReading {
            operational_state: effecter_operational_state(state),
            raw,
        })
    }

    pub fn encode_get_numeric_effecter_value_response(
        size: NumericDataSize,
        reading: NumericReading,
    ) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        buf.put_u8(size.code());
        buf.put_u8(if reading.operational_state == operational_state::ENABLED {
            1
        } else {
            2
        });
        size.write(&mut buf, reading.raw);
        size.write(&mut buf, reading.raw);
        buf.freeze()
    }

    // ── State reads ──

    /// One composite element of a state read.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StateField {
        pub operational_state: u8,
        pub present_state: u8,
    }

    pub fn get_state_sensor_readings_request(sensor_id: u16) -> Request {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u16_le(sensor_id);
        buf.put_u8(0); // rearm bitfield
        buf.put_u8(0); // reserved
        Request::new(PldmType::PLATFORM, GET_STATE_SENSOR_READINGS, buf.freeze())
    }

    pub fn decode_get_state_sensor_readings(
        mut payload: Bytes,
    ) -> Result<Vec<StateField>, CodecError> {
        let count = wire::u8(&mut payload, "GetStateSensorReadings")?;
        (0..count)
            .map(|_| {
                let operational_state = wire::u8(&mut payload, "state field")?;
                let present_state = wire::u8(&mut payload, "state field")?;
                let _previous = wire::u8(&mut payload, "state field")?;
                let _event = wire::u8(&mut payload, "state field")?;
                Ok(StateField {
                    operational_state,
                    present_state,
                })
            })
            .collect()
    }

    pub fn encode_get_state_sensor_readings_response(fields: &[StateField]) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + fields.len() * 4);
        buf.put_u8(u8::try_from(fields.len()).unwrap_or(u8::MAX));
        for field in fields.iter().take(usize::from(u8::MAX)) {
            buf.put_u8(field.operational_state);
            buf.put_u8(field.present_state);
            buf.put_u8(field.present_state);
            buf.put_u8(field.present_state);
        }
        buf.freeze()
    }

    pub fn get_state_effecter_states_request(effecter_id: u16) -> Request {
        let mut buf = BytesMut::with_capacity(2);
        buf.put_u16_le(effecter_id);
        Request::new(PldmType::PLATFORM, GET_STATE_EFFECTER_STATES, buf.freeze())
    }

    pub fn decode_get_state_effecter_states(
        mut payload: Bytes,
    ) -> Result<Vec<StateField>, CodecError> {
        let count = wire::u8(&mut payload, "GetStateEffecterStates")?;
        (0..count)
            .map(|_| {
                let state = wire::u8(&mut payload, "effecter field")?;
                let _pending = wire::u8(&mut payload, "effecter field")?;
                let present_state = wire::u8(&mut payload, "effecter field")?;
                Ok(StateField {
                    operational_state: effecter_operational_state(state),
                    present_state,
                })
            })
            .collect()
    }

    pub fn encode_get_state_effecter_states_response(fields: &[StateField]) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + fields.len() * 3);
        buf.put_u8(u8::try_from(fields.len()).unwrap_or(u8::MAX));
        for field in fields.iter().take(usize::from(u8::MAX)) {
            buf.put_u8(if field.operational_state == operational_state::ENABLED {
                1
            } else {
                2
            });
            buf.put_u8(field.present_state);
            buf.put_u8(field.present_state);
        }
        buf.freeze()
    }
}
