// ── Platform data records ──
//
// Records are fetched one at a time with GetPDR and describe the
// sensors and effecters a terminus exposes. Every record starts with a
// 10-byte common header; the body layout depends on the record type.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::wire;

const HEADER_LEN: usize = 10;
const PDR_VERSION: u8 = 1;

/// Record type codes understood by the codec.
pub mod pdr_type {
    pub const NUMERIC_SENSOR: u8 = 2;
    pub const STATE_SENSOR: u8 = 4;
    pub const NUMERIC_EFFECTER: u8 = 9;
    pub const STATE_EFFECTER: u8 = 11;
    pub const OEM: u8 = 127;
}

// ── Shared pieces ───────────────────────────────────────────────────

/// Entity the record is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: u16,
    pub entity_instance: u16,
    pub container_id: u16,
}

impl EntityRef {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            entity_type: wire::u16(buf, "entity")?,
            entity_instance: wire::u16(buf, "entity")?,
            container_id: wire::u16(buf, "entity")?,
        })
    }

    fn encode(self, buf: &mut BytesMut) {
        buf.put_u16_le(self.entity_type);
        buf.put_u16_le(self.entity_instance);
        buf.put_u16_le(self.container_id);
    }
}

/// Width and signedness of a numeric reading on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumericDataSize {
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
}

impl NumericDataSize {
    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        Ok(match code {
            0 => Self::U8,
            1 => Self::S8,
            2 => Self::U16,
            3 => Self::S16,
            4 => Self::U32,
            5 => Self::S32,
            other => {
                return Err(CodecError::UnexpectedValue {
                    field: "numeric data size",
                    value: u32::from(other),
                });
            }
        })
    }

    pub const fn code(self) -> u8 {
        match self {
            Self::U8 => 0,
            Self::S8 => 1,
            Self::U16 => 2,
            Self::S16 => 3,
            Self::U32 => 4,
            Self::S32 => 5,
        }
    }

    /// Read one value of this size, widened to `i64`.
    pub fn read(self, buf: &mut Bytes, what: &'static str) -> Result<i64, CodecError> {
        Ok(match self {
            Self::U8 => i64::from(wire::u8(buf, what)?),
            Self::S8 => i64::from(wire::i8(buf, what)?),
            Self::U16 => i64::from(wire::u16(buf, what)?),
            Self::S16 => i64::from(wire::i16(buf, what)?),
            Self::U32 => i64::from(wire::u32(buf, what)?),
            Self::S32 => i64::from(wire::i32(buf, what)?),
        })
    }

    /// Write `value`, saturating at the bounds of this size.
    pub fn write(self, buf: &mut BytesMut, value: i64) {
        match self {
            Self::U8 => buf.put_u8(u8::try_from(value.clamp(0, 0xff)).unwrap_or(u8::MAX)),
            Self::S8 => buf.put_i8(i8::try_from(value.clamp(-128, 127)).unwrap_or(i8::MAX)),
            Self::U16 => {
                buf.put_u16_le(u16::try_from(value.clamp(0, 0xffff)).unwrap_or(u16::MAX));
            }
            Self::S16 => buf.put_i16_le(
                i16::try_from(value.clamp(i64::from(i16::MIN), i64::from(i16::MAX)))
                    .unwrap_or(i16::MAX),
            ),
            Self::U32 => buf.put_u32_le(
                u32::try_from(value.clamp(0, i64::from(u32::MAX))).unwrap_or(u32::MAX),
            ),
            Self::S32 => buf.put_i32_le(
                i32::try_from(value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)))
                    .unwrap_or(i32::MAX),
            ),
        }
    }
}

// ── Record bodies ───────────────────────────────────────────────────

/// Numeric sensor (type 2) or numeric effecter (type 9) body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericPdr {
    pub terminus_handle: u16,
    /// Sensor id or effecter id, depending on the record type.
    pub id: u16,
    pub entity: EntityRef,
    pub base_unit: u8,
    pub unit_modifier: i8,
    pub data_size: NumericDataSize,
    pub resolution: f32,
    pub offset: f32,
}

impl NumericPdr {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            terminus_handle: wire::u16(buf, "numeric record")?,
            id: wire::u16(buf, "numeric record")?,
            entity: EntityRef::decode(buf)?,
            base_unit: wire::u8(buf, "numeric record")?,
            unit_modifier: wire::i8(buf, "numeric record")?,
            data_size: NumericDataSize::from_code(wire::u8(buf, "numeric record")?)?,
            resolution: wire::f32(buf, "numeric record")?,
            offset: wire::f32(buf, "numeric record")?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.terminus_handle);
        buf.put_u16_le(self.id);
        self.entity.encode(buf);
        buf.put_u8(self.base_unit);
        buf.put_i8(self.unit_modifier);
        buf.put_u8(self.data_size.code());
        buf.put_f32_le(self.resolution);
        buf.put_f32_le(self.offset);
    }
}

/// One composite element of a state sensor or effecter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSetDef {
    pub state_set_id: u16,
    /// Bitfield of states the element can report.
    pub possible_states: Bytes,
}

/// State sensor (type 4) or state effecter (type 11) body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePdr {
    pub terminus_handle: u16,
    /// Sensor id or effecter id, depending on the record type.
    pub id: u16,
    pub entity: EntityRef,
    pub composite: Vec<StateSetDef>,
}

impl StatePdr {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let terminus_handle = wire::u16(buf, "state record")?;
        let id = wire::u16(buf, "state record")?;
        let entity = EntityRef::decode(buf)?;
        let _init = wire::u8(buf, "state record")?;
        let _aux_names = wire::u8(buf, "state record")?;
        let count = wire::u8(buf, "state record")?;
        if count == 0 {
            return Err(CodecError::UnexpectedValue {
                field: "composite count",
                value: 0,
            });
        }

        let mut composite = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let state_set_id = wire::u16(buf, "state set")?;
            let size = wire::u8(buf, "state set")?;
            let possible_states = wire::bytes(buf, usize::from(size), "possible states")?;
            composite.push(StateSetDef {
                state_set_id,
                possible_states,
            });
        }

        Ok(Self {
            terminus_handle,
            id,
            entity,
            composite,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.terminus_handle);
        buf.put_u16_le(self.id);
        self.entity.encode(buf);
        buf.put_u8(0); // init: no init
        buf.put_u8(0); // no auxiliary names
        buf.put_u8(u8::try_from(self.composite.len()).unwrap_or(u8::MAX));
        for set in self.composite.iter().take(usize::from(u8::MAX)) {
            buf.put_u16_le(set.state_set_id);
            let states = set.possible_states.slice(..set.possible_states.len().min(0xff));
            buf.put_u8(u8::try_from(states.len()).unwrap_or(u8::MAX));
            buf.put_slice(&states);
        }
    }
}

/// Vendor-defined record (type 127); the body is opaque to the codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OemPdr {
    pub vendor_iana: u32,
    pub data: Bytes,
}

// ── PdrRecord ───────────────────────────────────────────────────────

/// Decoded record body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pdr {
    NumericSensor(NumericPdr),
    StateSensor(StatePdr),
    NumericEffecter(NumericPdr),
    StateEffecter(StatePdr),
    Oem(OemPdr),
    /// A record type this codec does not interpret.
    Unsupported { pdr_type: u8 },
}

impl Pdr {
    pub const fn pdr_type(&self) -> u8 {
        match self {
            Self::NumericSensor(_) => pdr_type::NUMERIC_SENSOR,
            Self::StateSensor(_) => pdr_type::STATE_SENSOR,
            Self::NumericEffecter(_) => pdr_type::NUMERIC_EFFECTER,
            Self::StateEffecter(_) => pdr_type::STATE_EFFECTER,
            Self::Oem(_) => pdr_type::OEM,
            Self::Unsupported { pdr_type } => *pdr_type,
        }
    }
}

/// A full record: common header fields plus the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdrRecord {
    pub record_handle: u32,
    pub record_change: u16,
    pub body: Pdr,
}

impl PdrRecord {
    pub fn new(record_handle: u32, body: Pdr) -> Self {
        Self {
            record_handle,
            record_change: 0,
            body,
        }
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, CodecError> {
        let record_handle = wire::u32(&mut bytes, "record header")?;
        let _version = wire::u8(&mut bytes, "record header")?;
        let kind = wire::u8(&mut bytes, "record header")?;
        let record_change = wire::u16(&mut bytes, "record header")?;
        let declared = usize::from(wire::u16(&mut bytes, "record header")?);
        if declared != bytes.len() {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }

        let body = match kind {
            pdr_type::NUMERIC_SENSOR => Pdr::NumericSensor(NumericPdr::decode(&mut bytes)?),
            pdr_type::STATE_SENSOR => Pdr::StateSensor(StatePdr::decode(&mut bytes)?),
            pdr_type::NUMERIC_EFFECTER => Pdr::NumericEffecter(NumericPdr::decode(&mut bytes)?),
            pdr_type::STATE_EFFECTER => Pdr::StateEffecter(StatePdr::decode(&mut bytes)?),
            pdr_type::OEM => Pdr::Oem(OemPdr {
                vendor_iana: wire::u32(&mut bytes, "oem record")?,
                data: bytes,
            }),
            other => Pdr::Unsupported { pdr_type: other },
        };

        Ok(Self {
            record_handle,
            record_change,
            body,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        match &self.body {
            Pdr::NumericSensor(p) | Pdr::NumericEffecter(p) => p.encode(&mut body),
            Pdr::StateSensor(p) | Pdr::StateEffecter(p) => p.encode(&mut body),
            Pdr::Oem(p) => {
                body.put_u32_le(p.vendor_iana);
                body.put_slice(&p.data);
            }
            Pdr::Unsupported { .. } => {}
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
        buf.put_u32_le(self.record_handle);
        buf.put_u8(PDR_VERSION);
        buf.put_u8(self.body.pdr_type());
        buf.put_u16_le(self.record_change);
        buf.put_u16_le(u16::try_from(body.len()).unwrap_or(u16::MAX));
        buf.put_slice(&body);
        buf.freeze()
    }
}
