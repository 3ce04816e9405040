// ── Message framing ──
//
// Three-byte header shared by every request and response:
//
//   byte 0: Rq(1) | D(1) | rsvd(1) | instance_id(5)
//   byte 1: hdr_ver(2) | type(6)
//   byte 2: command
//
// Responses carry a completion code immediately after the header.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::wire;

const RQ_BIT: u8 = 0x80;
const DATAGRAM_BIT: u8 = 0x40;
const INSTANCE_MASK: u8 = 0x1f;
const TYPE_MASK: u8 = 0x3f;
const HEADER_VERSION: u8 = 0;

// ── InstanceId ──────────────────────────────────────────────────────

/// 5-bit request correlation id, allocated per endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(u8);

impl InstanceId {
    pub const MAX: u8 = INSTANCE_MASK;

    /// Returns `None` for values that do not fit in five bits.
    pub const fn new(raw: u8) -> Option<Self> {
        if raw <= Self::MAX { Some(Self(raw)) } else { None }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// The following id, wrapping after 31.
    #[must_use]
    pub const fn next(self) -> Self {
        Self((self.0 + 1) & INSTANCE_MASK)
    }
}

// ── PldmType / CompletionCode ───────────────────────────────────────

/// Message type (command set) carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PldmType(pub u8);

impl PldmType {
    /// Messaging control and discovery.
    pub const BASE: Self = Self(0);
    /// Platform monitoring and control.
    pub const PLATFORM: Self = Self(2);
}

impl fmt::Display for PldmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BASE => f.write_str("base"),
            Self::PLATFORM => f.write_str("platform"),
            Self(other) => write!(f, "type-{other}"),
        }
    }
}

/// Completion code returned by the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompletionCode(pub u8);

impl CompletionCode {
    pub const SUCCESS: Self = Self(0x00);
    pub const ERROR: Self = Self(0x01);
    pub const ERROR_INVALID_DATA: Self = Self(0x02);
    pub const ERROR_INVALID_LENGTH: Self = Self(0x03);
    pub const ERROR_NOT_READY: Self = Self(0x04);
    pub const ERROR_UNSUPPORTED_CMD: Self = Self(0x05);
    pub const INVALID_SENSOR_ID: Self = Self(0x80);
    pub const INVALID_RECORD_HANDLE: Self = Self(0x82);

    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

impl fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

// ── Header ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    request: bool,
    instance_id: InstanceId,
    pldm_type: PldmType,
    command: u8,
}

impl Header {
    fn encode(self, buf: &mut BytesMut) {
        let mut b0 = self.instance_id.get();
        if self.request {
            b0 |= RQ_BIT;
        }
        buf.put_u8(b0);
        buf.put_u8((HEADER_VERSION << 6) | (self.pldm_type.0 & TYPE_MASK));
        buf.put_u8(self.command);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let b0 = wire::u8(buf, "header")?;
        let b1 = wire::u8(buf, "header")?;
        let command = wire::u8(buf, "header")?;

        if b0 & DATAGRAM_BIT != 0 {
            return Err(CodecError::InvalidHeader("datagram bit set"));
        }
        if b1 >> 6 != HEADER_VERSION {
            return Err(CodecError::InvalidHeader("unsupported header version"));
        }

        Ok(Self {
            request: b0 & RQ_BIT != 0,
            instance_id: InstanceId(b0 & INSTANCE_MASK),
            pldm_type: PldmType(b1 & TYPE_MASK),
            command,
        })
    }
}

// ── Request ─────────────────────────────────────────────────────────

/// An outgoing request with its command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub instance_id: InstanceId,
    pub pldm_type: PldmType,
    pub command: u8,
    pub payload: Bytes,
}

impl Request {
    pub fn new(pldm_type: PldmType, command: u8, payload: Bytes) -> Self {
        Self {
            instance_id: InstanceId::default(),
            pldm_type,
            command,
            payload,
        }
    }

    #[must_use]
    pub fn with_instance_id(mut self, instance_id: InstanceId) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.payload.len());
        Header {
            request: true,
            instance_id: self.instance_id,
            pldm_type: self.pldm_type,
            command: self.command,
        }
        .encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, CodecError> {
        let header = Header::decode(&mut bytes)?;
        if !header.request {
            return Err(CodecError::InvalidHeader("expected a request"));
        }
        Ok(Self {
            instance_id: header.instance_id,
            pldm_type: header.pldm_type,
            command: header.command,
            payload: bytes,
        })
    }
}

// ── Response ────────────────────────────────────────────────────────

/// A decoded response. `payload` excludes the completion code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub instance_id: InstanceId,
    pub pldm_type: PldmType,
    pub command: u8,
    pub completion_code: CompletionCode,
    pub payload: Bytes,
}

impl Response {
    /// Build a response answering `request`.
    pub fn to(request: &Request, completion_code: CompletionCode, payload: Bytes) -> Self {
        Self {
            instance_id: request.instance_id,
            pldm_type: request.pldm_type,
            command: request.command,
            completion_code,
            payload,
        }
    }

    /// Whether this response correlates with `request`.
    pub fn answers(&self, request: &Request) -> bool {
        self.instance_id == request.instance_id
            && self.pldm_type == request.pldm_type
            && self.command == request.command
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.payload.len());
        Header {
            request: false,
            instance_id: self.instance_id,
            pldm_type: self.pldm_type,
            command: self.command,
        }
        .encode(&mut buf);
        buf.put_u8(self.completion_code.0);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, CodecError> {
        let header = Header::decode(&mut bytes)?;
        if header.request {
            return Err(CodecError::InvalidHeader("expected a response"));
        }
        let completion_code = CompletionCode(wire::u8(&mut bytes, "completion code")?);
        Ok(Self {
            instance_id: header.instance_id,
            pldm_type: header.pldm_type,
            command: header.command,
            completion_code,
            payload: bytes,
        })
    }
}
