// Checked little-endian readers over `Bytes`. Every read reports the
// structure it was decoding so truncation errors are traceable.

use bytes::{Buf, Bytes};

use crate::error::CodecError;

fn need(buf: &Bytes, needed: usize, what: &'static str) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            what,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn u8(buf: &mut Bytes, what: &'static str) -> Result<u8, CodecError> {
    need(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub(crate) fn i8(buf: &mut Bytes, what: &'static str) -> Result<i8, CodecError> {
    need(buf, 1, what)?;
    Ok(buf.get_i8())
}

pub(crate) fn u16(buf: &mut Bytes, what: &'static str) -> Result<u16, CodecError> {
    need(buf, 2, what)?;
    Ok(buf.get_u16_le())
}

pub(crate) fn i16(buf: &mut Bytes, what: &'static str) -> Result<i16, CodecError> {
    need(buf, 2, what)?;
    Ok(buf.get_i16_le())
}

pub(crate) fn u32(buf: &mut Bytes, what: &'static str) -> Result<u32, CodecError> {
    need(buf, 4, what)?;
    Ok(buf.get_u32_le())
}

pub(crate) fn i32(buf: &mut Bytes, what: &'static str) -> Result<i32, CodecError> {
    need(buf, 4, what)?;
    Ok(buf.get_i32_le())
}

pub(crate) fn f32(buf: &mut Bytes, what: &'static str) -> Result<f32, CodecError> {
    need(buf, 4, what)?;
    Ok(buf.get_f32_le())
}

pub(crate) fn bytes(buf: &mut Bytes, len: usize, what: &'static str) -> Result<Bytes, CodecError> {
    need(buf, len, what)?;
    Ok(buf.split_to(len))
}
