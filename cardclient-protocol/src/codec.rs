//! Length-prefixed framing shared by card-server wire formats.
//!
//! Frame format:
//! ```text
//! +---------+------------------+
//! | Length  |     Payload      |
//! | u16 BE  |    (variable)    |
//! +---------+------------------+
//! | 2 bytes |  Length bytes    |
//! ```
//!
//! Protocol plug-ins layer their own message headers (and encryption, if
//! any) inside the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Frame header size: a single big-endian u16 length.
pub const HEADER_SIZE: usize = 2;

/// Maximum payload a frame can carry.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Wrap a payload into a frame.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len(), MAX_FRAME_SIZE));
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    frame.put_u16(payload.len() as u16);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Peek at the payload length of the next frame.
///
/// Returns `None` if the header has not fully arrived.
pub fn decode_header(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    Some(u16::from_be_bytes([buf[0], buf[1]]) as usize)
}

/// Split the next complete frame off the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched when more data is needed.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    let payload_len = match decode_header(buf) {
        Some(len) => len,
        None => return Ok(None),
    };

    if buf.len() < HEADER_SIZE + payload_len {
        return Ok(None);
    }

    buf.advance(HEADER_SIZE);
    Ok(Some(buf.split_to(payload_len).freeze()))
}

/// Read a 24-bit big-endian provider id.
pub fn get_provider_id(buf: &mut impl Buf) -> Result<u32, ProtocolError> {
    if buf.remaining() < 3 {
        return Err(ProtocolError::IncompleteFrame {
            expected: 3,
            actual: buf.remaining(),
        });
    }
    let hi = buf.get_u8() as u32;
    let lo = buf.get_u16() as u32;
    Ok((hi << 16) | lo)
}

/// Write a 24-bit big-endian provider id.
pub fn put_provider_id(buf: &mut BytesMut, provider_id: u32) {
    buf.put_u8((provider_id >> 16) as u8);
    buf.put_u16(provider_id as u16);
}
