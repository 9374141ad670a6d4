//! Binary wire-frame encoding
//!
//! When a destination requires re-encoding, each parsed data point is sent
//! as a self-delimiting binary frame instead of a text line:
//!
//! ```text
//! [4 bytes: frame length (big-endian, excludes itself)]
//! [2 bytes: name length (big-endian)]
//! [N bytes: name]
//! [8 bytes: value (f64, big-endian)]
//! [4 bytes: timestamp (u32 seconds, big-endian)]
//! ```
//!
//! Frames are written to the socket as-is, with no trailing newline.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{DataPoint, ProtocolError};

/// Fixed part of the frame body: name length + value + timestamp
const FIXED_BODY_SIZE: usize = 2 + 8 + 4;

/// Encode a data point as a binary frame
pub fn encode_frame(dp: &DataPoint) -> Bytes {
    let body_len = FIXED_BODY_SIZE + dp.name.len();
    let mut buf = BytesMut::with_capacity(4 + body_len);

    buf.put_u32(body_len as u32);
    buf.put_u16(dp.name.len() as u16);
    buf.put_slice(dp.name.as_bytes());
    buf.put_f64(dp.value);
    buf.put_u32(dp.timestamp);

    buf.freeze()
}

/// Decode one binary frame back into a data point
///
/// Returns the data point and the total number of bytes consumed, so callers
/// can walk a stream of concatenated frames.
pub fn decode_frame(buf: &[u8]) -> Result<(DataPoint, usize), ProtocolError> {
    if buf.len() < 4 {
        return Err(ProtocolError::TruncatedFrame {
            needed: 4,
            have: buf.len(),
        });
    }
    let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let total = 4 + body_len;
    if buf.len() < total || body_len < FIXED_BODY_SIZE {
        return Err(ProtocolError::TruncatedFrame {
            needed: total,
            have: buf.len(),
        });
    }

    let body = &buf[4..total];
    let name_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    if body_len != FIXED_BODY_SIZE + name_len {
        return Err(ProtocolError::TruncatedFrame {
            needed: 4 + FIXED_BODY_SIZE + name_len,
            have: buf.len(),
        });
    }

    let name = std::str::from_utf8(&body[2..2 + name_len])
        .map_err(|_| ProtocolError::BadEncoding)?
        .to_string();
    let rest = &body[2 + name_len..];
    let value = f64::from_be_bytes(rest[..8].try_into().unwrap());
    let timestamp = u32::from_be_bytes(rest[8..12].try_into().unwrap());

    Ok((
        DataPoint {
            name,
            value,
            timestamp,
        },
        total,
    ))
}
