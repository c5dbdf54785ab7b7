//! Wire codec for the multiplexed overlay frame (spec C1).
//!
//! ```text
//! offset 0  : id[6]      6 printable ASCII bytes
//! offset 6  : NUL        1 byte, value 0x00 (tolerated if missing on decode)
//! offset 7  : type       uint32, little-endian
//! offset 11 : payload    0..N bytes, present iff type == Data
//! ```

use crate::error::FrameError;
use crate::logger;
use std::fmt;

pub const FLOW_ID_LEN: usize = 6;
pub const HEADER_LEN: usize = FLOW_ID_LEN + 1 + 4;

/// Originator-allocated flow identifier: 6 printable ASCII bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId([u8; FLOW_ID_LEN]);

impl FlowId {
    pub fn from_bytes(bytes: [u8; FLOW_ID_LEN]) -> Result<Self, FrameError> {
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            Ok(Self(bytes))
        } else {
            Err(FrameError::InvalidFlowId)
        }
    }

    pub fn as_bytes(&self) -> &[u8; FLOW_ID_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("??????")
    }
}

impl fmt::Debug for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlowId({})", self.as_str())
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameType {
    Data = 0,
    Close = 1,
}

impl FrameType {
    fn from_u32(value: u32) -> Result<Self, FrameError> {
        match value {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::Close),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// A decoded frame borrowing its payload from the source buffer.
#[derive(Debug)]
pub struct Frame<'a> {
    pub id: FlowId,
    pub kind: FrameType,
    pub payload: &'a [u8],
}

/// Encodes a DATA frame carrying `payload` for `id`.
pub fn encode_data(id: FlowId, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    write_header(&mut out, id, FrameType::Data);
    out.extend_from_slice(payload);
    out
}

/// Encodes a CLOSE frame for `id`, with no payload.
pub fn encode_close(id: FlowId) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    write_header(&mut out, id, FrameType::Close);
    out
}

fn write_header(out: &mut Vec<u8>, id: FlowId, kind: FrameType) {
    out.extend_from_slice(id.as_bytes());
    out.push(0u8);
    out.extend_from_slice(&(kind as u32).to_le_bytes());
}

/// Decodes a frame from a complete overlay message. Tolerates a missing
/// trailing NUL at offset 6 (some peers omit it) but requires the full
/// 11-byte header to be present.
pub fn decode(bytes: &[u8]) -> Result<Frame<'_>, FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::TooShort(bytes.len()));
    }
    let mut id_bytes = [0u8; FLOW_ID_LEN];
    id_bytes.copy_from_slice(&bytes[0..FLOW_ID_LEN]);
    let id = FlowId::from_bytes(id_bytes)?;

    let type_bytes: [u8; 4] = bytes[FLOW_ID_LEN + 1..HEADER_LEN].try_into().unwrap();
    let kind = FrameType::from_u32(u32::from_le_bytes(type_bytes))?;

    let payload = match kind {
        FrameType::Data => &bytes[HEADER_LEN..],
        FrameType::Close => {
            if bytes.len() > HEADER_LEN {
                logger::warn(format!(
                    "CLOSE frame for {id} carries {} unexpected trailing bytes, ignoring",
                    bytes.len() - HEADER_LEN
                ));
            }
            &[]
        }
    };

    Ok(Frame { id, kind, payload })
}
