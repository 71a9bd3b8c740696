//! Frame Codec
//!
//! Pure conversion between raw bytes and RFC 6455 frames. No I/O.
//!
//! Wire layout:
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Masking-key (0 or 4 bytes)     |          Payload         ...
//! +------------------------------------+---------------------------
//! ```

use super::error::FrameError;

/// Largest payload that fits the 7-bit length field
const MAX_SHORT_LEN: usize = 125;

/// Largest payload that fits the 16-bit extended length field
const MAX_MEDIUM_LEN: usize = 65535;

/// Close status codes used by the server
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
}

/// Frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Parse the low nibble of the first header byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    /// Close, ping and pong
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// A single decoded frame with its payload already unmasked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message
    pub fin: bool,
    pub opcode: OpCode,
    /// Whether the sender masked the payload
    pub masked: bool,
    pub mask_key: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Outcome of a decode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A full frame, and how many bytes of the buffer it occupied
    Complete { frame: Frame, consumed: usize },
    /// Not enough bytes yet; keep the buffer and wait
    Incomplete,
    /// The buffer can never become a valid frame
    Malformed(FrameError),
}

/// Decode one frame from the front of `buffer`
pub fn decode(buffer: &[u8]) -> Decoded {
    decode_with_limit(buffer, u64::MAX)
}

/// Decode one frame, rejecting declared payloads larger than `max_payload`
///
/// The limit is checked as soon as the length field is readable, before any
/// payload has arrived.
pub fn decode_with_limit(buffer: &[u8], max_payload: u64) -> Decoded {
    if buffer.len() < 2 {
        return Decoded::Incomplete;
    }

    let first = buffer[0];
    let second = buffer[1];

    let reserved = first & 0x70;
    if reserved != 0 {
        return Decoded::Malformed(FrameError::ReservedBits(reserved));
    }

    let opcode = match OpCode::from_u8(first & 0x0F) {
        Some(op) => op,
        None => return Decoded::Malformed(FrameError::UnknownOpcode(first & 0x0F)),
    };
    let fin = first & 0x80 != 0;
    let masked = second & 0x80 != 0;

    let (payload_len, mut offset) = match second & 0x7F {
        126 => {
            if buffer.len() < 4 {
                return Decoded::Malformed(FrameError::TruncatedLength {
                    width: 2,
                    available: buffer.len() - 2,
                });
            }
            (u16::from_be_bytes([buffer[2], buffer[3]]) as u64, 4)
        }
        127 => {
            if buffer.len() < 10 {
                return Decoded::Malformed(FrameError::TruncatedLength {
                    width: 8,
                    available: buffer.len() - 2,
                });
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buffer[2..10]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Decoded::Malformed(FrameError::LengthOverflow);
            }
            (len, 10)
        }
        short => (short as u64, 2),
    };

    if opcode.is_control() {
        if !fin {
            return Decoded::Malformed(FrameError::FragmentedControl);
        }
        if payload_len > MAX_SHORT_LEN as u64 {
            return Decoded::Malformed(FrameError::ControlTooLarge(payload_len));
        }
    }

    if payload_len > max_payload {
        return Decoded::Malformed(FrameError::PayloadTooLarge {
            len: payload_len,
            limit: max_payload,
        });
    }

    let mask_key = if masked {
        if buffer.len() < offset + 4 {
            return Decoded::Incomplete;
        }
        let key = [
            buffer[offset],
            buffer[offset + 1],
            buffer[offset + 2],
            buffer[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let payload_len = match usize::try_from(payload_len) {
        Ok(len) => len,
        Err(_) => {
            return Decoded::Malformed(FrameError::PayloadTooLarge {
                len: payload_len,
                limit: usize::MAX as u64,
            })
        }
    };

    let end = match offset.checked_add(payload_len) {
        Some(end) => end,
        None => return Decoded::Malformed(FrameError::LengthOverflow),
    };
    if buffer.len() < end {
        return Decoded::Incomplete;
    }

    let mut payload = buffer[offset..end].to_vec();
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Decoded::Complete {
        frame: Frame {
            fin,
            opcode,
            masked,
            mask_key,
            payload,
        },
        consumed: end,
    }
}

/// XOR `payload` in place with the 4-byte key (masking is its own inverse)
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Encode an unmasked server frame using the minimal length encoding
pub fn encode(payload: &[u8], opcode: OpCode, fin: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    write_header(&mut out, payload.len(), opcode, fin, false);
    out.extend_from_slice(payload);
    out
}

/// Encode a masked frame, as a client would send it
pub fn encode_masked(payload: &[u8], opcode: OpCode, fin: bool, key: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    write_header(&mut out, payload.len(), opcode, fin, true);
    out.extend_from_slice(&key);
    let start = out.len();
    out.extend_from_slice(payload);
    apply_mask(&mut out[start..], key);
    out
}

fn write_header(out: &mut Vec<u8>, len: usize, opcode: OpCode, fin: bool, masked: bool) {
    let fin_bit: u8 = if fin { 0x80 } else { 0x00 };
    let mask_bit: u8 = if masked { 0x80 } else { 0x00 };

    let first = fin_bit | opcode.as_u8();

    out.push(first);
    if len <= MAX_SHORT_LEN {
        out.push(mask_bit | len as u8);
    } else if len <= MAX_MEDIUM_LEN {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Single final text frame
pub fn text(payload: &str) -> Vec<u8> {
    encode(payload.as_bytes(), OpCode::Text, true)
}

pub fn ping(payload: &[u8]) -> Vec<u8> {
    encode(payload, OpCode::Ping, true)
}

pub fn pong(payload: &[u8]) -> Vec<u8> {
    encode(payload, OpCode::Pong, true)
}

/// Close frame carrying a status code and a reason truncated to fit 125 bytes
pub fn close(code: u16, reason: &str) -> Vec<u8> {
    let mut end = reason.len().min(MAX_SHORT_LEN - 2);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    encode(&payload, OpCode::Close, true)
}

/// Split a close payload into status code and reason
///
/// Returns `None` for an empty or one-byte payload.
pub fn parse_close_payload(payload: &[u8]) -> Option<(u16, String)> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    Some((code, reason))
}
