//! Framing: every packet travels as exactly one 512-byte frame.
//!
//! ```text
//! [0]        opcode
//! [1]        broadcast flag (0 = unicast, 1 = broadcast)
//! [2, 508)   variant payload, zero padded
//! [508, 512) CRC32 (big-endian) over [0, 508)
//! ```
//!
//! Multi-byte fields are big-endian; strings are raw UTF-8 followed by a NUL.

use crate::integrity;
use crate::protocol::{self, Message, Packet};

/// Size of every frame on the wire.
pub const FRAME_SIZE: usize = 512;
/// Trailing checksum size.
pub const CRC_SIZE: usize = 4;
/// Bytes covered by the checksum: header plus payload.
pub const BODY_SIZE: usize = FRAME_SIZE - CRC_SIZE;
/// Opcode and broadcast flag.
pub const HEADER_SIZE: usize = 2;
/// Room left for variant fields.
pub const PAYLOAD_SIZE: usize = BODY_SIZE - HEADER_SIZE;

/// One encoded packet.
pub type Frame = [u8; FRAME_SIZE];

const BROADCAST: u8 = 1;
const UNICAST: u8 = 0;

/// Encode a packet into a frame: header, variant fields, zero padding, CRC32.
/// Fails instead of truncating when the fields do not fit.
pub fn encode_frame(packet: &Packet) -> Result<Frame, FrameEncodeError> {
    let mut writer = FrameWriter::new(packet.opcode().as_byte(), packet.is_broadcast());
    packet.message().build(&mut writer)?;
    Ok(writer.finish())
}

/// Number of payload bytes the message occupies once encoded (excluding header, padding and CRC).
pub fn encoded_len(message: &Message) -> Result<usize, FrameEncodeError> {
    let mut writer = FrameWriter::new(message.opcode().as_byte(), false);
    message.build(&mut writer)?;
    Ok(writer.written())
}

/// Decode one frame. Checks size, then checksum, then opcode, then the variant fields.
pub fn decode_frame(bytes: &[u8]) -> Result<Packet, FrameDecodeError> {
    if bytes.len() != FRAME_SIZE {
        return Err(FrameDecodeError::SizeMismatch(bytes.len()));
    }
    let (body, trailer) = bytes.split_at(BODY_SIZE);
    let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = integrity::checksum(body);
    if actual != expected {
        return Err(FrameDecodeError::ChecksumMismatch { expected, actual });
    }
    let extract = protocol::extractor(body[0]).ok_or(FrameDecodeError::UnknownOpcode(body[0]))?;
    let broadcast = match body[1] {
        UNICAST => false,
        BROADCAST => true,
        _ => return Err(FrameDecodeError::Malformed("broadcast flag is neither 0 nor 1")),
    };
    let mut reader = FrameReader::new(&body[HEADER_SIZE..]);
    let message = extract(&mut reader)?;
    let mut packet = Packet::new(message);
    packet.set_broadcast(broadcast);
    Ok(packet)
}

/// Error encoding a packet into a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("field of {needed} bytes overflows frame ({remaining} bytes free)")]
    Overflow { needed: usize, remaining: usize },
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

/// Corrupt packet: the frame failed validation. The variant says why.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("corrupt packet: frame is {0} bytes, expected {FRAME_SIZE}")]
    SizeMismatch(usize),
    #[error("corrupt packet: opcode {0} is not recognized")]
    UnknownOpcode(u8),
    #[error("corrupt packet: checksum {actual:#010x} does not match trailer {expected:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("corrupt packet: {0}")]
    Malformed(&'static str),
}

/// Append-only cursor over the usable part of a frame. Writes past byte 508 fail.
pub struct FrameWriter {
    buf: Frame,
    pos: usize,
}

impl FrameWriter {
    fn new(opcode: u8, broadcast: bool) -> Self {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = opcode;
        buf[1] = if broadcast { BROADCAST } else { UNICAST };
        Self {
            buf,
            pos: HEADER_SIZE,
        }
    }

    /// Payload bytes written so far.
    pub fn written(&self) -> usize {
        self.pos - HEADER_SIZE
    }

    /// Payload bytes still free.
    pub fn remaining(&self) -> usize {
        BODY_SIZE - self.pos
    }

    fn reserve(&mut self, needed: usize) -> Result<&mut [u8], FrameEncodeError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(FrameEncodeError::Overflow { needed, remaining });
        }
        let start = self.pos;
        self.pos += needed;
        Ok(&mut self.buf[start..self.pos])
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), FrameEncodeError> {
        self.reserve(1)?[0] = value;
        Ok(())
    }

    pub fn put_bool(&mut self, value: bool) -> Result<(), FrameEncodeError> {
        self.put_u8(u8::from(value))
    }

    pub fn put_u32(&mut self, value: u32) -> Result<(), FrameEncodeError> {
        self.reserve(4)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn put_f64(&mut self, value: f64) -> Result<(), FrameEncodeError> {
        self.reserve(8)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// String bytes plus a NUL terminator.
    pub fn put_str(&mut self, value: &str) -> Result<(), FrameEncodeError> {
        if value.as_bytes().contains(&0) {
            return Err(FrameEncodeError::InvalidField("string contains a NUL byte"));
        }
        let bytes = value.as_bytes();
        let out = self.reserve(bytes.len() + 1)?;
        out[..bytes.len()].copy_from_slice(bytes);
        out[bytes.len()] = 0;
        Ok(())
    }

    /// Padding is already zero; only the checksum is left.
    fn finish(mut self) -> Frame {
        let crc = integrity::checksum(&self.buf[..BODY_SIZE]);
        self.buf[BODY_SIZE..].copy_from_slice(&crc.to_be_bytes());
        self.buf
    }
}

/// Read cursor over the payload region of a verified frame.
pub struct FrameReader<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameDecodeError> {
        if n > self.remaining() {
            return Err(FrameDecodeError::Malformed("field runs past the end of the frame"));
        }
        let payload = self.payload;
        let out = &payload[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Next byte without consuming it; `None` at the end of the payload.
    pub fn peek_u8(&self) -> Option<u8> {
        self.payload.get(self.pos).copied()
    }

    pub fn get_u8(&mut self) -> Result<u8, FrameDecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool, FrameDecodeError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(FrameDecodeError::Malformed("boolean is neither 0 nor 1")),
        }
    }

    pub fn get_u32(&mut self) -> Result<u32, FrameDecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_f64(&mut self) -> Result<f64, FrameDecodeError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(f64::from_be_bytes(b))
    }

    pub fn get_str(&mut self) -> Result<String, FrameDecodeError> {
        let payload = self.payload;
        let rest = &payload[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(FrameDecodeError::Malformed("string is not NUL terminated"))?;
        let s = std::str::from_utf8(&rest[..end])
            .map_err(|_| FrameDecodeError::Malformed("string is not valid UTF-8"))?;
        self.pos += end + 1;
        Ok(s.to_owned())
    }
}
