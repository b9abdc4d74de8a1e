//! WebSocket frame parsing and serialization
//!
//! This module implements the RFC 6455 §5.2 wire format:
//! - Stateless header decoding that never consumes a partial frame
//! - All 16 opcode values representable, unassigned ones as `Reserved`
//! - Minimal length encoding on write (7-bit, 16-bit, 64-bit)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::mask::apply_mask;
use crate::utf8::validate_utf8;
use crate::{MAX_CONTROL_PAYLOAD, MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Continuation frame
    Continuation,
    /// Text frame
    Text,
    /// Binary frame
    Binary,
    /// Connection close
    Close,
    /// Ping
    Ping,
    /// Pong
    Pong,
    /// Unassigned opcode (0x3-0x7, 0xB-0xF), kept so it can round-trip
    Reserved(u8),
}

impl OpCode {
    /// Parse opcode from the low nibble of a byte
    #[inline]
    pub fn from_u8(byte: u8) -> Self {
        match byte & 0x0F {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            raw => OpCode::Reserved(raw),
        }
    }

    /// Raw 4-bit value
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(raw) => raw & 0x0F,
        }
    }

    /// Check if this is a control frame (high bit of the opcode set)
    #[inline]
    pub fn is_control(&self) -> bool {
        self.as_u8() & 0x08 != 0
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        matches!(self, OpCode::Continuation | OpCode::Text | OpCode::Binary)
    }

    /// Check if this opcode is unassigned by RFC 6455
    #[inline]
    pub fn is_reserved(&self) -> bool {
        matches!(self, OpCode::Reserved(_))
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1 (used for compression)
    pub rsv1: bool,
    /// RSV2 (reserved)
    pub rsv2: bool,
    /// RSV3 (reserved)
    pub rsv3: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag (must be true for client->server)
    pub masked: bool,
    /// Payload length
    pub payload_len: u64,
    /// Masking key (if masked)
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Get the total header size in bytes
    #[inline]
    pub fn header_size(&self) -> usize {
        let mut size = 2;

        if self.payload_len > MEDIUM_MESSAGE_THRESHOLD as u64 {
            size += 8;
        } else if self.payload_len > SMALL_MESSAGE_THRESHOLD as u64 {
            size += 2;
        }

        if self.masked {
            size += 4;
        }

        size
    }

    /// Encode the frame header into a buffer
    #[inline]
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut b0 = self.opcode.as_u8();
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        if self.rsv2 {
            b0 |= 0x20;
        }
        if self.rsv3 {
            b0 |= 0x10;
        }
        buf.put_u8(b0);

        let mask_bit = if self.masked { 0x80 } else { 0x00 };

        if self.payload_len <= SMALL_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(self.payload_len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(self.payload_len);
        }

        if let Some(mask) = self.mask {
            buf.put_slice(&mask);
        }
    }
}

/// A complete WebSocket frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Frame payload (already unmasked)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new unmasked frame
    pub fn new(opcode: OpCode, payload: Bytes, fin: bool) -> Self {
        Self {
            header: FrameHeader {
                fin,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode,
                masked: false,
                payload_len: payload.len() as u64,
                mask: None,
            },
            payload,
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data.into(), true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data.into(), true)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data.into(), true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data.into(), true)
    }

    /// Create a close frame
    #[inline]
    pub fn close(code: u16, reason: &str) -> Self {
        let payload = CloseReason::new(code, reason).to_payload();
        Self::new(OpCode::Close, Bytes::from(payload), true)
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.opcode.is_control()
    }

    /// Check if this is the final fragment
    #[inline]
    pub fn is_final(&self) -> bool {
        self.header.fin
    }

    /// Serialize this frame, masking the payload when the header carries a key
    pub fn encode(&self, buf: &mut BytesMut) {
        encode_frame_with_rsv(
            buf,
            self.header.opcode,
            &self.payload,
            self.header.fin,
            self.header.mask,
            self.header.rsv1,
        );
    }

    /// Parse and validate a close frame payload.
    ///
    /// Empty payloads carry no status. A one-byte payload, a status code that
    /// may not appear on the wire, or a non-UTF-8 reason are errors.
    pub fn parse_close(&self) -> Result<Option<CloseReason>> {
        parse_close_payload(&self.payload)
    }
}

/// Parse a close frame payload (see [`Frame::parse_close`])
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseReason>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(Error::Protocol("invalid close frame payload")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !CloseReason::is_valid_code(code) {
                return Err(Error::InvalidCloseCode(code));
            }
            let text = &payload[2..];
            if !validate_utf8(text) {
                return Err(Error::InvalidUtf8);
            }
            let reason = String::from_utf8_lossy(text).into_owned();
            Ok(Some(CloseReason::new(code, reason)))
        }
    }
}

/// Decoder policy for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Largest payload accepted in a single frame
    pub max_frame_size: usize,
    /// `Some(true)` requires masked frames (server role), `Some(false)`
    /// forbids them (client role), `None` accepts both
    pub expect_masked: Option<bool>,
    /// Whether RSV1 is allowed (compression negotiated)
    pub allow_rsv1: bool,
    /// Decode unassigned opcodes instead of rejecting them (fuzzing harnesses)
    pub allow_reserved_opcodes: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            expect_masked: None,
            allow_rsv1: false,
            allow_reserved_opcodes: false,
        }
    }
}

/// Outcome of a header decode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A full header is buffered; `header_len` bytes precede the payload
    Header {
        /// Parsed header
        header: FrameHeader,
        /// Bytes occupied by the header (2-14)
        header_len: usize,
    },
    /// The buffer ends inside the header; retry with more data
    NeedMoreData,
}

/// Decode the frame header at the start of `buf`.
///
/// Never consumes anything. Protocol violations that are visible in the
/// first two bytes are reported before the extended length or mask arrive.
pub fn decode_header(buf: &[u8], opts: &DecodeOptions) -> Result<Decoded> {
    if buf.len() < 2 {
        return Ok(Decoded::NeedMoreData);
    }

    let b0 = buf[0];
    let b1 = buf[1];

    let fin = b0 & 0x80 != 0;
    let rsv1 = b0 & 0x40 != 0;
    let rsv2 = b0 & 0x20 != 0;
    let rsv3 = b0 & 0x10 != 0;

    if rsv1 && !opts.allow_rsv1 {
        return Err(Error::Protocol(
            "RSV1 must be 0 (compression not negotiated)",
        ));
    }
    if rsv2 || rsv3 {
        return Err(Error::Protocol("RSV2 and RSV3 must be 0"));
    }

    let opcode = OpCode::from_u8(b0);
    if opcode.is_reserved() && !opts.allow_reserved_opcodes {
        return Err(Error::Protocol("reserved opcode"));
    }

    if opcode.is_control() && !fin {
        return Err(Error::Protocol("control frame must not be fragmented"));
    }

    let masked = b1 & 0x80 != 0;
    let len_byte = b1 & 0x7F;

    match opts.expect_masked {
        Some(true) if !masked => return Err(Error::Protocol("client frames must be masked")),
        Some(false) if masked => {
            return Err(Error::Protocol("server frames must not be masked"));
        }
        _ => {}
    }

    if opcode.is_control() && len_byte as usize > MAX_CONTROL_PAYLOAD {
        return Err(Error::Protocol("control frame too large"));
    }

    let (payload_len, len_size) = match len_byte {
        0..=125 => (len_byte as u64, 0),
        126 => {
            if buf.len() < 4 {
                return Ok(Decoded::NeedMoreData);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 2)
        }
        _ => {
            if buf.len() < 10 {
                return Ok(Decoded::NeedMoreData);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(Error::InvalidFrame("payload length MSB must be 0"));
            }
            (len, 8)
        }
    };

    if payload_len > opts.max_frame_size as u64 {
        return Err(Error::FrameTooLarge);
    }

    let base = 2 + len_size;
    let header_len = base + if masked { 4 } else { 0 };
    if buf.len() < header_len {
        return Ok(Decoded::NeedMoreData);
    }

    let mask = masked.then(|| [buf[base], buf[base + 1], buf[base + 2], buf[base + 3]]);

    Ok(Decoded::Header {
        header: FrameHeader {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            masked,
            payload_len,
            mask,
        },
        header_len,
    })
}

/// Decode one complete frame from the front of `buf`.
///
/// Returns:
/// - `Ok(Some(frame))` and consumes the frame's bytes when header and
///   payload are both buffered
/// - `Ok(None)` if more data is needed; nothing is consumed
/// - `Err(e)` if the frame is malformed
pub fn decode_frame(buf: &mut BytesMut, opts: &DecodeOptions) -> Result<Option<Frame>> {
    let (header, header_len) = match decode_header(buf, opts)? {
        Decoded::Header { header, header_len } => (header, header_len),
        Decoded::NeedMoreData => return Ok(None),
    };

    // bounded by max_frame_size above, so this fits in usize
    let payload_len = header.payload_len as usize;
    if buf.len() < header_len + payload_len {
        return Ok(None);
    }

    buf.advance(header_len);
    let mut payload = buf.split_to(payload_len);
    if let Some(mask) = header.mask {
        apply_mask(&mut payload, mask);
    }

    Ok(Some(Frame {
        header,
        payload: payload.freeze(),
    }))
}

/// Encode a frame into a buffer
///
/// For masked frames (client mode) the payload is copied and masked.
#[inline]
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    encode_frame_with_rsv(buf, opcode, payload, fin, mask, false)
}

/// Encode a frame with RSV1 bit control (for compression)
///
/// When `rsv1` is true, sets the RSV1 bit indicating compressed data.
pub fn encode_frame_with_rsv(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
    rsv1: bool,
) {
    let payload_len = payload.len();

    let header_size = 2
        + if payload_len > MEDIUM_MESSAGE_THRESHOLD {
            8
        } else if payload_len > SMALL_MESSAGE_THRESHOLD {
            2
        } else {
            0
        }
        + if mask.is_some() { 4 } else { 0 };

    buf.reserve(header_size + payload_len);

    let mut b0 = opcode.as_u8();
    if fin {
        b0 |= 0x80;
    }
    if rsv1 {
        b0 |= 0x40;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };

    if payload_len <= SMALL_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(m) = mask {
        buf.put_slice(&m);
        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], m);
    } else {
        buf.put_slice(payload);
    }
}
