//! Stateful frame engine
//!
//! Turns an arbitrarily chunked byte stream into complete messages and
//! serializes outgoing messages into frames:
//! - Fragment reassembly with control frames interleaved mid-message
//! - Incremental UTF-8 validation of fragmented text
//! - Message-level decompression through a negotiated [`Extension`]
//! - Client-side masking and write-path fragmentation

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::Config;
use crate::deflate::Extension;
use crate::error::{CloseReason, Error, Result};
use crate::frame::{DecodeOptions, Frame, OpCode, decode_frame, encode_frame_with_rsv};
use crate::mask::generate_mask;
use crate::utf8::{StreamingUtf8, validate_utf8};
use crate::MAX_CONTROL_PAYLOAD;

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client (must mask frames)
    Client,
    /// Server (must not mask frames)
    Server,
}

/// WebSocket message (complete, possibly assembled from fragments)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message (UTF-8 validated unless the engine runs lenient)
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
    /// Ping message
    Ping(Bytes),
    /// Pong message
    Pong(Bytes),
    /// Close message
    Close(Option<CloseReason>),
}

impl Message {
    /// Create a text message from a string
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(Bytes::from(s.into()))
    }

    /// Create a binary message
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Create a ping message
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Message::Ping(data.into())
    }

    /// Create a pong message
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Message::Pong(data.into())
    }

    /// Create a close message
    #[inline]
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Message::Close(Some(CloseReason::new(code, reason)))
    }

    /// Check if this is a close message
    #[inline]
    pub fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }

    /// Check if this is a text message
    #[inline]
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Check if this is a binary message
    #[inline]
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    /// Check if this is a control message
    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Message::Ping(_) | Message::Pong(_) | Message::Close(_)
        )
    }

    /// Get message as text (returns None for non-text or non-UTF-8 payloads)
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get message as bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(b) | Message::Binary(b) | Message::Ping(b) | Message::Pong(b) => b,
            Message::Close(_) => &[],
        }
    }

    /// Convert to an owned string, replacing invalid sequences
    ///
    /// Returns None for non-text messages.
    pub fn into_text(self) -> Option<String> {
        match self {
            Message::Text(b) => Some(String::from_utf8_lossy(&b).into_owned()),
            _ => None,
        }
    }

    /// Convert to binary data
    pub fn into_bytes(self) -> Bytes {
        match self {
            Message::Text(b) | Message::Binary(b) | Message::Ping(b) | Message::Pong(b) => b,
            Message::Close(_) => Bytes::new(),
        }
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(Bytes::from(s))
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(v))
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Message::Binary(b)
    }
}

/// One message being reassembled from fragments
#[derive(Debug)]
struct FragmentBuffer {
    opcode: OpCode,
    payload: BytesMut,
    /// RSV1 of the initiating frame
    compressed: bool,
    utf8: StreamingUtf8,
}

impl FragmentBuffer {
    fn new(opcode: OpCode, compressed: bool) -> Self {
        Self {
            opcode,
            payload: BytesMut::new(),
            compressed,
            utf8: StreamingUtf8::new(),
        }
    }

    /// Whether text can be validated as it arrives (compressed text only
    /// becomes checkable after inflating)
    fn streams_utf8(&self, lenient: bool) -> bool {
        self.opcode == OpCode::Text && !self.compressed && !lenient
    }
}

/// Frame parser, message assembler and frame writer for one connection.
///
/// The engine is synchronous; the connection task feeds it bytes in arrival
/// order and writes whatever it encodes.
pub struct FrameEngine {
    role: Role,
    /// Bytes received but not yet forming a complete frame
    buf: BytesMut,
    fragment: Option<FragmentBuffer>,
    extension: Option<Box<dyn Extension>>,
    opts: DecodeOptions,
    max_message_size: usize,
    fragment_size: usize,
    lenient_utf8: bool,
    /// Set after the first protocol error; all later input is ignored
    failed: bool,
    /// A frame-by-frame outgoing message is in progress with compression
    write_compressed: bool,
}

impl FrameEngine {
    /// Create an engine for the given role using the limits from `config`
    pub fn new(role: Role, config: &Config) -> Self {
        Self {
            role,
            buf: BytesMut::with_capacity(crate::RECV_BUFFER_SIZE),
            fragment: None,
            extension: None,
            opts: DecodeOptions {
                max_frame_size: config.max_frame_size,
                expect_masked: Some(role == Role::Server),
                allow_rsv1: false,
                allow_reserved_opcodes: false,
            },
            max_message_size: config.max_message_size,
            fragment_size: config.fragment_size,
            lenient_utf8: config.lenient_utf8,
            failed: false,
            write_compressed: false,
        }
    }

    /// Client engine with default limits
    pub fn client() -> Self {
        Self::new(Role::Client, &Config::default())
    }

    /// Server engine with default limits
    pub fn server() -> Self {
        Self::new(Role::Server, &Config::default())
    }

    /// Install (or remove) the negotiated extension. RSV1 is accepted on
    /// incoming frames only while one is installed.
    pub fn set_extension(&mut self, extension: Option<Box<dyn Extension>>) {
        self.opts.allow_rsv1 = extension.is_some();
        self.extension = extension;
    }

    /// Builder form of [`set_extension`](Self::set_extension)
    pub fn with_extension(mut self, extension: Box<dyn Extension>) -> Self {
        self.set_extension(Some(extension));
        self
    }

    /// Endpoint role
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether an extension is negotiated
    #[inline]
    pub fn has_extension(&self) -> bool {
        self.extension.is_some()
    }

    /// Whether a protocol error has latched the engine
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Bytes buffered waiting for the rest of a frame
    #[inline]
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Whether a fragmented message is being reassembled
    #[inline]
    pub fn in_fragment(&self) -> bool {
        self.fragment.is_some()
    }

    /// Feed a chunk of received bytes.
    ///
    /// The returned iterator yields each message completed by this chunk (and
    /// any bytes left over from earlier calls), in wire order. Partial frames
    /// stay buffered for the next call. After the first error the engine is
    /// latched failed and yields nothing more, ever.
    pub fn received_data(&mut self, chunk: &[u8]) -> Incoming<'_> {
        if !self.failed {
            self.buf.extend_from_slice(chunk);
        }
        Incoming { engine: self }
    }

    /// Feed a chunk and collect the completed messages, stopping at the
    /// first error
    pub fn process(&mut self, chunk: &[u8]) -> Result<Vec<Message>> {
        self.received_data(chunk).collect()
    }

    /// Discard all buffered input, fragment and write state
    pub fn reset(&mut self) {
        self.buf.clear();
        self.fragment = None;
        self.failed = false;
        self.write_compressed = false;
    }

    fn next_message(&mut self) -> Option<Result<Message>> {
        if self.failed {
            return None;
        }

        loop {
            let frame = match decode_frame(&mut self.buf, &self.opts) {
                Ok(Some(frame)) => frame,
                Ok(None) => return None,
                Err(e) => return Some(Err(self.fail(e))),
            };

            trace!(
                opcode = ?frame.header.opcode,
                fin = frame.header.fin,
                len = frame.payload.len(),
                "frame decoded"
            );

            match self.handle_frame(frame) {
                Ok(Some(msg)) => return Some(Ok(msg)),
                Ok(None) => continue,
                Err(e) => return Some(Err(self.fail(e))),
            }
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        debug!(error = %err, buffered = self.buf.len(), "frame engine failed");
        self.failed = true;
        self.buf.clear();
        self.fragment = None;
        err
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        let opcode = frame.header.opcode;

        // RFC 7692: only the first frame of a data message may carry RSV1
        if frame.header.rsv1 && !matches!(opcode, OpCode::Text | OpCode::Binary) {
            return Err(Error::Protocol("RSV1 set on control or continuation frame"));
        }

        match opcode {
            OpCode::Ping => Ok(Some(Message::Ping(frame.payload))),
            OpCode::Pong => Ok(Some(Message::Pong(frame.payload))),
            OpCode::Close => Ok(Some(Message::Close(frame.parse_close()?))),
            OpCode::Text | OpCode::Binary => self.handle_data(opcode, frame),
            OpCode::Continuation => self.handle_continuation(frame),
            OpCode::Reserved(_) => Err(Error::Protocol("reserved opcode")),
        }
    }

    /// Handle a Text or Binary frame
    fn handle_data(&mut self, opcode: OpCode, frame: Frame) -> Result<Option<Message>> {
        if self.fragment.is_some() {
            return Err(Error::Protocol("expected continuation frame"));
        }

        if frame.payload.len() > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }

        let compressed = frame.header.rsv1;
        if frame.header.fin {
            return self
                .complete(opcode, frame.payload, compressed, false)
                .map(Some);
        }

        let mut fragment = FragmentBuffer::new(opcode, compressed);
        fragment.payload.extend_from_slice(&frame.payload);
        if fragment.streams_utf8(self.lenient_utf8) && !fragment.utf8.feed(&fragment.payload) {
            return Err(Error::InvalidUtf8);
        }
        self.fragment = Some(fragment);
        Ok(None)
    }

    fn handle_continuation(&mut self, frame: Frame) -> Result<Option<Message>> {
        let lenient = self.lenient_utf8;
        let max = self.max_message_size;
        let fragment = self
            .fragment
            .as_mut()
            .ok_or(Error::Protocol("unexpected continuation frame"))?;

        if fragment.payload.len() + frame.payload.len() > max {
            return Err(Error::MessageTooLarge);
        }
        fragment.payload.extend_from_slice(&frame.payload);

        let streaming = fragment.streams_utf8(lenient);
        if !frame.header.fin {
            if streaming && !fragment.utf8.feed(&fragment.payload) {
                return Err(Error::InvalidUtf8);
            }
            return Ok(None);
        }

        let Some(mut fragment) = self.fragment.take() else {
            return Err(Error::Protocol("unexpected continuation frame"));
        };
        if streaming && !fragment.utf8.finish(&fragment.payload) {
            return Err(Error::InvalidUtf8);
        }
        self.complete(
            fragment.opcode,
            fragment.payload.freeze(),
            fragment.compressed,
            streaming,
        )
        .map(Some)
    }

    /// Build the final message: inflate if needed, then check text
    fn complete(
        &mut self,
        opcode: OpCode,
        payload: Bytes,
        compressed: bool,
        utf8_checked: bool,
    ) -> Result<Message> {
        let payload = if compressed {
            let extension = self
                .extension
                .as_mut()
                .ok_or(Error::Protocol("RSV1 set without negotiated extension"))?;
            extension.decompress(&payload, self.max_message_size)?
        } else {
            payload
        };

        match opcode {
            OpCode::Text => {
                if !self.lenient_utf8 && !utf8_checked && !validate_utf8(&payload) {
                    return Err(Error::InvalidUtf8);
                }
                Ok(Message::Text(payload))
            }
            OpCode::Binary => Ok(Message::Binary(payload)),
            _ => Err(Error::Protocol("invalid fragment opcode")),
        }
    }

    #[inline]
    fn next_mask(&self) -> Option<[u8; 4]> {
        (self.role == Role::Client).then(generate_mask)
    }

    /// Encode exactly one frame.
    ///
    /// `is_compressed` asks for compression of a data message; it takes
    /// effect only when an extension is negotiated, and only the frame that
    /// starts the message carries RSV1. Continuation frames of a compressed
    /// message are deflated on the same stream. No automatic fragmentation
    /// and no opcode checks happen here, so reserved opcodes can be written.
    pub fn create_write_frame(
        &mut self,
        opcode: OpCode,
        payload: &[u8],
        is_final: bool,
        is_compressed: bool,
    ) -> Result<Bytes> {
        let starts_message = matches!(opcode, OpCode::Text | OpCode::Binary);
        if starts_message {
            self.write_compressed = is_compressed && self.extension.is_some();
        }

        let in_message = starts_message || opcode == OpCode::Continuation;
        let deflated = match self.extension.as_mut() {
            Some(extension) if in_message && self.write_compressed => {
                Some(extension.compress_fragment(payload, starts_message, is_final)?)
            }
            _ => None,
        };
        let rsv1 = starts_message && self.write_compressed;
        if in_message && is_final {
            self.write_compressed = false;
        }

        let body = deflated.as_deref().unwrap_or(payload);
        let mut buf = BytesMut::with_capacity(body.len() + crate::MAX_FRAME_HEADER_SIZE);
        encode_frame_with_rsv(&mut buf, opcode, body, is_final, self.next_mask(), rsv1);
        Ok(buf.freeze())
    }

    /// Encode a whole message for sending.
    ///
    /// Data messages are compressed once when an extension is negotiated and
    /// split into frames of at most `fragment_size` bytes. Control payloads
    /// over 125 bytes are rejected.
    pub fn encode_message(&mut self, msg: &Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::Text(data) => self.encode_data(OpCode::Text, data, buf),
            Message::Binary(data) => self.encode_data(OpCode::Binary, data, buf),
            Message::Ping(data) => self.encode_control(OpCode::Ping, data, buf),
            Message::Pong(data) => self.encode_control(OpCode::Pong, data, buf),
            Message::Close(reason) => {
                let payload = match reason {
                    Some(reason) => {
                        if !CloseReason::is_valid_code(reason.code) {
                            return Err(Error::InvalidCloseCode(reason.code));
                        }
                        reason.to_payload()
                    }
                    None => Vec::new(),
                };
                self.encode_control(OpCode::Close, &payload, buf)
            }
        }
    }

    fn encode_control(&mut self, opcode: OpCode, payload: &[u8], buf: &mut BytesMut) -> Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::Protocol("control frame payload exceeds 125 bytes"));
        }
        encode_frame_with_rsv(buf, opcode, payload, true, self.next_mask(), false);
        Ok(())
    }

    fn encode_data(&mut self, opcode: OpCode, data: &Bytes, buf: &mut BytesMut) -> Result<()> {
        let compressed = match self.extension.as_mut() {
            Some(extension) => extension.compress(data)?,
            None => None,
        };
        let rsv1 = compressed.is_some();
        let body: &[u8] = compressed.as_deref().unwrap_or(data);

        if self.fragment_size == 0 || body.len() <= self.fragment_size {
            encode_frame_with_rsv(buf, opcode, body, true, self.next_mask(), rsv1);
            return Ok(());
        }

        let mut chunks = body.chunks(self.fragment_size).peekable();
        let mut first = true;
        while let Some(chunk) = chunks.next() {
            let fin = chunks.peek().is_none();
            let (op, rsv) = if first {
                (opcode, rsv1)
            } else {
                (OpCode::Continuation, false)
            };
            encode_frame_with_rsv(buf, op, chunk, fin, self.next_mask(), rsv);
            first = false;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FrameEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameEngine")
            .field("role", &self.role)
            .field("buffered", &self.buf.len())
            .field("fragment", &self.fragment)
            .field("extension", &self.extension.is_some())
            .field("failed", &self.failed)
            .finish()
    }
}

/// Messages completed by one [`FrameEngine::received_data`] call
pub struct Incoming<'a> {
    engine: &'a mut FrameEngine,
}

impl Iterator for Incoming<'_> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        self.engine.next_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;

    fn frame(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, fin, None);
        buf.to_vec()
    }

    #[test]
    fn test_single_text() {
        let mut engine = FrameEngine::client();
        let msgs = engine.process(&frame(OpCode::Text, b"Hello", true)).unwrap();
        assert_eq!(msgs, vec![Message::text("Hello")]);
    }

    #[test]
    fn test_fragmented_with_ping() {
        let mut engine = FrameEngine::client();
        let mut wire = frame(OpCode::Text, b"A", false);
        wire.extend(frame(OpCode::Ping, b"p", true));
        wire.extend(frame(OpCode::Continuation, b"B", true));

        let msgs = engine.process(&wire).unwrap();
        assert_eq!(msgs, vec![Message::ping("p"), Message::text("AB")]);
        assert!(!engine.in_fragment());
    }

    #[test]
    fn test_multiple_frames_one_chunk() {
        let mut engine = FrameEngine::client();
        let mut wire = frame(OpCode::Binary, &[1, 2], true);
        wire.extend(frame(OpCode::Text, b"x", true));
        wire.extend(frame(OpCode::Pong, b"", true));

        let msgs = engine.process(&wire).unwrap();
        assert_eq!(
            msgs,
            vec![
                Message::binary(vec![1, 2]),
                Message::text("x"),
                Message::pong(Bytes::new()),
            ]
        );
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut engine = FrameEngine::client();
        let wire = frame(OpCode::Binary, &[7u8; 300], true);
        let mut msgs = Vec::new();
        for byte in &wire {
            msgs.extend(engine.process(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(msgs, vec![Message::binary(vec![7u8; 300])]);
        assert_eq!(engine.buffered_len(), 0);
    }

    #[test]
    fn test_continuation_without_start() {
        let mut engine = FrameEngine::client();
        let err = engine
            .process(&frame(OpCode::Continuation, b"x", true))
            .unwrap_err();
        assert_eq!(err.close_code(), 1002);
        assert!(engine.is_failed());
    }

    #[test]
    fn test_new_message_during_fragment() {
        let mut engine = FrameEngine::client();
        let mut wire = frame(OpCode::Text, b"a", false);
        wire.extend(frame(OpCode::Text, b"b", true));
        assert!(matches!(engine.process(&wire), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_latched_after_error() {
        let mut engine = FrameEngine::client();
        let mut wire = frame(OpCode::Reserved(0x3), b"", true);
        wire.extend(frame(OpCode::Text, b"after", true));

        let results: Vec<_> = engine.received_data(&wire).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());

        assert_eq!(engine.received_data(&frame(OpCode::Text, b"x", true)).count(), 0);

        engine.reset();
        assert_eq!(
            engine.process(&frame(OpCode::Text, b"x", true)).unwrap(),
            vec![Message::text("x")]
        );
    }

    #[test]
    fn test_invalid_utf8_single_frame() {
        let mut engine = FrameEngine::client();
        let err = engine
            .process(&frame(OpCode::Text, &[0xce, 0xba, 0xff], true))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUtf8));
        assert_eq!(err.close_code(), 1007);
    }

    #[test]
    fn test_utf8_split_inside_codepoint() {
        let mut engine = FrameEngine::client();
        let text = "κόσμε".as_bytes();
        let mut wire = frame(OpCode::Text, &text[..1], false);
        for byte in &text[1..text.len() - 1] {
            wire.extend(frame(OpCode::Continuation, std::slice::from_ref(byte), false));
        }
        wire.extend(frame(OpCode::Continuation, &text[text.len() - 1..], true));

        let msgs = engine.process(&wire).unwrap();
        assert_eq!(msgs, vec![Message::text("κόσμε")]);
    }

    #[test]
    fn test_fragmented_utf8_fails_fast() {
        let mut engine = FrameEngine::client();
        // first fragment already holds an invalid sequence
        let results: Vec<_> = engine
            .received_data(&frame(OpCode::Text, &[b'a', 0xff], false))
            .collect();
        assert!(matches!(results.as_slice(), [Err(Error::InvalidUtf8)]));
    }

    #[test]
    fn test_fragmented_text_ends_incomplete() {
        let mut engine = FrameEngine::client();
        let mut wire = frame(OpCode::Text, b"a", false);
        wire.extend(frame(OpCode::Continuation, &[0xce], true));
        assert!(matches!(engine.process(&wire), Err(Error::InvalidUtf8)));
    }

    #[test]
    fn test_lenient_utf8() {
        let config = Config::builder().lenient_utf8(true).build();
        let mut engine = FrameEngine::new(Role::Client, &config);
        let msgs = engine.process(&frame(OpCode::Text, &[0xff, b'a'], true)).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].as_text(), None);
        assert_eq!(msgs[0].clone().into_text().unwrap(), "\u{fffd}a");
    }

    #[test]
    fn test_close_parsing() {
        let mut engine = FrameEngine::client();
        let msgs = engine
            .process(&frame(OpCode::Close, &[0x03, 0xe8, b'o', b'k'], true))
            .unwrap();
        assert_eq!(msgs, vec![Message::close(1000, "ok")]);

        let mut engine = FrameEngine::client();
        assert!(engine.process(&frame(OpCode::Close, &[0x03], true)).is_err());

        let mut engine = FrameEngine::client();
        let err = engine
            .process(&frame(OpCode::Close, &[0x03, 0xe8, 0xff], true))
            .unwrap_err();
        assert_eq!(err.close_code(), 1007);
    }

    #[test]
    fn test_message_too_large() {
        let config = Config::builder().max_message_size(4).build();
        let mut engine = FrameEngine::new(Role::Client, &config);
        let mut wire = frame(OpCode::Binary, &[0; 3], false);
        wire.extend(frame(OpCode::Continuation, &[0; 3], true));
        let err = engine.process(&wire).unwrap_err();
        assert_eq!(err.close_code(), 1009);
    }

    #[test]
    fn test_rsv1_without_extension() {
        let mut engine = FrameEngine::client();
        assert!(engine.process(&[0xc1, 0x00]).is_err());
    }

    #[test]
    fn test_client_masks_server_does_not() {
        let mut client = FrameEngine::client();
        let mut server = FrameEngine::server();

        let mut buf = BytesMut::new();
        client.encode_message(&Message::text("hi"), &mut buf).unwrap();
        assert_eq!(buf[1] & 0x80, 0x80);
        assert_eq!(server.process(&buf).unwrap(), vec![Message::text("hi")]);

        let mut buf = BytesMut::new();
        server.encode_message(&Message::text("hi"), &mut buf).unwrap();
        assert_eq!(buf[1] & 0x80, 0);
        assert_eq!(client.process(&buf).unwrap(), vec![Message::text("hi")]);
    }

    #[test]
    fn test_encode_auto_fragments() {
        let config = Config::builder().fragment_size(4).build();
        let mut server = FrameEngine::new(Role::Server, &config);
        let mut client = FrameEngine::client();

        let mut buf = BytesMut::new();
        server
            .encode_message(&Message::binary(vec![9u8; 10]), &mut buf)
            .unwrap();
        // 3 frames: 4 + 4 + 2 payload bytes, each with a 2-byte header
        assert_eq!(buf.len(), 16);
        assert_eq!(buf[0], 0x02);
        assert_eq!(buf[6], 0x00);
        assert_eq!(buf[12], 0x80);

        assert_eq!(
            client.process(&buf).unwrap(),
            vec![Message::binary(vec![9u8; 10])]
        );
    }

    #[test]
    fn test_encode_control_limits() {
        let mut engine = FrameEngine::client();
        let mut buf = BytesMut::new();
        assert!(engine
            .encode_message(&Message::ping(vec![0u8; 126]), &mut buf)
            .is_err());
        assert!(engine
            .encode_message(&Message::close(1000, "x".repeat(124)), &mut buf)
            .is_err());
        assert!(engine
            .encode_message(&Message::close(1005, ""), &mut buf)
            .is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_create_write_frame_reserved_opcode() {
        let mut engine = FrameEngine::server();
        let bytes = engine
            .create_write_frame(OpCode::Reserved(0xB), b"", true, false)
            .unwrap();
        assert_eq!(&bytes[..], &[0x8B, 0x00]);
    }

    #[cfg(feature = "permessage-deflate")]
    mod compressed {
        use super::*;
        use crate::deflate::{DeflateConfig, PerMessageDeflate};

        fn pair() -> (FrameEngine, FrameEngine) {
            let config = DeflateConfig {
                compression_threshold: 0,
                ..Default::default()
            };
            let client = FrameEngine::client()
                .with_extension(Box::new(PerMessageDeflate::client(config.clone())));
            let server =
                FrameEngine::server().with_extension(Box::new(PerMessageDeflate::server(config)));
            (client, server)
        }

        #[test]
        fn test_compressed_round_trip() {
            let (mut client, mut server) = pair();
            let text = "compress me ".repeat(20);

            let mut buf = BytesMut::new();
            client.encode_message(&Message::text(text.clone()), &mut buf).unwrap();
            assert_eq!(buf[0] & 0x40, 0x40);
            assert!(buf.len() < text.len());

            assert_eq!(server.process(&buf).unwrap(), vec![Message::text(text)]);
        }

        #[test]
        fn test_rsv1_only_on_first_frame() {
            let (mut client, mut server) = pair();

            let first = client
                .create_write_frame(OpCode::Text, b"Hello, ", false, true)
                .unwrap();
            let last = client
                .create_write_frame(OpCode::Continuation, b"World!", true, true)
                .unwrap();
            assert_eq!(first[0] & 0x40, 0x40);
            assert_eq!(last[0] & 0x40, 0);

            let mut wire = first.to_vec();
            wire.extend_from_slice(&last);
            assert_eq!(
                server.process(&wire).unwrap(),
                vec![Message::text("Hello, World!")]
            );
        }

        #[test]
        fn test_rsv1_on_continuation_rejected() {
            let (_, mut server) = pair();
            let mut wire = BytesMut::new();
            encode_frame(&mut wire, OpCode::Binary, b"a", false, Some([1, 2, 3, 4]));
            encode_frame_with_rsv(
                &mut wire,
                OpCode::Continuation,
                b"b",
                true,
                Some([1, 2, 3, 4]),
                true,
            );
            assert!(server.process(&wire).is_err());
        }

        #[test]
        fn test_compressed_auto_fragmented() {
            let config = DeflateConfig {
                compression_threshold: 0,
                ..Default::default()
            };
            let engine_config = Config::builder().fragment_size(8).build();
            let mut server = FrameEngine::new(Role::Server, &engine_config)
                .with_extension(Box::new(PerMessageDeflate::server(config.clone())));
            let mut client =
                FrameEngine::client().with_extension(Box::new(PerMessageDeflate::client(config)));

            let payload: Vec<u8> = (0..200u8).collect();
            let mut buf = BytesMut::new();
            server
                .encode_message(&Message::binary(payload.clone()), &mut buf)
                .unwrap();
            assert_eq!(buf[0], 0x42);

            assert_eq!(client.process(&buf).unwrap(), vec![Message::binary(payload)]);
        }
    }
}
