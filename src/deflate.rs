//! Per-Message Deflate Extension (RFC 7692)
//!
//! Message payloads are compressed as a whole at write time and inflated
//! once the last fragment arrives at read time. The codec itself is only
//! built with the `permessage-deflate` feature; negotiation types are always
//! available so a [`Config`](crate::Config) can be written either way.

use bytes::Bytes;

#[cfg(feature = "permessage-deflate")]
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

/// Extension name used in `Sec-WebSocket-Extensions`
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Trailer bytes that must be removed after compression and added before decompression
#[cfg(feature = "permessage-deflate")]
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Default LZ77 window size (32KB = 2^15)
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Minimum LZ77 window size (256 bytes = 2^8)
pub const MIN_WINDOW_BITS: u8 = 8;

/// Smallest window zlib can compress with
pub const MIN_ENCODER_WINDOW_BITS: u8 = 9;

/// Maximum LZ77 window size (32KB = 2^15)
pub const MAX_WINDOW_BITS: u8 = 15;

/// Upper bound on codec calls per message, guards against a stalled stream
#[cfg(feature = "permessage-deflate")]
const MAX_ITERATIONS: u32 = 100_000;

/// A negotiated message-level payload transform.
///
/// The frame engine calls `compress` once per outgoing data message and
/// `decompress` once per complete incoming message whose first frame had
/// RSV1 set.
pub trait Extension: Send {
    /// Compress a message payload.
    ///
    /// `Ok(None)` means the payload should go out uncompressed (RSV1 clear).
    fn compress(&mut self, payload: &[u8]) -> Result<Option<Bytes>>;

    /// Compress one frame of a message written frame by frame.
    ///
    /// Every fragment of the message goes through the same stream; `first`
    /// starts a new message and `last` ends it.
    fn compress_fragment(&mut self, payload: &[u8], first: bool, last: bool) -> Result<Bytes>;

    /// Decompress a message payload, failing once output exceeds `max_size`
    fn decompress(&mut self, payload: &[u8], max_size: usize) -> Result<Bytes>;
}

/// Configuration for permessage-deflate extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateConfig {
    /// Server's maximum LZ77 window bits (for compression when server, decompression when client)
    pub server_max_window_bits: u8,
    /// Client's maximum LZ77 window bits (for compression when client, decompression when server).
    /// Never offered or accepted below 9, zlib cannot compress in an 8-bit window.
    pub client_max_window_bits: u8,
    /// If true, server must reset compression context after each message
    pub server_no_context_takeover: bool,
    /// If true, client must reset compression context after each message
    pub client_no_context_takeover: bool,
    /// Compression level (0-9, where 0 is no compression, 9 is max)
    pub compression_level: u32,
    /// Minimum message size to compress (smaller messages may not benefit)
    pub compression_threshold: usize,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_max_window_bits: DEFAULT_WINDOW_BITS,
            client_max_window_bits: DEFAULT_WINDOW_BITS,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            compression_level: 6,
            compression_threshold: 32,
        }
    }
}

impl DeflateConfig {
    /// Create config optimized for low memory usage
    pub fn low_memory() -> Self {
        Self {
            server_max_window_bits: 10,
            client_max_window_bits: 10,
            server_no_context_takeover: true,
            client_no_context_takeover: true,
            compression_level: 1,
            compression_threshold: 64,
        }
    }

    /// Parse extension parameters from handshake
    pub fn from_params(params: &[(&str, Option<&str>)]) -> Result<Self> {
        let mut config = Self::default();

        for (name, value) in params {
            match *name {
                "server_no_context_takeover" => {
                    if value.is_some() {
                        return Err(Error::HandshakeFailed(
                            "server_no_context_takeover must not have a value",
                        ));
                    }
                    config.server_no_context_takeover = true;
                }
                "client_no_context_takeover" => {
                    if value.is_some() {
                        return Err(Error::HandshakeFailed(
                            "client_no_context_takeover must not have a value",
                        ));
                    }
                    config.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    if let Some(v) = value {
                        config.server_max_window_bits = parse_window_bits(v)?;
                    }
                }
                "client_max_window_bits" => {
                    // a bare parameter only advertises support
                    if let Some(v) = value {
                        config.client_max_window_bits = parse_window_bits(v)?;
                    }
                }
                _ => {
                    return Err(Error::HandshakeFailed(
                        "unknown permessage-deflate parameter",
                    ));
                }
            }
        }

        Ok(config)
    }

    /// Build the client's `Sec-WebSocket-Extensions` offer
    pub fn to_offer_header(&self) -> String {
        let mut parts = vec![EXTENSION_NAME.to_string()];

        if self.server_no_context_takeover {
            parts.push("server_no_context_takeover".to_string());
        }
        if self.client_no_context_takeover {
            parts.push("client_no_context_takeover".to_string());
        }
        if self.server_max_window_bits < MAX_WINDOW_BITS {
            parts.push(format!(
                "server_max_window_bits={}",
                self.server_max_window_bits
            ));
        }
        if self.client_max_window_bits < MAX_WINDOW_BITS {
            parts.push(format!(
                "client_max_window_bits={}",
                self.client_max_window_bits.max(MIN_ENCODER_WINDOW_BITS)
            ));
        } else {
            parts.push("client_max_window_bits".to_string());
        }

        parts.join("; ")
    }

    /// Generate extension response header value for a server
    ///
    /// Only used by in-process test servers; there is no server accept path.
    pub fn to_response_header(&self) -> String {
        let mut parts = vec![EXTENSION_NAME.to_string()];

        if self.server_no_context_takeover {
            parts.push("server_no_context_takeover".to_string());
        }
        if self.client_no_context_takeover {
            parts.push("client_no_context_takeover".to_string());
        }
        if self.server_max_window_bits < MAX_WINDOW_BITS {
            parts.push(format!(
                "server_max_window_bits={}",
                self.server_max_window_bits
            ));
        }
        if self.client_max_window_bits < MAX_WINDOW_BITS {
            parts.push(format!(
                "client_max_window_bits={}",
                self.client_max_window_bits
            ));
        }

        parts.join("; ")
    }

    /// Turn the server's `Sec-WebSocket-Extensions` value into the config
    /// actually in force.
    ///
    /// Returns `Ok(None)` if the server did not accept permessage-deflate.
    /// The local compression level and threshold carry over from `self`.
    pub fn accept_response(&self, header_value: &str) -> Result<Option<Self>> {
        for offer in header_value.split(',') {
            let Some(params) = parse_deflate_offer(offer) else {
                continue;
            };
            let mut negotiated = Self::from_params(&params)?;
            if negotiated.client_max_window_bits < MIN_ENCODER_WINDOW_BITS {
                // we cannot compress inside an 8-bit window
                return Err(Error::HandshakeFailed(
                    "client_max_window_bits=8 is not supported",
                ));
            }
            negotiated.compression_level = self.compression_level;
            negotiated.compression_threshold = self.compression_threshold;
            return Ok(Some(negotiated));
        }
        Ok(None)
    }
}

fn parse_window_bits(value: &str) -> Result<u8> {
    let bits: u8 = value
        .parse()
        .map_err(|_| Error::HandshakeFailed("invalid max_window_bits value"))?;
    if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        return Err(Error::HandshakeFailed("max_window_bits out of range (8-15)"));
    }
    Ok(bits)
}

/// Parse permessage-deflate extension parameters from header value
pub fn parse_deflate_offer(value: &str) -> Option<Vec<(&str, Option<&str>)>> {
    let rest = value.trim().strip_prefix(EXTENSION_NAME)?.trim_start();

    if rest.is_empty() {
        return Some(Vec::new());
    }

    // Must start with semicolon if there are parameters
    let rest = rest.strip_prefix(';')?;

    let mut params = Vec::new();

    for part in rest.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((name, value)) = part.split_once('=') {
            let name = name.trim();
            let value = value.trim().trim_matches('"');
            params.push((name, Some(value)));
        } else {
            params.push((part, None));
        }
    }

    Some(params)
}

/// zlib refuses an 8-bit window for raw deflate. Inflating with 9 bits still
/// accepts an 8-bit stream, so only the outgoing side is constrained.
#[cfg(feature = "permessage-deflate")]
fn effective_window_bits(bits: u8) -> u8 {
    bits.clamp(MIN_ENCODER_WINDOW_BITS, MAX_WINDOW_BITS)
}

/// Deflate compressor for outgoing messages
#[cfg(feature = "permessage-deflate")]
pub struct DeflateEncoder {
    compress: Compress,
    no_context_takeover: bool,
    threshold: usize,
}

#[cfg(feature = "permessage-deflate")]
impl DeflateEncoder {
    /// Create a new encoder
    pub fn new(window_bits: u8, no_context_takeover: bool, level: u32, threshold: usize) -> Self {
        let compress = Compress::new_with_window_bits(
            Compression::new(level),
            false,
            effective_window_bits(window_bits),
        );

        Self {
            compress,
            no_context_takeover,
            threshold,
        }
    }

    /// Compress a message payload
    ///
    /// Returns None if the message is below the threshold, or if compression
    /// would not shrink it and the context is reset per message anyway.
    pub fn compress(&mut self, data: &[u8]) -> Result<Option<Bytes>> {
        if data.len() < self.threshold {
            return Ok(None);
        }

        if self.no_context_takeover {
            self.compress.reset();
        }

        let mut output = self.deflate_sync(data)?;
        if output.ends_with(&DEFLATE_TRAILER) {
            output.truncate(output.len() - DEFLATE_TRAILER.len());
        }

        // With context takeover the peer's window must see this message, so
        // it has to go out compressed even if it grew.
        if self.no_context_takeover && output.len() >= data.len() {
            return Ok(None);
        }

        Ok(Some(Bytes::from(output)))
    }

    /// Compress one fragment of a frame-by-frame message
    ///
    /// No threshold applies: once the first frame carries RSV1 every
    /// fragment must be deflate data.
    pub fn compress_fragment(&mut self, data: &[u8], first: bool, last: bool) -> Result<Bytes> {
        if first && self.no_context_takeover {
            self.compress.reset();
        }

        let mut output = self.deflate_sync(data)?;
        if last && output.ends_with(&DEFLATE_TRAILER) {
            output.truncate(output.len() - DEFLATE_TRAILER.len());
        }
        Ok(Bytes::from(output))
    }

    /// Feed `data` through the compressor and sync-flush it
    fn deflate_sync(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut output: Vec<u8> = Vec::with_capacity(data.len() + 64);
        let start_in = self.compress.total_in();
        let mut iterations = 0u32;

        loop {
            iterations += 1;
            if iterations > MAX_ITERATIONS {
                return Err(Error::Compression(
                    "compression took too many iterations".into(),
                ));
            }

            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(4096));
            }

            let consumed = (self.compress.total_in() - start_in) as usize;
            self.compress
                .compress_vec(&data[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| Error::Compression(format!("deflate error: {}", e)))?;

            let consumed = (self.compress.total_in() - start_in) as usize;
            // spare room left means the sync flush completed
            if consumed >= data.len() && output.len() < output.capacity() {
                return Ok(output);
            }
        }
    }

    /// Reset the compression context (for no_context_takeover)
    pub fn reset(&mut self) {
        self.compress.reset();
    }
}

/// Deflate decompressor for incoming messages
#[cfg(feature = "permessage-deflate")]
pub struct DeflateDecoder {
    decompress: Decompress,
    no_context_takeover: bool,
}

#[cfg(feature = "permessage-deflate")]
impl DeflateDecoder {
    /// Create a new decoder
    pub fn new(window_bits: u8, no_context_takeover: bool) -> Self {
        let decompress = Decompress::new_with_window_bits(false, effective_window_bits(window_bits));

        Self {
            decompress,
            no_context_takeover,
        }
    }

    /// Decompress a message payload
    pub fn decompress(&mut self, data: &[u8], max_size: usize) -> Result<Bytes> {
        if self.no_context_takeover {
            self.decompress.reset(false);
        }

        let mut input = Vec::with_capacity(data.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let initial_cap = data.len().saturating_mul(4).clamp(1024, max_size.max(1024));
        let mut output: Vec<u8> = Vec::with_capacity(initial_cap);
        let start_in = self.decompress.total_in();
        let mut iterations = 0u32;

        loop {
            iterations += 1;
            if iterations > MAX_ITERATIONS {
                return Err(Error::Compression(
                    "decompression took too many iterations".into(),
                ));
            }

            if output.len() == output.capacity() {
                if output.len() > max_size {
                    return Err(Error::MessageTooLarge);
                }
                output.reserve(output.capacity().max(4096));
            }

            let consumed = (self.decompress.total_in() - start_in) as usize;
            let before_out = output.len();
            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| Error::Compression(format!("inflate error: {}", e)))?;

            if output.len() > max_size {
                return Err(Error::MessageTooLarge);
            }

            let now_consumed = (self.decompress.total_in() - start_in) as usize;
            match status {
                Status::StreamEnd => {
                    // peer ended the stream with BFINAL; start fresh next time
                    self.decompress.reset(false);
                    break;
                }
                Status::Ok | Status::BufError => {
                    if now_consumed >= input.len() && output.len() < output.capacity() {
                        break;
                    }
                    let stalled = now_consumed == consumed && output.len() == before_out;
                    if stalled && output.len() < output.capacity() {
                        return Err(Error::Compression("truncated deflate stream".into()));
                    }
                }
            }
        }

        Ok(Bytes::from(output))
    }

    /// Reset the decompression context (for no_context_takeover)
    pub fn reset(&mut self) {
        self.decompress.reset(false);
    }
}

/// permessage-deflate state for one connection, one context per direction
#[cfg(feature = "permessage-deflate")]
pub struct PerMessageDeflate {
    /// Encoder for outgoing messages
    pub encoder: DeflateEncoder,
    /// Decoder for incoming messages
    pub decoder: DeflateDecoder,
    /// Negotiated configuration
    pub config: DeflateConfig,
}

#[cfg(feature = "permessage-deflate")]
impl PerMessageDeflate {
    /// Create context for server role
    pub fn server(config: DeflateConfig) -> Self {
        let encoder = DeflateEncoder::new(
            config.server_max_window_bits,
            config.server_no_context_takeover,
            config.compression_level,
            config.compression_threshold,
        );
        let decoder = DeflateDecoder::new(
            config.client_max_window_bits,
            config.client_no_context_takeover,
        );

        Self {
            encoder,
            decoder,
            config,
        }
    }

    /// Create context for client role
    pub fn client(config: DeflateConfig) -> Self {
        let encoder = DeflateEncoder::new(
            config.client_max_window_bits,
            config.client_no_context_takeover,
            config.compression_level,
            config.compression_threshold,
        );
        let decoder = DeflateDecoder::new(
            config.server_max_window_bits,
            config.server_no_context_takeover,
        );

        Self {
            encoder,
            decoder,
            config,
        }
    }
}

#[cfg(feature = "permessage-deflate")]
impl Extension for PerMessageDeflate {
    fn compress(&mut self, payload: &[u8]) -> Result<Option<Bytes>> {
        self.encoder.compress(payload)
    }

    fn compress_fragment(&mut self, payload: &[u8], first: bool, last: bool) -> Result<Bytes> {
        self.encoder.compress_fragment(payload, first, last)
    }

    fn decompress(&mut self, payload: &[u8], max_size: usize) -> Result<Bytes> {
        self.decoder.decompress(payload, max_size)
    }
}

#[cfg(feature = "permessage-deflate")]
impl std::fmt::Debug for PerMessageDeflate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerMessageDeflate")
            .field("config", &self.config)
            .finish()
    }
}
