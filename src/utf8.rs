//! UTF-8 validation for text messages
//!
//! Complete messages go through `simdutf8` (SSE4.2/AVX2 on x86_64, NEON on
//! aarch64, std fallback elsewhere). Fragmented text uses [`StreamingUtf8`],
//! which validates each fragment as it arrives and only tolerates an
//! incomplete code point at the very end of the data seen so far.

use simdutf8::compat::from_utf8;

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Check if data is valid UTF-8 apart from an incomplete sequence at the end
///
/// Returns:
/// - `(true, n)` if all complete sequences are valid, where `n` is the number
///   of trailing bytes that form an incomplete sequence (0-3 bytes)
/// - `(false, 0)` if there is an invalid sequence
pub fn validate_utf8_incomplete(data: &[u8]) -> (bool, usize) {
    match from_utf8(data) {
        Ok(_) => (true, 0),
        // error_len() == None means the input ended mid-sequence
        Err(e) if e.error_len().is_none() => (true, data.len() - e.valid_up_to()),
        Err(_) => (false, 0),
    }
}

/// Incremental validator for a text message assembled from fragments.
///
/// Tracks how far the buffer has already been validated so each byte is
/// checked once, not once per fragment.
#[derive(Debug, Default, Clone)]
pub struct StreamingUtf8 {
    /// Bytes known to end on a complete code point
    checked: usize,
}

impl StreamingUtf8 {
    /// Create a validator for a new message
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the newly appended bytes of `buf`.
    ///
    /// `buf` must be the full message assembled so far. Returns `false` as
    /// soon as an invalid sequence is found.
    pub fn feed(&mut self, buf: &[u8]) -> bool {
        let pending = &buf[self.checked..];
        let (valid, incomplete) = validate_utf8_incomplete(pending);
        if !valid {
            return false;
        }
        self.checked = buf.len() - incomplete;
        true
    }

    /// Validate the final state of the message: no incomplete tail allowed.
    pub fn finish(&mut self, buf: &[u8]) -> bool {
        self.feed(buf) && self.checked == buf.len()
    }

    /// Reset for the next message
    pub fn reset(&mut self) {
        self.checked = 0;
    }
}
