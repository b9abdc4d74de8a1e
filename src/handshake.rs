//! WebSocket opening handshake (client side)
//!
//! The connection drives the handshake through three seams:
//! - [`HttpHandler`] builds the upgrade request and parses the response
//! - [`HeaderValidator`] decides whether the response is acceptable
//! - [`CertificatePinning`] optionally vets the transport's peer certificates
//!
//! [`Http1Handshake`] and [`AcceptKeyValidator`] are the HTTP/1.1 defaults.

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::WS_GUID;
use crate::deflate::DeflateConfig;
use crate::error::{Error, Result};

/// Maximum HTTP header size (8KB should be enough for any reasonable response)
pub const MAX_HEADER_SIZE: usize = 8192;

/// Header slots handed to httparse
const MAX_HEADERS: usize = 32;

/// Target of a client connection, parsed from a `ws://` or `wss://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    /// Host name or address, without brackets for IPv6
    pub host: String,
    /// TCP port (80/443 when the URL omits it)
    pub port: u16,
    /// Request target: path plus query, always starting with `/`
    pub path: String,
    /// Whether the scheme was `wss`
    pub secure: bool,
    /// Sub-protocols offered, in preference order
    pub protocols: Vec<String>,
    /// Extra request headers
    pub headers: Vec<(String, String)>,
}

impl ClientRequest {
    /// Parse a WebSocket URL
    pub fn parse(url: &str) -> Result<Self> {
        let (secure, rest) = if let Some(rest) = strip_scheme(url, "wss://") {
            (true, rest)
        } else if let Some(rest) = strip_scheme(url, "ws://") {
            (false, rest)
        } else {
            return Err(Error::InvalidHttp("URL scheme must be ws or wss"));
        };

        let split = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let (authority, target) = rest.split_at(split);
        // fragments are never sent
        let target = target.split('#').next().unwrap_or_default();
        let path = if target.is_empty() {
            "/".to_string()
        } else if target.starts_with('?') {
            format!("/{}", target)
        } else {
            target.to_string()
        };

        let default_port = if secure { 443 } else { 80 };
        let (host, port) = split_authority(authority, default_port)?;

        Ok(Self {
            host,
            port,
            path,
            secure,
            protocols: Vec::new(),
            headers: Vec::new(),
        })
    }

    /// Offer a sub-protocol
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Add a request header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Value for the `Host` header (port omitted when it is the default)
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

fn strip_scheme<'a>(url: &'a str, scheme: &str) -> Option<&'a str> {
    let head = url.get(..scheme.len())?;
    head.eq_ignore_ascii_case(scheme).then(|| &url[scheme.len()..])
}

fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    // drop userinfo
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or(Error::InvalidHttp("unterminated IPv6 address"))?;
        (host, after.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(Error::InvalidHttp("URL has no host"));
    }

    let port = match port {
        Some(p) => p
            .parse()
            .map_err(|_| Error::InvalidHttp("invalid port in URL"))?,
        None => default_port,
    };

    Ok((host.to_string(), port))
}

/// Parsed upgrade response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// HTTP status code
    pub status: u16,
    /// The Sec-WebSocket-Accept header
    pub accept: Option<String>,
    /// The Sec-WebSocket-Protocol header
    pub protocol: Option<String>,
    /// The Sec-WebSocket-Extensions header
    pub extensions: Option<String>,
    /// Whether `Upgrade: websocket` was present
    pub upgrade: bool,
    /// Whether `Connection` listed `upgrade`
    pub connection_upgrade: bool,
    /// All headers, names lowercased
    pub headers: Vec<(String, String)>,
}

impl HandshakeResponse {
    /// Look up a header by lowercase name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Builds the upgrade request and parses the server's answer
pub trait HttpHandler: Send {
    /// Serialize the upgrade request. `extensions` is the offer, if any.
    fn build_request(&self, request: &ClientRequest, key: &str, extensions: Option<&str>)
    -> Bytes;

    /// Parse a response from the start of `buf`.
    ///
    /// `Ok(None)` means the head is not complete yet; otherwise returns the
    /// response and the number of bytes it occupied. Bytes past that belong to
    /// the WebSocket stream.
    fn parse_response(&self, buf: &[u8]) -> Result<Option<(HandshakeResponse, usize)>>;
}

/// Decides whether a parsed response completes the handshake
pub trait HeaderValidator: Send + Sync {
    /// Check `response` against the `key` sent with the request
    fn validate(&self, response: &HandshakeResponse, key: &str) -> Result<()>;
}

/// Certificate / public-key pinning policy
pub trait CertificatePinning: Send + Sync {
    /// Return whether the DER certificates presented for `domain` are trusted
    fn evaluate_trust(&self, certificates: &[Bytes], domain: &str) -> bool;
}

/// Plain HTTP/1.1 upgrade
#[derive(Debug, Clone)]
pub struct Http1Handshake {
    max_size: usize,
}

impl Http1Handshake {
    /// Handler refusing response heads larger than `max_size`
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Default for Http1Handshake {
    fn default() -> Self {
        Self::new(MAX_HEADER_SIZE)
    }
}

impl HttpHandler for Http1Handshake {
    fn build_request(
        &self,
        request: &ClientRequest,
        key: &str,
        extensions: Option<&str>,
    ) -> Bytes {
        build_request(request, key, extensions)
    }

    fn parse_response(&self, buf: &[u8]) -> Result<Option<(HandshakeResponse, usize)>> {
        match parse_response(buf)? {
            None if buf.len() > self.max_size => Err(Error::InvalidHttp("response too large")),
            other => Ok(other),
        }
    }
}

/// Default validator: RFC 6455 §4.1 checks on the 101 response
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptKeyValidator;

impl HeaderValidator for AcceptKeyValidator {
    fn validate(&self, response: &HandshakeResponse, key: &str) -> Result<()> {
        if response.status != 101 {
            return Err(Error::HandshakeFailed("expected 101 Switching Protocols"));
        }
        if !response.upgrade {
            return Err(Error::HandshakeFailed("missing Upgrade: websocket"));
        }
        if !response.connection_upgrade {
            return Err(Error::HandshakeFailed("missing Connection: Upgrade"));
        }
        let accept = response
            .accept
            .as_deref()
            .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Accept"))?;
        if !validate_accept_key(key, accept) {
            return Err(Error::HandshakeFailed("invalid Sec-WebSocket-Accept"));
        }
        Ok(())
    }
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Validate the server's accept key (client-side)
pub fn validate_accept_key(sent_key: &str, received_accept: &str) -> bool {
    generate_accept_key(sent_key) == received_accept.trim()
}

/// Generate a random Sec-WebSocket-Key (16 random bytes, base64)
pub fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    for chunk in bytes.chunks_exact_mut(4) {
        chunk.copy_from_slice(&crate::mask::generate_mask());
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Build a WebSocket upgrade request
pub fn build_request(request: &ClientRequest, key: &str, extensions: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);

    buf.put_slice(b"GET ");
    buf.put_slice(request.path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    buf.put_slice(b"Host: ");
    buf.put_slice(request.host_header().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");

    if !request.protocols.is_empty() {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(request.protocols.join(", ").as_bytes());
        buf.put_slice(b"\r\n");
    }

    if let Some(ext) = extensions {
        buf.put_slice(b"Sec-WebSocket-Extensions: ");
        buf.put_slice(ext.as_bytes());
        buf.put_slice(b"\r\n");
    }

    for (name, value) in &request.headers {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Parse a WebSocket upgrade response
///
/// Any status is returned; the [`HeaderValidator`] decides what is acceptable.
pub fn parse_response(buf: &[u8]) -> Result<Option<(HandshakeResponse, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let mut response = HandshakeResponse {
                status: res.code.unwrap_or(0),
                accept: None,
                protocol: None,
                extensions: None,
                upgrade: false,
                connection_upgrade: false,
                headers: Vec::with_capacity(res.headers.len()),
            };

            for header in res.headers.iter() {
                let name = header.name.to_ascii_lowercase();
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| Error::InvalidHttp("invalid header value"))?
                    .trim()
                    .to_string();

                match name.as_str() {
                    "sec-websocket-accept" => response.accept = Some(value.clone()),
                    "sec-websocket-protocol" => response.protocol = Some(value.clone()),
                    "sec-websocket-extensions" => {
                        // repeated headers are one comma-separated list
                        response.extensions = Some(match response.extensions.take() {
                            Some(prev) => format!("{}, {}", prev, value),
                            None => value.clone(),
                        });
                    }
                    "upgrade" => {
                        response.upgrade = value.eq_ignore_ascii_case("websocket");
                    }
                    "connection" => {
                        response.connection_upgrade = value
                            .split(',')
                            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
                    }
                    _ => {}
                }
                response.headers.push((name, value));
            }

            Ok(Some((response, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(Error::InvalidHttp("failed to parse HTTP response")),
    }
}

/// Resolve the extension the server accepted against what was offered
///
/// Fails when the server answers with an extension that was never offered.
pub fn negotiate_compression(
    offer: Option<&DeflateConfig>,
    response: &HandshakeResponse,
) -> Result<Option<DeflateConfig>> {
    let Some(value) = response.extensions.as_deref().filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let offer = offer.ok_or(Error::HandshakeFailed("server selected an extension that was not offered"))?;
    match offer.accept_response(value)? {
        Some(config) => Ok(Some(config)),
        None => Err(Error::HandshakeFailed("server selected an unsupported extension")),
    }
}

/// Check the sub-protocol the server picked
pub fn negotiate_protocol(
    request: &ClientRequest,
    response: &HandshakeResponse,
) -> Result<Option<String>> {
    match response.protocol.as_deref() {
        None | Some("") => Ok(None),
        Some(chosen) if request.protocols.iter().any(|p| p == chosen) => {
            Ok(Some(chosen.to_string()))
        }
        Some(_) => Err(Error::HandshakeFailed("server selected a sub-protocol that was not offered")),
    }
}

/// Request head as seen by an in-process test server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request target
    pub path: String,
    /// The Sec-WebSocket-Key header
    pub key: String,
    /// The Sec-WebSocket-Protocol header
    pub protocol: Option<String>,
    /// The Sec-WebSocket-Extensions header
    pub extensions: Option<String>,
}

/// Parse an upgrade request head.
///
/// Only used by loopback servers in tests and benches.
pub fn parse_request(buf: &[u8]) -> Result<Option<(UpgradeRequest, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            if req.method != Some("GET") {
                return Err(Error::InvalidHttp("method must be GET"));
            }

            let mut key = None;
            let mut protocol = None;
            let mut extensions = None;
            for header in req.headers.iter() {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| Error::InvalidHttp("invalid header value"))?;
                match header.name.to_ascii_lowercase().as_str() {
                    "sec-websocket-key" => key = Some(value.to_string()),
                    "sec-websocket-protocol" => protocol = Some(value.to_string()),
                    "sec-websocket-extensions" => extensions = Some(value.to_string()),
                    _ => {}
                }
            }

            let key = key.ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Key"))?;
            Ok(Some((
                UpgradeRequest {
                    path: req.path.unwrap_or("/").to_string(),
                    key,
                    protocol,
                    extensions,
                },
                len,
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(Error::InvalidHttp("failed to parse HTTP request")),
    }
}

/// Build a `101 Switching Protocols` response
pub fn build_response(accept_key: &str, protocol: Option<&str>, extensions: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept_key.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(proto) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(proto.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if let Some(ext) = extensions {
        buf.put_slice(b"Sec-WebSocket-Extensions: ");
        buf.put_slice(ext.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn response(accept: &str, extra: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n{}\r\n",
            accept, extra
        )
        .into_bytes()
    }

    #[test]
    fn test_generate_accept_key() {
        // Test vector from RFC 6455
        assert_eq!(generate_accept_key(KEY), ACCEPT);
    }

    #[test]
    fn test_validate_accept_key() {
        assert!(validate_accept_key(KEY, ACCEPT));
        assert!(!validate_accept_key(KEY, "invalid"));
    }

    #[test]
    fn test_generate_key_shape() {
        let key = generate_key();
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&key)
            .unwrap();
        assert_eq!(raw.len(), 16);
    }

    #[test]
    fn test_parse_urls() {
        let req = ClientRequest::parse("ws://example.com/chat?room=1").unwrap();
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 80);
        assert_eq!(req.path, "/chat?room=1");
        assert!(!req.secure);

        let req = ClientRequest::parse("WSS://example.com:9443").unwrap();
        assert!(req.secure);
        assert_eq!(req.port, 9443);
        assert_eq!(req.path, "/");
        assert_eq!(req.host_header(), "example.com:9443");

        let req = ClientRequest::parse("ws://[::1]:9001/x#frag").unwrap();
        assert_eq!(req.host, "::1");
        assert_eq!(req.path, "/x");
        assert_eq!(req.host_header(), "[::1]:9001");

        let req = ClientRequest::parse("ws://h?q").unwrap();
        assert_eq!(req.path, "/?q");

        assert!(ClientRequest::parse("http://example.com").is_err());
        assert!(ClientRequest::parse("ws://:80/").is_err());
        assert!(ClientRequest::parse("ws://host:notaport/").is_err());
    }

    #[test]
    fn test_build_request() {
        let req = ClientRequest::parse("ws://localhost:9001/runCase?case=1")
            .unwrap()
            .protocol("chat")
            .protocol("superchat")
            .header("Origin", "http://localhost");
        let bytes = build_request(&req, KEY, Some("permessage-deflate"));
        let text = std::str::from_utf8(&bytes).unwrap();

        assert!(text.starts_with("GET /runCase?case=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: localhost:9001\r\n"));
        assert!(text.contains("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat, superchat\r\n"));
        assert!(text.contains("Sec-WebSocket-Extensions: permessage-deflate\r\n"));
        assert!(text.contains("Origin: http://localhost\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        let (parsed, len) = parse_request(&bytes).unwrap().unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(parsed.key, KEY);
        assert_eq!(parsed.path, "/runCase?case=1");
    }

    #[test]
    fn test_parse_response_with_trailing_frame() {
        let mut buf = response(ACCEPT, "");
        let head_len = buf.len();
        buf.extend_from_slice(&[0x81, 0x00]);

        let (res, len) = parse_response(&buf).unwrap().unwrap();
        assert_eq!(len, head_len);
        assert_eq!(res.status, 101);
        assert!(res.upgrade && res.connection_upgrade);
        assert!(AcceptKeyValidator.validate(&res, KEY).is_ok());
    }

    #[test]
    fn test_parse_response_partial() {
        let buf = response(ACCEPT, "");
        assert!(parse_response(&buf[..20]).unwrap().is_none());
    }

    #[test]
    fn test_validator_rejects() {
        let (res, _) = parse_response(&response("bogus", "")).unwrap().unwrap();
        assert!(AcceptKeyValidator.validate(&res, KEY).is_err());

        let forbidden = b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n";
        let (res, _) = parse_response(forbidden).unwrap().unwrap();
        assert!(matches!(
            AcceptKeyValidator.validate(&res, KEY),
            Err(Error::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_handler_size_limit() {
        let handler = Http1Handshake::new(16);
        let partial = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n";
        assert!(handler.parse_response(partial).is_err());
    }

    #[test]
    fn test_negotiation() {
        let req = ClientRequest::parse("ws://h/").unwrap().protocol("chat");
        let (res, _) = parse_response(&response(
            ACCEPT,
            "Sec-WebSocket-Protocol: chat\r\nSec-WebSocket-Extensions: permessage-deflate; server_no_context_takeover\r\n",
        ))
        .unwrap()
        .unwrap();

        assert_eq!(negotiate_protocol(&req, &res).unwrap().as_deref(), Some("chat"));
        let offer = DeflateConfig::default();
        let negotiated = negotiate_compression(Some(&offer), &res).unwrap().unwrap();
        assert!(negotiated.server_no_context_takeover);

        // not offered
        assert!(negotiate_compression(None, &res).is_err());
        let bare = ClientRequest::parse("ws://h/").unwrap();
        assert!(negotiate_protocol(&bare, &res).is_err());
    }
}
