//! WebSocket opening handshake (RFC 6455 Section 4).
//!
//! # Client Request
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Sec-WebSocket-Version: 13
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Connection: Upgrade
//! Upgrade: websocket
//! Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits
//! ```
//!
//! # Server Response
//!
//! ```http
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```
//!
//! This module holds the pieces shared by both roles: key derivation, URL
//! handling, a minimal HTTP/1.1 head parser, and the client-side request
//! builder and response validator. The server side lives in
//! [`crate::server`].

use crate::deflate::{PerMessageDeflate, EXTENSION_NAME};
use crate::error::HandshakeError;
use crate::extension::{is_valid_protocol, parse_extensions};
use base64::Engine;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use sha1::{Digest, Sha1};
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;

/// RFC 6455 GUID for Sec-WebSocket-Accept calculation.
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest HTTP head accepted from either peer.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Protocol versions a client may request.
pub const SUPPORTED_VERSIONS: [u8; 2] = [8, 13];

/// Compute the Sec-WebSocket-Accept value from a client key.
///
/// ```
/// use wsengine::handshake::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Generate a random base64-encoded 16-byte key for the client handshake.
pub fn generate_client_key() -> io::Result<String> {
    let mut key = [0u8; 16];
    getrandom::fill(&mut key).map_err(|err| io::Error::other(err.to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(key))
}

/// Whether `key` has the shape of a base64-encoded 16-byte value.
#[must_use]
pub fn is_valid_client_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    bytes.len() == 24
        && bytes[..22]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
        && &bytes[22..] == b"=="
}

// =============================================================================
// URL
// =============================================================================

/// A validated `ws:` or `wss:` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    url: Url,
}

impl WsUrl {
    /// Parse and validate a WebSocket URL.
    pub fn parse(input: &str) -> Result<Self, HandshakeError> {
        let url = Url::parse(input).map_err(|_| HandshakeError::InvalidUrl(format!("Invalid URL: {input}")))?;
        Self::from_url(url)
    }

    /// Validate an already parsed URL.
    pub fn from_url(url: Url) -> Result<Self, HandshakeError> {
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(HandshakeError::InvalidUrl(
                "The URL's protocol must be one of \"ws:\" or \"wss:\"".into(),
            ));
        }
        if url.fragment().is_some_and(|fragment| !fragment.is_empty()) {
            return Err(HandshakeError::InvalidUrl(
                "The URL contains a fragment identifier".into(),
            ));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(HandshakeError::InvalidUrl(format!("Invalid URL: {url}")));
        }
        Ok(Self { url })
    }

    /// Resolve a redirect `Location` against this URL.
    pub fn join(&self, location: &str) -> Result<Self, HandshakeError> {
        let url = self
            .url
            .join(location)
            .map_err(|_| HandshakeError::InvalidUrl(format!("Invalid URL: {location}")))?;
        Self::from_url(url)
    }

    /// Underlying URL.
    #[must_use]
    pub const fn as_url(&self) -> &Url {
        &self.url
    }

    /// Whether the connection must use TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "wss"
    }

    /// Host to connect to, without IPv6 brackets.
    #[must_use]
    pub fn host(&self) -> &str {
        let host = self.url.host_str().unwrap_or_default();
        host.strip_prefix('[')
            .and_then(|inner| inner.strip_suffix(']'))
            .unwrap_or(host)
    }

    /// Port to connect to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.is_secure() { 443 } else { 80 })
    }

    /// `host[:port]` as written in the `Host` header; the port is omitted
    /// when it is the scheme default.
    #[must_use]
    pub fn authority(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        }
    }

    /// Request target: path plus query.
    #[must_use]
    pub fn resource(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{query}", self.url.path()),
            None => self.url.path().to_owned(),
        }
    }

    /// `user:password` from the URL, if any credentials are present.
    #[must_use]
    pub fn userinfo(&self) -> Option<String> {
        let user = self.url.username();
        let password = self.url.password();
        if user.is_empty() && password.is_none() {
            return None;
        }
        Some(format!("{user}:{}", password.unwrap_or_default()))
    }
}

impl fmt::Display for WsUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

// =============================================================================
// HTTP heads
// =============================================================================

/// Parsed HTTP/1.1 request head.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method.
    pub method: String,
    /// Request target (path and query).
    pub target: String,
    /// Header fields.
    pub headers: HeaderMap,
}

impl HttpRequest {
    /// Parse a request head (everything up to and including the blank line).
    pub fn parse(data: &[u8]) -> Result<Self, HandshakeError> {
        let mut lines = head_lines(data)?;
        let request_line = lines
            .next()
            .ok_or_else(|| HandshakeError::InvalidHttp("empty request".into()))?;

        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(HandshakeError::InvalidHttp(format!(
                "malformed request line: {request_line}"
            )));
        };
        if !version.starts_with("HTTP/") {
            return Err(HandshakeError::InvalidHttp(format!("unsupported version: {version}")));
        }

        Ok(Self {
            method: method.to_owned(),
            target: target.to_owned(),
            headers: parse_headers(lines)?,
        })
    }

    /// Header value as text.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    /// Target without its query string.
    #[must_use]
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }
}

/// Parsed HTTP/1.1 response head.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    /// Header fields.
    pub headers: HeaderMap,
}

impl HttpResponse {
    /// Parse a response head.
    pub fn parse(data: &[u8]) -> Result<Self, HandshakeError> {
        let mut lines = head_lines(data)?;
        let status_line = lines
            .next()
            .ok_or_else(|| HandshakeError::InvalidHttp("empty response".into()))?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(HandshakeError::InvalidHttp(format!("malformed status line: {status_line}")));
        }
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| HandshakeError::InvalidHttp(format!("malformed status line: {status_line}")))?;
        let reason = parts.next().unwrap_or_default().to_owned();

        Ok(Self {
            status,
            reason,
            headers: parse_headers(lines)?,
        })
    }

    /// Header value as text.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }
}

fn head_lines(data: &[u8]) -> Result<impl Iterator<Item = &str>, HandshakeError> {
    let text = std::str::from_utf8(data).map_err(|_| HandshakeError::InvalidHttp("invalid UTF-8".into()))?;
    Ok(text.split("\r\n"))
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<HeaderMap, HandshakeError> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::InvalidHttp(format!("malformed header: {line}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| HandshakeError::InvalidHttp(format!("invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| HandshakeError::InvalidHttp(format!("invalid value for header {name}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// First value of `name`, if it is visible ASCII.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Read an HTTP head from `io`.
///
/// Returns the head (through the blank line) and any bytes read past it,
/// which already belong to the WebSocket stream.
pub async fn read_http_head<IO>(io: &mut IO) -> Result<(Vec<u8>, Bytes), HandshakeError>
where
    IO: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let mut scanned = 0usize;

    loop {
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the HTTP head was complete",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);

        let from = scanned.saturating_sub(3);
        if let Some(pos) = buf[from..].windows(4).position(|w| w == b"\r\n\r\n") {
            let split_at = from + pos + 4;
            let trailing = Bytes::copy_from_slice(&buf[split_at..]);
            buf.truncate(split_at);
            return Ok((buf, trailing));
        }
        scanned = buf.len();

        if buf.len() > MAX_HEAD_SIZE {
            return Err(HandshakeError::InvalidHttp("HTTP head too large".into()));
        }
    }
}

// =============================================================================
// Client handshake
// =============================================================================

/// Outcome of a successful client handshake.
#[derive(Debug)]
pub struct Negotiated {
    /// Subprotocol chosen by the server.
    pub protocol: Option<String>,
    /// Negotiated extensions header value.
    pub extensions: Option<String>,
    /// Accepted permessage-deflate state.
    pub deflate: Option<PerMessageDeflate>,
}

/// One client upgrade request and the state needed to validate its response.
#[derive(Debug)]
pub struct ClientHandshake {
    url: WsUrl,
    key: String,
    protocols: Vec<String>,
    headers: HeaderMap,
    deflate: Option<PerMessageDeflate>,
}

impl ClientHandshake {
    /// Create a handshake for `url` with a fresh random key.
    pub fn new(url: WsUrl) -> Result<Self, HandshakeError> {
        Ok(Self::with_key(url, generate_client_key()?))
    }

    /// Create a handshake with an explicit key.
    #[must_use]
    pub fn with_key(url: WsUrl, key: String) -> Self {
        Self {
            url,
            key,
            protocols: Vec::new(),
            headers: HeaderMap::new(),
            deflate: None,
        }
    }

    /// Request subprotocols, validating the token grammar and uniqueness.
    pub fn protocols(mut self, protocols: &[String]) -> Result<Self, HandshakeError> {
        let mut seen: Vec<String> = Vec::with_capacity(protocols.len());
        for protocol in protocols {
            if !is_valid_protocol(protocol) || seen.contains(protocol) {
                return Err(HandshakeError::InvalidSubprotocol);
            }
            seen.push(protocol.clone());
        }
        self.protocols = seen;
        Ok(self)
    }

    /// Add request headers. Later calls override earlier values.
    #[must_use]
    pub fn headers(mut self, headers: &HeaderMap) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    /// Offer permessage-deflate.
    #[must_use]
    pub fn per_message_deflate(mut self, deflate: PerMessageDeflate) -> Self {
        self.deflate = Some(deflate);
        self
    }

    /// Target URL.
    #[must_use]
    pub const fn url(&self) -> &WsUrl {
        &self.url
    }

    /// `Sec-WebSocket-Key` value.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Final request headers for protocol `version`; `origin` goes in
    /// `Origin` for version 13 and `Sec-WebSocket-Origin` before that.
    pub fn request_headers(&self, version: u8, origin: Option<&str>) -> Result<HeaderMap, HandshakeError> {
        let mut headers = self.headers.clone();
        let value = |text: &str| {
            HeaderValue::from_str(text).map_err(|_| HandshakeError::InvalidHttp(format!("invalid header value: {text}")))
        };

        if !headers.contains_key(header::HOST) {
            headers.insert(header::HOST, value(&self.url.authority())?);
        }
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from(u16::from(version)));
        headers.insert(header::SEC_WEBSOCKET_KEY, value(&self.key)?);
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        if let Some(deflate) = &self.deflate {
            headers.insert(header::SEC_WEBSOCKET_EXTENSIONS, value(&deflate.offer_header())?);
        }
        if !self.protocols.is_empty() {
            headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value(&self.protocols.join(","))?);
        }
        if let Some(origin) = origin {
            let name = if version < 13 {
                HeaderName::from_static("sec-websocket-origin")
            } else {
                header::ORIGIN
            };
            headers.insert(name, value(origin)?);
        }
        Ok(headers)
    }

    /// Serialize the request head.
    pub fn request_bytes(&self, version: u8, origin: Option<&str>) -> Result<Vec<u8>, HandshakeError> {
        let headers = self.request_headers(version, origin)?;
        let mut request = format!("GET {} HTTP/1.1\r\n", self.url.resource()).into_bytes();
        for (name, value) in &headers {
            request.extend_from_slice(name.as_str().as_bytes());
            request.extend_from_slice(b": ");
            request.extend_from_slice(value.as_bytes());
            request.extend_from_slice(b"\r\n");
        }
        request.extend_from_slice(b"\r\n");
        Ok(request)
    }

    /// Validate a `101 Switching Protocols` response.
    pub fn validate_response(self, response: &HttpResponse) -> Result<Negotiated, HandshakeError> {
        if response.status != 101 {
            return Err(HandshakeError::UnexpectedResponse(response.status));
        }

        let upgrade = response.header("upgrade").unwrap_or_default();
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(HandshakeError::InvalidResponse("Invalid Upgrade header"));
        }

        if response.header("sec-websocket-accept") != Some(compute_accept_key(&self.key).as_str()) {
            return Err(HandshakeError::InvalidResponse("Invalid Sec-WebSocket-Accept header"));
        }

        let protocol = match response.headers.get(header::SEC_WEBSOCKET_PROTOCOL) {
            Some(value) => {
                if self.protocols.is_empty() {
                    return Err(HandshakeError::InvalidResponse(
                        "Server sent a subprotocol but none was requested",
                    ));
                }
                let chosen = value.to_str().unwrap_or_default();
                if !self.protocols.iter().any(|protocol| protocol == chosen) {
                    return Err(HandshakeError::InvalidResponse("Server sent an invalid subprotocol"));
                }
                Some(chosen.to_owned())
            }
            None if !self.protocols.is_empty() => {
                return Err(HandshakeError::InvalidResponse("Server sent no subprotocol"));
            }
            None => None,
        };

        let (extensions, deflate) = match response.headers.get(header::SEC_WEBSOCKET_EXTENSIONS) {
            None => (None, None),
            Some(value) => {
                let Some(mut deflate) = self.deflate else {
                    return Err(HandshakeError::InvalidResponse(
                        "Server sent a Sec-WebSocket-Extensions header but no extension was requested",
                    ));
                };
                let header_value = value.to_str().unwrap_or_default();
                let parsed = parse_extensions(header_value)
                    .map_err(|_| HandshakeError::InvalidResponse("Invalid Sec-WebSocket-Extensions header"))?;
                let mut names = parsed.names();
                let (Some(EXTENSION_NAME), None) = (names.next(), names.next()) else {
                    return Err(HandshakeError::InvalidResponse(
                        "Server indicated an extension that was not requested",
                    ));
                };
                let offers = parsed.get(EXTENSION_NAME).unwrap_or_default();
                deflate
                    .accept(offers)
                    .map_err(|_| HandshakeError::InvalidResponse("Invalid Sec-WebSocket-Extensions header"))?;
                (Some(header_value.to_owned()), Some(deflate))
            }
        };

        tracing::debug!(
            target: "ws::handshake",
            url = %self.url,
            protocol = protocol.as_deref().unwrap_or(""),
            extensions = extensions.as_deref().unwrap_or(""),
            "handshake response validated"
        );
        Ok(Negotiated {
            protocol,
            extensions,
            deflate,
        })
    }
}
