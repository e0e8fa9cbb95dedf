//! WebSocket client: connect, handshake, follow redirects.
//!
//! ```ignore
//! use wsengine::client::connect;
//! use wsengine::websocket::Event;
//!
//! let mut ws = connect("ws://127.0.0.1:9001/chat").await?;
//! let _ = ws.send_text("hello");
//! while let Some(event) = ws.recv().await {
//!     if let Event::Message(message) = event {
//!         println!("{:?}", message.as_text());
//!     }
//! }
//! ```
//!
//! Transports come from a [`Connector`]. [`TcpConnector`] handles `ws:`
//! URLs; `wss:` needs a caller-supplied connector that performs TLS.

use crate::deflate::{PerMessageDeflate, PerMessageDeflateConfig};
use crate::error::HandshakeError;
use crate::frame::{MaskGenerator, OsMaskGenerator, Role};
use crate::handshake::{read_http_head, ClientHandshake, HttpResponse, WsUrl, SUPPORTED_VERSIONS};
use crate::websocket::{ConnectionConfig, Upgrade, WebSocket};
use async_trait::async_trait;
use base64::Engine;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Settings for the connection once open.
    pub connection: ConnectionConfig,
    /// Offer permessage-deflate with these settings. `None` disables it.
    pub per_message_deflate: Option<PerMessageDeflateConfig>,
    /// `Sec-WebSocket-Version` to send (8 or 13).
    pub protocol_version: u8,
    /// Requested subprotocols, in preference order.
    pub protocols: Vec<String>,
    /// Value for `Origin` (or `Sec-WebSocket-Origin` for version 8).
    pub origin: Option<String>,
    /// Extra request headers.
    pub headers: HeaderMap,
    /// Follow 3xx responses carrying a `Location` header.
    pub follow_redirects: bool,
    /// Most redirects followed before giving up.
    pub max_redirects: usize,
    /// Deadline for the whole opening handshake, redirects included.
    pub handshake_timeout: Option<Duration>,
    /// Masking key source for outgoing frames.
    pub mask_generator: Arc<dyn MaskGenerator>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            per_message_deflate: Some(PerMessageDeflateConfig::default()),
            protocol_version: 13,
            protocols: Vec::new(),
            origin: None,
            headers: HeaderMap::new(),
            follow_redirects: false,
            max_redirects: 10,
            handshake_timeout: None,
            mask_generator: Arc::new(OsMaskGenerator),
        }
    }
}

impl ClientConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection settings.
    #[must_use]
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set or disable the permessage-deflate offer.
    #[must_use]
    pub fn per_message_deflate(mut self, config: Option<PerMessageDeflateConfig>) -> Self {
        self.per_message_deflate = config;
        self
    }

    /// Set the protocol version.
    #[must_use]
    pub const fn protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = version;
        self
    }

    /// Add a requested subprotocol.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Set the origin.
    #[must_use]
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Add a request header.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Enable or disable redirect following.
    #[must_use]
    pub const fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Set the redirect limit.
    #[must_use]
    pub const fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Set the handshake deadline.
    #[must_use]
    pub const fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the masking key source.
    #[must_use]
    pub fn mask_generator(mut self, masks: Arc<dyn MaskGenerator>) -> Self {
        self.mask_generator = masks;
        self
    }
}

// =============================================================================
// Transports
// =============================================================================

/// Opens the byte stream for one handshake attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Transport produced by this connector.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a transport to `url`'s host and port.
    async fn connect(&self, url: &WsUrl) -> Result<Self::Stream, HandshakeError>;
}

/// Plain TCP connector for `ws:` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, url: &WsUrl) -> Result<TcpStream, HandshakeError> {
        if url.is_secure() {
            return Err(HandshakeError::Unsupported(
                "wss: URLs need a Connector that performs TLS",
            ));
        }
        let stream = TcpStream::connect((url.host(), url.port())).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

// =============================================================================
// Connecting
// =============================================================================

/// Connect to `url` over TCP with the default configuration.
pub async fn connect(url: &str) -> Result<WebSocket<TcpStream>, HandshakeError> {
    connect_with(url, ClientConfig::default()).await
}

/// Connect to `url` over TCP.
pub async fn connect_with(url: &str, config: ClientConfig) -> Result<WebSocket<TcpStream>, HandshakeError> {
    connect_with_connector(url, config, &TcpConnector).await
}

/// Connect to `url`, opening each transport through `connector`.
pub async fn connect_with_connector<C>(
    url: &str,
    config: ClientConfig,
    connector: &C,
) -> Result<WebSocket<C::Stream>, HandshakeError>
where
    C: Connector,
{
    check_version(config.protocol_version)?;
    let url = WsUrl::parse(url)?;
    let timeout = config.handshake_timeout;
    let attempt = follow(url, &config, connector);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| HandshakeError::Timeout)?,
        None => attempt.await,
    }
}

/// Perform the opening handshake over an already open transport.
///
/// Redirect responses are reported as unexpected; there is no connector to
/// reach the new location with.
pub async fn client_handshake<IO>(
    io: IO,
    url: &str,
    config: ClientConfig,
) -> Result<WebSocket<IO>, HandshakeError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    check_version(config.protocol_version)?;
    let url = WsUrl::parse(url)?;
    let mut headers = config.headers.clone();
    if let Some(auth) = url.userinfo() {
        if !headers.contains_key(header::AUTHORIZATION) {
            headers.insert(header::AUTHORIZATION, basic_auth(&auth)?);
        }
    }
    let attempt = async {
        match handshake(io, &url, &headers, &config, false).await? {
            Attempt::Open(ws) => Ok(ws),
            Attempt::Redirect { status, .. } => Err(HandshakeError::UnexpectedResponse(status)),
        }
    };
    match config.handshake_timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| HandshakeError::Timeout)?,
        None => attempt.await,
    }
}

fn check_version(version: u8) -> Result<(), HandshakeError> {
    if SUPPORTED_VERSIONS.contains(&version) {
        Ok(())
    } else {
        Err(HandshakeError::UnsupportedVersion(version))
    }
}

fn basic_auth(userinfo: &str) -> Result<HeaderValue, HandshakeError> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(userinfo);
    HeaderValue::from_str(&format!("Basic {encoded}"))
        .map_err(|_| HandshakeError::InvalidHttp("invalid credentials in URL".into()))
}

enum Attempt<IO> {
    Open(WebSocket<IO>),
    Redirect { status: u16, location: String },
}

async fn follow<C>(mut url: WsUrl, config: &ClientConfig, connector: &C) -> Result<WebSocket<C::Stream>, HandshakeError>
where
    C: Connector,
{
    let original_host = url.authority();
    let original_secure = url.is_secure();
    // Persists across hops, like the caller's own headers.
    let mut headers = config.headers.clone();
    let mut redirects = 0usize;

    loop {
        let mut request_headers = headers.clone();
        let mut auth = url.userinfo();
        if redirects > 0 {
            let same_host = url.authority() == original_host;
            if !same_host || (original_secure && !url.is_secure()) {
                request_headers.remove(header::AUTHORIZATION);
                request_headers.remove(header::COOKIE);
                if !same_host {
                    request_headers.remove(header::HOST);
                }
                auth = None;
            }
        }
        if let Some(auth) = auth {
            if !headers.contains_key(header::AUTHORIZATION) {
                let value = basic_auth(&auth)?;
                if config.follow_redirects {
                    headers.insert(header::AUTHORIZATION, value.clone());
                }
                request_headers.insert(header::AUTHORIZATION, value);
            }
        }

        let stream = connector.connect(&url).await?;
        match handshake(stream, &url, &request_headers, config, config.follow_redirects).await? {
            Attempt::Open(ws) => return Ok(ws),
            Attempt::Redirect { status, location } => {
                redirects += 1;
                if redirects > config.max_redirects {
                    tracing::debug!(target: "ws::handshake", redirects, "too many redirects");
                    return Err(HandshakeError::MaxRedirects);
                }
                let next = url.join(&location)?;
                tracing::debug!(
                    target: "ws::handshake",
                    status,
                    redirects,
                    from = %url,
                    to = %next,
                    "redirect followed"
                );
                url = next;
            }
        }
    }
}

async fn handshake<IO>(
    mut io: IO,
    url: &WsUrl,
    headers: &HeaderMap,
    config: &ClientConfig,
    follow_redirects: bool,
) -> Result<Attempt<IO>, HandshakeError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut handshake = ClientHandshake::new(url.clone())?
        .protocols(&config.protocols)?
        .headers(headers);
    if let Some(deflate) = &config.per_message_deflate {
        handshake = handshake.per_message_deflate(PerMessageDeflate::new(
            deflate.clone(),
            false,
            config.connection.max_payload,
        ));
    }

    let request = handshake.request_bytes(config.protocol_version, config.origin.as_deref())?;
    io.write_all(&request).await?;
    io.flush().await?;
    tracing::debug!(target: "ws::handshake", url = %url, "handshake request sent");

    let (head, trailing) = read_http_head(&mut io).await?;
    let response = HttpResponse::parse(&head)?;

    if follow_redirects && (300..400).contains(&response.status) {
        if let Some(location) = response.header("location") {
            return Ok(Attempt::Redirect {
                status: response.status,
                location: location.to_owned(),
            });
        }
    }

    let negotiated = match handshake.validate_response(&response) {
        Ok(negotiated) => negotiated,
        Err(err) => {
            tracing::debug!(target: "ws::handshake", status = response.status, %err, "handshake rejected");
            return Err(err);
        }
    };
    let upgrade = Upgrade::from_negotiated(negotiated)
        .head(trailing)
        .url(url.to_string())
        .masks(Arc::clone(&config.mask_generator));
    Ok(Attempt::Open(WebSocket::from_upgraded(
        io,
        Role::Client,
        config.connection.clone(),
        upgrade,
    )))
}
