//! WebSocket server: upgrade validation, negotiation and client tracking.
//!
//! [`WebSocketServer::bind`] listens on TCP and upgrades each connection in
//! its own task; finished connections come out of
//! [`WebSocketServer::accept`]. Plain HTTP requests are answered with
//! `426 Upgrade Required`. Transports accepted elsewhere go through
//! [`WebSocketServer::handle_upgrade`] instead.
//!
//! Upgrade requests are checked in a fixed order, and the first failure is
//! answered with an HTTP error and the transport is closed:
//!
//! | Check | Status | Body |
//! |---|---|---|
//! | method is `GET` | 405 | `Invalid HTTP method` |
//! | `Upgrade: websocket` | 400 | `Invalid Upgrade header` |
//! | `Sec-WebSocket-Key` shape | 400 | `Missing or invalid Sec-WebSocket-Key header` |
//! | `Sec-WebSocket-Version` is 8 or 13 | 400 | `Missing or invalid Sec-WebSocket-Version header` |
//! | path matches | 400 | `Bad Request` |
//! | `Sec-WebSocket-Protocol` grammar | 400 | `Invalid Sec-WebSocket-Protocol header` |
//! | permessage-deflate offer acceptable | 400 | `Invalid or unacceptable Sec-WebSocket-Extensions header` |
//! | [`VerifyClient`] | 401 or chosen | chosen |
//! | server still running | 503 | `Service Unavailable` |

use crate::deflate::{PerMessageDeflate, PerMessageDeflateConfig, EXTENSION_NAME};
use crate::error::HandshakeError;
use crate::extension::{parse_extensions, parse_protocols};
use crate::frame::Role;
use crate::handshake::{compute_accept_key, is_valid_client_key, read_http_head, HttpRequest};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::sender::SenderHandle;
use crate::websocket::{ConnectionConfig, Upgrade, WebSocket};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};

const INCOMING_BACKLOG: usize = 64;

// =============================================================================
// Strategies
// =============================================================================

/// What a [`VerifyClient`] hook sees about an upgrade request.
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo<'a> {
    /// `Origin` (or `Sec-WebSocket-Origin` for version 8).
    pub origin: Option<&'a str>,
    /// Whether the transport is encrypted.
    pub secure: bool,
    /// The upgrade request.
    pub request: &'a HttpRequest,
}

/// HTTP answer for a refused upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Response status.
    pub status: u16,
    /// Response body; the status text when absent.
    pub message: Option<String>,
    /// Extra response headers.
    pub headers: HeaderMap,
}

impl Default for Rejection {
    fn default() -> Self {
        Self::new(401)
    }
}

impl Rejection {
    /// Rejection with `status` and the default body.
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            message: None,
            headers: HeaderMap::new(),
        }
    }

    /// Set the response body.
    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Add a response header.
    #[must_use]
    pub fn header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Outcome of [`VerifyClient::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Continue the upgrade.
    Accept,
    /// Refuse the upgrade.
    Reject(Rejection),
}

impl Verdict {
    /// Refuse with `401 Unauthorized`.
    #[must_use]
    pub fn reject() -> Self {
        Self::Reject(Rejection::default())
    }
}

/// Decides whether an upgrade request may proceed.
///
/// Runs after the request passed protocol validation and extension
/// negotiation. Plain closures `Fn(&ClientInfo) -> Verdict` implement it.
#[async_trait]
pub trait VerifyClient: Send + Sync {
    /// Inspect the request.
    async fn verify(&self, info: &ClientInfo<'_>) -> Verdict;
}

#[async_trait]
impl<F> VerifyClient for F
where
    F: Fn(&ClientInfo<'_>) -> Verdict + Send + Sync,
{
    async fn verify(&self, info: &ClientInfo<'_>) -> Verdict {
        self(info)
    }
}

/// Picks the subprotocol from the client's list.
///
/// Returning `None` accepts the connection without a subprotocol. Without a
/// chooser the client's first protocol wins.
pub trait HandleProtocols: Send + Sync {
    /// Choose one of `protocols`.
    fn select(&self, protocols: &[String], request: &HttpRequest) -> Option<String>;
}

impl<F> HandleProtocols for F
where
    F: Fn(&[String], &HttpRequest) -> Option<String> + Send + Sync,
{
    fn select(&self, protocols: &[String], request: &HttpRequest) -> Option<String> {
        self(protocols, request)
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Settings for accepted connections.
    pub connection: ConnectionConfig,
    /// Accept permessage-deflate offers with these settings. `None` ignores them.
    pub per_message_deflate: Option<PerMessageDeflateConfig>,
    /// Only accept upgrades for this path (query ignored).
    pub path: Option<String>,
    /// Track accepted clients; closing then waits for them.
    pub client_tracking: bool,
    /// Upgrade gate.
    pub verify_client: Option<Arc<dyn VerifyClient>>,
    /// Subprotocol chooser.
    pub handle_protocols: Option<Arc<dyn HandleProtocols>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            per_message_deflate: None,
            path: None,
            client_tracking: true,
            verify_client: None,
            handle_protocols: None,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("connection", &self.connection)
            .field("per_message_deflate", &self.per_message_deflate)
            .field("path", &self.path)
            .field("client_tracking", &self.client_tracking)
            .field("verify_client", &self.verify_client.is_some())
            .field("handle_protocols", &self.handle_protocols.is_some())
            .finish()
    }
}

impl ServerConfig {
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

    /// Enable or disable permessage-deflate.
    #[must_use]
    pub fn per_message_deflate(mut self, config: Option<PerMessageDeflateConfig>) -> Self {
        self.per_message_deflate = config;
        self
    }

    /// Restrict upgrades to `path`.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Enable or disable client tracking.
    #[must_use]
    pub const fn client_tracking(mut self, enabled: bool) -> Self {
        self.client_tracking = enabled;
        self
    }

    /// Install the upgrade gate.
    #[must_use]
    pub fn verify_client(mut self, verify: impl VerifyClient + 'static) -> Self {
        self.verify_client = Some(Arc::new(verify));
        self
    }

    /// Install the subprotocol chooser.
    #[must_use]
    pub fn handle_protocols(mut self, handle: impl HandleProtocols + 'static) -> Self {
        self.handle_protocols = Some(Arc::new(handle));
        self
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Serialize an HTTP error response for a refused upgrade.
///
/// `message` defaults to the status text. Entries in `headers` replace the
/// defaults of the same name or are appended.
#[must_use]
pub fn abort_handshake(status: u16, message: Option<&str>, headers: &HeaderMap) -> Vec<u8> {
    let reason = status_text(status);
    let body = message.unwrap_or(reason);
    let mut fields: Vec<(String, String)> = vec![
        ("Connection".into(), "close".into()),
        ("Content-Type".into(), "text/html".into()),
        ("Content-Length".into(), body.len().to_string()),
    ];
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match fields.iter_mut().find(|(field, _)| field.eq_ignore_ascii_case(name.as_str())) {
            Some(field) => field.1 = value,
            None => fields.push((name.as_str().to_owned(), value)),
        }
    }

    let mut response = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in &fields {
        response.push_str(name);
        response.push_str(": ");
        response.push_str(value);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response.push_str(body);
    response.into_bytes()
}

fn status_text(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Unknown")
}

const UPGRADE_REQUIRED: &[u8] =
    b"HTTP/1.1 426 Upgrade Required\r\nContent-Length: 16\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nUpgrade Required";

async fn reject<IO>(io: &mut IO, status: u16, message: Option<&str>, headers: &HeaderMap) -> HandshakeError
where
    IO: AsyncWrite + Unpin,
{
    let response = abort_handshake(status, message, headers);
    let written = async {
        io.write_all(&response).await?;
        io.shutdown().await
    };
    if let Err(err) = written.await {
        tracing::debug!(target: "ws::server", %err, "failed to write rejection");
    }
    let message = message.unwrap_or_else(|| status_text(status)).to_owned();
    tracing::debug!(target: "ws::server", status, message = %message, "upgrade rejected");
    HandshakeError::Rejected { status, message }
}

// =============================================================================
// Server
// =============================================================================

/// Server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    /// Accepting upgrades.
    Running,
    /// Refusing upgrades, waiting for tracked clients to go away.
    Closing,
    /// Done.
    Closed,
}

type Accepted = (WebSocket<TcpStream>, HttpRequest);

struct Shared {
    config: ServerConfig,
    state: watch::Sender<ServerState>,
    clients: Mutex<ConnectionRegistry<SenderHandle>>,
}

/// WebSocket server.
pub struct WebSocketServer {
    shared: Arc<Shared>,
    incoming: Option<mpsc::Receiver<Accepted>>,
    local_addr: Option<SocketAddr>,
}

impl fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("config", &self.shared.config)
            .field("state", &self.state())
            .field("clients", &self.clients())
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl WebSocketServer {
    /// Server without a listener; feed it through [`handle_upgrade`](Self::handle_upgrade).
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let (state, _) = watch::channel(ServerState::Running);
        Self {
            shared: Arc::new(Shared {
                config,
                state,
                clients: Mutex::new(ConnectionRegistry::new()),
            }),
            incoming: None,
            local_addr: None,
        }
    }

    /// Listen on `addr` and upgrade incoming connections in the background.
    ///
    /// Must be called within a tokio runtime.
    pub async fn bind(addr: impl ToSocketAddrs, config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let mut server = Self::new(config);
        let (tx, rx) = mpsc::channel(INCOMING_BACKLOG);
        tokio::spawn(run_listener(listener, Arc::clone(&server.shared), tx));
        server.incoming = Some(rx);
        server.local_addr = Some(local_addr);
        tracing::debug!(target: "ws::server", %local_addr, "listening");
        Ok(server)
    }

    /// Next upgraded connection and the request that opened it.
    ///
    /// Fails with [`HandshakeError::ServerClosed`] once the server stopped
    /// listening and every upgrade in flight was delivered. Individual
    /// failed upgrades are answered and logged, never returned here.
    pub async fn accept(&mut self) -> Result<(WebSocket<TcpStream>, HttpRequest), HandshakeError> {
        let incoming = self
            .incoming
            .as_mut()
            .ok_or(HandshakeError::Unsupported("the server is not bound to a listener"))?;
        incoming.recv().await.ok_or(HandshakeError::ServerClosed)
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Whether `request` targets the configured path.
    #[must_use]
    pub fn should_handle(&self, request: &HttpRequest) -> bool {
        self.shared.should_handle(request)
    }

    /// Upgrade a connection accepted elsewhere.
    ///
    /// `head` holds bytes read past the request head. On failure the error
    /// response has already been written and the transport shut down.
    pub async fn handle_upgrade<IO>(
        &self,
        request: &HttpRequest,
        io: IO,
        head: Bytes,
    ) -> Result<WebSocket<IO>, HandshakeError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.shared.upgrade(request, io, head, false).await
    }

    /// [`handle_upgrade`](Self::handle_upgrade) for an encrypted transport.
    pub async fn handle_secure_upgrade<IO>(
        &self,
        request: &HttpRequest,
        io: IO,
        head: Bytes,
    ) -> Result<WebSocket<IO>, HandshakeError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.shared.upgrade(request, io, head, true).await
    }

    /// Number of tracked clients.
    #[must_use]
    pub fn clients(&self) -> usize {
        self.shared.clients.lock().len()
    }

    /// Write handles of every tracked client, e.g. for broadcasting.
    #[must_use]
    pub fn client_senders(&self) -> Vec<SenderHandle> {
        self.shared
            .clients
            .lock()
            .iter()
            .map(|(_, sender)| sender.clone())
            .collect()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.shared.state.borrow()
    }

    /// Stop accepting upgrades.
    ///
    /// The listener stops and later upgrades get `503`. Open connections are
    /// left alone; the server is Closed once the last tracked client is gone.
    pub fn close(&self) {
        let clients = self.shared.clients.lock();
        let drained = !self.shared.config.client_tracking || clients.is_empty();
        let changed = self.shared.state.send_if_modified(|state| {
            if *state != ServerState::Running {
                return false;
            }
            *state = if drained {
                ServerState::Closed
            } else {
                ServerState::Closing
            };
            true
        });
        drop(clients);
        if changed {
            tracing::debug!(target: "ws::server", state = ?self.state(), "server closing");
        }
    }

    /// Wait until the server is Closed.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|state| *state == ServerState::Closed).await;
    }
}

impl Shared {
    fn should_handle(&self, request: &HttpRequest) -> bool {
        self.config.path.as_deref().map_or(true, |path| request.path() == path)
    }

    fn is_running(&self) -> bool {
        *self.state.borrow() == ServerState::Running
    }

    fn release(&self, id: ConnectionId) {
        let mut clients = self.clients.lock();
        clients.remove(id);
        let drained = clients.is_empty();
        self.state.send_if_modified(|state| {
            if drained && *state == ServerState::Closing {
                *state = ServerState::Closed;
                true
            } else {
                false
            }
        });
    }

    async fn upgrade<IO>(
        self: &Arc<Self>,
        request: &HttpRequest,
        mut io: IO,
        head: Bytes,
        secure: bool,
    ) -> Result<WebSocket<IO>, HandshakeError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let none = HeaderMap::new();

        if request.method != "GET" {
            return Err(reject(&mut io, 405, Some("Invalid HTTP method"), &none).await);
        }
        if !request
            .header("upgrade")
            .is_some_and(|upgrade| upgrade.eq_ignore_ascii_case("websocket"))
        {
            return Err(reject(&mut io, 400, Some("Invalid Upgrade header"), &none).await);
        }
        let key = match request.header("sec-websocket-key") {
            Some(key) if is_valid_client_key(key) => key.to_owned(),
            _ => {
                let message = "Missing or invalid Sec-WebSocket-Key header";
                return Err(reject(&mut io, 400, Some(message), &none).await);
            }
        };
        let version = match request.header("sec-websocket-version").map(str::trim) {
            Some("13") => 13,
            Some("8") => 8,
            _ => {
                let message = "Missing or invalid Sec-WebSocket-Version header";
                return Err(reject(&mut io, 400, Some(message), &none).await);
            }
        };
        if !self.should_handle(request) {
            return Err(reject(&mut io, 400, None, &none).await);
        }

        let protocols = match request.header("sec-websocket-protocol").map(parse_protocols) {
            None => Vec::new(),
            Some(Ok(protocols)) => protocols,
            Some(Err(_)) => {
                let message = "Invalid Sec-WebSocket-Protocol header";
                return Err(reject(&mut io, 400, Some(message), &none).await);
            }
        };

        let mut deflate = None;
        if let (Some(config), Some(header)) = (
            &self.config.per_message_deflate,
            request.header("sec-websocket-extensions"),
        ) {
            let mut negotiator = PerMessageDeflate::new(config.clone(), true, self.config.connection.max_payload);
            let accepted = parse_extensions(header).and_then(|offers| match offers.get(EXTENSION_NAME) {
                Some(offers) => negotiator.accept(offers).map(|_| true),
                None => Ok(false),
            });
            match accepted {
                Ok(true) => deflate = Some(negotiator),
                Ok(false) => {}
                Err(err) => {
                    tracing::debug!(target: "ws::server", %err, "extension negotiation failed");
                    let message = "Invalid or unacceptable Sec-WebSocket-Extensions header";
                    return Err(reject(&mut io, 400, Some(message), &none).await);
                }
            }
        }

        if let Some(verify) = &self.config.verify_client {
            let origin = if version == 8 { "sec-websocket-origin" } else { "origin" };
            let info = ClientInfo {
                origin: request.header(origin),
                secure,
                request,
            };
            if let Verdict::Reject(rejection) = verify.verify(&info).await {
                return Err(reject(&mut io, rejection.status, rejection.message.as_deref(), &rejection.headers).await);
            }
        }

        if !self.is_running() {
            return Err(reject(&mut io, 503, None, &none).await);
        }

        let protocol = if protocols.is_empty() {
            None
        } else {
            match &self.config.handle_protocols {
                Some(handle) => handle.select(&protocols, request),
                None => protocols.first().cloned(),
            }
        };
        let extensions = deflate.as_ref().and_then(PerMessageDeflate::response_header);

        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n",
            compute_accept_key(&key)
        );
        if let Some(protocol) = &protocol {
            response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
        }
        if let Some(extensions) = &extensions {
            response.push_str(&format!("Sec-WebSocket-Extensions: {extensions}\r\n"));
        }
        response.push_str("\r\n");
        io.write_all(response.as_bytes()).await?;
        io.flush().await?;

        tracing::debug!(
            target: "ws::server",
            path = request.path(),
            version,
            protocol = protocol.as_deref().unwrap_or(""),
            extensions = extensions.as_deref().unwrap_or(""),
            "upgrade accepted"
        );

        let upgrade = Upgrade {
            protocol,
            extensions,
            deflate,
            head,
            ..Upgrade::default()
        };
        let connection = self.config.connection.clone();
        if !self.config.client_tracking {
            return Ok(WebSocket::from_upgraded(io, Role::Server, connection, upgrade));
        }

        let server: Weak<Self> = Arc::downgrade(self);
        let mut opened = None;
        self.clients.lock().insert_with(|id| {
            let upgrade = upgrade.on_close(move || {
                if let Some(server) = server.upgrade() {
                    server.release(id);
                }
            });
            let ws = WebSocket::from_upgraded(io, Role::Server, connection, upgrade);
            let sender = ws.sender();
            opened = Some(ws);
            sender
        });
        opened.ok_or(HandshakeError::ServerClosed)
    }
}

async fn run_listener(listener: TcpListener, shared: Arc<Shared>, tx: mpsc::Sender<Accepted>) {
    let mut state = shared.state.subscribe();
    loop {
        let stopped = async {
            let _ = state.wait_for(|state| *state != ServerState::Running).await;
        };
        let (stream, peer) = tokio::select! {
            () = stopped => break,
            () = tx.closed() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(target: "ws::server", %err, "accept failed");
                    continue;
                }
            },
        };

        let shared = Arc::clone(&shared);
        let tx = tx.clone();
        tokio::spawn(async move {
            match serve(&shared, stream).await {
                Ok(Some(accepted)) => {
                    // A dropped server drops the connection with it.
                    let _ = tx.send(accepted).await;
                }
                Ok(None) => {}
                Err(err) => tracing::debug!(target: "ws::server", %peer, %err, "upgrade failed"),
            }
        });
    }
    tracing::debug!(target: "ws::server", "listener stopped");
}

async fn serve(shared: &Arc<Shared>, mut stream: TcpStream) -> Result<Option<Accepted>, HandshakeError> {
    stream.set_nodelay(true)?;
    let (head, rest) = read_http_head(&mut stream).await?;
    let request = HttpRequest::parse(&head)?;
    if request.header("upgrade").is_none() {
        stream.write_all(UPGRADE_REQUIRED).await?;
        stream.shutdown().await?;
        tracing::debug!(target: "ws::server", path = request.path(), "plain HTTP request answered with 426");
        return Ok(None);
    }
    let ws = shared.upgrade(&request, stream, rest, false).await?;
    Ok(Some((ws, request)))
}
