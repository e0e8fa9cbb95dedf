//! Connection driver shared by both roles.
//!
//! A [`WebSocket`] owns the read half of an upgraded transport and the
//! [`Receiver`] parsing it. The write half belongs to a spawned [`Sender`]
//! task; the connection keeps one [`SenderHandle`] and hands out clones
//! through [`WebSocket::sender`].
//!
//! The connection only makes progress while [`WebSocket::recv`] is polled:
//! it reads from the transport, answers pings, echoes close frames, enforces
//! the close-handshake deadline and sends keepalive pings. Every lifecycle
//! ends with exactly one [`Event::Close`], after which `recv` returns `None`.
//!
//! # Cancel-Safety
//!
//! `recv` is cancel-safe. Dropping it while it waits on the transport or a
//! timer loses nothing, and an inflate it started keeps running on its own
//! task; the next `recv` picks up the result.

use crate::close::{CloseHandshake, ReadyState, ABNORMAL_CLOSURE, DEFAULT_CLOSE_TIMEOUT, NO_STATUS_RECEIVED};
use crate::deflate::PerMessageDeflate;
use crate::error::WsError;
use crate::frame::{MaskGenerator, OsMaskGenerator, Role};
use crate::handshake::Negotiated;
use crate::receiver::{Receiver, ReceiverConfig, ReceiverEvent};
use crate::sender::{Completion, SendOptions, Sender, SenderHandle};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Default largest accepted message (100 MiB).
pub const DEFAULT_MAX_PAYLOAD: u64 = 100 * 1024 * 1024;

/// Default queued-write level above which reading pauses (1 MiB).
pub const DEFAULT_WRITE_HIGH_WATER: usize = 1024 * 1024;

const READ_CHUNK: usize = 16 * 1024;

// =============================================================================
// Messages and events
// =============================================================================

/// A complete data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message. UTF-8 unless validation was disabled.
    Text(Bytes),
    /// Binary message.
    Binary(Bytes),
}

impl Message {
    /// Create a text message.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(Bytes::from(text.into()))
    }

    /// Create a binary message.
    #[must_use]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Whether this is a text message.
    #[must_use]
    pub const fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    /// Payload bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(data) | Self::Binary(data) => data,
        }
    }

    /// Payload as text, for text messages holding valid UTF-8.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(data) => std::str::from_utf8(data).ok(),
            Self::Binary(_) => None,
        }
    }

    /// Consume the message, returning its payload.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Text(data) | Self::Binary(data) => data,
        }
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Terminal event of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Status code from the peer's close frame, the code we failed the
    /// connection with, or 1006.
    pub code: u16,
    /// Close reason bytes.
    pub reason: Bytes,
}

impl CloseEvent {
    /// Reason as text, if it is valid UTF-8.
    #[must_use]
    pub fn reason_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.reason).ok()
    }
}

/// Something that happened on a connection.
#[derive(Debug)]
pub enum Event {
    /// A data message arrived.
    Message(Message),
    /// A ping arrived. It has already been answered if auto-pong is on.
    Ping(Bytes),
    /// A pong arrived.
    Pong(Bytes),
    /// The peer violated the protocol. A close frame with the matching code
    /// has been queued; [`Event::Close`] follows.
    Error(WsError),
    /// The connection is closed. Always the last event.
    Close(CloseEvent),
}

// =============================================================================
// Configuration
// =============================================================================

/// Per-connection settings shared by clients and servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Largest accepted message in bytes. 0 disables the limit.
    pub max_payload: u64,
    /// Deliver text and close reasons without UTF-8 checks.
    pub skip_utf8_validation: bool,
    /// Answer pings automatically while open.
    pub auto_pong: bool,
    /// How long to wait for the close handshake before destroying the transport.
    pub close_timeout: Duration,
    /// Send a keepalive ping at this interval while open.
    pub ping_interval: Option<Duration>,
    /// Stop reading while more than this many bytes are queued for writing.
    /// 0 disables the check.
    pub write_buffer_high_water: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            skip_utf8_validation: false,
            auto_pong: true,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            ping_interval: None,
            write_buffer_high_water: DEFAULT_WRITE_HIGH_WATER,
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the message size limit.
    #[must_use]
    pub const fn max_payload(mut self, max_payload: u64) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Skip UTF-8 validation of received text.
    #[must_use]
    pub const fn skip_utf8_validation(mut self, skip: bool) -> Self {
        self.skip_utf8_validation = skip;
        self
    }

    /// Enable or disable automatic pongs.
    #[must_use]
    pub const fn auto_pong(mut self, enabled: bool) -> Self {
        self.auto_pong = enabled;
        self
    }

    /// Set the close-handshake deadline.
    #[must_use]
    pub const fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the keepalive ping interval.
    #[must_use]
    pub const fn ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the write backlog that pauses reading.
    #[must_use]
    pub const fn write_buffer_high_water(mut self, bytes: usize) -> Self {
        self.write_buffer_high_water = bytes;
        self
    }

    fn receiver_config(&self, role: Role) -> ReceiverConfig {
        ReceiverConfig::new(role)
            .max_payload(self.max_payload)
            .skip_utf8_validation(self.skip_utf8_validation)
    }
}

/// Everything the opening handshake settled, handed to [`WebSocket::from_upgraded`].
pub struct Upgrade {
    /// Negotiated subprotocol.
    pub protocol: Option<String>,
    /// Negotiated `Sec-WebSocket-Extensions` value.
    pub extensions: Option<String>,
    /// Accepted permessage-deflate state.
    pub deflate: Option<PerMessageDeflate>,
    /// Bytes read past the end of the HTTP head.
    pub head: Bytes,
    /// URL of the connection, when known.
    pub url: Option<String>,
    /// Masking key source for outgoing frames.
    pub masks: Arc<dyn MaskGenerator>,
    /// Runs once when the connection reaches Closed or is dropped.
    pub on_close: Option<CloseHook>,
}

/// Callback run when a connection goes away.
pub type CloseHook = Box<dyn FnOnce() + Send + Sync>;

impl Default for Upgrade {
    fn default() -> Self {
        Self {
            protocol: None,
            extensions: None,
            deflate: None,
            head: Bytes::new(),
            url: None,
            masks: Arc::new(OsMaskGenerator),
            on_close: None,
        }
    }
}

impl Upgrade {
    /// Upgrade with nothing negotiated.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upgrade carrying the outcome of a client handshake.
    #[must_use]
    pub fn from_negotiated(negotiated: Negotiated) -> Self {
        Self {
            protocol: negotiated.protocol,
            extensions: negotiated.extensions,
            deflate: negotiated.deflate,
            ..Self::default()
        }
    }

    /// Set the bytes that followed the HTTP head.
    #[must_use]
    pub fn head(mut self, head: Bytes) -> Self {
        self.head = head;
        self
    }

    /// Set the connection URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the mask key source.
    #[must_use]
    pub fn masks(mut self, masks: Arc<dyn MaskGenerator>) -> Self {
        self.masks = masks;
        self
    }

    /// Install a hook that runs when the connection goes away.
    #[must_use]
    pub fn on_close(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for Upgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgrade")
            .field("protocol", &self.protocol)
            .field("extensions", &self.extensions)
            .field("head", &self.head.len())
            .field("url", &self.url)
            .field("masks", &self.masks)
            .field("on_close", &self.on_close.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// WebSocket
// =============================================================================

/// An open WebSocket connection.
pub struct WebSocket<IO> {
    /// Dropped on Closed so the transport goes away with the writer task.
    reader: Option<ReadHalf<IO>>,
    read_buf: Box<[u8]>,
    receiver: Receiver,
    sender: SenderHandle,
    role: Role,
    config: ConnectionConfig,
    state: ReadyState,
    close: CloseHandshake,
    /// Close code we failed the connection with after a receive error.
    failure: Option<u16>,
    /// The write side has been asked to shut down.
    ended: bool,
    close_deadline: Option<Instant>,
    keepalive: Option<Interval>,
    pending: VecDeque<Event>,
    protocol: Option<String>,
    extensions: Option<String>,
    url: Option<String>,
    on_close: Option<CloseHook>,
}

impl<IO> fmt::Debug for WebSocket<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("protocol", &self.protocol)
            .field("extensions", &self.extensions)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl<IO> WebSocket<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a transport whose opening handshake has completed.
    ///
    /// Spawns the writer task, so it must be called within a tokio runtime.
    #[must_use]
    pub fn from_upgraded(io: IO, role: Role, config: ConnectionConfig, upgrade: Upgrade) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let receiver_config = config.receiver_config(role);
        let (deflater, mut receiver) = match upgrade.deflate.and_then(PerMessageDeflate::into_codecs) {
            Some((deflater, inflater)) => (Some(deflater), Receiver::with_inflater(receiver_config, inflater)),
            None => (None, Receiver::new(receiver_config)),
        };
        receiver.feed(&upgrade.head);

        let sender = Sender::spawn(writer, role, upgrade.masks, deflater);
        let keepalive = config.ping_interval.filter(|period| !period.is_zero()).map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        tracing::debug!(
            target: "ws::connection",
            ?role,
            protocol = upgrade.protocol.as_deref().unwrap_or(""),
            extensions = upgrade.extensions.as_deref().unwrap_or(""),
            "connection open"
        );

        Self {
            reader: Some(reader),
            read_buf: vec![0; READ_CHUNK].into_boxed_slice(),
            receiver,
            sender,
            role,
            config,
            state: ReadyState::Open,
            close: CloseHandshake::new(),
            failure: None,
            ended: false,
            close_deadline: None,
            keepalive,
            pending: VecDeque::new(),
            protocol: upgrade.protocol,
            extensions: upgrade.extensions,
            url: upgrade.url,
            on_close: upgrade.on_close,
        }
    }

    /// Wait for the next event. Returns `None` after [`Event::Close`].
    ///
    /// Cancel-safe, so it can sit in a `tokio::select!` loop.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.state == ReadyState::Closed {
                return None;
            }
            self.drive().await;
        }
    }

    /// Queue a data message.
    pub fn send(&self, data: impl Into<Bytes>, options: SendOptions) -> Completion {
        if self.state != ReadyState::Open {
            return Completion::ready(Err(WsError::NotOpen(self.state)));
        }
        self.sender.send(data, options)
    }

    /// Queue a text message.
    pub fn send_text(&self, text: impl Into<String>) -> Completion {
        self.send(text.into(), SendOptions::text())
    }

    /// Queue a binary message.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> Completion {
        self.send(data, SendOptions::binary())
    }

    /// Queue a [`Message`].
    pub fn send_message(&self, message: Message) -> Completion {
        let options = if message.is_text() {
            SendOptions::text()
        } else {
            SendOptions::binary()
        };
        self.send(message.into_bytes(), options)
    }

    /// Queue a ping.
    pub fn ping(&self, payload: impl Into<Bytes>) -> Result<Completion, WsError> {
        self.require_open()?;
        self.sender.ping(payload)
    }

    /// Queue a pong.
    pub fn pong(&self, payload: impl Into<Bytes>) -> Result<Completion, WsError> {
        self.require_open()?;
        self.sender.pong(payload)
    }

    /// Start the closing handshake.
    ///
    /// Queues a close frame; keep calling [`recv`](Self::recv) until
    /// [`Event::Close`] to finish the handshake. Without a code the frame is
    /// empty and `reason` is ignored. Does nothing once closing has started,
    /// except shutting the transport down when both close frames have crossed.
    pub fn close(&mut self, code: Option<u16>, reason: impl AsRef<[u8]>) -> Result<(), WsError> {
        self.start_close(code, reason.as_ref())
    }

    /// Destroy the transport without a closing handshake.
    pub fn terminate(&mut self) {
        if self.state == ReadyState::Closed {
            return;
        }
        tracing::debug!(target: "ws::connection", "terminated");
        self.state = ReadyState::Closing;
        self.sender.destroy();
        self.finish();
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn ready_state(&self) -> ReadyState {
        self.state
    }

    /// Subprotocol chosen during the handshake.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Negotiated `Sec-WebSocket-Extensions` value.
    #[must_use]
    pub fn extensions(&self) -> Option<&str> {
        self.extensions.as_deref()
    }

    /// URL this connection was opened to.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Role of the local endpoint.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Payload bytes queued but not yet written.
    #[must_use]
    pub fn buffered_amount(&self) -> usize {
        self.sender.buffered_amount()
    }

    /// Cloneable write handle for sending from another task.
    ///
    /// The handle does not track the ready state; once the writer stops,
    /// its sends complete with [`WsError::Closed`].
    #[must_use]
    pub fn sender(&self) -> SenderHandle {
        self.sender.clone()
    }

    fn require_open(&self) -> Result<(), WsError> {
        if self.state == ReadyState::Open {
            Ok(())
        } else {
            Err(WsError::NotOpen(self.state))
        }
    }

    /// Make one unit of progress: parse a buffered event, or wait for bytes,
    /// a timer, or the close deadline.
    async fn drive(&mut self) {
        match self.receiver.next_event().await {
            Ok(Some(event)) => {
                self.on_receiver_event(event);
                return;
            }
            Ok(None) => {}
            Err(err) => {
                self.on_receiver_error(err);
                return;
            }
        }

        if self.state == ReadyState::Open && self.sender.is_closed() {
            tracing::debug!(target: "ws::connection", "writer stopped");
            self.finish();
            return;
        }

        let Some(reader) = self.reader.as_mut() else {
            self.finish();
            return;
        };
        let high_water = self.config.write_buffer_high_water;
        let outcome = tokio::select! {
            biased;
            () = sleep_until(self.close_deadline) => Wake::Deadline,
            () = tick(self.keepalive.as_mut()) => Wake::Keepalive,
            read = read_chunk(reader, &mut self.read_buf, &self.sender, high_water) => Wake::Read(read),
        };

        match outcome {
            Wake::Deadline => {
                tracing::warn!(
                    target: "ws::connection",
                    timeout = ?self.config.close_timeout,
                    "close handshake timed out, destroying transport"
                );
                self.sender.destroy();
                self.finish();
            }
            Wake::Keepalive => {
                if self.state == ReadyState::Open {
                    if let Ok(completion) = self.sender.ping(Bytes::new()) {
                        drop(completion);
                    }
                }
            }
            Wake::Read(Ok(0)) => {
                tracing::trace!(target: "ws::connection", "transport reached EOF");
                self.end();
                self.finish();
            }
            Wake::Read(Ok(n)) => self.receiver.feed(&self.read_buf[..n]),
            Wake::Read(Err(err)) => {
                tracing::debug!(target: "ws::connection", %err, "transport read failed");
                self.sender.destroy();
                self.finish();
            }
        }
    }

    fn on_receiver_event(&mut self, event: ReceiverEvent) {
        match event {
            ReceiverEvent::Message(message) => self.pending.push_back(Event::Message(message)),
            ReceiverEvent::Ping(payload) => {
                if self.config.auto_pong && self.state == ReadyState::Open {
                    if let Ok(completion) = self.sender.pong(payload.clone()) {
                        drop(completion);
                    }
                }
                self.pending.push_back(Event::Ping(payload));
            }
            ReceiverEvent::Pong(payload) => self.pending.push_back(Event::Pong(payload)),
            ReceiverEvent::Close(frame) => {
                tracing::debug!(target: "ws::connection", code = frame.code, "close frame received");
                let (code, reason) = (frame.code, frame.reason.clone());
                self.close.mark_received(frame);
                let result = if code == NO_STATUS_RECEIVED {
                    self.start_close(None, &[])
                } else {
                    self.start_close(Some(code), &reason)
                };
                if let Err(err) = result {
                    tracing::debug!(target: "ws::connection", %err, "close echo failed");
                }
            }
        }
    }

    fn on_receiver_error(&mut self, err: WsError) {
        let code = err.close_code();
        tracing::debug!(target: "ws::connection", code = ?code, %err, "failing connection");
        self.failure = code.or(Some(ABNORMAL_CLOSURE));
        self.pending.push_back(Event::Error(err));
        if let Err(err) = self.start_close(code, &[]) {
            tracing::debug!(target: "ws::connection", %err, "close after error failed");
        }
    }

    fn start_close(&mut self, code: Option<u16>, reason: &[u8]) -> Result<(), WsError> {
        match self.state {
            ReadyState::Closed => Ok(()),
            ReadyState::Closing => {
                if self.close.is_sent() && (self.close.is_received() || self.failure.is_some()) {
                    self.end();
                }
                Ok(())
            }
            ReadyState::Connecting | ReadyState::Open => {
                let completion = self.sender.close(code, reason)?;
                drop(completion);
                tracing::debug!(target: "ws::connection", code = ?code, "close frame queued");
                self.state = ReadyState::Closing;
                self.close.mark_sent();
                if self.close.is_received() || self.failure.is_some() {
                    self.end();
                }
                self.close_deadline = Some(Instant::now() + self.config.close_timeout);
                Ok(())
            }
        }
    }

    /// Shut the write side down after everything already queued.
    fn end(&mut self) {
        if !self.ended {
            self.ended = true;
            drop(self.sender.shutdown());
        }
    }

    fn finish(&mut self) {
        if self.state == ReadyState::Closed {
            return;
        }
        self.state = ReadyState::Closed;
        self.close_deadline = None;
        self.keepalive = None;
        self.reader = None;

        let (code, reason) = match (self.close.peer(), self.failure) {
            (None, Some(code)) => (code, Bytes::new()),
            _ => self.close.outcome(),
        };
        tracing::debug!(target: "ws::connection", code, "connection closed");
        self.pending.push_back(Event::Close(CloseEvent { code, reason }));

        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl<IO> Drop for WebSocket<IO> {
    fn drop(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

enum Wake {
    Deadline,
    Keepalive,
    Read(std::io::Result<usize>),
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn read_chunk<R>(
    reader: &mut R,
    buf: &mut [u8],
    sender: &SenderHandle,
    high_water: usize,
) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    if high_water > 0 {
        sender.wait_buffered_below(high_water).await;
    }
    reader.read(buf).await
}
