//! Outbound frame writer.
//!
//! The write half of a connection is owned by one spawned task fed through
//! an unbounded FIFO command queue. Commands run strictly in the order they
//! were enqueued, and a compression job is awaited before the next command
//! is taken, so frames never interleave on the wire and the deflate window
//! sees messages in send order.
//!
//! Every command carries a oneshot completion. When the connection is
//! destroyed or the writer shuts down, commands still queued complete with
//! [`WsError::Closed`].

use crate::close::CloseFrame;
use crate::deflate::Deflater;
use crate::error::WsError;
use crate::frame::{encode_frame, FrameOptions, MaskGenerator, Opcode, Role, MAX_CONTROL_PAYLOAD};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Notify};

/// Per-call options for data frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Send as a binary (rather than text) message.
    pub binary: bool,
    /// Compress if permessage-deflate was negotiated.
    pub compress: bool,
    /// Last fragment of the message.
    pub fin: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            binary: false,
            compress: true,
            fin: true,
        }
    }
}

impl SendOptions {
    /// Options for a complete text message.
    #[must_use]
    pub fn text() -> Self {
        Self::default()
    }

    /// Options for a complete binary message.
    #[must_use]
    pub fn binary() -> Self {
        Self {
            binary: true,
            ..Self::default()
        }
    }

    /// Set the compression flag.
    #[must_use]
    pub const fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Set the final-fragment flag.
    #[must_use]
    pub const fn fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }
}

/// Resolves once a queued frame has been written (or dropped).
#[derive(Debug)]
#[must_use = "a Completion reports write errors only when awaited"]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), WsError>>,
}

impl Completion {
    fn pair() -> (oneshot::Sender<Result<(), WsError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A completion that is already resolved.
    pub fn ready(result: Result<(), WsError>) -> Self {
        let (tx, completion) = Self::pair();
        let _ = tx.send(result);
        completion
    }
}

impl Future for Completion {
    type Output = Result<(), WsError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(WsError::Closed)))
    }
}

type Done = oneshot::Sender<Result<(), WsError>>;

#[derive(Debug)]
enum Command {
    Data {
        data: Bytes,
        options: SendOptions,
        done: Done,
    },
    Control {
        opcode: Opcode,
        payload: Bytes,
        done: Done,
    },
    Shutdown {
        done: Done,
    },
}

impl Command {
    fn complete(self, result: Result<(), WsError>) {
        let (Self::Data { done, .. } | Self::Control { done, .. } | Self::Shutdown { done }) = self;
        let _ = done.send(result);
    }

    fn queued_len(&self) -> usize {
        match self {
            Self::Data { data, .. } => data.len(),
            Self::Control { payload, .. } => payload.len(),
            Self::Shutdown { .. } => 0,
        }
    }
}

#[derive(Debug)]
struct Shared {
    buffered: AtomicUsize,
    drained: Notify,
    destroyed: watch::Sender<bool>,
}

impl Shared {
    fn release(&self, len: usize) {
        self.buffered.fetch_sub(len, Ordering::AcqRel);
        self.drained.notify_waiters();
    }
}

/// Cloneable handle to a connection's writer task.
#[derive(Debug, Clone)]
pub struct SenderHandle {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl SenderHandle {
    fn enqueue(&self, command: impl FnOnce(Done) -> Command) -> Completion {
        let (done, completion) = Completion::pair();
        let command = command(done);
        let len = command.queued_len();
        self.shared.buffered.fetch_add(len, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            self.shared.release(len);
            command.complete(Err(WsError::Closed));
        }
        completion
    }

    /// Queue a data frame.
    pub fn send(&self, data: impl Into<Bytes>, options: SendOptions) -> Completion {
        let data = data.into();
        self.enqueue(|done| Command::Data {
            data,
            options,
            done,
        })
    }

    /// Queue a ping. Payloads above 125 bytes are rejected immediately.
    pub fn ping(&self, payload: impl Into<Bytes>) -> Result<Completion, WsError> {
        self.control(Opcode::Ping, payload.into())
    }

    /// Queue a pong. Payloads above 125 bytes are rejected immediately.
    pub fn pong(&self, payload: impl Into<Bytes>) -> Result<Completion, WsError> {
        self.control(Opcode::Pong, payload.into())
    }

    /// Queue a close frame after validating the code and reason.
    pub fn close(&self, code: Option<u16>, reason: &[u8]) -> Result<Completion, WsError> {
        let payload = CloseFrame::encode(code, reason)?;
        self.control(Opcode::Close, payload)
    }

    fn control(&self, opcode: Opcode, payload: Bytes) -> Result<Completion, WsError> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WsError::ControlPayloadTooLarge(payload.len()));
        }
        Ok(self.enqueue(|done| Command::Control {
            opcode,
            payload,
            done,
        }))
    }

    /// Flush everything queued so far, then shut the transport's write side.
    pub fn shutdown(&self) -> Completion {
        self.enqueue(|done| Command::Shutdown { done })
    }

    /// Stop writing now; queued commands complete with [`WsError::Closed`].
    pub fn destroy(&self) {
        self.shared.destroyed.send_replace(true);
    }

    /// Whether the writer task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Payload bytes queued but not yet written.
    #[must_use]
    pub fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    /// Wait until at most `limit` payload bytes are queued.
    pub async fn wait_buffered_below(&self, limit: usize) {
        loop {
            let drained = self.shared.drained.notified();
            if self.buffered_amount() <= limit || self.is_closed() {
                return;
            }
            drained.await;
        }
    }
}

/// Writer task state for one connection.
pub struct Sender<W> {
    writer: W,
    role: Role,
    masks: Arc<dyn MaskGenerator>,
    deflater: Option<Deflater>,
    commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    first_fragment: bool,
    compress: bool,
}

impl<W> std::fmt::Debug for Sender<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("role", &self.role)
            .field("compression", &self.deflater.is_some())
            .field("first_fragment", &self.first_fragment)
            .finish_non_exhaustive()
    }
}

impl<W> Sender<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Spawn the writer task and return its handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        writer: W,
        role: Role,
        masks: Arc<dyn MaskGenerator>,
        deflater: Option<Deflater>,
    ) -> SenderHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (destroyed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            buffered: AtomicUsize::new(0),
            drained: Notify::new(),
            destroyed,
        });
        let sender = Self {
            writer,
            role,
            masks,
            deflater,
            commands: rx,
            shared: Arc::clone(&shared),
            first_fragment: true,
            compress: false,
        };
        tokio::spawn(sender.run());
        SenderHandle {
            commands: tx,
            shared,
        }
    }

    async fn run(mut self) {
        let mut destroyed = self.shared.destroyed.subscribe();

        loop {
            let command = tokio::select! {
                biased;
                _ = destroyed.wait_for(|destroyed| *destroyed) => break,
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            let command = match command {
                Command::Shutdown { done } => {
                    let result = self.writer.shutdown().await.map_err(WsError::from);
                    tracing::trace!(target: "ws::sender", ok = result.is_ok(), "writer shut down");
                    let _ = done.send(result);
                    break;
                }
                command => command,
            };

            let len = command.queued_len();
            let outcome = tokio::select! {
                biased;
                _ = destroyed.wait_for(|destroyed| *destroyed) => None,
                result = self.dispatch(command) => Some(result),
            };
            self.shared.release(len);

            match outcome {
                Some(true) => {}
                Some(false) => {
                    self.shared.destroyed.send_replace(true);
                    break;
                }
                None => break,
            }
        }

        self.drain();
    }

    /// Returns false if the transport failed.
    async fn dispatch(&mut self, command: Command) -> bool {
        let (result, done) = match command {
            Command::Data {
                data,
                options,
                done,
            } => (self.send_data(data, options).await, done),
            Command::Control {
                opcode,
                payload,
                done,
            } => {
                let options = FrameOptions {
                    mask: self.role.masks_outgoing(),
                    ..FrameOptions::new(opcode)
                };
                (self.write_frame(payload, &options).await, done)
            }
            Command::Shutdown { done } => (Ok(()), done),
        };

        let healthy = !result.as_ref().err().is_some_and(stops_writer);
        if let Err(err) = &result {
            tracing::debug!(target: "ws::sender", %err, "write failed");
        }
        let _ = done.send(result);
        healthy
    }

    async fn send_data(&mut self, data: Bytes, options: SendOptions) -> Result<(), WsError> {
        let mut opcode = if options.binary {
            Opcode::Binary
        } else {
            Opcode::Text
        };

        if self.first_fragment {
            self.first_fragment = false;
            let mut compress = options.compress && self.deflater.is_some();
            if let Some(deflater) = self.deflater.as_ref().filter(|_| compress) {
                if deflater.no_context_takeover() {
                    compress = data.len() >= deflater.threshold();
                }
            }
            self.compress = compress;
        } else {
            opcode = Opcode::Continuation;
        }
        let first = opcode != Opcode::Continuation;
        if options.fin {
            self.first_fragment = true;
        }

        let mut frame = FrameOptions {
            fin: options.fin,
            rsv1: first && self.compress,
            mask: self.role.masks_outgoing(),
            ..FrameOptions::new(opcode)
        };

        let payload = match &self.deflater {
            Some(deflater) if self.compress => deflater.compress(data, options.fin).await?,
            _ => {
                frame.rsv1 = false;
                data
            }
        };
        self.write_frame(payload, &frame).await
    }

    async fn write_frame(&mut self, payload: Bytes, options: &FrameOptions) -> Result<(), WsError> {
        let encoded = encode_frame(payload, options, self.masks.as_ref())?;
        tracing::trace!(
            target: "ws::sender",
            opcode = ?options.opcode,
            fin = options.fin,
            rsv1 = options.rsv1,
            len = encoded.payload.len(),
            "writing frame"
        );
        self.writer.write_all(&encoded.header).await?;
        self.writer.write_all(&encoded.payload).await?;
        self.writer.flush().await?;
        Ok(())
    }

    fn drain(&mut self) {
        self.commands.close();
        let mut dropped = 0usize;
        while let Ok(command) = self.commands.try_recv() {
            self.shared.release(command.queued_len());
            command.complete(Err(WsError::Closed));
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(target: "ws::sender", dropped, "discarded queued frames");
        }
        self.shared.drained.notify_waiters();
    }
}

/// Errors after which the stream state is unknown, so nothing more may be
/// written. A failed deflate leaves the shared compression context mid-stream.
const fn stops_writer(err: &WsError) -> bool {
    matches!(err, WsError::Io(_) | WsError::Compression(_))
}
