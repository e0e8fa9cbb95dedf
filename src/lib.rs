//! wsengine: an RFC 6455 WebSocket protocol engine with permessage-deflate.
//!
//! # Overview
//!
//! The crate implements both roles of the WebSocket protocol on top of any
//! tokio byte stream. The client performs the opening handshake (with
//! optional redirect following), the server validates and upgrades HTTP
//! requests, and both end up driving the same [`WebSocket`] connection:
//! an incremental [`receiver`] parses and reassembles frames, a queued
//! [`sender`] serializes writes in order, and the close handshake runs with
//! a deadline.
//!
//! # Core Guarantees
//!
//! - **Chunking does not matter**: the receiver emits the same events no matter how the byte stream is split
//! - **Ordered writes**: frames reach the transport in the order they were queued, compressed or not
//! - **One close per connection**: every connection reports exactly one [`Event::Close`]
//! - **Bounded memory**: messages (inflated or not) above `max_payload` fail the connection with 1009
//! - **Bounded compression fan-out**: deflate jobs run through a process-wide concurrency [`limiter`]
//!
//! # Module Structure
//!
//! - [`frame`]: Frame model, header encoding, masking
//! - [`receiver`]: Incremental frame parser and message reassembler
//! - [`sender`]: Writer task with its FIFO queue
//! - [`close`]: Ready states and close-frame payloads
//! - [`extension`]: `Sec-WebSocket-Extensions` and `Sec-WebSocket-Protocol` grammars
//! - [`deflate`]: permessage-deflate negotiation and codecs
//! - [`limiter`]: Concurrency limiter for compression jobs
//! - [`handshake`]: Accept keys, URLs, HTTP heads, client request/response
//! - [`websocket`]: The connection driver shared by both roles
//! - [`client`]: Connecting, redirects, handshake timeout
//! - [`server`]: Upgrade validation, negotiation, client tracking
//! - [`registry`]: Generation-checked slab of tracked clients
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use wsengine::{connect, Event, Message};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut ws = connect("ws://127.0.0.1:8080/chat").await?;
//! ws.send_text("hello").await?;
//! while let Some(event) = ws.recv().await {
//!     match event {
//!         Event::Message(Message::Text(text)) => println!("{}", String::from_utf8_lossy(&text)),
//!         Event::Close(close) => println!("closed with {}", close.code),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod client;
pub mod close;
pub mod deflate;
pub mod error;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod limiter;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod server;
pub mod websocket;

// Re-exports for convenient access to core types
pub use client::{client_handshake, connect, connect_with, connect_with_connector, ClientConfig, Connector, TcpConnector};
pub use close::{CloseFrame, ReadyState};
pub use deflate::{MaxWindowBits, PerMessageDeflateConfig};
pub use error::{ExtensionError, HandshakeError, WsError};
pub use frame::{CloseCode, Frame, MaskGenerator, Opcode, Role};
pub use handshake::{HttpRequest, HttpResponse, WsUrl};
pub use sender::{Completion, SendOptions, SenderHandle};
pub use server::{
    abort_handshake, ClientInfo, HandleProtocols, Rejection, ServerConfig, ServerState, Verdict, VerifyClient,
    WebSocketServer,
};
pub use websocket::{CloseEvent, ConnectionConfig, Event, Message, Upgrade, WebSocket};
