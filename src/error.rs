//! Error types for the WebSocket engine.
//!
//! Three families, split by the lifecycle phase they belong to:
//!
//! - [`WsError`]: anything after the connection is open (framing, payload,
//!   resource limits, local send-side validation, transport failures).
//! - [`HandshakeError`]: anything before the connection is open.
//! - [`ExtensionError`]: `Sec-WebSocket-Extensions` / `Sec-WebSocket-Protocol`
//!   grammar and permessage-deflate parameter negotiation.

use crate::close::ReadyState;
use std::io;
use thiserror::Error;

// =============================================================================
// Close codes reported for fatal receive-side errors
// =============================================================================

/// Protocol error.
pub(crate) const PROTOCOL_ERROR: u16 = 1002;
/// Invalid frame payload data.
pub(crate) const INVALID_PAYLOAD: u16 = 1007;
/// Message too big.
pub(crate) const MESSAGE_TOO_BIG: u16 = 1009;

// =============================================================================
// WsError
// =============================================================================

/// Errors raised by an open connection.
#[derive(Debug, Error)]
pub enum WsError {
    /// RSV2 or RSV3 set on a received frame.
    #[error("RSV2 and RSV3 must be clear")]
    InvalidRsv2Rsv3,

    /// RSV1 set without permessage-deflate, or on a continuation/control frame.
    #[error("RSV1 must be clear")]
    UnexpectedRsv1,

    /// Opcode outside the RFC 6455 set.
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),

    /// Continuation frame with no fragmented message in progress.
    #[error("invalid opcode 0")]
    UnexpectedContinuation,

    /// Text/binary frame while a fragmented message is still open.
    #[error("invalid opcode {0}")]
    ExpectedContinuation(u8),

    /// Control frame with FIN clear.
    #[error("FIN must be set")]
    FragmentedControlFrame,

    /// Control frame payload above 125 bytes.
    #[error("invalid payload length {0}")]
    ControlFrameTooLarge(u64),

    /// Close frame with a one-byte payload.
    #[error("invalid payload length 1")]
    InvalidClosePayloadLength,

    /// Server received an unmasked frame.
    #[error("MASK must be set")]
    ExpectedMask,

    /// Client received a masked frame.
    #[error("MASK must be clear")]
    UnexpectedMask,

    /// Peer sent a close frame with an illegal status code.
    #[error("invalid status code {0}")]
    InvalidCloseCode(u16),

    /// Text message or close reason is not valid UTF-8.
    #[error("invalid UTF-8 sequence")]
    InvalidUtf8,

    /// Compressed payload could not be inflated.
    #[error("invalid compressed data: {0}")]
    InvalidCompressedData(String),

    /// 64-bit payload length above 2^53 - 1.
    #[error("Unsupported WebSocket frame: payload length > 2^53 - 1")]
    UnsupportedPayloadLength,

    /// Message (or inflated message) above the configured maximum.
    #[error("Max payload size exceeded")]
    MessageTooBig {
        /// Configured limit in bytes.
        max: u64,
    },

    /// Ping/pong/close payload above 125 bytes on the send side.
    #[error("The data size must not be greater than 125 bytes (got {0})")]
    ControlPayloadTooLarge(usize),

    /// Close status code that may not be sent.
    #[error("First argument must be a valid error code number (got {0})")]
    InvalidStatusCode(u16),

    /// Close reason longer than 123 bytes.
    #[error("The message must not be greater than 123 bytes (got {0})")]
    CloseReasonTooLong(usize),

    /// Operation attempted outside the Open state.
    #[error("WebSocket is not open: readyState {} ({})", .0.as_u8(), .0.name())]
    NotOpen(ReadyState),

    /// The connection was closed before a queued write was dispatched.
    #[error("The socket was closed while data was being sent")]
    Closed,

    /// The compressor failed or its worker was lost.
    #[error("compression failed: {0}")]
    Compression(String),

    /// Transport I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WsError {
    /// Close code to send when this error terminates the connection.
    ///
    /// Returns `None` for local errors that do not close the connection.
    #[must_use]
    pub const fn close_code(&self) -> Option<u16> {
        match self {
            Self::InvalidRsv2Rsv3
            | Self::UnexpectedRsv1
            | Self::InvalidOpcode(_)
            | Self::UnexpectedContinuation
            | Self::ExpectedContinuation(_)
            | Self::FragmentedControlFrame
            | Self::ControlFrameTooLarge(_)
            | Self::InvalidClosePayloadLength
            | Self::ExpectedMask
            | Self::UnexpectedMask
            | Self::InvalidCloseCode(_) => Some(PROTOCOL_ERROR),
            Self::InvalidUtf8 | Self::InvalidCompressedData(_) => Some(INVALID_PAYLOAD),
            Self::UnsupportedPayloadLength | Self::MessageTooBig { .. } => Some(MESSAGE_TOO_BIG),
            _ => None,
        }
    }

    /// Returns true if the error was detected in data received from the peer.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        self.close_code().is_some()
    }
}

// =============================================================================
// HandshakeError
// =============================================================================

/// Errors raised while opening a connection.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// URL could not be parsed or has an unsupported shape.
    #[error("{0}")]
    InvalidUrl(String),

    /// Protocol version other than 8 or 13 was configured.
    #[error("Unsupported protocol version: {0} (supported versions: 8, 13)")]
    UnsupportedVersion(u8),

    /// A requested subprotocol failed the token grammar or was repeated.
    #[error("An invalid or duplicated subprotocol was specified")]
    InvalidSubprotocol,

    /// Malformed HTTP message.
    #[error("invalid HTTP message: {0}")]
    InvalidHttp(String),

    /// The server answered with something other than 101 or a followed redirect.
    #[error("Unexpected server response: {0}")]
    UnexpectedResponse(u16),

    /// Redirect chain exceeded the configured maximum.
    #[error("Maximum redirects exceeded")]
    MaxRedirects,

    /// Response validation failed; carries the diagnostic message.
    #[error("{0}")]
    InvalidResponse(&'static str),

    /// Server rejected the upgrade with an HTTP error status.
    #[error("{status} {message}")]
    Rejected {
        /// HTTP status written to the client.
        status: u16,
        /// Diagnostic message written as the response body.
        message: String,
    },

    /// The opening handshake did not complete in time.
    #[error("Opening handshake has timed out")]
    Timeout,

    /// The transport cannot be established for this URL.
    #[error("{0}")]
    Unsupported(&'static str),

    /// The server is closing and refuses new connections.
    #[error("The server is not running")]
    ServerClosed,

    /// Extension negotiation failure.
    #[error(transparent)]
    Extension(#[from] ExtensionError),

    /// Transport I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// =============================================================================
// ExtensionError
// =============================================================================

/// Errors from header grammars and permessage-deflate negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtensionError {
    /// Header contained a character not allowed at this position.
    #[error("Unexpected character at index {0}")]
    UnexpectedCharacter(usize),

    /// Header ended in the middle of a token or quoted string.
    #[error("Unexpected end of input")]
    UnexpectedEnd,

    /// Subprotocol listed twice.
    #[error("The \"{0}\" subprotocol is duplicated")]
    DuplicateProtocol(String),

    /// Parameter carried more than one value.
    #[error("Parameter \"{0}\" must have only a single value")]
    MultipleValues(String),

    /// Parameter name not defined for permessage-deflate.
    #[error("Unknown parameter \"{0}\"")]
    UnknownParameter(String),

    /// Parameter value outside its grammar.
    #[error("Invalid value for parameter \"{name}\": {value}")]
    InvalidValue {
        /// Parameter name.
        name: String,
        /// Offending value as it appeared in the header.
        value: String,
    },

    /// No client offer was compatible with the server configuration.
    #[error("None of the extension offers can be accepted")]
    NoAcceptableOffer,

    /// Server response carries a parameter the client did not allow.
    #[error("Unexpected parameter \"{0}\"")]
    UnexpectedParameter(&'static str),

    /// Server response carries an out-of-range parameter value.
    #[error("Unexpected or invalid parameter \"{0}\"")]
    InvalidParameter(&'static str),
}
