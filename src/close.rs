//! WebSocket close handshake (RFC 6455 Section 7).
//!
//! 1. Initiator sends a Close frame with an optional status code and reason.
//! 2. The peer echoes a Close frame.
//! 3. Once both frames have crossed, the transport is shut down.
//!
//! This module holds the lifecycle state, close payload parsing and
//! building, and the tracker the connection driver uses to know when the
//! handshake is complete.

use crate::error::WsError;
use crate::frame::{is_valid_status_code, MAX_CONTROL_PAYLOAD};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::time::Duration;

/// How long to wait for the peer's close frame before destroying the transport.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Reported when a close frame carried no status code.
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Reported when the transport went away without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Longest close reason that fits a control frame next to the status code.
pub const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadyState {
    /// Opening handshake in progress.
    Connecting,
    /// Messages may be exchanged.
    Open,
    /// A close frame was sent or received.
    Closing,
    /// The transport is gone.
    Closed,
}

impl ReadyState {
    /// Numeric value (0-3) as exposed by browser WebSocket APIs.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }

    /// Upper-case state name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded close frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Status code; [`NO_STATUS_RECEIVED`] when the payload was empty.
    pub code: u16,
    /// Reason bytes, valid UTF-8 unless validation was skipped.
    pub reason: Bytes,
}

impl CloseFrame {
    /// Parse a received close payload.
    ///
    /// An empty payload reports 1005. A single byte, an illegal status code,
    /// and a non-UTF-8 reason are protocol or payload errors.
    pub fn parse(payload: &Bytes, skip_utf8_validation: bool) -> Result<Self, WsError> {
        match payload.len() {
            0 => Ok(Self {
                code: NO_STATUS_RECEIVED,
                reason: Bytes::new(),
            }),
            1 => Err(WsError::InvalidClosePayloadLength),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !is_valid_status_code(code) {
                    return Err(WsError::InvalidCloseCode(code));
                }
                let reason = payload.slice(2..);
                if !skip_utf8_validation && std::str::from_utf8(&reason).is_err() {
                    return Err(WsError::InvalidUtf8);
                }
                Ok(Self { code, reason })
            }
        }
    }

    /// Build an outgoing close payload.
    ///
    /// Without a code the payload is empty and `reason` is ignored.
    pub fn encode(code: Option<u16>, reason: &[u8]) -> Result<Bytes, WsError> {
        let Some(code) = code else {
            return Ok(Bytes::new());
        };
        if !is_valid_status_code(code) {
            return Err(WsError::InvalidStatusCode(code));
        }
        if reason.len() > MAX_CLOSE_REASON {
            return Err(WsError::CloseReasonTooLong(reason.len()));
        }
        let mut buf = BytesMut::with_capacity(2 + reason.len());
        buf.put_u16(code);
        buf.put_slice(reason);
        Ok(buf.freeze())
    }

    /// Reason as text, if it is valid UTF-8.
    #[must_use]
    pub fn reason_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.reason).ok()
    }
}

/// Tracks which close frames have crossed the wire.
#[derive(Debug, Default)]
pub struct CloseHandshake {
    sent: bool,
    received: Option<CloseFrame>,
}

impl CloseHandshake {
    /// Fresh tracker; no close frame in either direction.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sent: false,
            received: None,
        }
    }

    /// Our close frame was written.
    pub fn mark_sent(&mut self) {
        self.sent = true;
    }

    /// The peer's close frame arrived. Later frames are ignored.
    pub fn mark_received(&mut self, frame: CloseFrame) {
        self.received.get_or_insert(frame);
    }

    /// Whether we already sent a close frame.
    #[must_use]
    pub const fn is_sent(&self) -> bool {
        self.sent
    }

    /// Whether the peer already sent a close frame.
    #[must_use]
    pub const fn is_received(&self) -> bool {
        self.received.is_some()
    }

    /// Both close frames have crossed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.sent && self.received.is_some()
    }

    /// The peer's close frame.
    #[must_use]
    pub const fn peer(&self) -> Option<&CloseFrame> {
        self.received.as_ref()
    }

    /// Code and reason reported to the application once the transport is
    /// gone: the peer's frame if one arrived, otherwise 1006.
    #[must_use]
    pub fn outcome(&self) -> (u16, Bytes) {
        self.received.as_ref().map_or_else(
            || (ABNORMAL_CLOSURE, Bytes::new()),
            |frame| (frame.code, frame.reason.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_state_names() {
        assert_eq!(ReadyState::Connecting.as_u8(), 0);
        assert_eq!(ReadyState::Closed.as_u8(), 3);
        assert_eq!(ReadyState::Open.to_string(), "OPEN");
        assert!(ReadyState::Closing > ReadyState::Open);
    }

    #[test]
    fn test_parse_empty_payload_is_1005() {
        let frame = CloseFrame::parse(&Bytes::new(), false).unwrap();
        assert_eq!(frame.code, NO_STATUS_RECEIVED);
        assert!(frame.reason.is_empty());
    }

    #[test]
    fn test_parse_rejects_one_byte() {
        let err = CloseFrame::parse(&Bytes::from_static(&[0x03]), false).unwrap_err();
        assert!(matches!(err, WsError::InvalidClosePayloadLength));
        assert_eq!(err.close_code(), Some(1002));
    }

    #[test]
    fn test_parse_code_and_reason() {
        let payload = Bytes::from_static(b"\x03\xe8bye");
        let frame = CloseFrame::parse(&payload, false).unwrap();
        assert_eq!(frame.code, 1000);
        assert_eq!(frame.reason_str(), Some("bye"));
    }

    #[test]
    fn test_parse_rejects_reserved_codes() {
        for code in [1004u16, 1005, 1006, 1015, 999, 2000, 5000] {
            let payload = Bytes::copy_from_slice(&code.to_be_bytes());
            let err = CloseFrame::parse(&payload, false).unwrap_err();
            assert!(matches!(err, WsError::InvalidCloseCode(c) if c == code), "{code}");
        }
    }

    #[test]
    fn test_parse_reason_utf8() {
        let payload = Bytes::from_static(b"\x03\xe8\xff\xfe");
        assert!(matches!(
            CloseFrame::parse(&payload, false),
            Err(WsError::InvalidUtf8)
        ));
        assert!(CloseFrame::parse(&payload, true).is_ok());
    }

    #[test]
    fn test_encode_validates() {
        assert!(CloseFrame::encode(None, b"ignored").unwrap().is_empty());
        assert_eq!(
            CloseFrame::encode(Some(4000), b"ok").unwrap().as_ref(),
            b"\x0f\xa0ok"
        );
        assert!(matches!(
            CloseFrame::encode(Some(1005), b""),
            Err(WsError::InvalidStatusCode(1005))
        ));
        assert!(matches!(
            CloseFrame::encode(Some(1000), &[b'x'; 124]),
            Err(WsError::CloseReasonTooLong(124))
        ));
        assert!(CloseFrame::encode(Some(1000), &[b'x'; 123]).is_ok());
    }

    #[test]
    fn test_handshake_tracking() {
        let mut handshake = CloseHandshake::new();
        assert_eq!(handshake.outcome().0, ABNORMAL_CLOSURE);

        handshake.mark_received(CloseFrame {
            code: 1001,
            reason: Bytes::from_static(b"away"),
        });
        assert!(!handshake.is_complete());
        handshake.mark_received(CloseFrame {
            code: 1000,
            reason: Bytes::new(),
        });
        handshake.mark_sent();
        assert!(handshake.is_complete());
        assert_eq!(handshake.outcome(), (1001, Bytes::from_static(b"away")));
    }
}
