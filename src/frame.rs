//! WebSocket frame builder according to RFC 6455.
//!
//! Decoding lives in [`crate::receiver`] because it has to run incrementally
//! over a byte stream; this module holds the wire model and the encoder.
//!
//! # Frame Format (RFC 6455 Section 5.2)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! :                     Payload Data continued ...                :
//! + - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - +
//! |                     Payload Data (continued)                  |
//! +---------------------------------------------------------------+
//! ```

use crate::error::WsError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;

/// Largest payload length representable without losing integer precision
/// in peers that store lengths as doubles (2^53 - 1).
pub const MAX_PAYLOAD_LENGTH: u64 = (1 << 53) - 1;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation frame (fragmented message).
    Continuation = 0x0,
    /// Text data frame.
    Text = 0x1,
    /// Binary data frame.
    Binary = 0x2,
    // 0x3-0x7 reserved for non-control frames
    /// Connection close control frame.
    Close = 0x8,
    /// Ping control frame.
    Ping = 0x9,
    /// Pong control frame.
    Pong = 0xA,
    // 0xB-0xF reserved for control frames
}

impl Opcode {
    /// Returns true if this is a control frame (Close, Ping, Pong).
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Returns true if this is a data frame (Continuation, Text, Binary).
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(self, Self::Continuation | Self::Text | Self::Binary)
    }

    /// Try to parse an opcode from the low nibble of the first header byte.
    pub const fn from_u8(value: u8) -> Result<Self, WsError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WsError::InvalidOpcode(value)),
        }
    }
}

/// Role in the WebSocket connection (affects masking requirements).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client role: masks outgoing frames, rejects masked incoming frames.
    Client,
    /// Server role: sends unmasked frames, requires masked incoming frames.
    Server,
}

impl Role {
    /// Whether frames sent by this role are masked by default.
    #[must_use]
    pub const fn masks_outgoing(self) -> bool {
        matches!(self, Self::Client)
    }
}

// =============================================================================
// Mask key source
// =============================================================================

/// Source of masking keys for outgoing frames.
///
/// Installed per connection at construction time. The default draws from the
/// operating system RNG as RFC 6455 §5.3 requires; tests and embedders can
/// install a deterministic generator instead.
pub trait MaskGenerator: Send + Sync + fmt::Debug {
    /// Produce the next 4-byte masking key.
    fn generate(&self) -> io::Result<[u8; 4]>;
}

/// Mask generator backed by the operating system RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsMaskGenerator;

impl MaskGenerator for OsMaskGenerator {
    fn generate(&self) -> io::Result<[u8; 4]> {
        let mut key = [0u8; 4];
        getrandom::fill(&mut key).map_err(|err| io::Error::other(err.to_string()))?;
        Ok(key)
    }
}

/// Mask generator that always returns the same key.
#[derive(Debug, Clone, Copy)]
pub struct FixedMaskGenerator(pub [u8; 4]);

impl MaskGenerator for FixedMaskGenerator {
    fn generate(&self) -> io::Result<[u8; 4]> {
        Ok(self.0)
    }
}

// =============================================================================
// Frame model
// =============================================================================

/// WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag (FIN bit).
    pub fin: bool,
    /// RSV1: set on the first frame of a compressed message.
    pub rsv1: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Mask flag.
    pub masked: bool,
    /// Explicit masking key; a random key is drawn when `masked` and this is `None`.
    pub mask_key: Option<[u8; 4]>,
    /// Payload data (unmasked).
    pub payload: Bytes,
}

impl Frame {
    fn final_frame(opcode: Opcode, payload: Bytes) -> Self {
        Self {
            fin: true,
            rsv1: false,
            opcode,
            masked: false,
            mask_key: None,
            payload,
        }
    }

    /// Create a new text frame with the given payload.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::final_frame(Opcode::Text, payload.into())
    }

    /// Create a new binary frame with the given payload.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::final_frame(Opcode::Binary, payload.into())
    }

    /// Create a continuation frame.
    #[must_use]
    pub fn continuation(payload: impl Into<Bytes>, fin: bool) -> Self {
        Self {
            fin,
            ..Self::final_frame(Opcode::Continuation, payload.into())
        }
    }

    /// Create a ping frame.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::final_frame(Opcode::Ping, payload.into())
    }

    /// Create a pong frame.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::final_frame(Opcode::Pong, payload.into())
    }

    /// Create a close frame with optional status code and reason.
    #[must_use]
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let payload = match code {
            Some(code) => {
                let mut buf = BytesMut::with_capacity(2 + reason.len());
                buf.put_u16(code);
                buf.put_slice(reason.as_bytes());
                buf.freeze()
            }
            None => Bytes::new(),
        };
        Self::final_frame(Opcode::Close, payload)
    }

    /// Set the FIN bit.
    #[must_use]
    pub const fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Mark the frame masked, optionally with an explicit key.
    #[must_use]
    pub const fn with_mask(mut self, key: Option<[u8; 4]>) -> Self {
        self.masked = true;
        self.mask_key = key;
        self
    }

    /// Header options describing this frame.
    #[must_use]
    pub const fn options(&self) -> FrameOptions {
        FrameOptions {
            fin: self.fin,
            opcode: self.opcode,
            rsv1: self.rsv1,
            mask: self.masked,
            mask_key: self.mask_key,
        }
    }

    /// Encode this frame, drawing a random key from `masks` when needed.
    pub fn encode(&self, masks: &dyn MaskGenerator) -> Result<EncodedFrame, WsError> {
        encode_frame(self.payload.clone(), &self.options(), masks)
    }
}

/// Header options for [`encode_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOptions {
    /// FIN bit.
    pub fin: bool,
    /// Opcode.
    pub opcode: Opcode,
    /// RSV1 bit.
    pub rsv1: bool,
    /// Mask the payload.
    pub mask: bool,
    /// Explicit key; `None` draws one from the generator.
    pub mask_key: Option<[u8; 4]>,
}

impl FrameOptions {
    /// Options for a final, unmasked, uncompressed frame.
    #[must_use]
    pub const fn new(opcode: Opcode) -> Self {
        Self {
            fin: true,
            opcode,
            rsv1: false,
            mask: false,
            mask_key: None,
        }
    }
}

/// An encoded frame: header bytes followed by (possibly masked) payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Frame header, 2 to 14 bytes.
    pub header: Bytes,
    /// Payload as it goes on the wire.
    pub payload: Bytes,
}

impl EncodedFrame {
    /// Total encoded length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.header.len() + self.payload.len()
    }

    /// Always false: every frame has at least a two-byte header.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.header.is_empty()
    }

    /// Concatenate header and payload into one buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        buf.put_slice(&self.header);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Build the wire representation of one frame.
///
/// Fails only for control frames that are fragmented or carry more than
/// 125 bytes, and for payloads longer than [`MAX_PAYLOAD_LENGTH`].
pub fn encode_frame(
    payload: Bytes,
    options: &FrameOptions,
    masks: &dyn MaskGenerator,
) -> Result<EncodedFrame, WsError> {
    let payload_len = payload.len();

    if options.opcode.is_control() {
        if payload_len > MAX_CONTROL_PAYLOAD {
            return Err(WsError::ControlPayloadTooLarge(payload_len));
        }
        if !options.fin {
            return Err(WsError::FragmentedControlFrame);
        }
    }
    if payload_len as u64 > MAX_PAYLOAD_LENGTH {
        return Err(WsError::UnsupportedPayloadLength);
    }

    let mut first_byte = options.opcode as u8;
    if options.fin {
        first_byte |= 0x80;
    }
    if options.rsv1 {
        first_byte |= 0x40;
    }
    let mask_bit = if options.mask { 0x80 } else { 0 };

    let header_size = 2
        + if payload_len > 65535 {
            8
        } else if payload_len > 125 {
            2
        } else {
            0
        }
        + if options.mask { 4 } else { 0 };

    let mut header = BytesMut::with_capacity(header_size);
    header.put_u8(first_byte);

    if payload_len <= 125 {
        header.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= 65535 {
        header.put_u8(mask_bit | 126);
        header.put_u16(payload_len as u16);
    } else {
        header.put_u8(mask_bit | 127);
        header.put_u64(payload_len as u64);
    }

    if !options.mask {
        return Ok(EncodedFrame {
            header: header.freeze(),
            payload,
        });
    }

    let mask_key = match options.mask_key {
        Some(key) => key,
        None => masks.generate()?,
    };
    header.put_slice(&mask_key);

    // An all-zero key leaves the payload unchanged; skip the copy.
    if mask_key == [0; 4] || payload.is_empty() {
        return Ok(EncodedFrame {
            header: header.freeze(),
            payload,
        });
    }

    let mut masked = BytesMut::from(payload.as_ref());
    apply_mask(&mut masked, mask_key);
    Ok(EncodedFrame {
        header: header.freeze(),
        payload: masked.freeze(),
    })
}

/// Apply XOR masking to payload data.
///
/// This is used for both masking (encoding) and unmasking (decoding).
/// The mask is applied in-place.
pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    apply_mask_offset(payload, mask_key, 0);
}

/// Apply the mask starting at byte `offset` of the frame payload.
pub(crate) fn apply_mask_offset(payload: &mut [u8], mask_key: [u8; 4], offset: usize) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[(offset + i) % 4];
    }
}

// =============================================================================
// Close codes
// =============================================================================

/// Close codes defined by RFC 6455 and the IANA registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal = 1000,
    /// Going away (1001).
    GoingAway = 1001,
    /// Protocol error (1002).
    ProtocolError = 1002,
    /// Unsupported data type (1003).
    Unsupported = 1003,
    /// Reserved (1004).
    Reserved = 1004,
    /// No status received (1005) - must not be sent in a frame.
    NoStatusReceived = 1005,
    /// Abnormal closure (1006) - must not be sent in a frame.
    Abnormal = 1006,
    /// Invalid payload data (1007).
    InvalidPayload = 1007,
    /// Policy violation (1008).
    PolicyViolation = 1008,
    /// Message too big (1009).
    MessageTooBig = 1009,
    /// Mandatory extension missing (1010).
    MandatoryExtension = 1010,
    /// Internal server error (1011).
    InternalError = 1011,
    /// Service restart (1012).
    ServiceRestart = 1012,
    /// Try again later (1013).
    TryAgainLater = 1013,
    /// Bad gateway (1014).
    BadGateway = 1014,
    /// TLS handshake failure (1015) - must not be sent in a frame.
    TlsHandshake = 1015,
}

impl CloseCode {
    /// Returns true if this code can be sent in a close frame.
    #[must_use]
    pub const fn is_sendable(self) -> bool {
        is_valid_status_code(self as u16)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code as Self
    }
}

/// Whether `code` may appear in a close frame on the wire.
///
/// Legal: 1000-1014 except 1004, 1005, 1006; and the 3000-4999 range
/// reserved for libraries and applications.
#[must_use]
pub const fn is_valid_status_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}
