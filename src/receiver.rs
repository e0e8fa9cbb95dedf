//! Incremental frame parser and message reassembler.
//!
//! The [`Receiver`] owns a byte buffer fed with whatever chunks the transport
//! delivers. Each call to [`Receiver::step`] advances the decode state
//! machine as far as the buffered bytes allow:
//!
//! ```text
//! Info -> [Length16 | Length64] -> [Mask] -> Data -> [Inflating] -> Info
//! ```
//!
//! When a state needs more bytes than are buffered, `step` returns
//! [`Step::NeedMore`] and keeps its position, so the emitted events do not
//! depend on how the stream was chunked. Compressed data frames surface as
//! [`Step::Inflate`]; the caller decompresses and hands the result back
//! through [`Receiver::finish_inflate`]. [`Receiver::next_event`] drives
//! both halves with the negotiated [`Inflater`].
//!
//! An inflate started by `next_event` runs as its own task; dropping the
//! `next_event` future leaves it running and the next call picks the result
//! up, so cancelling never loses a frame.
//!
//! Any error is fatal: the receiver moves to a terminal state and ignores
//! further input. So does a received close frame.

use crate::close::CloseFrame;
use crate::deflate::Inflater;
use crate::error::WsError;
use crate::frame::{apply_mask, Opcode, Role, MAX_CONTROL_PAYLOAD};
use crate::websocket::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::task::JoinHandle;

/// Receive-side configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    /// Role of the local endpoint; decides which masking is required.
    pub role: Role,
    /// Largest accepted message, in bytes. 0 disables the limit.
    pub max_payload: u64,
    /// Deliver text messages and close reasons without UTF-8 checks.
    pub skip_utf8_validation: bool,
}

impl ReceiverConfig {
    /// Configuration for `role` with no payload limit.
    #[must_use]
    pub const fn new(role: Role) -> Self {
        Self {
            role,
            max_payload: 0,
            skip_utf8_validation: false,
        }
    }

    /// Set the message size limit.
    #[must_use]
    pub const fn max_payload(mut self, max_payload: u64) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Skip UTF-8 validation.
    #[must_use]
    pub const fn skip_utf8_validation(mut self, skip: bool) -> Self {
        self.skip_utf8_validation = skip;
        self
    }
}

/// Something the peer sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    /// A complete data message.
    Message(Message),
    /// Ping with its payload.
    Ping(Bytes),
    /// Pong with its payload.
    Pong(Bytes),
    /// Close frame. The receiver accepts nothing after it.
    Close(CloseFrame),
}

/// Outcome of one [`Receiver::step`].
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// The buffer is exhausted; feed more bytes.
    NeedMore,
    /// An event is ready.
    Event(ReceiverEvent),
    /// A compressed fragment must be inflated before parsing can continue.
    Inflate {
        /// Raw deflate bytes of one frame.
        data: Bytes,
        /// Whether the frame ended its message.
        fin: bool,
    },
}

/// Header fields carried between states.
#[derive(Debug, Clone, Copy)]
struct Header {
    fin: bool,
    compressed: bool,
    opcode: Opcode,
    masked: bool,
}

#[derive(Debug)]
enum State {
    Info,
    Length16(Header),
    Length64(Header),
    Mask {
        header: Header,
        len: usize,
    },
    Data {
        header: Header,
        len: usize,
        mask: Option<[u8; 4]>,
    },
    Inflating {
        opcode: Opcode,
        fin: bool,
    },
    Closed,
}

/// Incremental WebSocket receiver.
#[derive(Debug)]
pub struct Receiver {
    config: ReceiverConfig,
    inflater: Option<Inflater>,
    /// Inflate started by `next_event` whose result is not yet consumed.
    inflating: Option<JoinHandle<Result<Bytes, WsError>>>,
    buffer: BytesMut,
    state: State,
    /// Opcode of the fragmented message in progress.
    fragmented: Option<Opcode>,
    /// The message in progress is compressed.
    compressed: bool,
    /// Wire bytes of the message so far.
    total_payload_length: u64,
    /// Delivered bytes of the message so far.
    message_length: u64,
    fragments: Vec<Bytes>,
}

impl Receiver {
    /// Receiver without compression.
    #[must_use]
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            inflater: None,
            inflating: None,
            buffer: BytesMut::new(),
            state: State::Info,
            fragmented: None,
            compressed: false,
            total_payload_length: 0,
            message_length: 0,
            fragments: Vec::new(),
        }
    }

    /// Receiver that accepts RSV1 frames and inflates them with `inflater`.
    #[must_use]
    pub fn with_inflater(config: ReceiverConfig, inflater: Inflater) -> Self {
        Self {
            inflater: Some(inflater),
            ..Self::new(config)
        }
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Whether permessage-deflate is active.
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.inflater.is_some()
    }

    /// Whether an error or a close frame ended parsing.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Bytes fed but not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk from the transport. Ignored once closed.
    pub fn feed(&mut self, chunk: &[u8]) {
        if !self.is_closed() {
            self.buffer.extend_from_slice(chunk);
        }
    }

    /// Advance the state machine as far as the buffer allows.
    pub fn step(&mut self) -> Result<Step, WsError> {
        let result = self.advance();
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    /// Deliver the output of a [`Step::Inflate`] request.
    pub fn finish_inflate(&mut self, data: Bytes) -> Result<Option<ReceiverEvent>, WsError> {
        let result = self.inflated(data);
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    /// Run the state machine, inflating compressed frames as they complete.
    ///
    /// Returns `Ok(None)` once the buffer needs more input. Cancel-safe: an
    /// inflate interrupted by dropping the future is resumed by the next call.
    /// Must be called within a tokio runtime.
    pub async fn next_event(&mut self) -> Result<Option<ReceiverEvent>, WsError> {
        loop {
            if let Some(job) = self.inflating.as_mut() {
                let joined = job.await;
                self.inflating = None;
                let inflated = joined.map_err(|err| WsError::Compression(err.to_string())).and_then(|r| r);
                let data = match inflated {
                    Ok(data) => data,
                    Err(err) => {
                        self.fail(&err);
                        return Err(err);
                    }
                };
                if let Some(event) = self.finish_inflate(data)? {
                    return Ok(Some(event));
                }
                continue;
            }

            match self.step()? {
                Step::NeedMore => return Ok(None),
                Step::Event(event) => return Ok(Some(event)),
                Step::Inflate { data, fin } => {
                    let Some(inflater) = self.inflater.clone() else {
                        let err = WsError::UnexpectedRsv1;
                        self.fail(&err);
                        return Err(err);
                    };
                    let job = tokio::spawn(async move { inflater.decompress(data, fin).await });
                    self.inflating = Some(job);
                }
            }
        }
    }

    fn fail(&mut self, err: &WsError) {
        tracing::debug!(target: "ws::receiver", code = ?err.close_code(), %err, "receiver stopped");
        self.state = State::Closed;
        self.inflating = None;
        self.buffer.clear();
        self.fragments.clear();
    }

    fn advance(&mut self) -> Result<Step, WsError> {
        loop {
            match self.state {
                State::Closed | State::Inflating { .. } => return Ok(Step::NeedMore),
                State::Info => {
                    if self.buffer.len() < 2 {
                        return Ok(Step::NeedMore);
                    }
                    self.get_info()?;
                }
                State::Length16(header) => {
                    if self.buffer.len() < 2 {
                        return Ok(Step::NeedMore);
                    }
                    let len = u64::from(self.buffer.get_u16());
                    self.have_length(header, len)?;
                }
                State::Length64(header) => {
                    if self.buffer.len() < 8 {
                        return Ok(Step::NeedMore);
                    }
                    let len = self.buffer.get_u64();
                    // Lengths above 2^53 - 1 are not representable by every peer.
                    if len >> 53 != 0 {
                        return Err(WsError::UnsupportedPayloadLength);
                    }
                    self.have_length(header, len)?;
                }
                State::Mask { header, len } => {
                    if self.buffer.len() < 4 {
                        return Ok(Step::NeedMore);
                    }
                    let mut mask = [0u8; 4];
                    self.buffer.copy_to_slice(&mut mask);
                    self.state = State::Data {
                        header,
                        len,
                        mask: Some(mask),
                    };
                }
                State::Data { header, len, mask } => {
                    if self.buffer.len() < len {
                        return Ok(Step::NeedMore);
                    }
                    let mut data = self.buffer.split_to(len);
                    if let Some(mask) = mask.filter(|mask| *mask != [0; 4]) {
                        apply_mask(&mut data, mask);
                    }
                    if let Some(step) = self.get_data(header, data.freeze())? {
                        return Ok(step);
                    }
                }
            }
        }
    }

    fn get_info(&mut self) -> Result<(), WsError> {
        let first = self.buffer[0];
        let second = self.buffer[1];
        self.buffer.advance(2);

        if first & 0x30 != 0 {
            return Err(WsError::InvalidRsv2Rsv3);
        }
        let compressed = first & 0x40 != 0;
        if compressed && self.inflater.is_none() {
            return Err(WsError::UnexpectedRsv1);
        }

        let fin = first & 0x80 != 0;
        let raw_opcode = first & 0x0f;
        let payload_len = second & 0x7f;

        let opcode = match Opcode::from_u8(raw_opcode)? {
            Opcode::Continuation => {
                if compressed {
                    return Err(WsError::UnexpectedRsv1);
                }
                self.fragmented.ok_or(WsError::UnexpectedContinuation)?
            }
            opcode @ (Opcode::Text | Opcode::Binary) => {
                if self.fragmented.is_some() {
                    return Err(WsError::ExpectedContinuation(raw_opcode));
                }
                self.compressed = compressed;
                opcode
            }
            opcode => {
                if !fin {
                    return Err(WsError::FragmentedControlFrame);
                }
                if compressed {
                    return Err(WsError::UnexpectedRsv1);
                }
                if usize::from(payload_len) > MAX_CONTROL_PAYLOAD {
                    return Err(WsError::ControlFrameTooLarge(u64::from(payload_len)));
                }
                if opcode == Opcode::Close && payload_len == 1 {
                    return Err(WsError::InvalidClosePayloadLength);
                }
                opcode
            }
        };

        if !fin && self.fragmented.is_none() {
            self.fragmented = Some(opcode);
        }

        let masked = second & 0x80 != 0;
        match self.config.role {
            Role::Server if !masked => return Err(WsError::ExpectedMask),
            Role::Client if masked => return Err(WsError::UnexpectedMask),
            _ => {}
        }

        let header = Header {
            fin,
            compressed: compressed || (opcode.is_data() && self.compressed),
            opcode,
            masked,
        };
        match payload_len {
            126 => self.state = State::Length16(header),
            127 => self.state = State::Length64(header),
            len => self.have_length(header, u64::from(len))?,
        }
        Ok(())
    }

    fn have_length(&mut self, header: Header, len: u64) -> Result<(), WsError> {
        if len > 0 && !header.opcode.is_control() {
            self.total_payload_length += len;
            let max = self.config.max_payload;
            if max > 0 && self.total_payload_length > max {
                return Err(WsError::MessageTooBig { max });
            }
        }
        let len = usize::try_from(len).map_err(|_| WsError::UnsupportedPayloadLength)?;
        self.state = if header.masked {
            State::Mask { header, len }
        } else {
            State::Data {
                header,
                len,
                mask: None,
            }
        };
        Ok(())
    }

    fn get_data(&mut self, header: Header, data: Bytes) -> Result<Option<Step>, WsError> {
        if header.opcode.is_control() {
            return self.control_message(header.opcode, data).map(Some);
        }

        if header.compressed {
            self.state = State::Inflating {
                opcode: header.opcode,
                fin: header.fin,
            };
            return Ok(Some(Step::Inflate {
                data,
                fin: header.fin,
            }));
        }

        if !data.is_empty() {
            self.message_length = self.total_payload_length;
            self.fragments.push(data);
        }
        self.state = State::Info;
        Ok(self.data_message(header.opcode, header.fin)?.map(Step::Event))
    }

    fn inflated(&mut self, data: Bytes) -> Result<Option<ReceiverEvent>, WsError> {
        let State::Inflating { opcode, fin } = self.state else {
            return Ok(None);
        };
        if !data.is_empty() {
            self.message_length += data.len() as u64;
            let max = self.config.max_payload;
            if max > 0 && self.message_length > max {
                return Err(WsError::MessageTooBig { max });
            }
            self.fragments.push(data);
        }
        self.state = State::Info;
        self.data_message(opcode, fin)
    }

    fn data_message(&mut self, opcode: Opcode, fin: bool) -> Result<Option<ReceiverEvent>, WsError> {
        if !fin {
            return Ok(None);
        }

        self.fragmented = None;
        let fragments = std::mem::take(&mut self.fragments);
        self.total_payload_length = 0;
        self.message_length = 0;
        self.compressed = false;

        let data = concat(fragments);
        let message = match opcode {
            Opcode::Binary => Message::Binary(data),
            _ => {
                if !self.config.skip_utf8_validation && std::str::from_utf8(&data).is_err() {
                    return Err(WsError::InvalidUtf8);
                }
                Message::Text(data)
            }
        };
        Ok(Some(ReceiverEvent::Message(message)))
    }

    fn control_message(&mut self, opcode: Opcode, data: Bytes) -> Result<Step, WsError> {
        let event = match opcode {
            Opcode::Close => {
                let frame = CloseFrame::parse(&data, self.config.skip_utf8_validation)?;
                tracing::trace!(target: "ws::receiver", code = frame.code, "close frame received");
                self.state = State::Closed;
                self.buffer.clear();
                return Ok(Step::Event(ReceiverEvent::Close(frame)));
            }
            Opcode::Ping => ReceiverEvent::Ping(data),
            _ => ReceiverEvent::Pong(data),
        };
        self.state = State::Info;
        Ok(Step::Event(event))
    }
}

fn concat(fragments: Vec<Bytes>) -> Bytes {
    match fragments.len() {
        0 => Bytes::new(),
        1 => fragments.into_iter().next().unwrap_or_default(),
        _ => {
            let total = fragments.iter().map(Bytes::len).sum();
            let mut buf = BytesMut::with_capacity(total);
            for fragment in fragments {
                buf.put(fragment);
            }
            buf.freeze()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deflate::{PerMessageDeflate, PerMessageDeflateConfig};
    use crate::extension::parse_extensions;
    use crate::frame::{FixedMaskGenerator, Frame};
    use std::time::Duration;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn wire(frame: Frame) -> Vec<u8> {
        frame
            .encode(&FixedMaskGenerator(KEY))
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    fn masked(frame: Frame) -> Vec<u8> {
        wire(frame.with_mask(None))
    }

    fn server() -> Receiver {
        Receiver::new(ReceiverConfig::new(Role::Server))
    }

    fn client() -> Receiver {
        Receiver::new(ReceiverConfig::new(Role::Client))
    }

    fn drain(receiver: &mut Receiver) -> Result<Vec<ReceiverEvent>, WsError> {
        let mut events = Vec::new();
        loop {
            match receiver.step()? {
                Step::NeedMore => return Ok(events),
                Step::Event(event) => events.push(event),
                Step::Inflate { .. } => panic!("unexpected compressed frame"),
            }
        }
    }

    fn feed_all(receiver: &mut Receiver, bytes: &[u8]) -> Result<Vec<ReceiverEvent>, WsError> {
        receiver.feed(bytes);
        drain(receiver)
    }

    fn text(value: &'static str) -> ReceiverEvent {
        ReceiverEvent::Message(Message::Text(Bytes::from_static(value.as_bytes())))
    }

    #[test]
    fn test_single_masked_text_frame() {
        let events = feed_all(&mut server(), &masked(Frame::text("Hello"))).unwrap();
        assert_eq!(events, vec![text("Hello")]);
    }

    #[test]
    fn test_unmasked_binary_frame_to_client() {
        let events = feed_all(&mut client(), &wire(Frame::binary(vec![1u8, 2, 3]))).unwrap();
        assert_eq!(
            events,
            vec![ReceiverEvent::Message(Message::Binary(Bytes::from_static(&[1, 2, 3])))]
        );
    }

    #[test]
    fn test_byte_at_a_time_matches_whole_buffer() {
        let mut stream = masked(Frame::text("x".repeat(300)));
        stream.extend(masked(Frame::ping("p")));
        stream.extend(masked(Frame::binary(vec![7u8; 70_000])));

        let whole = feed_all(&mut server(), &stream).unwrap();

        let mut receiver = server();
        let mut split = Vec::new();
        for byte in &stream {
            split.extend(feed_all(&mut receiver, std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(whole.len(), 3);
        assert_eq!(whole, split);
        assert_eq!(receiver.buffered(), 0);
    }

    #[test]
    fn test_fragments_with_interleaved_ping() {
        let mut stream = masked(Frame::text("Hel").with_fin(false));
        stream.extend(masked(Frame::ping("still here")));
        stream.extend(masked(Frame::continuation("lo, ", false)));
        stream.extend(masked(Frame::pong("")));
        stream.extend(masked(Frame::continuation("world", true)));

        let events = feed_all(&mut server(), &stream).unwrap();
        assert_eq!(
            events,
            vec![
                ReceiverEvent::Ping(Bytes::from_static(b"still here")),
                ReceiverEvent::Pong(Bytes::new()),
                text("Hello, world"),
            ]
        );
    }

    #[test]
    fn test_zero_mask_key_is_accepted() {
        let frame = Frame::text("plain").with_mask(Some([0; 4]));
        let events = feed_all(&mut server(), &wire(frame)).unwrap();
        assert_eq!(events, vec![text("plain")]);
    }

    #[test]
    fn test_mask_must_match_role() {
        let err = feed_all(&mut server(), &wire(Frame::text("a"))).unwrap_err();
        assert!(matches!(err, WsError::ExpectedMask));

        let err = feed_all(&mut client(), &masked(Frame::text("a"))).unwrap_err();
        assert!(matches!(err, WsError::UnexpectedMask));
        assert_eq!(err.close_code(), Some(1002));
    }

    #[test]
    fn test_header_violations() {
        let cases: [(&[u8], fn(&WsError) -> bool); 7] = [
            (&[0xa1, 0x80], |e| matches!(e, WsError::InvalidRsv2Rsv3)),
            (&[0xc1, 0x80], |e| matches!(e, WsError::UnexpectedRsv1)),
            (&[0x80, 0x80], |e| matches!(e, WsError::UnexpectedContinuation)),
            (&[0x83, 0x80], |e| matches!(e, WsError::InvalidOpcode(3))),
            (&[0x09, 0x80], |e| matches!(e, WsError::FragmentedControlFrame)),
            (&[0x89, 0xfe], |e| matches!(e, WsError::ControlFrameTooLarge(126))),
            (&[0x88, 0x81], |e| matches!(e, WsError::InvalidClosePayloadLength)),
        ];
        for (bytes, check) in cases {
            let err = feed_all(&mut server(), bytes).unwrap_err();
            assert!(check(&err), "{bytes:02x?}: {err}");
            assert_eq!(err.close_code(), Some(1002));
        }
    }

    #[test]
    fn test_new_message_while_fragmented() {
        let mut stream = masked(Frame::text("a").with_fin(false));
        stream.extend(masked(Frame::binary(vec![1u8])));
        let err = feed_all(&mut server(), &stream).unwrap_err();
        assert!(matches!(err, WsError::ExpectedContinuation(2)));
    }

    #[test]
    fn test_payload_length_above_2_pow_53() {
        let mut receiver = client();
        let mut bytes = vec![0x82, 0x7f];
        bytes.extend_from_slice(&(1u64 << 53).to_be_bytes());
        let err = feed_all(&mut receiver, &bytes).unwrap_err();
        assert!(matches!(err, WsError::UnsupportedPayloadLength));
        assert_eq!(err.close_code(), Some(1009));
        assert!(receiver.is_closed());
    }

    #[test]
    fn test_max_payload_counts_all_fragments() {
        let config = ReceiverConfig::new(Role::Server).max_payload(10);
        let mut receiver = Receiver::new(config.clone());
        assert!(feed_all(&mut receiver, &masked(Frame::binary(vec![0u8; 10]))).is_ok());

        let mut receiver = Receiver::new(config);
        let mut stream = masked(Frame::binary(vec![0u8; 6]).with_fin(false));
        stream.extend(masked(Frame::continuation(vec![0u8; 6], true)));
        let err = feed_all(&mut receiver, &stream).unwrap_err();
        assert!(matches!(err, WsError::MessageTooBig { max: 10 }));
        assert_eq!(err.close_code(), Some(1009));
    }

    #[test]
    fn test_max_payload_rejects_before_buffering() {
        let mut receiver = Receiver::new(ReceiverConfig::new(Role::Client).max_payload(100));
        // Header only; the 1000 byte payload never arrives.
        let err = feed_all(&mut receiver, &[0x82, 0x7e, 0x03, 0xe8]).unwrap_err();
        assert!(matches!(err, WsError::MessageTooBig { .. }));
    }

    #[test]
    fn test_invalid_utf8_text() {
        let frame = Frame::text(vec![0xffu8, 0xfe]);
        let err = feed_all(&mut server(), &masked(frame.clone())).unwrap_err();
        assert!(matches!(err, WsError::InvalidUtf8));
        assert_eq!(err.close_code(), Some(1007));

        let mut lenient = Receiver::new(ReceiverConfig::new(Role::Server).skip_utf8_validation(true));
        let events = feed_all(&mut lenient, &masked(frame)).unwrap();
        assert_eq!(
            events,
            vec![ReceiverEvent::Message(Message::Text(Bytes::from_static(&[0xff, 0xfe])))]
        );
    }

    #[test]
    fn test_close_frames() {
        let mut receiver = server();
        let mut stream = masked(Frame::close(None, ""));
        stream.extend(masked(Frame::text("ignored")));
        let events = feed_all(&mut receiver, &stream).unwrap();
        assert_eq!(
            events,
            vec![ReceiverEvent::Close(CloseFrame {
                code: 1005,
                reason: Bytes::new(),
            })]
        );
        assert!(receiver.is_closed());
        receiver.feed(&masked(Frame::text("later")));
        assert_eq!(receiver.buffered(), 0);

        let events = feed_all(&mut server(), &masked(Frame::close(Some(4000), "done"))).unwrap();
        assert_eq!(
            events,
            vec![ReceiverEvent::Close(CloseFrame {
                code: 4000,
                reason: Bytes::from_static(b"done"),
            })]
        );

        let err = feed_all(&mut server(), &masked(Frame::close(Some(1006), ""))).unwrap_err();
        assert!(matches!(err, WsError::InvalidCloseCode(1006)));
    }

    fn compressed_pair(max_payload: u64) -> (crate::deflate::Deflater, Receiver) {
        let offer = parse_extensions("permessage-deflate").unwrap();
        let offer = offer.get("permessage-deflate").unwrap();

        let mut local = PerMessageDeflate::new(PerMessageDeflateConfig::default(), false, 0);
        local.accept(offer).unwrap();
        let (deflater, _) = local.into_codecs().unwrap();

        let mut remote = PerMessageDeflate::new(PerMessageDeflateConfig::default(), true, max_payload);
        remote.accept(offer).unwrap();
        let (_, inflater) = remote.into_codecs().unwrap();

        let config = ReceiverConfig::new(Role::Server).max_payload(max_payload);
        (deflater, Receiver::with_inflater(config, inflater))
    }

    #[tokio::test]
    async fn test_compressed_message_is_inflated() {
        let (deflater, mut receiver) = compressed_pair(0);
        let data = deflater
            .compress(Bytes::from_static(b"compressed hello"), true)
            .await
            .unwrap();
        let mut frame = Frame::text(data);
        frame.rsv1 = true;
        receiver.feed(&masked(frame));

        assert!(receiver.is_compressed());
        let event = receiver.next_event().await.unwrap();
        assert_eq!(event, Some(text("compressed hello")));
        assert_eq!(receiver.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compressed_fragments_and_rsv1_on_continuation() {
        let (deflater, mut receiver) = compressed_pair(0);
        let first = deflater.compress(Bytes::from_static(b"abc"), false).await.unwrap();
        let second = deflater.compress(Bytes::from_static(b"def"), true).await.unwrap();

        let mut start = Frame::binary(first).with_fin(false);
        start.rsv1 = true;
        receiver.feed(&masked(start));
        receiver.feed(&masked(Frame::continuation(second, true)));
        assert_eq!(
            receiver.next_event().await.unwrap(),
            Some(ReceiverEvent::Message(Message::Binary(Bytes::from_static(b"abcdef"))))
        );

        let mut bad = Frame::continuation("x", true);
        bad.rsv1 = true;
        let (_, mut receiver) = compressed_pair(0);
        receiver.feed(&masked(Frame::text("a").with_fin(false)));
        receiver.feed(&masked(bad));
        assert!(matches!(
            receiver.next_event().await,
            Err(WsError::UnexpectedRsv1)
        ));
    }

    #[tokio::test]
    async fn test_dropped_next_event_resumes_inflate() {
        let (deflater, mut receiver) = compressed_pair(0);
        for body in ["first inflated", "second inflated"] {
            let data = deflater.compress(Bytes::from_static(body.as_bytes()), true).await.unwrap();
            let mut frame = Frame::text(data);
            frame.rsv1 = true;
            receiver.feed(&masked(frame));
        }

        // The spawned inflate cannot run before the timeout fires on this runtime.
        let cancelled = tokio::time::timeout(Duration::ZERO, receiver.next_event()).await;
        assert!(cancelled.is_err());
        assert!(!receiver.is_closed());

        assert_eq!(receiver.next_event().await.unwrap(), Some(text("first inflated")));
        assert_eq!(receiver.next_event().await.unwrap(), Some(text("second inflated")));
        assert_eq!(receiver.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_inflated_size_is_limited() {
        let (deflater, mut receiver) = compressed_pair(1024);
        let data = deflater.compress(Bytes::from(vec![b'a'; 64 * 1024]), true).await.unwrap();
        assert!(data.len() < 1024);
        let mut frame = Frame::binary(data);
        frame.rsv1 = true;
        receiver.feed(&masked(frame));

        let err = receiver.next_event().await.unwrap_err();
        assert_eq!(err.close_code(), Some(1009));
        assert!(receiver.is_closed());
    }
}
