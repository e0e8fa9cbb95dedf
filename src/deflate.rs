//! permessage-deflate (RFC 7692): negotiation and per-connection codecs.
//!
//! [`PerMessageDeflate`] produces the client offer, accepts offers as a
//! server or a response as a client, and once negotiated splits into a
//! [`Deflater`] (owned by the sender) and an [`Inflater`] (owned by the
//! receiver). Both codecs run their jobs through the process-wide
//! [`Limiter`].

use crate::error::{ExtensionError, WsError};
use crate::extension::{format_extensions, ExtensionParams, Extensions, ParamValue};
use crate::limiter::{Limiter, DEFAULT_CONCURRENCY};
use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use parking_lot::Mutex;
use std::sync::Arc;

/// Extension token.
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Default minimum message size compressed when context takeover is off.
pub const DEFAULT_THRESHOLD: usize = 1024;

/// Bytes a sync flush appends; stripped on send, restored on receive.
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Default LZ77 window size.
const DEFAULT_WINDOW_BITS: u8 = 15;

/// Output growth step while inflating; the payload cap is checked per step.
const INFLATE_CHUNK: usize = 16 * 1024;

const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";

// =============================================================================
// Configuration
// =============================================================================

/// Local preference for a `*_max_window_bits` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxWindowBits {
    /// Willing to negotiate; the peer picks.
    Negotiable,
    /// Never accept the parameter.
    Refused,
    /// Request or cap at this many bits (8..=15).
    Bits(u8),
}

/// permessage-deflate configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerMessageDeflateConfig {
    /// `Some(true)` requests/forces it, `Some(false)` refuses it.
    pub server_no_context_takeover: Option<bool>,
    /// `Some(true)` requests/forces it, `Some(false)` refuses it.
    pub client_no_context_takeover: Option<bool>,
    /// Server window preference.
    pub server_max_window_bits: Option<MaxWindowBits>,
    /// Client window preference.
    pub client_max_window_bits: Option<MaxWindowBits>,
    /// zlib compression level (0-9).
    pub level: u32,
    /// Messages below this size are sent uncompressed when context takeover
    /// is disabled for the sending side.
    pub threshold: usize,
    /// Process-wide concurrent job limit; only the first instance counts.
    pub concurrency_limit: usize,
}

impl Default for PerMessageDeflateConfig {
    fn default() -> Self {
        Self {
            server_no_context_takeover: None,
            client_no_context_takeover: None,
            server_max_window_bits: None,
            client_max_window_bits: None,
            level: 6,
            threshold: DEFAULT_THRESHOLD,
            concurrency_limit: DEFAULT_CONCURRENCY,
        }
    }
}

impl PerMessageDeflateConfig {
    /// Configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `server_no_context_takeover`.
    #[must_use]
    pub const fn server_no_context_takeover(mut self, value: bool) -> Self {
        self.server_no_context_takeover = Some(value);
        self
    }

    /// Set `client_no_context_takeover`.
    #[must_use]
    pub const fn client_no_context_takeover(mut self, value: bool) -> Self {
        self.client_no_context_takeover = Some(value);
        self
    }

    /// Set the server window preference.
    #[must_use]
    pub const fn server_max_window_bits(mut self, value: MaxWindowBits) -> Self {
        self.server_max_window_bits = Some(value);
        self
    }

    /// Set the client window preference.
    #[must_use]
    pub const fn client_max_window_bits(mut self, value: MaxWindowBits) -> Self {
        self.client_max_window_bits = Some(value);
        self
    }

    /// Set the compression level.
    #[must_use]
    pub const fn level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    /// Set the compression threshold.
    #[must_use]
    pub const fn threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the process-wide concurrency limit.
    #[must_use]
    pub const fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }
}

// =============================================================================
// Negotiated parameters
// =============================================================================

/// `client_max_window_bits` as it may appear in an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowBitsParam {
    /// Present without a value: the client supports the parameter.
    Flag,
    /// Explicit window size.
    Bits(u8),
}

/// One normalized offer, or the accepted parameter set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeflateParams {
    /// Server resets its compression context after each message.
    pub server_no_context_takeover: bool,
    /// Client resets its compression context after each message.
    pub client_no_context_takeover: bool,
    /// Server window size.
    pub server_max_window_bits: Option<u8>,
    /// Client window size.
    pub client_max_window_bits: Option<WindowBitsParam>,
}

impl DeflateParams {
    /// Validate one raw offer. `is_server` allows a bare `client_max_window_bits`.
    pub fn normalize(params: &ExtensionParams, is_server: bool) -> Result<Self, ExtensionError> {
        let mut normalized = Self::default();

        for (name, values) in params.iter() {
            let [value] = values else {
                return Err(ExtensionError::MultipleValues(name.to_owned()));
            };
            let invalid = || ExtensionError::InvalidValue {
                name: name.to_owned(),
                value: value.as_display().to_owned(),
            };

            match name {
                CLIENT_MAX_WINDOW_BITS => {
                    normalized.client_max_window_bits = Some(match value {
                        ParamValue::Flag if is_server => WindowBitsParam::Flag,
                        ParamValue::Flag => return Err(invalid()),
                        ParamValue::Value(text) => {
                            WindowBitsParam::Bits(parse_window_bits(text).ok_or_else(invalid)?)
                        }
                    });
                }
                SERVER_MAX_WINDOW_BITS => match value {
                    ParamValue::Value(text) => {
                        normalized.server_max_window_bits =
                            Some(parse_window_bits(text).ok_or_else(invalid)?);
                    }
                    ParamValue::Flag => return Err(invalid()),
                },
                CLIENT_NO_CONTEXT_TAKEOVER | SERVER_NO_CONTEXT_TAKEOVER => {
                    if *value != ParamValue::Flag {
                        return Err(invalid());
                    }
                    if name == CLIENT_NO_CONTEXT_TAKEOVER {
                        normalized.client_no_context_takeover = true;
                    } else {
                        normalized.server_no_context_takeover = true;
                    }
                }
                _ => return Err(ExtensionError::UnknownParameter(name.to_owned())),
            }
        }

        Ok(normalized)
    }

    /// Render as header parameters.
    #[must_use]
    pub fn to_extension_params(&self) -> ExtensionParams {
        let mut params = ExtensionParams::new();
        if self.server_no_context_takeover {
            params.push(SERVER_NO_CONTEXT_TAKEOVER, ParamValue::Flag);
        }
        if self.client_no_context_takeover {
            params.push(CLIENT_NO_CONTEXT_TAKEOVER, ParamValue::Flag);
        }
        if let Some(bits) = self.server_max_window_bits {
            params.push(SERVER_MAX_WINDOW_BITS, ParamValue::Value(bits.to_string()));
        }
        match self.client_max_window_bits {
            Some(WindowBitsParam::Bits(bits)) => {
                params.push(CLIENT_MAX_WINDOW_BITS, ParamValue::Value(bits.to_string()));
            }
            Some(WindowBitsParam::Flag) => params.push(CLIENT_MAX_WINDOW_BITS, ParamValue::Flag),
            None => {}
        }
        params
    }

    fn no_context_takeover(&self, server_side: bool) -> bool {
        if server_side {
            self.server_no_context_takeover
        } else {
            self.client_no_context_takeover
        }
    }

    fn window_bits(&self, server_side: bool) -> u8 {
        let bits = if server_side {
            self.server_max_window_bits
        } else {
            match self.client_max_window_bits {
                Some(WindowBitsParam::Bits(bits)) => Some(bits),
                _ => None,
            }
        };
        bits.unwrap_or(DEFAULT_WINDOW_BITS)
    }
}

fn parse_window_bits(text: &str) -> Option<u8> {
    text.parse::<u8>().ok().filter(|bits| (8..=15).contains(bits))
}

// =============================================================================
// Negotiator
// =============================================================================

/// permessage-deflate negotiator bound to one connection.
#[derive(Debug, Clone)]
pub struct PerMessageDeflate {
    config: PerMessageDeflateConfig,
    is_server: bool,
    max_payload: u64,
    params: Option<DeflateParams>,
}

impl PerMessageDeflate {
    /// Create a negotiator. `max_payload` of 0 disables the inflate cap.
    #[must_use]
    pub fn new(config: PerMessageDeflateConfig, is_server: bool, max_payload: u64) -> Self {
        Limiter::global(config.concurrency_limit);
        Self {
            config,
            is_server,
            max_payload,
            params: None,
        }
    }

    /// Local configuration.
    #[must_use]
    pub const fn config(&self) -> &PerMessageDeflateConfig {
        &self.config
    }

    /// Accepted parameters, once negotiated.
    #[must_use]
    pub const fn params(&self) -> Option<&DeflateParams> {
        self.params.as_ref()
    }

    /// Parameters a client sends in its `Sec-WebSocket-Extensions` offer.
    #[must_use]
    pub fn offer(&self) -> ExtensionParams {
        let config = &self.config;
        let mut params = ExtensionParams::new();

        if config.server_no_context_takeover == Some(true) {
            params.push(SERVER_NO_CONTEXT_TAKEOVER, ParamValue::Flag);
        }
        if config.client_no_context_takeover == Some(true) {
            params.push(CLIENT_NO_CONTEXT_TAKEOVER, ParamValue::Flag);
        }
        match config.server_max_window_bits {
            Some(MaxWindowBits::Bits(bits)) => {
                params.push(SERVER_MAX_WINDOW_BITS, ParamValue::Value(bits.to_string()));
            }
            Some(MaxWindowBits::Negotiable) => params.push(SERVER_MAX_WINDOW_BITS, ParamValue::Flag),
            Some(MaxWindowBits::Refused) | None => {}
        }
        match config.client_max_window_bits {
            Some(MaxWindowBits::Bits(bits)) => {
                params.push(CLIENT_MAX_WINDOW_BITS, ParamValue::Value(bits.to_string()));
            }
            Some(MaxWindowBits::Negotiable) | None => {
                params.push(CLIENT_MAX_WINDOW_BITS, ParamValue::Flag);
            }
            Some(MaxWindowBits::Refused) => {}
        }
        params
    }

    /// Full header value for the client offer.
    #[must_use]
    pub fn offer_header(&self) -> String {
        format_extensions(&Extensions::new().with(EXTENSION_NAME, self.offer()))
    }

    /// Accept client offers (server) or the server response (client).
    pub fn accept(&mut self, offers: &[ExtensionParams]) -> Result<&DeflateParams, ExtensionError> {
        let normalized = offers
            .iter()
            .map(|offer| DeflateParams::normalize(offer, self.is_server))
            .collect::<Result<Vec<_>, _>>()?;

        let accepted = if self.is_server {
            self.accept_as_server(normalized)?
        } else {
            self.accept_as_client(normalized)?
        };
        tracing::debug!(target: "ws::deflate", params = ?accepted, server = self.is_server, "permessage-deflate negotiated");
        Ok(self.params.insert(accepted))
    }

    /// Header value echoing the accepted parameters (server response).
    #[must_use]
    pub fn response_header(&self) -> Option<String> {
        self.params.as_ref().map(|params| {
            format_extensions(&Extensions::new().with(EXTENSION_NAME, params.to_extension_params()))
        })
    }

    fn accept_as_server(&self, offers: Vec<DeflateParams>) -> Result<DeflateParams, ExtensionError> {
        let config = &self.config;
        let mut accepted = offers
            .into_iter()
            .find(|offer| {
                let refuses_snct = config.server_no_context_takeover == Some(false)
                    && offer.server_no_context_takeover;
                let refuses_smwb = offer.server_max_window_bits.is_some_and(|bits| {
                    match config.server_max_window_bits {
                        Some(MaxWindowBits::Refused) => true,
                        Some(MaxWindowBits::Bits(limit)) => limit > bits,
                        _ => false,
                    }
                });
                let needs_cmwb = matches!(config.client_max_window_bits, Some(MaxWindowBits::Bits(_)))
                    && offer.client_max_window_bits.is_none();
                !(refuses_snct || refuses_smwb || needs_cmwb)
            })
            .ok_or(ExtensionError::NoAcceptableOffer)?;

        if config.server_no_context_takeover == Some(true) {
            accepted.server_no_context_takeover = true;
        }
        if config.client_no_context_takeover == Some(true) {
            accepted.client_no_context_takeover = true;
        }
        if let Some(MaxWindowBits::Bits(bits)) = config.server_max_window_bits {
            accepted.server_max_window_bits = Some(bits);
        }
        match config.client_max_window_bits {
            Some(MaxWindowBits::Bits(bits)) => {
                accepted.client_max_window_bits = Some(WindowBitsParam::Bits(bits));
            }
            Some(MaxWindowBits::Refused) => accepted.client_max_window_bits = None,
            _ if accepted.client_max_window_bits == Some(WindowBitsParam::Flag) => {
                accepted.client_max_window_bits = None;
            }
            _ => {}
        }

        Ok(accepted)
    }

    fn accept_as_client(&self, response: Vec<DeflateParams>) -> Result<DeflateParams, ExtensionError> {
        let config = &self.config;
        let mut params = response
            .into_iter()
            .next()
            .ok_or(ExtensionError::NoAcceptableOffer)?;

        if config.client_no_context_takeover == Some(false) && params.client_no_context_takeover {
            return Err(ExtensionError::UnexpectedParameter(CLIENT_NO_CONTEXT_TAKEOVER));
        }

        match (params.client_max_window_bits, config.client_max_window_bits) {
            (None, Some(MaxWindowBits::Bits(bits))) => {
                params.client_max_window_bits = Some(WindowBitsParam::Bits(bits));
            }
            (None, _) => {}
            (Some(_), Some(MaxWindowBits::Refused)) => {
                return Err(ExtensionError::InvalidParameter(CLIENT_MAX_WINDOW_BITS));
            }
            (Some(WindowBitsParam::Bits(bits)), Some(MaxWindowBits::Bits(limit))) if bits > limit => {
                return Err(ExtensionError::InvalidParameter(CLIENT_MAX_WINDOW_BITS));
            }
            (Some(_), _) => {}
        }

        Ok(params)
    }

    /// Build the per-direction codecs from the accepted parameters.
    ///
    /// Returns `None` when nothing was negotiated.
    #[must_use]
    pub fn into_codecs(self) -> Option<(Deflater, Inflater)> {
        let params = self.params?;
        let limiter = Limiter::global(self.config.concurrency_limit);
        let local = self.is_server;
        let remote = !self.is_server;

        let deflater = Deflater {
            compress: Arc::new(Mutex::new(Compress::new_with_window_bits(
                Compression::new(self.config.level.min(9)),
                false,
                backend_window_bits(params.window_bits(local)),
            ))),
            no_context_takeover: params.no_context_takeover(local),
            threshold: self.config.threshold,
            limiter,
        };
        let inflater = Inflater {
            decompress: Arc::new(Mutex::new(Decompress::new_with_window_bits(
                false,
                backend_window_bits(params.window_bits(remote)),
            ))),
            no_context_takeover: params.no_context_takeover(remote),
            max_payload: self.max_payload,
            limiter,
        };
        Some((deflater, inflater))
    }
}

/// zlib runs an 8-bit raw deflate window as 9 bits; flate2 rejects 8 outright.
const fn backend_window_bits(bits: u8) -> u8 {
    if bits < 9 {
        9
    } else {
        bits
    }
}

// =============================================================================
// Codecs
// =============================================================================

/// Outbound compression context of one connection.
#[derive(Debug)]
pub struct Deflater {
    compress: Arc<Mutex<Compress>>,
    no_context_takeover: bool,
    threshold: usize,
    limiter: &'static Limiter,
}

impl Deflater {
    /// Whether our side resets its window after every message.
    #[must_use]
    pub const fn no_context_takeover(&self) -> bool {
        self.no_context_takeover
    }

    /// Minimum size compressed when context takeover is disabled.
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    /// Compress one fragment on the blocking pool.
    pub async fn compress(&self, data: Bytes, fin: bool) -> Result<Bytes, WsError> {
        let compress = Arc::clone(&self.compress);
        let reset = self.no_context_takeover;
        self.limiter
            .run(move || deflate_raw(&mut compress.lock(), &data, fin, reset))
            .await?
    }
}

/// Inbound decompression context of one connection.
///
/// Clones share the same decompression stream.
#[derive(Debug, Clone)]
pub struct Inflater {
    decompress: Arc<Mutex<Decompress>>,
    no_context_takeover: bool,
    max_payload: u64,
    limiter: &'static Limiter,
}

impl Inflater {
    /// Cap on the inflated size of one call; 0 means unlimited.
    #[must_use]
    pub const fn max_payload(&self) -> u64 {
        self.max_payload
    }

    /// Decompress one fragment on the blocking pool.
    pub async fn decompress(&self, data: Bytes, fin: bool) -> Result<Bytes, WsError> {
        let decompress = Arc::clone(&self.decompress);
        let reset = self.no_context_takeover;
        let max_payload = self.max_payload;
        self.limiter
            .run(move || inflate_raw(&mut decompress.lock(), &data, fin, reset, max_payload))
            .await?
    }
}

fn deflate_raw(compress: &mut Compress, data: &[u8], fin: bool, reset: bool) -> Result<Bytes, WsError> {
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    let mut consumed = 0usize;

    loop {
        let before = compress.total_in();
        compress
            .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
            .map_err(|err| WsError::Compression(err.to_string()))?;
        consumed += (compress.total_in() - before) as usize;

        // The flush is complete once all input is in and zlib left spare room.
        if consumed >= data.len() && out.len() < out.capacity() {
            break;
        }
        out.reserve(out.capacity().max(1024));
    }

    if fin {
        if out.ends_with(&DEFLATE_TRAILER) {
            out.truncate(out.len() - DEFLATE_TRAILER.len());
        }
        if reset {
            compress.reset();
        }
    }
    Ok(Bytes::from(out))
}

fn inflate_raw(
    decompress: &mut Decompress,
    data: &[u8],
    fin: bool,
    reset: bool,
    max_payload: u64,
) -> Result<Bytes, WsError> {
    let mut out = Vec::with_capacity(INFLATE_CHUNK.min(data.len().saturating_mul(4).max(64)));
    let mut ended = inflate_into(decompress, data, &mut out, max_payload)?;
    if fin && !ended {
        ended = inflate_into(decompress, &DEFLATE_TRAILER, &mut out, max_payload)?;
    }
    if ended || (fin && reset) {
        decompress.reset(false);
    }
    Ok(Bytes::from(out))
}

/// Feed `input` through the inflater. Returns true if the stream ended.
fn inflate_into(
    decompress: &mut Decompress,
    input: &[u8],
    out: &mut Vec<u8>,
    max_payload: u64,
) -> Result<bool, WsError> {
    let mut consumed = 0usize;

    loop {
        if out.len() == out.capacity() {
            out.reserve(INFLATE_CHUNK);
        }
        let before_in = decompress.total_in();
        let before_out = decompress.total_out();
        let status = decompress
            .decompress_vec(&input[consumed..], out, FlushDecompress::Sync)
            .map_err(|err| WsError::InvalidCompressedData(err.to_string()))?;
        consumed += (decompress.total_in() - before_in) as usize;

        if max_payload > 0 && out.len() as u64 > max_payload {
            return Err(WsError::MessageTooBig { max: max_payload });
        }
        if status == Status::StreamEnd {
            return Ok(true);
        }
        let drained = consumed >= input.len() && out.len() < out.capacity();
        let stalled = decompress.total_in() == before_in
            && decompress.total_out() == before_out
            && out.len() < out.capacity();
        if drained || stalled {
            return Ok(false);
        }
    }
}
