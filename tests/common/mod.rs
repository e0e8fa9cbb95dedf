//! Helpers shared by the integration tests.

// Each test binary uses a different subset.
#![allow(dead_code)]

use bytes::Bytes;
use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use std::sync::Once;
use tokio::io::{duplex, DuplexStream};
use tracing_subscriber::fmt::format::FmtSpan;
use wsengine::frame::FixedMaskGenerator;
use wsengine::handshake::read_http_head;
use wsengine::{client_handshake, ClientConfig, Frame, HttpRequest, WebSocket, WebSocketServer};

static INIT_LOGGING: Once = Once::new();

/// Mask key used by [`masked`].
const TEST_MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

/// Seed used under CI when `WSENGINE_PROPTEST_SEED` is unset.
const CI_PROPTEST_SEED: u64 = 0x5EED_5EED;

/// ProptestConfig with `cases` cases and a fixed seed when one is requested.
///
/// `PROPTEST_RNG_SEED` wins over `WSENGINE_PROPTEST_SEED`, which wins over the
/// CI default.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    let mut config = ProptestConfig::with_cases(cases);
    if matches!(config.rng_seed, RngSeed::Random) {
        if let Some(seed) = proptest_seed() {
            config.rng_seed = RngSeed::Fixed(seed);
        }
    }
    config
}

fn proptest_seed() -> Option<u64> {
    match std::env::var("WSENGINE_PROPTEST_SEED") {
        Ok(value) => value.parse().ok(),
        Err(_) => std::env::var("CI").is_ok().then_some(CI_PROPTEST_SEED),
    }
}

/// Install a trace-level subscriber that writes through the test harness.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Wire bytes of `frame` as a client would send it.
#[must_use]
pub fn masked(frame: Frame) -> Vec<u8> {
    let encoded = frame
        .with_mask(Some(TEST_MASK))
        .encode(&FixedMaskGenerator(TEST_MASK))
        .expect("encodable frame");
    encoded.to_bytes().to_vec()
}

/// Wire bytes of `frame` as a server would send it.
#[must_use]
pub fn unmasked(frame: Frame) -> Vec<u8> {
    let encoded = frame.encode(&FixedMaskGenerator(TEST_MASK)).expect("encodable frame");
    encoded.to_bytes().to_vec()
}

/// Run a full opening handshake over an in-memory pipe.
///
/// Returns `(client, server, request)`.
pub async fn connected_pair(
    server: &WebSocketServer,
    url: &str,
    client: ClientConfig,
) -> (WebSocket<DuplexStream>, WebSocket<DuplexStream>, HttpRequest) {
    let (client_io, mut server_io) = duplex(256 * 1024);
    let server_side = async {
        let (head, rest) = read_http_head(&mut server_io).await.expect("request head");
        let request = HttpRequest::parse(&head).expect("request");
        let ws = server
            .handle_upgrade(&request, server_io, rest)
            .await
            .expect("server upgrade");
        (ws, request)
    };
    let client_side = async { client_handshake(client_io, url, client).await.expect("client handshake") };
    let ((server_ws, request), client_ws) = tokio::join!(server_side, client_side);
    (client_ws, server_ws, request)
}

/// Payload of a text message as a string.
#[must_use]
pub fn text_of(bytes: &Bytes) -> &str {
    std::str::from_utf8(bytes).expect("utf-8 text")
}
