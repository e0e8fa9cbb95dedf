//! Property tests for permessage-deflate.
//!
//! Verifies that inflate(deflate(m)) == m across message sequences, with and
//! without context takeover and at every window size.

mod common;

use bytes::Bytes;
use common::{init_test_logging, test_proptest_config};
use proptest::prelude::*;
use wsengine::deflate::{Deflater, Inflater, PerMessageDeflate};
use wsengine::{MaxWindowBits, PerMessageDeflateConfig};

const MAX_PAYLOAD: u64 = 1 << 20;

/// Negotiate both ends and return the client deflater and server inflater.
fn client_to_server(config: PerMessageDeflateConfig) -> (Deflater, Inflater) {
    let mut client = PerMessageDeflate::new(config.clone(), false, MAX_PAYLOAD);
    let mut server = PerMessageDeflate::new(config, true, MAX_PAYLOAD);
    let response = server.accept(&[client.offer()]).unwrap().to_extension_params();
    client.accept(&[response]).unwrap();

    let (deflater, _) = client.into_codecs().unwrap();
    let (_, inflater) = server.into_codecs().unwrap();
    (deflater, inflater)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..2048),
        // Repetitive input compresses, which exercises back-references.
        ("[a-d]{1,8}", 1usize..400).prop_map(|(word, times)| word.repeat(times).into_bytes()),
    ]
}

fn arb_config() -> impl Strategy<Value = PerMessageDeflateConfig> {
    (any::<bool>(), any::<bool>(), 9u8..=15, 0u32..=9).prop_map(|(server_nct, client_nct, bits, level)| {
        PerMessageDeflateConfig::new()
            .server_no_context_takeover(server_nct)
            .client_no_context_takeover(client_nct)
            .client_max_window_bits(MaxWindowBits::Bits(bits))
            .level(level)
    })
}

proptest! {
    #![proptest_config(test_proptest_config(64))]

    /// Every message of a sequence survives the round trip.
    #[test]
    fn sequence_roundtrips(
        config in arb_config(),
        messages in prop::collection::vec(arb_payload(), 1..6),
    ) {
        init_test_logging();
        let (deflater, inflater) = client_to_server(config);
        runtime().block_on(async {
            for message in messages {
                let data = Bytes::from(message);
                let compressed = deflater.compress(data.clone(), true).await.unwrap();
                let restored = inflater.decompress(compressed, true).await.unwrap();
                prop_assert_eq!(restored, data);
            }
            Ok(())
        })?;
    }

    /// Splitting a message into fragments compresses to the same content.
    #[test]
    fn fragmented_message_roundtrips(
        payload in arb_payload(),
        cut in 0usize..2048,
    ) {
        init_test_logging();
        let (deflater, inflater) = client_to_server(PerMessageDeflateConfig::new());
        let cut = cut.min(payload.len());
        let data = Bytes::from(payload);
        runtime().block_on(async {
            let first = deflater.compress(data.slice(..cut), false).await.unwrap();
            let second = deflater.compress(data.slice(cut..), true).await.unwrap();
            let mut restored = inflater.decompress(first, false).await.unwrap().to_vec();
            restored.extend_from_slice(&inflater.decompress(second, true).await.unwrap());
            prop_assert_eq!(Bytes::from(restored), data);
            Ok(())
        })?;
    }
}

#[test]
fn inflated_size_is_capped() {
    init_test_logging();
    let config = PerMessageDeflateConfig::new();
    let mut client = PerMessageDeflate::new(config.clone(), false, MAX_PAYLOAD);
    let mut server = PerMessageDeflate::new(config, true, 1024);
    let response = server.accept(&[client.offer()]).unwrap().to_extension_params();
    client.accept(&[response]).unwrap();
    let (deflater, _) = client.into_codecs().unwrap();
    let (_, inflater) = server.into_codecs().unwrap();

    runtime().block_on(async {
        let bomb = deflater.compress(Bytes::from(vec![0u8; 64 * 1024]), true).await.unwrap();
        assert!(bomb.len() < 1024);
        let err = inflater.decompress(bomb, true).await.unwrap_err();
        assert_eq!(err.close_code(), Some(1009));
    });
}
