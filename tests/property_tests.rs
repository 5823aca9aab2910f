//! Property-based tests using proptest
//!
//! These tests verify invariants across randomized inputs: payload bytes are
//! never altered, metadata keeps its order and multiplicity, and the pool
//! never lends one connection to two callers.

mod common;

use bytes::{Bytes, BytesMut};
use common::MemoryBackend;
use grpc_fastcgi_bridge::codec::Frame;
use grpc_fastcgi_bridge::config::BridgeConfig;
use grpc_fastcgi_bridge::metadata::{AUTHORITY, Metadata, parse_grpc_timeout, remap_request_headers};
use grpc_fastcgi_bridge::{BackendPool, PoolConfig};
use prost::Message;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Arbitrary Implementations
// =============================================================================

/// Metadata entries with lower-case keys, duplicates likely
fn arb_metadata_entries() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec(("x-[a-c]{1,2}", "[a-zA-Z0-9 ,;=]{0,16}"), 0..12)
}

/// Pool sizing and per-task hold times in milliseconds
fn arb_pool_workload() -> impl Strategy<Value = (usize, Vec<u64>)> {
    (1usize..5, prop::collection::vec(0u64..4, 1..24))
}

// =============================================================================
// Pass-through fidelity
// =============================================================================

proptest! {
    #[test]
    fn frame_bytes_are_untouched(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
        let frame = Frame::new(payload.clone());
        let mut wire = BytesMut::new();
        frame.write_to(&mut wire);
        prop_assert_eq!(&wire[..], payload.as_slice());

        let mut src = wire.freeze();
        let read = Frame::read_from(&mut src);
        prop_assert_eq!(read.into_payload(), Bytes::from(payload));
    }

    #[test]
    fn protobuf_payload_survives_as_frame(text in ".{0,64}") {
        // A protobuf message relayed as a frame decodes to the same message
        let encoded = text.encode_to_vec();
        let mut src = Bytes::from(encoded);
        let frame = Frame::read_from(&mut src);

        let decoded = String::decode(frame.into_payload()).unwrap();
        prop_assert_eq!(decoded, text);
    }
}

// =============================================================================
// Metadata remapping
// =============================================================================

proptest! {
    #[test]
    fn remap_keeps_every_value_in_order(entries in arb_metadata_entries()) {
        let mut metadata = Metadata::new();
        for (key, value) in &entries {
            metadata.append(key, value.clone());
        }

        let (host, headers) = remap_request_headers(&metadata, "localhost");
        prop_assert_eq!(host, "localhost");

        let keys: HashSet<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        for key in keys {
            let expected: Vec<&str> = entries
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .collect();
            let actual: Vec<&str> = headers
                .get_all(key)
                .iter()
                .map(|v| v.to_str().unwrap())
                .collect();
            prop_assert_eq!(actual, expected);
        }
    }

    #[test]
    fn first_authority_selects_host(
        hosts in prop::collection::vec("[a-z]{1,8}\\.example(:[0-9]{2,5})?", 1..4),
    ) {
        let mut metadata = Metadata::new();
        for host in &hosts {
            metadata.append(AUTHORITY, host.clone());
        }

        let (host, headers) = remap_request_headers(&metadata, "localhost");
        prop_assert_eq!(&host, &hosts[0]);
        prop_assert_eq!(headers.get_all(http::header::HOST).iter().count(), 1);
        prop_assert!(headers.get(AUTHORITY).is_none());
    }

    #[test]
    fn grpc_timeout_units(amount in 0u64..99_999_999, unit in prop::sample::select(vec!['H', 'M', 'S', 'm', 'u', 'n'])) {
        let parsed = parse_grpc_timeout(&format!("{amount}{unit}")).unwrap();
        let expected = match unit {
            'H' => Duration::from_secs(amount * 3600),
            'M' => Duration::from_secs(amount * 60),
            'S' => Duration::from_secs(amount),
            'm' => Duration::from_millis(amount),
            'u' => Duration::from_micros(amount),
            _ => Duration::from_nanos(amount),
        };
        prop_assert_eq!(parsed, expected);
    }
}

// =============================================================================
// Configuration
// =============================================================================

proptest! {
    #[test]
    fn config_toml_roundtrip(
        pool_size in 1usize..512,
        acquire_ms in 1u64..60_000,
        idle in prop::option::of(1u64..3600),
        entry in "/[a-z]{1,10}/[a-z]{1,10}\\.php",
    ) {
        let mut config = BridgeConfig {
            entry_file: entry,
            ..Default::default()
        };
        config.pool.max_connections = pool_size;
        config.pool.acquire_timeout_ms = acquire_ms;
        config.pool.idle_timeout_secs = idle;

        let text = toml::to_string(&config).unwrap();
        let parsed: BridgeConfig = toml::from_str(&text).unwrap();

        prop_assert_eq!(&parsed.entry_file, &config.entry_file);
        prop_assert_eq!(&parsed.pool, &config.pool);
        prop_assert!(parsed.validate().is_ok());
    }
}

// =============================================================================
// Pool exclusivity
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn pool_never_shares_a_connection((capacity, holds) in arb_pool_workload()) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let (created, max_in_use) = runtime.block_on(async move {
            let pool = BackendPool::new(
                MemoryBackend::echo(),
                PoolConfig {
                    max_connections: capacity,
                    acquire_timeout: Duration::from_secs(5),
                    idle_timeout: None,
                },
            );
            let held: Arc<Mutex<HashSet<u64>>> = Arc::default();
            let peak: Arc<Mutex<usize>> = Arc::default();

            let tasks: Vec<_> = holds
                .into_iter()
                .map(|hold_ms| {
                    let pool = pool.clone();
                    let held = held.clone();
                    let peak = peak.clone();
                    tokio::spawn(async move {
                        let conn = pool.acquire().await.unwrap();
                        {
                            let mut held = held.lock().unwrap();
                            assert!(held.insert(conn.id()), "connection {} lent twice", conn.id());
                            let mut peak = peak.lock().unwrap();
                            *peak = (*peak).max(held.len());
                        }
                        tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                        held.lock().unwrap().remove(&conn.id());
                        conn.release();
                    })
                })
                .collect();

            for task in tasks {
                task.await.unwrap();
            }

            let stats = pool.stats();
            assert_eq!(stats.in_use, 0);
            let peak = *peak.lock().unwrap();
            (stats.created, peak)
        });

        prop_assert!(max_in_use <= capacity);
        prop_assert!(created as usize <= capacity);
    }
}
