//! # Property Checks
//!
//! Invariants that must hold for any input size, checked with `proptest`.

use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tether_bus::{HostBus, SubscriptionRegistry};
use tether_refs::RefStore;
use tether_runtime::{HostContext, SatelliteContext, TetherConfig};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// After N applied writes the version is exactly N above where it
    /// started, and no two writes share a version.
    #[test]
    fn prop_ref_versions_are_dense(values in prop::collection::vec(any::<i64>(), 1..40)) {
        let store = RefStore::new(HostBus::new());
        let start = store.declare("k", json!(0)).unwrap().version;

        let versions: Vec<u64> = values
            .iter()
            .map(|v| store.write("k", json!(v)).unwrap())
            .collect();

        let expected: Vec<u64> = (start + 1..=start + values.len() as u64).collect();
        prop_assert_eq!(versions, expected);
        let last = store.read("k").unwrap();
        prop_assert_eq!(last.value, json!(values[values.len() - 1]));
    }

    /// A publish reaches exactly the handlers subscribed at publish time,
    /// each once.
    #[test]
    fn prop_publish_reaches_only_current_subscribers(before in 0usize..8, after in 0usize..8) {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut subs = Vec::new();

        for _ in 0..before {
            let hits = hits.clone();
            subs.push(registry.subscribe("t", Arc::new(move |_: &Value| {
                hits.fetch_add(1, Ordering::SeqCst);
            })));
        }
        let delivered = registry.dispatch("t", &json!("payload"));
        for _ in 0..after {
            let hits = hits.clone();
            subs.push(registry.subscribe("t", Arc::new(move |_: &Value| {
                hits.fetch_add(1, Ordering::SeqCst);
            })));
        }

        prop_assert_eq!(delivered, before);
        prop_assert_eq!(hits.load(Ordering::SeqCst), before);
        prop_assert_eq!(registry.subscriber_count("t"), before + after);
    }

    /// Arbitrary inbound bytes are rejected or decoded, never a panic.
    #[test]
    fn prop_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = tether_types::decode(&bytes);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Any number of concurrent first callers produce one handshake and
    /// share one connection.
    #[test]
    fn prop_single_flight_bootstrap(callers in 1usize..16) {
        let rt = runtime();
        let (handshakes, distinct) = rt.block_on(async move {
            let host = HostContext::new(TetherConfig::default()).unwrap();
            let sat = SatelliteContext::new(Arc::new(host.connector()), TetherConfig::default()).unwrap();

            let attempts: Vec<_> = (0..callers)
                .map(|_| {
                    let sat = sat.clone();
                    tokio::spawn(async move { sat.ensure_connection().await.unwrap() })
                })
                .collect();
            let mut conns = Vec::new();
            for attempt in attempts {
                conns.push(attempt.await.unwrap());
            }
            let distinct = conns.iter().filter(|c| !Arc::ptr_eq(c, &conns[0])).count();
            (sat.connections().handshake_count(), distinct)
        });

        prop_assert_eq!(handshakes, 1);
        prop_assert_eq!(distinct, 0);
    }
}
