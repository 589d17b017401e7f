//! Ban-handling flows against the scripted adapter.

use std::sync::{Arc, Mutex};

use steamfeed::config::HeuristicsConfig;
use steamfeed::proxy::{ProxyEndpoint, ProxyRotator};
use steamfeed::resilience::BanResilience;
use steamfeed::types::{FeedError, FetchOutcome};

use crate::mock_adapter::{price, ScriptedAdapter};

fn heuristics() -> HeuristicsConfig {
    HeuristicsConfig {
        ban_sleep_min_seconds: 0.0,
        ban_sleep_max_seconds: 0.0,
        ..HeuristicsConfig::default()
    }
}

fn rotator(n: usize) -> Arc<Mutex<ProxyRotator>> {
    let endpoints = (0..n)
        .map(|i| ProxyEndpoint::new(&format!("10.0.0.{i}"), 8080))
        .collect();
    Arc::new(Mutex::new(ProxyRotator::new(
        endpoints,
        vec![30, 60, 300, 900],
    )))
}

/// A block response tears the session down and reroutes through the
/// next proxy before control returns.
#[tokio::test]
async fn block_tears_down_and_reroutes() {
    let adapter = Arc::new(ScriptedAdapter::new("bookA"));
    adapter.push_outcome(
        FetchOutcome::failed("edge 403")
            .with_excerpt(format!("access denied — unusual activity {}", " x".repeat(60))),
    );

    let mut resilience = BanResilience::new("bookA", &heuristics(), rotator(2), None);

    let err = resilience.guarded_fetch(adapter.as_ref()).await.unwrap_err();
    assert!(matches!(err, FeedError::BlockDetected { .. }));
    assert_eq!(resilience.ban_count(), 1);

    // Teardown happened and a proxy was acquired for the new route.
    assert_eq!(*adapter.close_count.lock().unwrap(), 1);
    let reroutes = adapter.reroutes.lock().unwrap().clone();
    assert_eq!(reroutes.len(), 1);
    assert!(reroutes[0].is_some());
}

/// After a teardown the next fetch proceeds normally — the stored page
/// state died with the session.
#[tokio::test]
async fn recovery_after_block() {
    let adapter = Arc::new(ScriptedAdapter::new("bookA"));
    adapter.push_outcome(
        FetchOutcome::failed("edge 403")
            .with_excerpt(format!("blocked {}", " x".repeat(60))),
    );
    adapter.push_prices(vec![price("bookA", "EV-1", "home", 2.00)]);

    let mut resilience = BanResilience::new("bookA", &heuristics(), rotator(2), None);

    assert!(resilience.guarded_fetch(adapter.as_ref()).await.is_err());
    let outcome = resilience.guarded_fetch(adapter.as_ref()).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.prices.len(), 1);
}

/// Repeated blocks walk the proxy pool rather than hammering one
/// endpoint.
#[tokio::test]
async fn repeated_blocks_rotate_proxies() {
    let adapter = Arc::new(ScriptedAdapter::new("bookA"));
    for _ in 0..3 {
        adapter.push_outcome(
            FetchOutcome::failed("edge 403")
                .with_excerpt(format!("perimeterx {}", " x".repeat(60))),
        );
    }

    let rot = rotator(3);
    let mut resilience = BanResilience::new("bookA", &heuristics(), rot.clone(), None);

    for _ in 0..3 {
        let _ = resilience.guarded_fetch(adapter.as_ref()).await;
    }
    assert_eq!(resilience.ban_count(), 3);

    let reroutes = adapter.reroutes.lock().unwrap().clone();
    let distinct: std::collections::HashSet<_> = reroutes.iter().flatten().collect();
    assert!(
        distinct.len() >= 2,
        "expected rotation across proxies, got {reroutes:?}"
    );
}
