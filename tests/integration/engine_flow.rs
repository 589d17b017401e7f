//! End-to-end engine flows against the scripted adapter.

use std::sync::{Arc, Mutex};

use steamfeed::alerts::{OpportunityDetection, OpportunityLeg};
use steamfeed::config::{CounterpartyConfig, CredentialEntry, HeuristicsConfig};
use steamfeed::credentials::CredentialSet;
use steamfeed::engine::FeedEngine;
use steamfeed::movement::MovementEvent;
use steamfeed::poller::FeedObserver;
use steamfeed::types::{MarketKind, PriceRecord, SessionState};

use crate::mock_adapter::{price, ScriptedAdapter};

fn heuristics() -> HeuristicsConfig {
    HeuristicsConfig {
        min_login_interval_seconds: 0,
        ban_sleep_min_seconds: 0.0,
        ban_sleep_max_seconds: 0.0,
        ..HeuristicsConfig::default()
    }
}

fn counterparty_config(name: &str, poll_interval: u64) -> CounterpartyConfig {
    CounterpartyConfig {
        name: name.to_string(),
        adapter: "http".to_string(),
        enabled: true,
        feed_url: Some("https://example.com/feed".to_string()),
        login_url: None,
        poll_interval_seconds: poll_interval,
        min_delay_seconds: 0.0,
        max_delay_seconds: 0.0,
        credentials: vec![CredentialEntry {
            identifier: "userA".to_string(),
            secret_env: "UNUSED".to_string(),
        }],
    }
}

fn credentials(name: &str, ids: &[&str]) -> Vec<CredentialSet> {
    ids.iter()
        .map(|id| CredentialSet::new(name, id, "pw"))
        .collect()
}

struct CountingObserver {
    prices: Mutex<usize>,
    movements: Mutex<Vec<MovementEvent>>,
}

impl FeedObserver for CountingObserver {
    fn on_prices(&self, _counterparty: &str, prices: &[PriceRecord]) {
        *self.prices.lock().unwrap() += prices.len();
    }

    fn on_movement(&self, movement: &MovementEvent) {
        self.movements.lock().unwrap().push(movement.clone());
    }
}

/// Register two credentials, burn credential A out with three failed
/// logins, and verify only B is attempted once A is quarantined.
#[tokio::test]
async fn credential_rotation_after_quarantine() {
    let adapter = Arc::new(ScriptedAdapter::new("bookA"));
    adapter.reject_identifier("userA");

    let mut engine = FeedEngine::new(heuristics(), vec![], None);
    engine
        .register_with_adapter(
            counterparty_config("bookA", 6),
            credentials("bookA", &["userA", "userB"]),
            adapter.clone(),
        )
        .await
        .unwrap();

    // Three failed attempts quarantine userA at the pool level.
    for _ in 0..3 {
        assert!(!engine.ensure_active("bookA").await);
    }

    // The next attempt selects and logs in with userB only.
    assert!(engine.ensure_active("bookA").await);
    assert_eq!(
        adapter.login_attempts(),
        vec!["userA", "userA", "userA", "userB"]
    );

    let status = engine.get_status("bookA").await.unwrap();
    assert_eq!(status.state, SessionState::Active);
    assert!(status.session_valid);
}

/// Drive the real polling loop for two ticks and verify the movement
/// flows through to a ranked, movement-associated alert.
#[tokio::test]
async fn polling_detects_movement_and_boosts_alert() {
    let adapter = Arc::new(ScriptedAdapter::new("bookA"));
    adapter.push_prices(vec![price("bookA", "EV-1", "home", 2.00)]);
    adapter.push_prices(vec![price("bookA", "EV-1", "home", 2.30)]);

    let observer = Arc::new(CountingObserver {
        prices: Mutex::new(0),
        movements: Mutex::new(Vec::new()),
    });

    let mut engine = FeedEngine::new(heuristics(), vec![], None);
    engine.add_observer(observer.clone());
    engine
        .register_with_adapter(
            counterparty_config("bookA", 3),
            credentials("bookA", &["userA"]),
            adapter.clone(),
        )
        .await
        .unwrap();

    engine.start_live_polling("bookA").await;

    // Base interval 3s with jitter in [-1, +2): two ticks land well
    // within 7 seconds.
    tokio::time::sleep(std::time::Duration::from_secs(7)).await;
    engine.stop_live_polling("bookA").await;

    let movements = observer.movements.lock().unwrap().clone();
    assert!(
        !movements.is_empty(),
        "expected a movement after 2.00 → 2.30"
    );
    assert_eq!(movements[0].selection, "home");
    assert!(*observer.prices.lock().unwrap() >= 2);

    // An opportunity on the moved selection is movement-associated and
    // tier-boosted as a live market.
    let alert = engine.ingest_opportunity(OpportunityDetection {
        event_id: "EV-1".to_string(),
        event_name: "Alpha vs Beta".to_string(),
        leg1: OpportunityLeg {
            counterparty: "booka".to_string(),
            selection: "home".to_string(),
            price: 2.30,
        },
        leg2: OpportunityLeg {
            counterparty: "bookb".to_string(),
            selection: "away".to_string(),
            price: 1.95,
        },
        profit_pct: 2.0,
        market_kind: MarketKind::Live,
    });
    assert!(alert.has_movement);
    assert_eq!(alert.tier_label(), "🚨🔥");

    let ranked = engine.get_prioritized_alerts();
    assert_eq!(ranked.len(), 1);
    assert!(ranked[0].has_movement);

    engine.close_all().await;
}

/// The loop keeps running through failed ticks and recovers when the
/// feed does.
#[tokio::test]
async fn polling_survives_errors() {
    let adapter = Arc::new(ScriptedAdapter::new("bookA"));
    adapter.push_outcome(steamfeed::types::FetchOutcome::failed("upstream 500"));
    adapter.push_prices(vec![price("bookA", "EV-1", "home", 2.00)]);

    let mut engine = FeedEngine::new(heuristics(), vec![], None);
    engine
        .register_with_adapter(
            counterparty_config("bookA", 3),
            credentials("bookA", &["userA"]),
            adapter.clone(),
        )
        .await
        .unwrap();

    engine.start_live_polling("bookA").await;
    // First tick fails (10s error sleep), second succeeds.
    tokio::time::sleep(std::time::Duration::from_secs(12)).await;
    engine.stop_live_polling("bookA").await;

    let stats = engine.stats().await;
    let cp = &stats.counterparties[0];
    assert!(cp.poller.error_count >= 1);
    assert!(cp.poller.poll_count >= 1);
    assert!(cp.poller.snapshot_count >= 1);

    engine.close_all().await;
}

/// Session status queries always return last-known state, never a
/// fault, and stopping resets the session record.
#[tokio::test]
async fn status_reflects_lifecycle() {
    let adapter = Arc::new(ScriptedAdapter::new("bookA"));

    let mut engine = FeedEngine::new(heuristics(), vec![], None);
    engine
        .register_with_adapter(
            counterparty_config("bookA", 6),
            credentials("bookA", &["userA"]),
            adapter.clone(),
        )
        .await
        .unwrap();

    let status = engine.get_status("bookA").await.unwrap();
    assert_eq!(status.state, SessionState::Uninitialized);

    assert!(engine.ensure_active("bookA").await);
    assert_eq!(
        engine.get_status("bookA").await.unwrap().state,
        SessionState::Active
    );

    engine.stop_live_polling("bookA").await;
    let status = engine.get_status("bookA").await.unwrap();
    assert_eq!(status.state, SessionState::Uninitialized);
    assert!(!status.session_valid);
}
