//! Adaptive live-polling loop.
//!
//! One perpetual loop per counterparty. Each tick runs strictly
//! sequentially: ensure the session is active, fetch through the
//! resilience wrapper, snapshot the prices into the bounded ring
//! buffer, detect movements, notify observers. The inter-tick delay is
//! jittered around the configured base and floored at 3 seconds — a
//! fixed cadence is exactly the fingerprint the counterparties look
//! for. Errors never stop the loop; it logs, sleeps a longer fixed
//! interval, and retries.
//!
//! `stop()` is cooperative: the flag is checked at the top of each
//! iteration, so an in-flight access call always runs to completion.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use crate::adapters::FeedAdapter;
use crate::config::{CounterpartyConfig, HeuristicsConfig};
use crate::credentials::CredentialPool;
use crate::movement::{MovementDetector, MovementEvent, OddsSnapshot};
use crate::resilience::BanResilience;
use crate::session::SessionLifecycle;
use crate::types::{FeedError, PriceRecord};

/// Ring buffer capacity for snapshot history.
const SNAPSHOT_CAPACITY: usize = 100;

/// Hard floor on the inter-tick delay, jitter included.
const MIN_TICK_SECONDS: f64 = 3.0;

/// Fixed sleep after a failed tick.
const ERROR_SLEEP_SECONDS: u64 = 10;

/// Receives fresh prices and detected movements each tick.
///
/// Implementations must be cheap and non-blocking; they run inline in
/// the polling loop.
pub trait FeedObserver: Send + Sync {
    fn on_prices(&self, counterparty: &str, prices: &[PriceRecord]);
    fn on_movement(&self, movement: &MovementEvent);
}

/// Stats snapshot for one poller.
#[derive(Debug, Clone)]
pub struct PollerStats {
    pub counterparty: String,
    pub is_running: bool,
    pub poll_count: u64,
    pub error_count: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub snapshot_count: usize,
    pub movements_detected: u64,
}

pub struct LivePoller {
    counterparty: String,
    base_interval_seconds: f64,
    detector: MovementDetector,
    snapshots: VecDeque<OddsSnapshot>,
    observers: Vec<Arc<dyn FeedObserver>>,
    running: Arc<AtomicBool>,
    poll_count: u64,
    error_count: u64,
    last_poll_at: Option<DateTime<Utc>>,
    movements_detected: u64,
}

impl LivePoller {
    pub fn new(config: &CounterpartyConfig, heuristics: &HeuristicsConfig) -> Self {
        Self {
            counterparty: config.name.to_lowercase(),
            base_interval_seconds: config.poll_interval_seconds as f64,
            detector: MovementDetector::new(
                heuristics.movement_threshold_pct,
                heuristics.snapshot_window_seconds,
            ),
            snapshots: VecDeque::with_capacity(SNAPSHOT_CAPACITY),
            observers: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            poll_count: 0,
            error_count: 0,
            last_poll_at: None,
            movements_detected: 0,
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn FeedObserver>) {
        self.observers.push(observer);
    }

    /// The cooperative stop flag. Cleared to stop the loop before its
    /// next iteration; an in-flight tick finishes first.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn stats(&self) -> PollerStats {
        PollerStats {
            counterparty: self.counterparty.clone(),
            is_running: self.running.load(Ordering::Acquire),
            poll_count: self.poll_count,
            error_count: self.error_count,
            last_poll_at: self.last_poll_at,
            snapshot_count: self.snapshots.len(),
            movements_detected: self.movements_detected,
        }
    }

    /// Snapshots captured within the last `seconds`.
    pub fn recent_snapshots(&self, seconds: i64) -> Vec<OddsSnapshot> {
        let cutoff = Utc::now() - Duration::seconds(seconds);
        self.snapshots
            .iter()
            .filter(|s| s.captured_at >= cutoff)
            .cloned()
            .collect()
    }

    /// Execute a single tick: access → snapshot → detect → notify.
    ///
    /// Errors are returned for the loop to log and absorb; they never
    /// escape the loop itself.
    pub async fn poll_once(
        &mut self,
        adapter: &dyn FeedAdapter,
        lifecycle: &mut SessionLifecycle,
        resilience: &mut BanResilience,
        pool: &Mutex<CredentialPool>,
    ) -> Result<usize> {
        let tick_started = Utc::now();

        let active = resilience
            .guarded_ensure_active(lifecycle, adapter, pool)
            .await?;
        if !active {
            self.error_count += 1;
            let reason = lifecycle
                .status()
                .error
                .unwrap_or_else(|| "session not active".to_string());
            return Err(FeedError::RecoverableLoginFailure {
                counterparty: self.counterparty.clone(),
                message: reason,
            }
            .into());
        }

        let outcome = match resilience.guarded_fetch(adapter).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.error_count += 1;
                return Err(e.into());
            }
        };

        self.poll_count += 1;
        self.last_poll_at = Some(Utc::now());

        if !outcome.success {
            self.error_count += 1;
            let reason = outcome.error.unwrap_or_else(|| "unknown".to_string());
            // Session expiry surfaces as an access error; invalidate so
            // the next tick relogs in.
            if lifecycle.is_forced_logout(&reason) {
                lifecycle.mark_session_expired(pool, &reason);
                return Err(FeedError::SessionExpired {
                    counterparty: self.counterparty.clone(),
                }
                .into());
            }
            anyhow::bail!("access failed: {reason}");
        }

        lifecycle.record_activity();

        let snapshot = OddsSnapshot::from_records(tick_started, &outcome.prices);
        self.push_snapshot(snapshot.clone());

        let movements = self.detector.detect(&self.snapshots, &snapshot);
        self.movements_detected += movements.len() as u64;

        if !outcome.prices.is_empty() {
            for observer in &self.observers {
                observer.on_prices(&self.counterparty, &outcome.prices);
            }
        }
        for movement in &movements {
            for observer in &self.observers {
                observer.on_movement(movement);
            }
        }

        debug!(
            counterparty = %self.counterparty,
            poll = self.poll_count,
            prices = outcome.prices.len(),
            movements = movements.len(),
            "Live poll complete"
        );
        Ok(outcome.prices.len())
    }

    fn push_snapshot(&mut self, snapshot: OddsSnapshot) {
        if self.snapshots.len() >= SNAPSHOT_CAPACITY {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot);
    }

    /// Next inter-tick delay: base ± uniform(-1, +2) seconds, floored.
    /// Deliberately never faster than the floor — a fixed fast cadence
    /// is detectable.
    fn next_delay_seconds(&self) -> f64 {
        let jitter = rand::thread_rng().gen_range(-1.0..2.0);
        (self.base_interval_seconds + jitter).max(MIN_TICK_SECONDS)
    }
}

/// The perpetual polling loop for one counterparty.
///
/// All per-counterparty state is locked for the duration of a tick, so
/// steps within a tick are strictly sequential and no two operations
/// for the same counterparty ever overlap.
pub async fn run_loop(
    poller: Arc<tokio::sync::Mutex<LivePoller>>,
    adapter: Arc<dyn FeedAdapter>,
    lifecycle: Arc<tokio::sync::Mutex<SessionLifecycle>>,
    resilience: Arc<tokio::sync::Mutex<BanResilience>>,
    pool: Arc<Mutex<CredentialPool>>,
    running: Arc<AtomicBool>,
) {
    let counterparty = {
        let poller = poller.lock().await;
        poller.counterparty.clone()
    };
    info!(counterparty = %counterparty, "Live poller started");

    while running.load(Ordering::Acquire) {
        let tick = {
            let mut poller = poller.lock().await;
            let mut lifecycle = lifecycle.lock().await;
            let mut resilience = resilience.lock().await;
            poller
                .poll_once(adapter.as_ref(), &mut lifecycle, &mut resilience, &pool)
                .await
        };

        let delay = match tick {
            Ok(_) => {
                let poller = poller.lock().await;
                poller.next_delay_seconds()
            }
            Err(e) => {
                error!(counterparty = %counterparty, error = %e, "Live poll error");
                ERROR_SLEEP_SECONDS as f64
            }
        };

        tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
    }

    info!(counterparty = %counterparty, "Live poller stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
