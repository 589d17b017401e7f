//! Rapid price-movement detection.
//!
//! Compares the newest odds snapshot against every snapshot inside a
//! trailing window and flags significant changes ("steam moves") —
//! often the first visible trace of sharp money landing at one
//! counterparty. Movements live 30 seconds and are expired lazily by
//! whoever reads them; nothing sweeps them on a timer.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use tracing::info;

use crate::types::{PriceKey, PriceRecord};

/// Movements go stale quickly.
const MOVEMENT_TTL_SECONDS: i64 = 30;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A point-in-time snapshot of prices, immutable once captured.
#[derive(Debug, Clone)]
pub struct OddsSnapshot {
    pub captured_at: DateTime<Utc>,
    prices: HashMap<PriceKey, f64>,
}

impl OddsSnapshot {
    pub fn from_records(captured_at: DateTime<Utc>, records: &[PriceRecord]) -> Self {
        let prices = records
            .iter()
            .map(|r| (r.key(), r.price_decimal))
            .collect();
        Self {
            captured_at,
            prices,
        }
    }

    pub fn price(&self, key: &PriceKey) -> Option<f64> {
        self.prices.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PriceKey, f64)> {
        self.prices.iter().map(|(k, v)| (k, *v))
    }
}

// ---------------------------------------------------------------------------
// Movement event
// ---------------------------------------------------------------------------

/// Direction of a price movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Price moving down — sharp money backing the selection.
    Shortening,
    /// Price moving up.
    Drifting,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Shortening => write!(f, "shortening"),
            Direction::Drifting => write!(f, "drifting"),
        }
    }
}

/// A detected rapid price movement.
#[derive(Debug, Clone)]
pub struct MovementEvent {
    pub event_id: String,
    pub selection: String,
    pub counterparty: String,
    pub old_price: f64,
    pub new_price: f64,
    pub change_pct: f64,
    pub detected_at: DateTime<Utc>,
}

impl MovementEvent {
    pub fn key(&self) -> PriceKey {
        PriceKey {
            event_id: self.event_id.clone(),
            selection: self.selection.clone(),
            counterparty: self.counterparty.clone(),
        }
    }

    pub fn direction(&self) -> Direction {
        if self.new_price < self.old_price {
            Direction::Shortening
        } else {
            Direction::Drifting
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.detected_at + Duration::seconds(MOVEMENT_TTL_SECONDS)
    }

    /// Checked lazily by readers; expired movements are ignored, never
    /// actively swept.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at()
    }

    /// Urgency score 0–100. Bigger and fresher moves score higher;
    /// shortening carries a premium because it usually means sharp
    /// action.
    pub fn urgency_score(&self) -> u8 {
        let mut score = 50.0;
        score += (self.change_pct * 5.0).min(30.0);
        if self.direction() == Direction::Shortening {
            score += 10.0;
        }
        let age_seconds = (Utc::now() - self.detected_at).num_seconds() as f64;
        score -= (age_seconds * 2.0).min(20.0);
        score.clamp(0.0, 100.0) as u8
    }
}

impl fmt::Display for MovementEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} {:.2} → {:.2} ({:.1}%)",
            self.counterparty,
            self.selection,
            self.direction(),
            self.old_price,
            self.new_price,
            self.change_pct,
        )
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Flags rapid, significant price changes against the rolling history.
pub struct MovementDetector {
    threshold_pct: f64,
    window: Duration,
}

impl MovementDetector {
    pub fn new(threshold_pct: f64, window_seconds: i64) -> Self {
        Self {
            threshold_pct,
            window: Duration::seconds(window_seconds),
        }
    }

    /// Compare `current` against every older snapshot inside the
    /// trailing window. One movement per price key per tick; the
    /// earliest qualifying comparison wins.
    pub fn detect(
        &self,
        history: &VecDeque<OddsSnapshot>,
        current: &OddsSnapshot,
    ) -> Vec<MovementEvent> {
        if history.len() < 2 {
            return Vec::new();
        }

        let cutoff = Utc::now() - self.window;
        let mut seen: HashSet<PriceKey> = HashSet::new();
        let mut movements = Vec::new();

        for snapshot in history {
            if snapshot.captured_at < cutoff {
                continue;
            }
            // Only ever look backward in time.
            if snapshot.captured_at >= current.captured_at {
                continue;
            }

            for (key, new_price) in current.iter() {
                if seen.contains(key) {
                    continue;
                }
                let Some(old_price) = snapshot.price(key) else {
                    continue;
                };
                if old_price <= 0.0 {
                    continue;
                }

                let change_pct = ((new_price - old_price) / old_price).abs() * 100.0;
                if change_pct >= self.threshold_pct {
                    seen.insert(key.clone());
                    let movement = MovementEvent {
                        event_id: key.event_id.clone(),
                        selection: key.selection.clone(),
                        counterparty: key.counterparty.clone(),
                        old_price,
                        new_price,
                        change_pct,
                        detected_at: Utc::now(),
                    };
                    info!(
                        counterparty = %movement.counterparty,
                        selection = %movement.selection,
                        direction = %movement.direction(),
                        old = movement.old_price,
                        new = movement.new_price,
                        change_pct = format!("{:.1}", movement.change_pct),
                        "Steam move detected"
                    );
                    movements.push(movement);
                }
            }
        }

        movements
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
