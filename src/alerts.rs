//! Ranked, expiring alerts.
//!
//! Profitable opportunities are detected elsewhere and handed in as
//! opaque inputs; this module correlates them with recent price
//! movements, scores them for ordering, and expires them aggressively —
//! a live price is only actionable for seconds. Expired entries are
//! dropped lazily when read, never swept on a timer.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::movement::MovementEvent;
use crate::types::{AlertTier, MarketKind};

/// Alert lifetime when a movement is associated: act fast or not at all.
const MOVEMENT_TTL_SECONDS: i64 = 15;
/// Alert lifetime otherwise.
const BASE_TTL_SECONDS: i64 = 30;

// ---------------------------------------------------------------------------
// Opportunity input
// ---------------------------------------------------------------------------

/// One leg of a detected opportunity.
#[derive(Debug, Clone)]
pub struct OpportunityLeg {
    pub counterparty: String,
    pub selection: String,
    pub price: f64,
}

/// An externally detected profitable opportunity. The profitability
/// math happens upstream; this is consumed as-is.
#[derive(Debug, Clone)]
pub struct OpportunityDetection {
    pub event_id: String,
    pub event_name: String,
    pub leg1: OpportunityLeg,
    pub leg2: OpportunityLeg,
    pub profit_pct: f64,
    pub market_kind: MarketKind,
}

// ---------------------------------------------------------------------------
// Ranked alert
// ---------------------------------------------------------------------------

/// An opportunity enriched with movement context and an expiry clock.
#[derive(Debug, Clone)]
pub struct RankedAlert {
    pub id: Uuid,
    pub opportunity: OpportunityDetection,
    pub profit_pct: f64,
    pub market_kind: MarketKind,
    pub detected_at: DateTime<Utc>,
    pub has_movement: bool,
}

impl RankedAlert {
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = if self.has_movement {
            MOVEMENT_TTL_SECONDS
        } else {
            BASE_TTL_SECONDS
        };
        self.detected_at + Duration::seconds(ttl)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at()
    }

    pub fn seconds_remaining(&self) -> i64 {
        (self.expires_at() - Utc::now()).num_seconds().max(0)
    }

    /// Priority score 0–100 for alert ordering. Profit carries the
    /// base, movement association and market kind add premiums, age
    /// decays the rest.
    pub fn priority_score(&self) -> u8 {
        let mut score = (self.profit_pct * 10.0).min(40.0);
        if self.has_movement {
            score += 15.0;
        }
        score += self.market_kind.bonus();
        let age_seconds = (Utc::now() - self.detected_at).num_seconds() as f64;
        score -= (age_seconds * 2.0).min(20.0);
        score.clamp(0.0, 100.0) as u8
    }

    /// Tier before any boosting.
    pub fn base_tier(&self) -> AlertTier {
        AlertTier::from_profit_pct(self.profit_pct)
    }

    /// Effective tier: live opportunities are boosted exactly one tier.
    pub fn tier(&self) -> AlertTier {
        if self.market_kind == MarketKind::Live {
            self.base_tier().boosted()
        } else {
            self.base_tier()
        }
    }

    /// Rendered tier marker; movement association adds extra urgency.
    pub fn tier_label(&self) -> String {
        if self.has_movement {
            format!("🚨{}", self.tier())
        } else {
            self.tier().to_string()
        }
    }
}

impl fmt::Display for RankedAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:.2}% {}↔{} (score {}, {}s left)",
            self.tier_label(),
            self.opportunity.event_name,
            self.profit_pct,
            self.opportunity.leg1.counterparty,
            self.opportunity.leg2.counterparty,
            self.priority_score(),
            self.seconds_remaining(),
        )
    }
}

// ---------------------------------------------------------------------------
// Prioritizer
// ---------------------------------------------------------------------------

/// Stats snapshot for the ops layer.
#[derive(Debug, Clone, Default)]
pub struct PrioritizerStats {
    pub active_alerts: usize,
    pub recent_movements: usize,
    pub top_priority: u8,
    pub movement_associated: usize,
}

/// Combines opportunity detections with movement context into a
/// ranked, expiring alert list.
#[derive(Default)]
pub struct AlertPrioritizer {
    active: Vec<RankedAlert>,
    recent_movements: HashMap<(String, String), MovementEvent>,
}

impl AlertPrioritizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a movement for later association with opportunities on
    /// the same (event, selection).
    pub fn add_movement(&mut self, movement: MovementEvent) {
        let key = (movement.event_id.clone(), movement.selection.clone());
        debug!(
            event_id = %movement.event_id,
            selection = %movement.selection,
            "Movement recorded for alert association"
        );
        self.recent_movements.insert(key, movement);
    }

    /// Ingest an opportunity detection, correlating it with any
    /// unexpired movement on either leg.
    pub fn ingest(&mut self, detection: OpportunityDetection) -> RankedAlert {
        let has_movement = [&detection.leg1, &detection.leg2].iter().any(|leg| {
            self.recent_movements
                .get(&(detection.event_id.clone(), leg.selection.clone()))
                .map(|m| !m.is_expired())
                .unwrap_or(false)
        });

        let alert = RankedAlert {
            id: Uuid::new_v4(),
            profit_pct: detection.profit_pct,
            market_kind: detection.market_kind,
            detected_at: Utc::now(),
            has_movement,
            opportunity: detection,
        };

        info!(
            event = %alert.opportunity.event_name,
            profit_pct = format!("{:.2}", alert.profit_pct),
            kind = %alert.market_kind,
            has_movement,
            tier = %alert.tier_label(),
            "Alert ranked"
        );

        self.active.push(alert.clone());
        alert
    }

    /// Active alerts, highest priority first. Expired entries are
    /// dropped here, on read.
    pub fn get_prioritized(&mut self) -> Vec<RankedAlert> {
        self.active.retain(|a| !a.is_expired());
        let mut alerts = self.active.clone();
        alerts.sort_by(|a, b| b.priority_score().cmp(&a.priority_score()));
        alerts
    }

    /// Manual sweep of expired alerts and movements. Returns how many
    /// alerts were removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let before = self.active.len();
        self.active.retain(|a| !a.is_expired());
        self.recent_movements.retain(|_, m| !m.is_expired());
        before - self.active.len()
    }

    pub fn stats(&self) -> PrioritizerStats {
        let live: Vec<&RankedAlert> = self.active.iter().filter(|a| !a.is_expired()).collect();
        PrioritizerStats {
            active_alerts: live.len(),
            recent_movements: self.recent_movements.len(),
            top_priority: live.iter().map(|a| a.priority_score()).max().unwrap_or(0),
            movement_associated: live.iter().filter(|a| a.has_movement).count(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
