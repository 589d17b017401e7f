//! Shared types for the STEAMFEED engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that credential, session,
//! poller, and alert modules can depend on them without circular
//! references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Price records
// ---------------------------------------------------------------------------

/// A single price observation returned by an access capability.
///
/// Prices are decimal odds (> 1.0), captured at the moment the
/// counterparty page/endpoint was read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRecord {
    pub event_id: String,
    pub market: String,
    pub selection: String,
    pub counterparty: String,
    pub price_decimal: f64,
    pub captured_at: DateTime<Utc>,
}

impl fmt::Display for PriceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}/{} {} @ {:.2}",
            self.counterparty, self.event_id, self.market, self.selection, self.price_decimal,
        )
    }
}

impl PriceRecord {
    /// The identity of this price stream for movement comparison.
    pub fn key(&self) -> PriceKey {
        PriceKey {
            event_id: self.event_id.clone(),
            selection: self.selection.clone(),
            counterparty: self.counterparty.clone(),
        }
    }
}

/// Identity of one price stream: (event, selection, counterparty).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriceKey {
    pub event_id: String,
    pub selection: String,
    pub counterparty: String,
}

impl fmt::Display for PriceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.event_id, self.selection, self.counterparty)
    }
}

// ---------------------------------------------------------------------------
// Session state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a counterparty session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No login has been attempted yet.
    Uninitialized,
    /// A login attempt is in flight.
    LoggingIn,
    /// Session established and believed valid.
    Active,
    /// Session invalid; eligible for relogin once the interval elapses.
    Invalid,
    /// Relogin refused because the minimum login interval has not passed.
    RateLimited,
    /// Too many consecutive failures; terminal until operator clearing.
    Exhausted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninitialized => write!(f, "UNINITIALIZED"),
            SessionState::LoggingIn => write!(f, "LOGGING_IN"),
            SessionState::Active => write!(f, "ACTIVE"),
            SessionState::Invalid => write!(f, "INVALID"),
            SessionState::RateLimited => write!(f, "RATE_LIMITED"),
            SessionState::Exhausted => write!(f, "EXHAUSTED"),
        }
    }
}

/// Last-known session status for one counterparty.
///
/// Exclusively owned and mutated by that counterparty's
/// `SessionLifecycle`; everyone else sees read-only snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub counterparty: String,
    pub state: SessionState,
    pub logged_in: bool,
    pub session_valid: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub login_failures: u32,
    pub error: Option<String>,
}

impl SessionStatus {
    pub fn new(counterparty: &str) -> Self {
        Self {
            counterparty: counterparty.to_string(),
            state: SessionState::Uninitialized,
            logged_in: false,
            session_valid: false,
            last_login_at: None,
            last_activity_at: None,
            login_failures: 0,
            error: None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} logged_in={} valid={} failures={}{}",
            self.counterparty,
            self.state,
            self.logged_in,
            self.session_valid,
            self.login_failures,
            self.error
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default(),
        )
    }
}

// ---------------------------------------------------------------------------
// Access outcome
// ---------------------------------------------------------------------------

/// Result of one delegated access (fetch) call.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub success: bool,
    pub prices: Vec<PriceRecord>,
    pub error: Option<String>,
    /// A lowercased excerpt of the observed page/body, used by the
    /// resilience layer for block-signal matching. `None` when the
    /// variant has no page concept (e.g. a pure JSON endpoint that
    /// returned cleanly).
    pub page_excerpt: Option<String>,
}

impl FetchOutcome {
    pub fn ok(prices: Vec<PriceRecord>) -> Self {
        Self {
            success: true,
            prices,
            error: None,
            page_excerpt: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            prices: Vec::new(),
            error: Some(error.into()),
            page_excerpt: None,
        }
    }

    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.page_excerpt = Some(excerpt.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Market kind & alert tiers
// ---------------------------------------------------------------------------

/// Market classification for alert scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Moneyline,
    Boost,
    Prop,
    Live,
}

impl MarketKind {
    /// Priority bonus contributed by this kind.
    pub fn bonus(&self) -> f64 {
        match self {
            MarketKind::Boost => 10.0,
            MarketKind::Prop => 5.0,
            MarketKind::Live => 5.0,
            MarketKind::Moneyline => 0.0,
        }
    }
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketKind::Moneyline => write!(f, "moneyline"),
            MarketKind::Boost => write!(f, "boost"),
            MarketKind::Prop => write!(f, "prop"),
            MarketKind::Live => write!(f, "live"),
        }
    }
}

impl std::str::FromStr for MarketKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "moneyline" | "ml" => Ok(MarketKind::Moneyline),
            "boost" | "boosted" => Ok(MarketKind::Boost),
            "prop" | "proposition" => Ok(MarketKind::Prop),
            "live" | "inplay" | "in-play" => Ok(MarketKind::Live),
            _ => Err(anyhow::anyhow!("Unknown market kind: {s}")),
        }
    }
}

/// Alert urgency tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertTier {
    Info,
    Lightning,
    Fire,
}

impl AlertTier {
    /// Base tier from profit percentage thresholds.
    pub fn from_profit_pct(profit_pct: f64) -> Self {
        if profit_pct >= 3.0 {
            AlertTier::Fire
        } else if profit_pct >= 1.5 {
            AlertTier::Lightning
        } else {
            AlertTier::Info
        }
    }

    /// One tier up. Fire stays Fire.
    pub fn boosted(&self) -> Self {
        match self {
            AlertTier::Info => AlertTier::Lightning,
            AlertTier::Lightning => AlertTier::Fire,
            AlertTier::Fire => AlertTier::Fire,
        }
    }
}

impl fmt::Display for AlertTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertTier::Fire => write!(f, "🔥"),
            AlertTier::Lightning => write!(f, "⚡"),
            AlertTier::Info => write!(f, "ℹ️"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for STEAMFEED.
///
/// Every variant is recoverable at the engine level; polling loops log,
/// update status, and continue. `Configuration` is fatal only for the
/// counterparty it names.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Login failed for {counterparty}: {message}")]
    RecoverableLoginFailure { counterparty: String, message: String },

    #[error("No usable credential for {counterparty}")]
    CredentialsExhausted { counterparty: String },

    #[error("Session expired for {counterparty}")]
    SessionExpired { counterparty: String },

    #[error("Block detected for {counterparty}: {signal}")]
    BlockDetected { counterparty: String, signal: String },

    #[error("Challenge detected for {counterparty} and no solver configured")]
    ChallengeUnsolvable { counterparty: String },

    #[error("All proxies in backoff; pool reset")]
    ProxiesExhausted,

    #[error("Configuration error for {counterparty}: {message}")]
    Configuration { counterparty: String, message: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
