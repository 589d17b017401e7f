//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (credential passwords, proxy passwords, solver API keys) are
//! referenced by env-var name in the config and resolved at runtime via
//! `std::env::var`.
//!
//! Every heuristic the engine relies on (block-signal text, failure
//! thresholds, cooldown windows, backoff schedule) lives here as a
//! tunable field with the observed production values as defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use crate::types::FeedError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub heuristics: HeuristicsConfig,
    #[serde(default)]
    pub counterparty: Vec<CounterpartyConfig>,
    #[serde(default)]
    pub proxy: Vec<ProxyEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub name: String,
    /// Env var holding the external challenge-solver API key.
    /// Absent → challenges fail cleanly instead of being retried.
    #[serde(default)]
    pub solver_api_key_env: Option<String>,
}

/// Per-counterparty feed configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct CounterpartyConfig {
    pub name: String,
    /// Access variant tag: "http" today; further variants select
    /// different `FeedAdapter` implementations.
    #[serde(default = "default_adapter")]
    pub adapter: String,
    #[serde(default)]
    pub enabled: bool,
    pub feed_url: Option<String>,
    pub login_url: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Jitter bounds applied before each delegated access call.
    #[serde(default = "default_min_delay")]
    pub min_delay_seconds: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: f64,
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
}

/// One credential set in the config file. The secret is an env-var
/// reference, never inline.
#[derive(Debug, Deserialize, Clone)]
pub struct CredentialEntry {
    pub identifier: String,
    pub secret_env: String,
}

/// One egress proxy endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyEntry {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_proxy_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
}

/// Tunable heuristics copied from observed counterparty behaviour.
///
/// These are starting points, not guaranteed-correct constants; every
/// field can be overridden in `config.toml`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HeuristicsConfig {
    /// Price change (%) that counts as a rapid movement.
    pub movement_threshold_pct: f64,
    /// Trailing comparison window for movement detection.
    pub snapshot_window_seconds: i64,
    /// Cooldown after a forced logout, before a credential is reused.
    pub cooldown_minutes: i64,
    /// Consecutive login failures before a credential is quarantined.
    pub quarantine_threshold: u32,
    /// Consecutive session login failures before EXHAUSTED.
    pub max_login_failures: u32,
    /// Minimum spacing between login attempts per counterparty.
    pub min_login_interval_seconds: i64,
    /// Proxy backoff schedule for consecutive failure counts 1, 2, 3, 4+.
    pub proxy_backoff_seconds: Vec<i64>,
    /// Page text fragments that indicate a block.
    pub block_signals: Vec<String>,
    /// Page text fragments that indicate an interactive challenge.
    pub challenge_markers: Vec<String>,
    /// Error text fragments that indicate a forced logout rather than
    /// bad credentials.
    pub forced_logout_indicators: Vec<String>,
    /// Pages shorter than this are treated as a block signal.
    pub min_page_content_length: usize,
    /// Sleep bounds after a ban teardown, before rerouting.
    pub ban_sleep_min_seconds: f64,
    pub ban_sleep_max_seconds: f64,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            movement_threshold_pct: 5.0,
            snapshot_window_seconds: 300,
            cooldown_minutes: 15,
            quarantine_threshold: 3,
            max_login_failures: 5,
            min_login_interval_seconds: 60,
            proxy_backoff_seconds: vec![30, 60, 300, 900],
            block_signals: vec![
                "access denied".to_string(),
                "blocked".to_string(),
                "unusual activity".to_string(),
                "verify you're human".to_string(),
                "cloudflare".to_string(),
                "datadome".to_string(),
                "perimeterx".to_string(),
            ],
            challenge_markers: vec![
                "captcha".to_string(),
                "challenge-form".to_string(),
                "g-recaptcha".to_string(),
                "h-captcha".to_string(),
            ],
            forced_logout_indicators: vec![
                "session expired".to_string(),
                "logged out".to_string(),
                "log in again".to_string(),
                "another session".to_string(),
            ],
            min_page_content_length: 100,
            ban_sleep_min_seconds: 30.0,
            ban_sleep_max_seconds: 60.0,
        }
    }
}

fn default_adapter() -> String {
    "http".to_string()
}

fn default_poll_interval() -> u64 {
    6
}

fn default_min_delay() -> f64 {
    2.0
}

fn default_max_delay() -> f64 {
    10.0
}

fn default_proxy_protocol() -> String {
    "http".to_string()
}

impl CounterpartyConfig {
    /// Validate the recognized option ranges.
    ///
    /// A validation failure is fatal only for this counterparty;
    /// registration of the others proceeds.
    pub fn validate(&self) -> Result<(), FeedError> {
        if !(3..=15).contains(&self.poll_interval_seconds) {
            return Err(FeedError::Configuration {
                counterparty: self.name.clone(),
                message: format!(
                    "poll_interval_seconds must be within 3-15, got {}",
                    self.poll_interval_seconds
                ),
            });
        }
        if self.min_delay_seconds < 0.0 || self.max_delay_seconds < self.min_delay_seconds {
            return Err(FeedError::Configuration {
                counterparty: self.name.clone(),
                message: format!(
                    "invalid jitter bounds: min={} max={}",
                    self.min_delay_seconds, self.max_delay_seconds
                ),
            });
        }
        if self.credentials.is_empty() {
            return Err(FeedError::Configuration {
                counterparty: self.name.clone(),
                message: "at least one credential set is required".to_string(),
            });
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
