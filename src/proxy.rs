//! Egress proxy pool with health tracking.
//!
//! Round-robins over endpoints that are not in backoff. Consecutive
//! failures push an endpoint out on an escalating backoff schedule; a
//! success decrements the failure counter (never zeroing it outright)
//! so trust recovers gradually. When every endpoint is in backoff the
//! pool fails open: all backoffs are reset rather than stalling the
//! feed.

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// One egress proxy endpoint.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

impl ProxyEndpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            protocol: "http".to_string(),
            username: None,
            password: None,
        }
    }

    /// Stable identity used for health tracking.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connection URL, with credentials inlined when present.
    pub fn server_url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}:{}",
                self.protocol,
                user,
                pass.expose_secret(),
                self.host,
                self.port
            ),
            _ => format!("{}://{}:{}", self.protocol, self.host, self.port),
        }
    }
}

/// Display is the host:port key only, never the credentials.
impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Health record for one proxy endpoint.
#[derive(Debug, Clone)]
pub struct ProxyHealth {
    pub endpoint: String,
    pub failures: u32,
    pub successes: u64,
    pub backoff_until: Option<DateTime<Utc>>,
}

impl ProxyHealth {
    fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            failures: 0,
            successes: 0,
            backoff_until: None,
        }
    }

    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        match self.backoff_until {
            Some(until) => now < until,
            None => false,
        }
    }
}

/// Pool-level stats snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProxyPoolStats {
    pub total: usize,
    pub healthy: usize,
    pub in_backoff: usize,
}

// ---------------------------------------------------------------------------
// Rotator
// ---------------------------------------------------------------------------

/// Round-robin proxy rotation with exponential-backoff health tracking.
pub struct ProxyRotator {
    endpoints: Vec<ProxyEndpoint>,
    health: HashMap<String, ProxyHealth>,
    backoff_schedule: Vec<i64>,
    index: usize,
}

impl ProxyRotator {
    /// `backoff_schedule` holds backoff seconds for consecutive failure
    /// counts 1, 2, 3, ...; the last entry applies to all higher counts.
    pub fn new(endpoints: Vec<ProxyEndpoint>, backoff_schedule: Vec<i64>) -> Self {
        let health = endpoints
            .iter()
            .map(|p| (p.key(), ProxyHealth::new(&p.key())))
            .collect();
        Self {
            endpoints,
            health,
            backoff_schedule,
            index: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Next endpoint not in backoff, round-robin. When every endpoint
    /// is in backoff, resets all backoffs (fail-open) and logs a
    /// warning instead of stalling.
    pub fn next_proxy(&mut self) -> Option<ProxyEndpoint> {
        if self.endpoints.is_empty() {
            return None;
        }

        let now = Utc::now();
        let mut available: Vec<&ProxyEndpoint> = self
            .endpoints
            .iter()
            .filter(|p| {
                self.health
                    .get(&p.key())
                    .map(|h| !h.in_backoff(now))
                    .unwrap_or(true)
            })
            .collect();

        if available.is_empty() {
            warn!("All proxies in backoff, resetting pool (fail-open)");
            for health in self.health.values_mut() {
                health.backoff_until = None;
                health.failures = 0;
            }
            available = self.endpoints.iter().collect();
        }

        let chosen = available[self.index % available.len()].clone();
        self.index = self.index.wrapping_add(1);
        debug!(proxy = %chosen, "Selected egress proxy");
        Some(chosen)
    }

    /// Record a success: failures decrement but are never zeroed
    /// outright, so a flaky endpoint earns trust back gradually.
    pub fn mark_success(&mut self, endpoint: &ProxyEndpoint) {
        if let Some(health) = self.health.get_mut(&endpoint.key()) {
            health.successes += 1;
            health.failures = health.failures.saturating_sub(1);
        }
    }

    /// Record a failure and schedule the backoff window.
    pub fn mark_failure(&mut self, endpoint: &ProxyEndpoint, reason: &str) {
        let Some(health) = self.health.get_mut(&endpoint.key()) else {
            return;
        };
        health.failures += 1;

        let step = (health.failures as usize - 1).min(self.backoff_schedule.len().saturating_sub(1));
        let backoff_secs = self.backoff_schedule.get(step).copied().unwrap_or(900);
        health.backoff_until = Some(Utc::now() + Duration::seconds(backoff_secs));

        warn!(
            proxy = %endpoint,
            failures = health.failures,
            backoff_secs,
            reason,
            "Proxy failed, backing off"
        );
    }

    /// Read-only view of one endpoint's health.
    pub fn health_of(&self, endpoint: &ProxyEndpoint) -> Option<&ProxyHealth> {
        self.health.get(&endpoint.key())
    }

    pub fn stats(&self) -> ProxyPoolStats {
        let now = Utc::now();
        let in_backoff = self
            .health
            .values()
            .filter(|h| h.in_backoff(now))
            .count();
        ProxyPoolStats {
            total: self.endpoints.len(),
            healthy: self.endpoints.len() - in_backoff,
            in_backoff,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
