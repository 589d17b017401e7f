//! Multi-account credential pool.
//!
//! Counterparties that only allow one login at a time force rotation
//! through several credential sets. The pool tracks per-credential
//! health, applies cooldowns after forced logouts, and quarantines
//! credentials after repeated failures.
//!
//! Health records are owned value types: every transition is an
//! explicit method returning the new state, and the pool swaps the
//! stored record. Records are created at registration and never
//! deleted, only quarantined and un-quarantined.

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use std::collections::HashMap;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Credential set
// ---------------------------------------------------------------------------

/// One credential set. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct CredentialSet {
    pub counterparty: String,
    pub identifier: String,
    pub secret: SecretString,
}

impl CredentialSet {
    pub fn new(counterparty: &str, identifier: &str, secret: &str) -> Self {
        Self {
            counterparty: counterparty.to_lowercase(),
            identifier: identifier.to_string(),
            secret: SecretString::new(secret.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Credential health
// ---------------------------------------------------------------------------

/// Health tracking for a single credential set.
///
/// Invariant: `is_available ⇔ !is_banned ∧ now ≥ cooldown_until`.
#[derive(Debug, Clone)]
pub struct CredentialHealth {
    pub identifier: String,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_logout_at: Option<DateTime<Utc>>,
    pub login_failures: u32,
    pub logout_count: u32,
    pub is_banned: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl CredentialHealth {
    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            last_login_at: None,
            last_logout_at: None,
            login_failures: 0,
            logout_count: 0,
            is_banned: false,
            cooldown_until: None,
        }
    }

    /// Whether the credential is inside a cooldown window at `now`.
    pub fn on_cooldown(&self, now: DateTime<Utc>) -> bool {
        match self.cooldown_until {
            Some(until) => now < until,
            None => false,
        }
    }

    /// Whether the credential may be selected at `now`.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        !self.is_banned && !self.on_cooldown(now)
    }

    /// Successful login: stamp the time, reset the failure counter.
    pub fn after_login_success(&self, now: DateTime<Utc>) -> Self {
        Self {
            last_login_at: Some(now),
            login_failures: 0,
            ..self.clone()
        }
    }

    /// Failed login: bump the counter, quarantine at the threshold.
    pub fn after_login_failure(&self, quarantine_threshold: u32) -> Self {
        let failures = self.login_failures + 1;
        Self {
            login_failures: failures,
            is_banned: self.is_banned || failures >= quarantine_threshold,
            ..self.clone()
        }
    }

    /// Forced logout by the counterparty: start a cooldown window.
    pub fn after_forced_logout(&self, now: DateTime<Utc>, cooldown: Duration) -> Self {
        Self {
            last_logout_at: Some(now),
            logout_count: self.logout_count + 1,
            cooldown_until: Some(now + cooldown),
            ..self.clone()
        }
    }

    /// Permanent quarantine.
    pub fn banned(&self) -> Self {
        Self {
            is_banned: true,
            ..self.clone()
        }
    }

    /// Operator clearing: lift the quarantine, zero the failures.
    pub fn unbanned(&self) -> Self {
        Self {
            is_banned: false,
            login_failures: 0,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

struct PoolEntry {
    sets: Vec<CredentialSet>,
    active_index: usize,
}

/// Per-credential stats snapshot for the ops layer.
#[derive(Debug, Clone)]
pub struct CredentialStat {
    pub identifier: String,
    pub is_available: bool,
    pub is_banned: bool,
    pub on_cooldown: bool,
    pub login_failures: u32,
    pub logout_count: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Pool-level stats snapshot.
#[derive(Debug, Clone)]
pub struct CredentialPoolStats {
    pub counterparty: String,
    pub total: usize,
    pub active_index: usize,
    pub active_identifier: Option<String>,
    pub available_count: usize,
    pub credentials: Vec<CredentialStat>,
}

/// Owns credential sets per counterparty and their health records.
///
/// Shared across polling loops behind a lock owned by the engine.
/// State is partitioned by counterparty key: the engine guarantees a
/// single writer per key.
pub struct CredentialPool {
    entries: HashMap<String, PoolEntry>,
    health: HashMap<(String, String), CredentialHealth>,
    cooldown: Duration,
    quarantine_threshold: u32,
}

impl CredentialPool {
    pub fn new(cooldown_minutes: i64, quarantine_threshold: u32) -> Self {
        Self {
            entries: HashMap::new(),
            health: HashMap::new(),
            cooldown: Duration::minutes(cooldown_minutes),
            quarantine_threshold,
        }
    }

    /// Register (or replace) the credential sets for a counterparty.
    /// Health records for already-known identifiers are preserved.
    pub fn register(&mut self, counterparty: &str, sets: Vec<CredentialSet>) {
        let counterparty = counterparty.to_lowercase();
        for set in &sets {
            let key = (counterparty.clone(), set.identifier.clone());
            self.health
                .entry(key)
                .or_insert_with(|| CredentialHealth::new(&set.identifier));
        }
        let count = sets.len();
        self.entries.insert(
            counterparty.clone(),
            PoolEntry {
                sets,
                active_index: 0,
            },
        );
        info!(counterparty = %counterparty, count, "Registered credential sets");
    }

    /// The currently pointed-to set if available, else the next
    /// available one via rotation. `None` when the pool is exhausted.
    pub fn get_active(&mut self, counterparty: &str) -> Option<CredentialSet> {
        let counterparty = counterparty.to_lowercase();
        let now = Utc::now();

        let current = {
            let entry = self.entries.get(&counterparty)?;
            entry.sets.get(entry.active_index)?.clone()
        };

        let available = self
            .health_of(&counterparty, &current.identifier)
            .map(|h| h.is_available(now))
            .unwrap_or(false);

        if available {
            Some(current)
        } else {
            self.rotate_to_next(&counterparty)
        }
    }

    /// Round-robin scan starting after the current pointer; returns the
    /// first available set and advances the pointer. `None` when no set
    /// qualifies (pool exhausted — reported, not fatal).
    pub fn rotate_to_next(&mut self, counterparty: &str) -> Option<CredentialSet> {
        let counterparty = counterparty.to_lowercase();
        let now = Utc::now();

        let (num, start) = {
            let entry = self.entries.get(&counterparty)?;
            if entry.sets.is_empty() {
                return None;
            }
            (entry.sets.len(), entry.active_index)
        };

        for i in 0..num {
            let next_index = (start + i + 1) % num;
            let candidate = self.entries.get(&counterparty)?.sets[next_index].clone();
            let available = self
                .health_of(&counterparty, &candidate.identifier)
                .map(|h| h.is_available(now))
                .unwrap_or(false);

            if available {
                if let Some(entry) = self.entries.get_mut(&counterparty) {
                    entry.active_index = next_index;
                }
                info!(
                    counterparty = %counterparty,
                    identifier = %candidate.identifier,
                    "Rotated to credential"
                );
                return Some(candidate);
            }
        }

        warn!(counterparty = %counterparty, "No available credentials after rotation");
        None
    }

    pub fn mark_login_success(&mut self, counterparty: &str, identifier: &str) {
        let now = Utc::now();
        self.update_health(counterparty, identifier, |h| h.after_login_success(now));
        debug!(counterparty = %counterparty.to_lowercase(), identifier, "Login success");
    }

    pub fn mark_login_failure(&mut self, counterparty: &str, identifier: &str) {
        let threshold = self.quarantine_threshold;
        let updated = self.update_health(counterparty, identifier, |h| {
            h.after_login_failure(threshold)
        });
        if let Some(h) = updated {
            if h.is_banned {
                warn!(
                    counterparty = %counterparty.to_lowercase(),
                    identifier,
                    failures = h.login_failures,
                    "Credential quarantined after repeated failures"
                );
            }
        }
    }

    pub fn mark_forced_logout(&mut self, counterparty: &str, identifier: &str) {
        let now = Utc::now();
        let cooldown = self.cooldown;
        let updated = self.update_health(counterparty, identifier, |h| {
            h.after_forced_logout(now, cooldown)
        });
        if let Some(h) = updated {
            info!(
                counterparty = %counterparty.to_lowercase(),
                identifier,
                cooldown_until = ?h.cooldown_until,
                "Credential on cooldown after forced logout"
            );
        }
    }

    pub fn mark_banned(&mut self, counterparty: &str, identifier: &str) {
        self.update_health(counterparty, identifier, |h| h.banned());
        warn!(counterparty = %counterparty.to_lowercase(), identifier, "Credential marked as BANNED");
    }

    pub fn unban(&mut self, counterparty: &str, identifier: &str) {
        self.update_health(counterparty, identifier, |h| h.unbanned());
        info!(counterparty = %counterparty.to_lowercase(), identifier, "Credential unbanned");
    }

    /// Read-only view of one credential's health.
    pub fn health_of(&self, counterparty: &str, identifier: &str) -> Option<&CredentialHealth> {
        self.health
            .get(&(counterparty.to_lowercase(), identifier.to_string()))
    }

    /// Stats snapshot for a counterparty's pool.
    pub fn stats(&self, counterparty: &str) -> Option<CredentialPoolStats> {
        let counterparty = counterparty.to_lowercase();
        let now = Utc::now();
        let entry = self.entries.get(&counterparty)?;

        let credentials: Vec<CredentialStat> = entry
            .sets
            .iter()
            .filter_map(|set| self.health_of(&counterparty, &set.identifier))
            .map(|h| CredentialStat {
                identifier: h.identifier.clone(),
                is_available: h.is_available(now),
                is_banned: h.is_banned,
                on_cooldown: h.on_cooldown(now),
                login_failures: h.login_failures,
                logout_count: h.logout_count,
                cooldown_until: h.cooldown_until,
            })
            .collect();

        let available_count = credentials.iter().filter(|c| c.is_available).count();
        Some(CredentialPoolStats {
            counterparty: counterparty.clone(),
            total: entry.sets.len(),
            active_index: entry.active_index,
            active_identifier: entry
                .sets
                .get(entry.active_index)
                .map(|s| s.identifier.clone()),
            available_count,
            credentials,
        })
    }

    fn update_health<F>(
        &mut self,
        counterparty: &str,
        identifier: &str,
        transition: F,
    ) -> Option<CredentialHealth>
    where
        F: FnOnce(&CredentialHealth) -> CredentialHealth,
    {
        let key = (counterparty.to_lowercase(), identifier.to_string());
        let slot = self
            .health
            .entry(key)
            .or_insert_with(|| CredentialHealth::new(identifier));
        let next = transition(slot);
        *slot = next.clone();
        Some(next)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
