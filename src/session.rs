//! Per-counterparty session lifecycle.
//!
//! A small state machine (`UNINITIALIZED → LOGGING_IN → ACTIVE /
//! INVALID → RATE_LIMITED / EXHAUSTED`) that coordinates login attempts
//! against an injected access capability. No I/O happens here directly:
//! credential selection is delegated to the shared `CredentialPool` and
//! the login itself to the `FeedAdapter`.
//!
//! Each instance exclusively owns its `SessionStatus`; other components
//! only ever see cloned snapshots.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::adapters::FeedAdapter;
use crate::config::HeuristicsConfig;
use crate::credentials::CredentialPool;
use crate::types::{FeedError, SessionState, SessionStatus};

pub struct SessionLifecycle {
    status: SessionStatus,
    last_attempt_at: Option<DateTime<Utc>>,
    active_identifier: Option<String>,
    max_login_failures: u32,
    min_login_interval: Duration,
    forced_logout_indicators: Vec<String>,
}

impl SessionLifecycle {
    pub fn new(counterparty: &str, heuristics: &HeuristicsConfig) -> Self {
        Self {
            status: SessionStatus::new(&counterparty.to_lowercase()),
            last_attempt_at: None,
            active_identifier: None,
            max_login_failures: heuristics.max_login_failures,
            min_login_interval: Duration::seconds(heuristics.min_login_interval_seconds),
            forced_logout_indicators: heuristics.forced_logout_indicators.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.status.state
    }

    /// Read-only snapshot of the last-known status.
    pub fn status(&self) -> SessionStatus {
        self.status.clone()
    }

    /// Identifier of the credential the current session was built with.
    pub fn active_identifier(&self) -> Option<&str> {
        self.active_identifier.as_deref()
    }

    /// Ensure the session is active, attempting a login if needed.
    ///
    /// Idempotent and safe to call before every access: an already
    /// active session returns `true` without touching the network.
    pub async fn ensure_active(
        &mut self,
        adapter: &dyn FeedAdapter,
        pool: &Mutex<CredentialPool>,
    ) -> bool {
        let counterparty = self.status.counterparty.clone();

        if self.status.state == SessionState::Active && self.status.session_valid {
            debug!(counterparty = %counterparty, "Session already active");
            return true;
        }

        if self.status.state == SessionState::Exhausted {
            debug!(counterparty = %counterparty, "Session exhausted; awaiting operator clearing");
            return false;
        }

        // Rate limiting: a relogin is only allowed once the minimum
        // interval has elapsed since the previous attempt.
        let now = Utc::now();
        if let Some(last) = self.last_attempt_at {
            if now - last < self.min_login_interval {
                self.status.state = SessionState::RateLimited;
                warn!(counterparty = %counterparty, "Login rate limited");
                return false;
            }
        }

        // Credential selection via the shared pool. The lock is held
        // only for the selection itself, never across an await.
        let credential = {
            let mut pool = pool.lock().expect("credential pool lock poisoned");
            pool.get_active(&counterparty)
        };

        let Some(credential) = credential else {
            // Pool exhausted: reported, not fatal. The caller waits for
            // a cooldown to lapse or an operator unban.
            let e = FeedError::CredentialsExhausted {
                counterparty: counterparty.clone(),
            };
            self.status.error = Some(e.to_string());
            warn!(counterparty = %counterparty, "Credential pool exhausted");
            return false;
        };

        self.status.state = SessionState::LoggingIn;
        self.last_attempt_at = Some(now);
        info!(
            counterparty = %counterparty,
            identifier = %credential.identifier,
            "Attempting login"
        );

        let outcome = match adapter.login(&credential).await {
            Ok(true) => Ok(()),
            Ok(false) => Err("login rejected".to_string()),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(()) => {
                self.status.state = SessionState::Active;
                self.status.logged_in = true;
                self.status.session_valid = true;
                self.status.last_login_at = Some(Utc::now());
                self.status.login_failures = 0;
                self.status.error = None;
                self.active_identifier = Some(credential.identifier.clone());

                let mut pool = pool.lock().expect("credential pool lock poisoned");
                pool.mark_login_success(&counterparty, &credential.identifier);
                info!(counterparty = %counterparty, "Login successful");
                true
            }
            Err(message) => {
                self.status.login_failures += 1;
                self.status.error = Some(message.clone());

                {
                    let mut pool = pool.lock().expect("credential pool lock poisoned");
                    pool.mark_login_failure(&counterparty, &credential.identifier);
                }

                if self.status.login_failures >= self.max_login_failures {
                    self.status.state = SessionState::Exhausted;
                    error!(
                        counterparty = %counterparty,
                        failures = self.status.login_failures,
                        "Session exhausted after repeated login failures"
                    );
                } else {
                    self.status.state = SessionState::Invalid;
                    warn!(
                        counterparty = %counterparty,
                        failures = self.status.login_failures,
                        error = %message,
                        "Login failed"
                    );
                }
                false
            }
        }
    }

    /// A later access reported session expiry: invalidate, and when the
    /// error text reads like a forced logout, put the credential that
    /// built the session on cooldown rather than blaming it.
    pub fn mark_session_expired(&mut self, pool: &Mutex<CredentialPool>, reason: &str) {
        if self.status.state == SessionState::Exhausted {
            return;
        }

        self.status.session_valid = false;
        self.status.logged_in = false;
        self.status.state = SessionState::Invalid;
        self.status.error = Some(reason.to_string());

        if self.is_forced_logout(reason) {
            if let Some(identifier) = self.active_identifier.clone() {
                let mut pool = pool.lock().expect("credential pool lock poisoned");
                pool.mark_forced_logout(&self.status.counterparty, &identifier);
            }
        }

        info!(
            counterparty = %self.status.counterparty,
            reason,
            "Session invalidated"
        );
    }

    /// Whether an error message indicates a forced logout by the
    /// counterparty rather than bad credentials.
    pub fn is_forced_logout(&self, error: &str) -> bool {
        let lower = error.to_lowercase();
        self.forced_logout_indicators
            .iter()
            .any(|ind| lower.contains(ind))
    }

    /// Stamp activity on the session (successful access).
    pub fn record_activity(&mut self) {
        self.status.last_activity_at = Some(Utc::now());
    }

    /// Operator clearing of the terminal EXHAUSTED state.
    pub fn clear_exhausted(&mut self) {
        if self.status.state == SessionState::Exhausted {
            self.status.state = SessionState::Invalid;
            self.status.login_failures = 0;
            self.status.error = None;
            info!(counterparty = %self.status.counterparty, "Exhausted state cleared by operator");
        }
    }

    /// Reset on stop/restart. The status record survives (same
    /// instance), only its session fields return to their initial
    /// values; the last-attempt stamp is kept so a restart cannot be
    /// used to sidestep rate limiting.
    pub fn reset(&mut self) {
        let counterparty = self.status.counterparty.clone();
        self.status = SessionStatus::new(&counterparty);
        self.active_identifier = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockFeedAdapter;
    use crate::credentials::CredentialSet;

    fn heuristics() -> HeuristicsConfig {
        HeuristicsConfig::default()
    }

    /// Heuristics with rate limiting disabled, for multi-attempt tests.
    fn fast_heuristics() -> HeuristicsConfig {
        HeuristicsConfig {
            min_login_interval_seconds: 0,
            ..HeuristicsConfig::default()
        }
    }

    fn pool_with(counterparty: &str, ids: &[&str]) -> Mutex<CredentialPool> {
        let mut pool = CredentialPool::new(15, 3);
        let sets = ids
            .iter()
            .map(|id| CredentialSet::new(counterparty, id, "pw"))
            .collect();
        pool.register(counterparty, sets);
        Mutex::new(pool)
    }

    #[tokio::test]
    async fn test_first_login_success() {
        let mut adapter = MockFeedAdapter::new();
        adapter.expect_login().times(1).returning(|_| Ok(true));

        let pool = pool_with("bookA", &["user1"]);
        let mut lifecycle = SessionLifecycle::new("bookA", &heuristics());
        assert_eq!(lifecycle.state(), SessionState::Uninitialized);

        assert!(lifecycle.ensure_active(&adapter, &pool).await);
        assert_eq!(lifecycle.state(), SessionState::Active);
        assert_eq!(lifecycle.active_identifier(), Some("user1"));

        let status = lifecycle.status();
        assert!(status.logged_in);
        assert!(status.session_valid);
        assert_eq!(status.login_failures, 0);
        assert!(status.error.is_none());

        // Pool was notified of the success
        let pool = pool.lock().unwrap();
        assert!(pool.health_of("bookA", "user1").unwrap().last_login_at.is_some());
    }

    #[tokio::test]
    async fn test_ensure_active_idempotent_when_active() {
        let mut adapter = MockFeedAdapter::new();
        adapter.expect_login().times(1).returning(|_| Ok(true));

        let pool = pool_with("bookA", &["user1"]);
        let mut lifecycle = SessionLifecycle::new("bookA", &heuristics());

        assert!(lifecycle.ensure_active(&adapter, &pool).await);
        // Second call must not trigger another login (times(1) above).
        assert!(lifecycle.ensure_active(&adapter, &pool).await);
    }

    #[tokio::test]
    async fn test_failure_increments_both_counters() {
        let mut adapter = MockFeedAdapter::new();
        adapter.expect_login().times(1).returning(|_| Ok(false));

        let pool = pool_with("bookA", &["user1"]);
        let mut lifecycle = SessionLifecycle::new("bookA", &heuristics());

        assert!(!lifecycle.ensure_active(&adapter, &pool).await);
        assert_eq!(lifecycle.state(), SessionState::Invalid);
        assert_eq!(lifecycle.status().login_failures, 1);

        let pool = pool.lock().unwrap();
        assert_eq!(pool.health_of("bookA", "user1").unwrap().login_failures, 1);
    }

    #[tokio::test]
    async fn test_rate_limited_after_failed_attempt() {
        let mut adapter = MockFeedAdapter::new();
        adapter.expect_login().times(1).returning(|_| Ok(false));

        let pool = pool_with("bookA", &["user1"]);
        // Default 60s interval: the immediate retry must be refused.
        let mut lifecycle = SessionLifecycle::new("bookA", &heuristics());

        assert!(!lifecycle.ensure_active(&adapter, &pool).await);
        assert!(!lifecycle.ensure_active(&adapter, &pool).await);
        assert_eq!(lifecycle.state(), SessionState::RateLimited);
    }

    #[tokio::test]
    async fn test_exhausted_after_max_failures() {
        let mut adapter = MockFeedAdapter::new();
        adapter.expect_login().times(5).returning(|_| Ok(false));

        // Pool quarantine threshold high enough that the session
        // exhausts before the credential does.
        let mut pool = CredentialPool::new(15, 100);
        pool.register("bookA", vec![CredentialSet::new("bookA", "user1", "pw")]);
        let pool = Mutex::new(pool);

        let mut lifecycle = SessionLifecycle::new("bookA", &fast_heuristics());
        for _ in 0..5 {
            assert!(!lifecycle.ensure_active(&adapter, &pool).await);
        }
        assert_eq!(lifecycle.state(), SessionState::Exhausted);

        // Terminal: no further login attempts (times(5) above).
        assert!(!lifecycle.ensure_active(&adapter, &pool).await);
    }

    #[tokio::test]
    async fn test_clear_exhausted_allows_relogin() {
        let mut adapter = MockFeedAdapter::new();
        adapter.expect_login().times(6).returning(|_| Ok(false));

        let mut pool = CredentialPool::new(15, 100);
        pool.register("bookA", vec![CredentialSet::new("bookA", "user1", "pw")]);
        let pool = Mutex::new(pool);

        let mut lifecycle = SessionLifecycle::new("bookA", &fast_heuristics());
        for _ in 0..5 {
            lifecycle.ensure_active(&adapter, &pool).await;
        }
        assert_eq!(lifecycle.state(), SessionState::Exhausted);

        lifecycle.clear_exhausted();
        assert_eq!(lifecycle.state(), SessionState::Invalid);
        assert_eq!(lifecycle.status().login_failures, 0);

        // Sixth attempt runs again after clearing.
        assert!(!lifecycle.ensure_active(&adapter, &pool).await);
    }

    #[tokio::test]
    async fn test_credentials_exhausted_reported_not_fatal() {
        let adapter = MockFeedAdapter::new(); // login must never be called

        let pool = pool_with("bookA", &["user1"]);
        pool.lock().unwrap().mark_banned("bookA", "user1");

        let mut lifecycle = SessionLifecycle::new("bookA", &heuristics());
        assert!(!lifecycle.ensure_active(&adapter, &pool).await);
        let error = lifecycle.status().error.unwrap();
        assert!(error.contains("No usable credential"), "got: {error}");
        // Not exhausted — the pool may recover.
        assert_ne!(lifecycle.state(), SessionState::Exhausted);
    }

    #[tokio::test]
    async fn test_session_expiry_triggers_relogin_path() {
        let mut adapter = MockFeedAdapter::new();
        adapter.expect_login().times(2).returning(|_| Ok(true));

        let pool = pool_with("bookA", &["user1"]);
        let mut lifecycle = SessionLifecycle::new("bookA", &fast_heuristics());

        assert!(lifecycle.ensure_active(&adapter, &pool).await);
        lifecycle.mark_session_expired(&pool, "connection reset");
        assert_eq!(lifecycle.state(), SessionState::Invalid);
        assert!(!lifecycle.status().session_valid);

        // Next ensure_active attempts the relogin.
        assert!(lifecycle.ensure_active(&adapter, &pool).await);
        assert_eq!(lifecycle.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_forced_logout_puts_credential_on_cooldown() {
        let mut adapter = MockFeedAdapter::new();
        adapter.expect_login().times(1).returning(|_| Ok(true));

        let pool = pool_with("bookA", &["user1"]);
        let mut lifecycle = SessionLifecycle::new("bookA", &heuristics());
        assert!(lifecycle.ensure_active(&adapter, &pool).await);

        lifecycle.mark_session_expired(&pool, "You have been logged out");

        let pool = pool.lock().unwrap();
        let health = pool.health_of("bookA", "user1").unwrap();
        assert!(health.on_cooldown(Utc::now()));
        assert_eq!(health.logout_count, 1);
    }

    #[test]
    fn test_forced_logout_classification() {
        let lifecycle = SessionLifecycle::new("bookA", &heuristics());
        assert!(lifecycle.is_forced_logout("Session expired"));
        assert!(lifecycle.is_forced_logout("Another session is active"));
        assert!(lifecycle.is_forced_logout("please log in again"));
        assert!(!lifecycle.is_forced_logout("Invalid credentials"));
    }

    #[tokio::test]
    async fn test_rotation_after_quarantine_selects_other_credential() {
        // Credential A has been quarantined after 3 pool-level
        // failures; only B's login is attempted.
        let mut adapter = MockFeedAdapter::new();
        adapter
            .expect_login()
            .withf(|cred| cred.identifier == "userB")
            .times(1)
            .returning(|_| Ok(true));

        let pool = pool_with("bookA", &["userA", "userB"]);
        {
            let mut pool = pool.lock().unwrap();
            for _ in 0..3 {
                pool.mark_login_failure("bookA", "userA");
            }
        }

        let mut lifecycle = SessionLifecycle::new("bookA", &heuristics());
        assert!(lifecycle.ensure_active(&adapter, &pool).await);
        assert_eq!(lifecycle.active_identifier(), Some("userB"));
    }

    #[tokio::test]
    async fn test_reset_preserves_rate_limit_stamp() {
        let mut adapter = MockFeedAdapter::new();
        adapter.expect_login().times(1).returning(|_| Ok(false));

        let pool = pool_with("bookA", &["user1"]);
        let mut lifecycle = SessionLifecycle::new("bookA", &heuristics());
        lifecycle.ensure_active(&adapter, &pool).await;

        lifecycle.reset();
        assert_eq!(lifecycle.state(), SessionState::Uninitialized);
        assert!(lifecycle.active_identifier().is_none());

        // Rate limiting still applies after the reset.
        assert!(!lifecycle.ensure_active(&adapter, &pool).await);
        assert_eq!(lifecycle.state(), SessionState::RateLimited);
    }
}
