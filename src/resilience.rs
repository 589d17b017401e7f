//! Block detection and recovery around every access attempt.
//!
//! Counterparties signal that automation has been noticed in a handful
//! of observable ways: explicit block text, an interposed challenge, or
//! an anomalously short page. This layer classifies the last observed
//! page state before spending a network round trip, tears the transport
//! down and reroutes through the proxy pool when a block lands, and
//! escalates challenges to an external solver when one is configured.

use rand::Rng;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::adapters::{ChallengeSolver, FeedAdapter};
use crate::config::HeuristicsConfig;
use crate::credentials::CredentialPool;
use crate::proxy::{ProxyEndpoint, ProxyRotator};
use crate::session::SessionLifecycle;
use crate::types::{FeedError, FetchOutcome};

/// Sleep for a random duration between the bounds. Degenerate bounds
/// collapse to the minimum.
pub async fn jittered_delay(min_seconds: f64, max_seconds: f64) {
    let seconds = if max_seconds > min_seconds {
        rand::thread_rng().gen_range(min_seconds..max_seconds)
    } else {
        min_seconds
    };
    if seconds > 0.0 {
        tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await;
    }
}

/// Classification of an observed page state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageVerdict {
    Clean,
    /// Matched a block signal (or the page was suspiciously short).
    Blocked(String),
    /// Matched an interactive-challenge marker.
    Challenged(String),
}

pub struct BanResilience {
    counterparty: String,
    block_signals: Vec<String>,
    challenge_markers: Vec<String>,
    min_content_length: usize,
    ban_sleep_min: f64,
    ban_sleep_max: f64,
    rotator: Arc<Mutex<ProxyRotator>>,
    solver: Option<Arc<dyn ChallengeSolver>>,
    current_proxy: Option<ProxyEndpoint>,
    last_excerpt: Option<String>,
    ban_count: u64,
    challenge_count: u64,
}

impl BanResilience {
    pub fn new(
        counterparty: &str,
        heuristics: &HeuristicsConfig,
        rotator: Arc<Mutex<ProxyRotator>>,
        solver: Option<Arc<dyn ChallengeSolver>>,
    ) -> Self {
        Self {
            counterparty: counterparty.to_lowercase(),
            block_signals: heuristics.block_signals.clone(),
            challenge_markers: heuristics.challenge_markers.clone(),
            min_content_length: heuristics.min_page_content_length,
            ban_sleep_min: heuristics.ban_sleep_min_seconds,
            ban_sleep_max: heuristics.ban_sleep_max_seconds,
            rotator,
            solver,
            current_proxy: None,
            last_excerpt: None,
            ban_count: 0,
            challenge_count: 0,
        }
    }

    pub fn ban_count(&self) -> u64 {
        self.ban_count
    }

    pub fn challenge_count(&self) -> u64 {
        self.challenge_count
    }

    /// Classify a page excerpt against the configured signal sets.
    /// Challenge markers win over block text: a challenge is actionable
    /// via the solver, a block is not.
    pub fn classify(&self, excerpt: &str) -> PageVerdict {
        let lower = excerpt.to_lowercase();

        for marker in &self.challenge_markers {
            if lower.contains(marker) {
                return PageVerdict::Challenged(marker.clone());
            }
        }
        for signal in &self.block_signals {
            if lower.contains(signal) {
                return PageVerdict::Blocked(signal.clone());
            }
        }
        if lower.trim().len() < self.min_content_length {
            return PageVerdict::Blocked("short content".to_string());
        }
        PageVerdict::Clean
    }

    /// Login wrapped with the same pre-call block check as access.
    pub async fn guarded_ensure_active(
        &mut self,
        lifecycle: &mut SessionLifecycle,
        adapter: &dyn FeedAdapter,
        pool: &Mutex<CredentialPool>,
    ) -> Result<bool, FeedError> {
        self.precheck(adapter).await?;
        Ok(lifecycle.ensure_active(adapter, pool).await)
    }

    /// One access attempt with full resilience.
    pub async fn guarded_fetch(
        &mut self,
        adapter: &dyn FeedAdapter,
    ) -> Result<FetchOutcome, FeedError> {
        self.precheck(adapter).await?;

        let outcome = match adapter.fetch().await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Transport-level failure: blame the egress route, but
                // no teardown — the next tick retries.
                self.mark_proxy_failure("transport");
                return Ok(FetchOutcome::failed(e.to_string()));
            }
        };

        self.last_excerpt = outcome.page_excerpt.clone();

        if let Some(excerpt) = &outcome.page_excerpt {
            match self.classify(excerpt) {
                PageVerdict::Blocked(signal) => {
                    self.handle_block(adapter, &signal).await;
                    return Err(FeedError::BlockDetected {
                        counterparty: self.counterparty.clone(),
                        signal,
                    });
                }
                PageVerdict::Challenged(marker) => {
                    self.challenge_count += 1;
                    return self.escalate_challenge(adapter, &marker).await;
                }
                PageVerdict::Clean => {}
            }
        }

        if outcome.success {
            self.mark_proxy_success();
        } else {
            self.mark_proxy_failure("fetch failed");
        }
        Ok(outcome)
    }

    /// Pre-call short-circuit: when the last observed page state already
    /// matched a block or challenge signal, fail without spending a
    /// network round trip. The optional `detect_block` probe runs when
    /// the variant supports it.
    async fn precheck(&mut self, adapter: &dyn FeedAdapter) -> Result<(), FeedError> {
        if let Some(excerpt) = self.last_excerpt.clone() {
            match self.classify(&excerpt) {
                PageVerdict::Blocked(signal) => {
                    warn!(
                        counterparty = %self.counterparty,
                        signal = %signal,
                        "Short-circuiting on previously observed block state"
                    );
                    self.handle_block(adapter, &signal).await;
                    return Err(FeedError::BlockDetected {
                        counterparty: self.counterparty.clone(),
                        signal,
                    });
                }
                PageVerdict::Challenged(_) if self.solver.is_none() => {
                    return Err(FeedError::ChallengeUnsolvable {
                        counterparty: self.counterparty.clone(),
                    });
                }
                _ => {}
            }
        }

        if let Some(true) = adapter.detect_block().await {
            self.handle_block(adapter, "probe").await;
            return Err(FeedError::BlockDetected {
                counterparty: self.counterparty.clone(),
                signal: "probe".to_string(),
            });
        }

        Ok(())
    }

    /// Escalate a mid-access challenge to the external solver. Without
    /// one, fail cleanly instead of retrying blindly.
    async fn escalate_challenge(
        &mut self,
        adapter: &dyn FeedAdapter,
        marker: &str,
    ) -> Result<FetchOutcome, FeedError> {
        let Some(solver) = self.solver.clone() else {
            warn!(
                counterparty = %self.counterparty,
                marker,
                "Challenge detected but no solver configured"
            );
            return Err(FeedError::ChallengeUnsolvable {
                counterparty: self.counterparty.clone(),
            });
        };

        info!(counterparty = %self.counterparty, marker, "Escalating challenge to solver");
        match solver.solve(&self.counterparty).await {
            Ok(true) => {
                // Challenge cleared; one retry of the access.
                self.last_excerpt = None;
                match adapter.fetch().await {
                    Ok(outcome) => {
                        self.last_excerpt = outcome.page_excerpt.clone();
                        if outcome.success {
                            self.mark_proxy_success();
                        }
                        Ok(outcome)
                    }
                    Err(e) => {
                        self.mark_proxy_failure("transport");
                        Ok(FetchOutcome::failed(e.to_string()))
                    }
                }
            }
            Ok(false) | Err(_) => Err(FeedError::ChallengeUnsolvable {
                counterparty: self.counterparty.clone(),
            }),
        }
    }

    /// Full ban handling: blame the proxy, tear the session down, wait
    /// out a jittered window, and come back on a fresh route.
    async fn handle_block(&mut self, adapter: &dyn FeedAdapter, signal: &str) {
        self.ban_count += 1;
        warn!(
            counterparty = %self.counterparty,
            signal,
            ban_count = self.ban_count,
            "Handling block: tearing down and rerouting"
        );

        self.mark_proxy_failure("ban");
        adapter.close().await;

        jittered_delay(self.ban_sleep_min, self.ban_sleep_max).await;

        let next = {
            let mut rotator = self.rotator.lock().expect("proxy rotator lock poisoned");
            let stats = rotator.stats();
            if stats.total > 0 && stats.in_backoff == stats.total {
                // Resolved by the rotator's fail-open reset, not fatal.
                warn!(counterparty = %self.counterparty, "{}", FeedError::ProxiesExhausted);
            }
            rotator.next_proxy()
        };
        if let Err(e) = adapter.reroute(next.clone()).await {
            warn!(counterparty = %self.counterparty, error = %e, "Reroute failed");
        }
        self.current_proxy = next;
        // The old page state died with the session.
        self.last_excerpt = None;
    }

    fn mark_proxy_success(&mut self) {
        if let Some(proxy) = &self.current_proxy {
            let mut rotator = self.rotator.lock().expect("proxy rotator lock poisoned");
            rotator.mark_success(proxy);
        }
    }

    fn mark_proxy_failure(&mut self, reason: &str) {
        if let Some(proxy) = &self.current_proxy {
            let mut rotator = self.rotator.lock().expect("proxy rotator lock poisoned");
            rotator.mark_failure(proxy, reason);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
