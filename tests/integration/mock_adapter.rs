//! Scripted adapter for integration testing.
//!
//! Provides a deterministic `FeedAdapter` implementation that returns
//! scripted fetch outcomes, rejects configured credentials, and records
//! every interaction — all in-memory with no external dependencies.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use steamfeed::adapters::FeedAdapter;
use steamfeed::credentials::CredentialSet;
use steamfeed::proxy::ProxyEndpoint;
use steamfeed::types::{FetchOutcome, PriceRecord};

/// Build a price record for a scripted feed.
pub fn price(counterparty: &str, event: &str, selection: &str, price: f64) -> PriceRecord {
    PriceRecord {
        event_id: event.to_string(),
        market: "moneyline".to_string(),
        selection: selection.to_string(),
        counterparty: counterparty.to_lowercase(),
        price_decimal: price,
        captured_at: Utc::now(),
    }
}

/// A deterministic adapter scripted from test code.
///
/// Fetch outcomes are consumed from a queue; once the queue drains the
/// last outcome repeats, so a polling loop can keep ticking.
pub struct ScriptedAdapter {
    name: String,
    rejected_identifiers: Mutex<HashSet<String>>,
    fetch_script: Mutex<VecDeque<FetchOutcome>>,
    last_outcome: Mutex<FetchOutcome>,
    pub login_attempts: Mutex<Vec<String>>,
    pub close_count: Mutex<u32>,
    pub reroutes: Mutex<Vec<Option<String>>>,
}

impl ScriptedAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            rejected_identifiers: Mutex::new(HashSet::new()),
            fetch_script: Mutex::new(VecDeque::new()),
            last_outcome: Mutex::new(FetchOutcome::ok(Vec::new())),
            login_attempts: Mutex::new(Vec::new()),
            close_count: Mutex::new(0),
            reroutes: Mutex::new(Vec::new()),
        }
    }

    /// Logins with this identifier are rejected.
    pub fn reject_identifier(&self, identifier: &str) {
        self.rejected_identifiers
            .lock()
            .unwrap()
            .insert(identifier.to_string());
    }

    /// Queue a fetch outcome.
    pub fn push_outcome(&self, outcome: FetchOutcome) {
        self.fetch_script.lock().unwrap().push_back(outcome);
    }

    /// Queue a successful fetch with the given prices.
    pub fn push_prices(&self, prices: Vec<PriceRecord>) {
        self.push_outcome(FetchOutcome::ok(prices));
    }

    pub fn login_attempts(&self) -> Vec<String> {
        self.login_attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedAdapter for ScriptedAdapter {
    async fn login(&self, credential: &CredentialSet) -> Result<bool> {
        self.login_attempts
            .lock()
            .unwrap()
            .push(credential.identifier.clone());
        let rejected = self
            .rejected_identifiers
            .lock()
            .unwrap()
            .contains(&credential.identifier);
        Ok(!rejected)
    }

    async fn fetch(&self) -> Result<FetchOutcome> {
        let next = self.fetch_script.lock().unwrap().pop_front();
        match next {
            Some(outcome) => {
                *self.last_outcome.lock().unwrap() = outcome.clone();
                Ok(outcome)
            }
            None => Ok(self.last_outcome.lock().unwrap().clone()),
        }
    }

    async fn reroute(&self, proxy: Option<ProxyEndpoint>) -> Result<()> {
        self.reroutes
            .lock()
            .unwrap()
            .push(proxy.map(|p| p.key()));
        Ok(())
    }

    async fn close(&self) {
        *self.close_count.lock().unwrap() += 1;
    }

    fn name(&self) -> &str {
        &self.name
    }
}
