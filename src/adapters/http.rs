//! Generic HTTP access variant.
//!
//! Fetches a JSON price feed and performs a form login against the
//! URLs the counterparty config names. Applies the configured jitter
//! before every outbound call so the cadence never looks mechanical.
//! Proxy rerouting rebuilds the underlying client; the old connection
//! pool is dropped wholesale.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CounterpartyConfig;
use crate::credentials::CredentialSet;
use crate::proxy::ProxyEndpoint;
use crate::resilience::jittered_delay;
use crate::types::{FetchOutcome, PriceRecord};

use super::FeedAdapter;

/// How much of an error body is kept for block-signal matching.
const EXCERPT_LIMIT: usize = 512;

/// Price entry as the feed endpoint serves it.
#[derive(Debug, Deserialize)]
struct WirePrice {
    event_id: String,
    market: String,
    selection: String,
    price_decimal: f64,
}

pub struct HttpFeedAdapter {
    counterparty: String,
    feed_url: String,
    login_url: Option<String>,
    min_delay: f64,
    max_delay: f64,
    client: Mutex<reqwest::Client>,
}

impl HttpFeedAdapter {
    pub fn from_config(config: &CounterpartyConfig) -> Result<Self> {
        let feed_url = config
            .feed_url
            .clone()
            .context("http adapter requires feed_url")?;

        Ok(Self {
            counterparty: config.name.to_lowercase(),
            feed_url,
            login_url: config.login_url.clone(),
            min_delay: config.min_delay_seconds,
            max_delay: config.max_delay_seconds,
            client: Mutex::new(Self::build_client(None)?),
        })
    }

    fn build_client(proxy: Option<&ProxyEndpoint>) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(endpoint) = proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(endpoint.server_url())
                    .context("invalid proxy endpoint")?,
            );
        }
        builder.build().context("failed to build HTTP client")
    }

    fn client(&self) -> reqwest::Client {
        self.client.lock().expect("client lock poisoned").clone()
    }

    fn excerpt(body: &str) -> String {
        let lower = body.to_lowercase();
        lower.chars().take(EXCERPT_LIMIT).collect()
    }
}

#[async_trait]
impl FeedAdapter for HttpFeedAdapter {
    async fn login(&self, credential: &CredentialSet) -> Result<bool> {
        let Some(login_url) = &self.login_url else {
            // No login surface configured: sessionless feed.
            return Ok(true);
        };

        jittered_delay(self.min_delay, self.max_delay).await;

        let response = self
            .client()
            .post(login_url)
            .json(&serde_json::json!({
                "identifier": credential.identifier,
                "secret": credential.secret.expose_secret(),
            }))
            .send()
            .await
            .with_context(|| format!("login request to {login_url} failed"))?;

        let ok = response.status().is_success();
        if ok {
            info!(counterparty = %self.counterparty, identifier = %credential.identifier, "Login accepted");
        } else {
            warn!(
                counterparty = %self.counterparty,
                identifier = %credential.identifier,
                status = %response.status(),
                "Login rejected"
            );
        }
        Ok(ok)
    }

    async fn fetch(&self) -> Result<FetchOutcome> {
        jittered_delay(self.min_delay, self.max_delay).await;

        let response = self
            .client()
            .get(&self.feed_url)
            .send()
            .await
            .with_context(|| format!("feed request to {} failed", self.feed_url))?;

        let status = response.status();
        let body = response.text().await.context("failed to read feed body")?;

        if !status.is_success() {
            return Ok(
                FetchOutcome::failed(format!("feed returned {status}"))
                    .with_excerpt(Self::excerpt(&body)),
            );
        }

        let wire: Vec<WirePrice> = match serde_json::from_str(&body) {
            Ok(w) => w,
            Err(e) => {
                // Non-JSON bodies on a 200 are themselves suspicious;
                // hand the excerpt to the resilience layer.
                return Ok(FetchOutcome::failed(format!("unparseable feed body: {e}"))
                    .with_excerpt(Self::excerpt(&body)));
            }
        };

        let now = Utc::now();
        let prices = wire
            .into_iter()
            .map(|w| PriceRecord {
                event_id: w.event_id,
                market: w.market,
                selection: w.selection,
                counterparty: self.counterparty.clone(),
                price_decimal: w.price_decimal,
                captured_at: now,
            })
            .collect::<Vec<_>>();

        // A parsed feed is a clean response; no page state to carry.
        debug!(counterparty = %self.counterparty, count = prices.len(), "Feed fetched");
        Ok(FetchOutcome::ok(prices))
    }

    async fn reroute(&self, proxy: Option<ProxyEndpoint>) -> Result<()> {
        let fresh = Self::build_client(proxy.as_ref())?;
        *self.client.lock().expect("client lock poisoned") = fresh;
        info!(
            counterparty = %self.counterparty,
            proxy = proxy.map(|p| p.key()).unwrap_or_else(|| "direct".to_string()),
            "Transport rerouted"
        );
        Ok(())
    }

    async fn close(&self) {
        // Dropping the client tears down its connection pool; nothing
        // else is held.
        debug!(counterparty = %self.counterparty, "Adapter closed");
    }

    fn name(&self) -> &str {
        &self.counterparty
    }
}
