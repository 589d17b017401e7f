//! Access capabilities.
//!
//! Defines the `FeedAdapter` trait — the narrow interface through which
//! the engine talks to the excluded extraction layer — and the variant
//! types that implement it. Variants are selected by a tag
//! (`AdapterKind`), not a class hierarchy; each counterparty gets one
//! adapter instance for the lifetime of its registration.
//!
//! The actual page/field extraction per counterparty lives behind this
//! trait and is out of scope here.

pub mod http;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::CounterpartyConfig;
use crate::credentials::CredentialSet;
use crate::proxy::ProxyEndpoint;
use crate::types::{FeedError, FetchOutcome};

/// Abstraction over counterparty access.
///
/// Implementors handle login, price retrieval, and teardown. All
/// session/credential/proxy policy stays outside; an adapter only
/// executes the access it is told to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedAdapter: Send + Sync {
    /// Attempt a login with the given credential set.
    /// `Ok(false)` means the counterparty rejected the credentials;
    /// `Err` means the attempt itself could not be carried out.
    async fn login(&self, credential: &CredentialSet) -> Result<bool>;

    /// Retrieve current prices. Never panics on counterparty errors —
    /// failures are reported inside the outcome.
    async fn fetch(&self) -> Result<FetchOutcome>;

    /// Probe for an active block, if the variant can.
    /// `None` = probing unsupported; resilience falls back to
    /// page-excerpt matching only.
    async fn detect_block(&self) -> Option<bool> {
        None
    }

    /// Tear down and re-establish transport through the given proxy.
    /// Called by the resilience layer after a ban teardown.
    async fn reroute(&self, proxy: Option<ProxyEndpoint>) -> Result<()>;

    /// Release all resources. Safe to call repeatedly.
    async fn close(&self);

    /// Counterparty name for logging and identification.
    fn name(&self) -> &str;
}

/// External challenge-solver capability.
///
/// When a counterparty interposes an interactive challenge mid-access,
/// the resilience layer escalates here. Without a configured solver the
/// access fails cleanly instead of retrying blindly.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    /// Returns `Ok(true)` if the challenge was cleared.
    async fn solve(&self, counterparty: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Variant selection
// ---------------------------------------------------------------------------

/// Tag selecting the access variant for a counterparty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    /// Plain HTTP endpoint access (JSON feed + form login).
    Http,
}

impl std::str::FromStr for AdapterKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(AdapterKind::Http),
            _ => Err(anyhow::anyhow!("Unknown adapter kind: {s}")),
        }
    }
}

/// Build the adapter variant a counterparty's config selects.
pub fn build_adapter(
    config: &CounterpartyConfig,
) -> Result<std::sync::Arc<dyn FeedAdapter>, FeedError> {
    let kind: AdapterKind = config.adapter.parse().map_err(|e| FeedError::Configuration {
        counterparty: config.name.clone(),
        message: format!("{e}"),
    })?;

    match kind {
        AdapterKind::Http => {
            let adapter =
                http::HttpFeedAdapter::from_config(config).map_err(|e| FeedError::Configuration {
                    counterparty: config.name.clone(),
                    message: format!("{e}"),
                })?;
            Ok(std::sync::Arc::new(adapter))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_kind_from_str() {
        assert_eq!("http".parse::<AdapterKind>().unwrap(), AdapterKind::Http);
        assert_eq!("HTTP".parse::<AdapterKind>().unwrap(), AdapterKind::Http);
        assert!("telepathy".parse::<AdapterKind>().is_err());
    }

    #[test]
    fn test_build_adapter_rejects_unknown_kind() {
        let config = CounterpartyConfig {
            name: "bookA".to_string(),
            adapter: "telepathy".to_string(),
            enabled: true,
            feed_url: Some("https://example.com/feed".to_string()),
            login_url: None,
            poll_interval_seconds: 6,
            min_delay_seconds: 0.0,
            max_delay_seconds: 0.0,
            credentials: vec![],
        };
        let err = build_adapter(&config).err().unwrap();
        assert!(matches!(err, FeedError::Configuration { .. }));
    }
}
