//! Feed engine — the explicitly constructed object graph.
//!
//! Owns the shared credential pool, proxy rotator, and alert
//! prioritizer, plus one runtime (adapter, lifecycle, resilience,
//! poller, task) per registered counterparty. This replaces the
//! module-level singletons of a typical scraper deployment: everything
//! is constructed here and passed down, with a single writer per
//! counterparty key.
//!
//! Failures are partitioned by counterparty: a configuration error,
//! pool exhaustion, or ban on one counterparty never affects another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapters::{build_adapter, ChallengeSolver, FeedAdapter};
use crate::alerts::{AlertPrioritizer, OpportunityDetection, PrioritizerStats, RankedAlert};
use crate::config::{AppConfig, CounterpartyConfig, HeuristicsConfig};
use crate::credentials::{CredentialPool, CredentialPoolStats, CredentialSet};
use crate::movement::MovementEvent;
use crate::poller::{run_loop, FeedObserver, LivePoller, PollerStats};
use crate::proxy::{ProxyEndpoint, ProxyPoolStats, ProxyRotator};
use crate::resilience::BanResilience;
use crate::session::SessionLifecycle;
use crate::types::{FeedError, PriceRecord, SessionStatus};

// ---------------------------------------------------------------------------
// Internal observer wiring
// ---------------------------------------------------------------------------

/// Forwards detected movements into the shared prioritizer so later
/// opportunity detections can be associated with them.
struct MovementForwarder {
    prioritizer: Arc<Mutex<AlertPrioritizer>>,
}

impl FeedObserver for MovementForwarder {
    fn on_prices(&self, _counterparty: &str, _prices: &[PriceRecord]) {}

    fn on_movement(&self, movement: &MovementEvent) {
        let mut prioritizer = self.prioritizer.lock().expect("prioritizer lock poisoned");
        prioritizer.add_movement(movement.clone());
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

struct CounterpartyRuntime {
    config: CounterpartyConfig,
    adapter: Arc<dyn FeedAdapter>,
    lifecycle: Arc<tokio::sync::Mutex<SessionLifecycle>>,
    resilience: Arc<tokio::sync::Mutex<BanResilience>>,
    poller: Arc<tokio::sync::Mutex<LivePoller>>,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

/// Per-counterparty stats rollup.
#[derive(Debug, Clone)]
pub struct CounterpartyStats {
    pub counterparty: String,
    pub session: SessionStatus,
    pub poller: PollerStats,
    pub credentials: Option<CredentialPoolStats>,
}

/// Engine-wide stats rollup.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub counterparties: Vec<CounterpartyStats>,
    pub proxies: ProxyPoolStats,
    pub alerts: PrioritizerStats,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct FeedEngine {
    heuristics: HeuristicsConfig,
    credential_pool: Arc<Mutex<CredentialPool>>,
    proxy_rotator: Arc<Mutex<ProxyRotator>>,
    prioritizer: Arc<Mutex<AlertPrioritizer>>,
    solver: Option<Arc<dyn ChallengeSolver>>,
    observers: Vec<Arc<dyn FeedObserver>>,
    runtimes: HashMap<String, CounterpartyRuntime>,
}

impl FeedEngine {
    pub fn new(
        heuristics: HeuristicsConfig,
        proxies: Vec<ProxyEndpoint>,
        solver: Option<Arc<dyn ChallengeSolver>>,
    ) -> Self {
        let credential_pool = Arc::new(Mutex::new(CredentialPool::new(
            heuristics.cooldown_minutes,
            heuristics.quarantine_threshold,
        )));
        let proxy_rotator = Arc::new(Mutex::new(ProxyRotator::new(
            proxies,
            heuristics.proxy_backoff_seconds.clone(),
        )));
        Self {
            heuristics,
            credential_pool,
            proxy_rotator,
            prioritizer: Arc::new(Mutex::new(AlertPrioritizer::new())),
            solver,
            observers: Vec::new(),
            runtimes: HashMap::new(),
        }
    }

    /// Build an engine from loaded configuration, resolving proxy
    /// secrets from the environment.
    pub fn from_config(
        config: &AppConfig,
        solver: Option<Arc<dyn ChallengeSolver>>,
    ) -> anyhow::Result<Self> {
        let mut proxies = Vec::with_capacity(config.proxy.len());
        for entry in &config.proxy {
            let password = match &entry.password_env {
                Some(env) => Some(secrecy::SecretString::new(AppConfig::resolve_env(env)?)),
                None => None,
            };
            proxies.push(ProxyEndpoint {
                host: entry.host.clone(),
                port: entry.port,
                protocol: entry.protocol.clone(),
                username: entry.username.clone(),
                password,
            });
        }
        Ok(Self::new(config.heuristics.clone(), proxies, solver))
    }

    /// Observers registered here are attached to every counterparty
    /// registered afterwards.
    pub fn add_observer(&mut self, observer: Arc<dyn FeedObserver>) {
        self.observers.push(observer);
    }

    /// Register a counterparty: validate its config, build the access
    /// variant its tag selects, and set up the full runtime.
    pub async fn register(
        &mut self,
        config: CounterpartyConfig,
        credentials: Vec<CredentialSet>,
    ) -> Result<(), FeedError> {
        let adapter = build_adapter(&config)?;
        self.register_with_adapter(config, credentials, adapter).await
    }

    /// Registration seam for custom variants and tests.
    pub async fn register_with_adapter(
        &mut self,
        config: CounterpartyConfig,
        credentials: Vec<CredentialSet>,
        adapter: Arc<dyn FeedAdapter>,
    ) -> Result<(), FeedError> {
        config.validate()?;
        let name = config.name.to_lowercase();

        {
            let mut pool = self.credential_pool.lock().expect("credential pool lock poisoned");
            pool.register(&name, credentials);
        }

        let mut poller = LivePoller::new(&config, &self.heuristics);
        poller.add_observer(Arc::new(MovementForwarder {
            prioritizer: self.prioritizer.clone(),
        }));
        for observer in &self.observers {
            poller.add_observer(observer.clone());
        }

        let runtime = CounterpartyRuntime {
            lifecycle: Arc::new(tokio::sync::Mutex::new(SessionLifecycle::new(
                &name,
                &self.heuristics,
            ))),
            resilience: Arc::new(tokio::sync::Mutex::new(BanResilience::new(
                &name,
                &self.heuristics,
                self.proxy_rotator.clone(),
                self.solver.clone(),
            ))),
            poller: Arc::new(tokio::sync::Mutex::new(poller)),
            running: Arc::new(AtomicBool::new(false)),
            task: None,
            adapter,
            config,
        };

        // Replacing an existing registration stops its loop first.
        if let Some(previous) = self.runtimes.insert(name.clone(), runtime) {
            previous.running.store(false, Ordering::Release);
            previous.adapter.close().await;
        }

        info!(counterparty = %name, "Counterparty registered");
        Ok(())
    }

    /// Drop a counterparty entirely. Credential health records survive
    /// in the pool.
    pub async fn unregister(&mut self, counterparty: &str) {
        let name = counterparty.to_lowercase();
        if let Some(runtime) = self.runtimes.remove(&name) {
            runtime.running.store(false, Ordering::Release);
            if let Some(task) = runtime.task {
                let _ = task.await;
            }
            runtime.adapter.close().await;
            info!(counterparty = %name, "Counterparty unregistered");
        }
    }

    /// Idempotent session check, safe before every access.
    pub async fn ensure_active(&self, counterparty: &str) -> bool {
        let name = counterparty.to_lowercase();
        let Some(runtime) = self.runtimes.get(&name) else {
            warn!(counterparty = %name, "ensure_active on unregistered counterparty");
            return false;
        };

        let mut lifecycle = runtime.lifecycle.lock().await;
        let mut resilience = runtime.resilience.lock().await;
        match resilience
            .guarded_ensure_active(&mut lifecycle, runtime.adapter.as_ref(), &self.credential_pool)
            .await
        {
            Ok(active) => active,
            Err(e) => {
                warn!(counterparty = %name, error = %e, "ensure_active failed");
                false
            }
        }
    }

    /// Last-known status snapshot. Never surfaces a fault.
    pub async fn get_status(&self, counterparty: &str) -> Option<SessionStatus> {
        let name = counterparty.to_lowercase();
        let runtime = self.runtimes.get(&name)?;
        Some(runtime.lifecycle.lock().await.status())
    }

    /// Start the perpetual polling loop for a counterparty.
    pub async fn start_live_polling(&mut self, counterparty: &str) {
        let name = counterparty.to_lowercase();
        let Some(runtime) = self.runtimes.get_mut(&name) else {
            warn!(counterparty = %name, "start_live_polling on unregistered counterparty");
            return;
        };

        if runtime.running.load(Ordering::Acquire) {
            warn!(counterparty = %name, "Live poller already running");
            return;
        }

        runtime.running.store(true, Ordering::Release);
        let task = tokio::spawn(run_loop(
            runtime.poller.clone(),
            runtime.adapter.clone(),
            runtime.lifecycle.clone(),
            runtime.resilience.clone(),
            self.credential_pool.clone(),
            runtime.running.clone(),
        ));
        runtime.task = Some(task);
        info!(
            counterparty = %name,
            interval_secs = runtime.config.poll_interval_seconds,
            "Live polling started"
        );
    }

    /// Cooperative stop: the flag only prevents the next iteration; an
    /// in-flight access call runs to completion.
    pub async fn stop_live_polling(&mut self, counterparty: &str) {
        let name = counterparty.to_lowercase();
        let Some(runtime) = self.runtimes.get_mut(&name) else {
            return;
        };
        runtime.running.store(false, Ordering::Release);
        runtime.lifecycle.lock().await.reset();
        info!(counterparty = %name, "Live polling stop requested");
    }

    /// Feed an external opportunity detection in for ranking.
    pub fn ingest_opportunity(&self, detection: OpportunityDetection) -> RankedAlert {
        let mut prioritizer = self.prioritizer.lock().expect("prioritizer lock poisoned");
        prioritizer.ingest(detection)
    }

    /// Ranked alerts, highest priority first; expired entries dropped
    /// on read.
    pub fn get_prioritized_alerts(&self) -> Vec<RankedAlert> {
        let mut prioritizer = self.prioritizer.lock().expect("prioritizer lock poisoned");
        prioritizer.get_prioritized()
    }

    /// Operator clearing of a counterparty's EXHAUSTED state.
    pub async fn clear_exhausted(&self, counterparty: &str) {
        let name = counterparty.to_lowercase();
        if let Some(runtime) = self.runtimes.get(&name) {
            runtime.lifecycle.lock().await.clear_exhausted();
        }
    }

    /// Lift a credential quarantine.
    pub fn unban_credential(&self, counterparty: &str, identifier: &str) {
        let mut pool = self.credential_pool.lock().expect("credential pool lock poisoned");
        pool.unban(counterparty, identifier);
    }

    /// Stop every loop, wait for the tasks to wind down, and close all
    /// adapters.
    pub async fn close_all(&mut self) {
        for runtime in self.runtimes.values() {
            runtime.running.store(false, Ordering::Release);
        }

        let tasks: Vec<JoinHandle<()>> = self
            .runtimes
            .values_mut()
            .filter_map(|r| r.task.take())
            .collect();
        if !tasks.is_empty() {
            info!(count = tasks.len(), "Waiting for polling loops to stop");
            futures::future::join_all(tasks).await;
        }

        for runtime in self.runtimes.values() {
            runtime.adapter.close().await;
        }
        info!("All counterparty sessions closed");
    }

    /// Engine-wide stats rollup for the ops layer.
    pub async fn stats(&self) -> EngineStats {
        let mut counterparties = Vec::with_capacity(self.runtimes.len());
        for (name, runtime) in &self.runtimes {
            let session = runtime.lifecycle.lock().await.status();
            let poller = runtime.poller.lock().await.stats();
            let credentials = {
                let pool = self.credential_pool.lock().expect("credential pool lock poisoned");
                pool.stats(name)
            };
            counterparties.push(CounterpartyStats {
                counterparty: name.clone(),
                session,
                poller,
                credentials,
            });
        }
        counterparties.sort_by(|a, b| a.counterparty.cmp(&b.counterparty));

        EngineStats {
            counterparties,
            proxies: self
                .proxy_rotator
                .lock()
                .expect("proxy rotator lock poisoned")
                .stats(),
            alerts: self
                .prioritizer
                .lock()
                .expect("prioritizer lock poisoned")
                .stats(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
