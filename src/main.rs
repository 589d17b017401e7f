//! STEAMFEED — Resilient live-odds ingestion engine.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! wires the engine, registers every configured counterparty, and runs
//! the polling loops with graceful shutdown.

use anyhow::Result;
use tracing::{error, info, warn};

use steamfeed::config::{AppConfig, CounterpartyConfig};
use steamfeed::credentials::CredentialSet;
use steamfeed::engine::FeedEngine;

const BANNER: &str = r#"
 ____ _____ _____    _    __  __ _____ _____ _____ ____
/ ___|_   _| ____|  / \  |  \/  |  ___| ____| ____|  _ \
\___ \ | | |  _|   / _ \ | |\/| | |_  |  _| |  _| | | | |
 ___) || | | |___ / ___ \| |  | |  _| | |___| |___| |_| |
|____/ |_| |_____/_/   \_\_|  |_|_|   |_____|_____|____/

  Session-rotating live odds feed
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML
    let cfg = AppConfig::load("config.toml")?;

    // Initialise structured logging
    init_logging();

    println!("{BANNER}");
    info!(
        engine = %cfg.engine.name,
        counterparties = cfg.counterparty.len(),
        proxies = cfg.proxy.len(),
        "STEAMFEED starting up"
    );

    // -- Build the engine --------------------------------------------------

    // The challenge solver is an external capability; none wired here
    // means challenges fail cleanly instead of being retried.
    if cfg.engine.solver_api_key_env.is_some() {
        warn!("solver_api_key_env set but no solver integration is wired in this build");
    }
    let mut engine = FeedEngine::from_config(&cfg, None)?;

    // -- Register counterparties ------------------------------------------
    //
    // A failure here is fatal only for the counterparty it names; the
    // rest keep running.

    let mut started = 0usize;
    for counterparty in &cfg.counterparty {
        let credentials = match resolve_credentials(counterparty) {
            Ok(c) => c,
            Err(e) => {
                error!(
                    counterparty = %counterparty.name,
                    error = %e,
                    "Skipping counterparty: credential resolution failed"
                );
                continue;
            }
        };

        if let Err(e) = engine.register(counterparty.clone(), credentials).await {
            error!(
                counterparty = %counterparty.name,
                error = %e,
                "Skipping counterparty: registration failed"
            );
            continue;
        }

        if counterparty.enabled {
            engine.start_live_polling(&counterparty.name).await;
            started += 1;
        } else {
            info!(counterparty = %counterparty.name, "Registered but disabled");
        }
    }

    if started == 0 {
        warn!("No counterparty polling loops started; engine is idle");
    }

    // -- Run until shutdown ------------------------------------------------

    info!(loops = started, "Engine running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received.");

    engine.close_all().await;

    let stats = engine.stats().await;
    for cp in &stats.counterparties {
        info!(
            counterparty = %cp.counterparty,
            polls = cp.poller.poll_count,
            errors = cp.poller.error_count,
            movements = cp.poller.movements_detected,
            state = %cp.session.state,
            "Final counterparty stats"
        );
    }
    info!("STEAMFEED shut down cleanly.");

    Ok(())
}

/// Resolve a counterparty's credential secrets from the environment.
fn resolve_credentials(config: &CounterpartyConfig) -> Result<Vec<CredentialSet>> {
    config
        .credentials
        .iter()
        .map(|entry| {
            let secret = AppConfig::resolve_env(&entry.secret_env)?;
            Ok(CredentialSet::new(&config.name, &entry.identifier, &secret))
        })
        .collect()
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("steamfeed=info"));

    let json_logging = std::env::var("STEAMFEED_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
