//! GOPHERMART — accrual reconciler
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the ledger database and runs the reconciliation engine until
//! Ctrl+C.

use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{error, info};

use gophermart::accrual::AccrualClient;
use gophermart::config::AppConfig;
use gophermart::engine::{EngineConfig, Reconciler, ShutdownSignal};
use gophermart::storage::{LedgerStore, SqliteLedger};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = AppConfig::from_env()?;

    init_logging();

    info!(
        accrual = %cfg.accrual.base_url,
        poll_interval_secs = cfg.engine.poll_interval_secs,
        "Gophermart reconciler starting up"
    );

    // -- Components --------------------------------------------------------

    let ledger = SqliteLedger::connect(cfg.database.uri.expose_secret(), cfg.database.max_connections)
        .await
        .context("Failed to open ledger database")?;
    ledger.ping().await.context("Ledger database is not reachable")?;
    let ledger = Arc::new(ledger);

    let client = AccrualClient::from_config(&cfg.accrual).context("Failed to build accrual client")?;

    let reconciler = Reconciler::new(
        ledger.clone(),
        Arc::new(client),
        EngineConfig::from_settings(&cfg.engine),
    );

    // -- Run ---------------------------------------------------------------

    let signal = ShutdownSignal::new();
    let shutdown = signal.listener();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Shutdown signal received.");
        signal.trigger();
    });

    info!("Reconciler running. Press Ctrl+C to stop.");
    reconciler.start(shutdown).await;

    let stats = reconciler.stats();
    ledger.close().await;
    info!(
        fetched = stats.fetched,
        applied = stats.applied,
        credited = stats.credited,
        not_registered = stats.not_registered,
        rate_limited = stats.rate_limited,
        failed = stats.failed,
        "Gophermart shut down cleanly."
    );

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gophermart=info"));

    let json_logging = std::env::var("GOPHERMART_LOG_JSON").is_ok();

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
