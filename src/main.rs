//! Exchange Ledger - ledger of record service
//!
//! ```text
//! ┌──────────┐    ┌────────────┐    ┌──────────────┐    ┌──────────┐
//! │  Events  │───▶│ Settlement │───▶│ Double-Entry │───▶│  Store   │
//! │ (intake) │    │  Adapter   │    │    Engine    │    │(PG / mem)│
//! └──────────┘    └────────────┘    └──────────────┘    └──────────┘
//!                                                            ▲
//!          ┌────────────────────┐    ┌─────────────────┐     │
//!          │ Reconciliation tick│───▶│  Safety latch + │─────┤
//!          │  Invariant guard   │    │    actuator     │     │
//!          └────────────────────┘    └─────────────────┘     │
//! ```
//!
//! Usage: `exchange_ledger [--env dev]`

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use exchange_ledger::clock::{Clock, SystemClock};
use exchange_ledger::config::AppConfig;
use exchange_ledger::db::Database;
use exchange_ledger::logging::init_logging;
use exchange_ledger::service::{LedgerServices, actuator_from_config};
use exchange_ledger::store::{InMemoryLedgerStore, LedgerStore};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env).with_context(|| format!("loading config for {}", env))?;
    let _log_guard = init_logging(&config);

    tracing::info!("Starting exchange ledger in {} mode", env);

    let store: Arc<dyn LedgerStore> = match &config.postgres_url {
        Some(url) => {
            let db = Database::connect(url)
                .await
                .context("connecting to PostgreSQL")?;
            db.health_check().await.context("PostgreSQL health check")?;
            Arc::new(db.into_ledger_store().await.context("initializing schema")?)
        }
        None => {
            tracing::warn!("postgres_url not set, using in-memory store");
            Arc::new(InMemoryLedgerStore::new())
        }
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let actuator =
        actuator_from_config(&config.actuator, clock.clone()).context("building actuator")?;
    let services = LedgerServices::new(store, actuator, clock, config);

    let startup_check = services.check_invariants().await?;
    if !startup_check.ok {
        tracing::error!(
            violations = %startup_check.violations.join(","),
            "Invariants failing at startup"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = services.spawn_workers(shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }

    let snapshot = services.metrics.snapshot();
    tracing::info!("{}", snapshot);
    tracing::info!(
        metrics = %serde_json::to_string(&snapshot).unwrap_or_default(),
        "Final metrics"
    );
    Ok(())
}
