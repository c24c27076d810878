//! Reconciliation Worker
//!
//! Runs [`ReconciliationEngine::run_evaluation`] on a fixed interval until
//! the shutdown channel flips to `true`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::engine::ReconciliationEngine;
use super::types::ReconciliationRunSummary;
use crate::error::LedgerError;

pub struct ReconciliationWorker {
    engine: Arc<ReconciliationEngine>,
    interval: Duration,
}

impl ReconciliationWorker {
    pub fn new(engine: Arc<ReconciliationEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Build with the interval from the engine's config
    pub fn from_engine(engine: Arc<ReconciliationEngine>) -> Self {
        let interval = engine.config().interval();
        Self::new(engine, interval)
    }

    /// Run until `shutdown` becomes true or its sender is dropped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting reconciliation worker"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, code = e.code(), "Reconciliation tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reconciliation worker stopped");
    }

    /// Single evaluation pass
    pub async fn tick(&self) -> Result<ReconciliationRunSummary, LedgerError> {
        let summary = self.engine.run_evaluation().await?;
        debug!(
            symbols = summary.evaluations.len(),
            skipped = summary.skipped_symbols.len(),
            "Reconciliation tick"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{LatchReleaseConfig, ReconciliationConfig};
    use crate::invariant::InvariantChecker;
    use crate::metrics::LedgerMetrics;
    use crate::reconciliation::actuator::mock::MockActuator;
    use crate::store::{InMemoryLedgerStore, LedgerStore};
    use chrono::Utc;

    fn worker(store: Arc<InMemoryLedgerStore>) -> ReconciliationWorker {
        let metrics = Arc::new(LedgerMetrics::new());
        let checker = Arc::new(InvariantChecker::new(
            store.clone(),
            Arc::new(SystemClock),
            metrics.clone(),
        ));
        let engine = ReconciliationEngine::new(
            store,
            Arc::new(MockActuator::new()),
            checker,
            Arc::new(SystemClock),
            metrics,
            ReconciliationConfig::default(),
            LatchReleaseConfig::default(),
        );
        ReconciliationWorker::new(Arc::new(engine), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_tick_evaluates_tracked_symbols() {
        let store = Arc::new(InMemoryLedgerStore::new());
        store.advance_engine_seq("BTC-KRW", 3, Utc::now()).await.unwrap();
        let summary = worker(store).tick().await.unwrap();
        assert_eq!(summary.evaluations.len(), 1);
        assert!(!summary.evaluations[0].breached);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(InMemoryLedgerStore::new());
        store.advance_engine_seq("BTC-KRW", 3, Utc::now()).await.unwrap();
        let worker = Arc::new(worker(store.clone()));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should stop")
            .unwrap();
        assert!(store.reconciliation_history(10).await.unwrap().len() >= 1);
    }
}
