//! Ledger Services
//!
//! Wires the store, clock, metrics and actuator into every component and
//! exposes the admin surface as plain method calls.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::{ActuatorConfig, AppConfig, ConfigError};
use crate::correction::CorrectionWorkflow;
use crate::error::LedgerError;
use crate::invariant::{InvariantCheckResult, InvariantChecker, InvariantGuard};
use crate::ledger::types::AccountBalance;
use crate::ledger::{DoubleEntryEngine, SettlementAdapter};
use crate::metrics::LedgerMetrics;
use crate::reconciliation::types::{LatchReleaseRequest, LatchReleaseResult, ReconciliationDashboard};
use crate::reconciliation::{
    DisabledSafetyActuator, HttpSafetyActuator, ReconciliationEngine, ReconciliationWorker,
    SafetyModeActuator,
};
use crate::store::{InMemoryLedgerStore, LedgerStore};

pub struct LedgerServices {
    pub store: Arc<dyn LedgerStore>,
    pub metrics: Arc<LedgerMetrics>,
    pub engine: Arc<DoubleEntryEngine>,
    pub settlement: Arc<SettlementAdapter>,
    pub invariants: Arc<InvariantChecker>,
    pub reconciliation: Arc<ReconciliationEngine>,
    pub guard: Arc<InvariantGuard>,
    pub corrections: Arc<CorrectionWorkflow>,
    config: AppConfig,
}

impl LedgerServices {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        actuator: Arc<dyn SafetyModeActuator>,
        clock: Arc<dyn Clock>,
        config: AppConfig,
    ) -> Self {
        let metrics = Arc::new(LedgerMetrics::new());
        let engine = Arc::new(DoubleEntryEngine::new(store.clone(), metrics.clone()));
        let settlement = Arc::new(SettlementAdapter::new(
            engine.clone(),
            store.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let invariants = Arc::new(InvariantChecker::new(
            store.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let reconciliation = Arc::new(ReconciliationEngine::new(
            store.clone(),
            actuator.clone(),
            invariants.clone(),
            clock.clone(),
            metrics.clone(),
            config.reconciliation.clone(),
            config.latch_release.clone(),
        ));
        let guard = Arc::new(InvariantGuard::new(
            invariants.clone(),
            reconciliation.clone(),
            config.guard.clone(),
        ));
        let corrections = Arc::new(CorrectionWorkflow::new(
            store.clone(),
            clock,
            metrics.clone(),
        ));

        info!(
            store = store.name(),
            actuator = actuator.name(),
            "Ledger services wired"
        );
        Self {
            store,
            metrics,
            engine,
            settlement,
            invariants,
            reconciliation,
            guard,
            corrections,
            config,
        }
    }

    /// In-memory store, system clock and actuator from config
    pub fn in_memory(config: AppConfig) -> Result<Self, ConfigError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let actuator = actuator_from_config(&config.actuator, clock.clone())?;
        Ok(Self::new(
            Arc::new(InMemoryLedgerStore::new()),
            actuator,
            clock,
            config,
        ))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Start the enabled periodic workers. They stop when `shutdown` flips to true.
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.config.reconciliation.enabled {
            let worker = ReconciliationWorker::from_engine(self.reconciliation.clone());
            let rx = shutdown.clone();
            handles.push(tokio::spawn(async move { worker.run(rx).await }));
        }
        if self.config.guard.enabled {
            let guard = self.guard.clone();
            let rx = shutdown.clone();
            handles.push(tokio::spawn(async move { guard.run(rx).await }));
        }

        info!(workers = handles.len(), "Background workers started");
        handles
    }

    // === Admin surface ===

    pub async fn list_balances(&self) -> Result<Vec<AccountBalance>, LedgerError> {
        self.store.list_balances().await
    }

    pub async fn rebuild_balances(&self) -> Result<usize, LedgerError> {
        self.invariants.rebuild_balances().await
    }

    pub async fn check_invariants(&self) -> Result<InvariantCheckResult, LedgerError> {
        self.invariants.check().await
    }

    pub async fn reconciliation_status(
        &self,
        history_limit: usize,
    ) -> Result<ReconciliationDashboard, LedgerError> {
        self.reconciliation.status(history_limit).await
    }

    pub async fn release_latch(
        &self,
        request: &LatchReleaseRequest,
    ) -> Result<LatchReleaseResult, LedgerError> {
        self.reconciliation.release_latch(request).await
    }
}

/// HTTP actuator when enabled, otherwise one that rejects every request
pub fn actuator_from_config(
    config: &ActuatorConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn SafetyModeActuator>, ConfigError> {
    if !config.enabled {
        return Ok(Arc::new(DisabledSafetyActuator));
    }
    reqwest::Url::parse(&config.base_url).map_err(|e| {
        ConfigError::Invalid(format!("actuator.base_url '{}': {}", config.base_url, e))
    })?;
    let actuator = HttpSafetyActuator::new(&config.base_url, config.timeout(), clock)
        .map_err(|e| ConfigError::Invalid(format!("actuator client: {}", e)))?;
    Ok(Arc::new(actuator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::events::{EventEnvelope, ReserveCommand};
    use chrono::Utc;

    fn config() -> AppConfig {
        AppConfig::from_yaml(
            "inline",
            "log_level: info\nlog_dir: ./logs\nlog_file: ledger.log\nuse_json: false\nrotation: never\n",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_wiring_shares_one_store() {
        let services = LedgerServices::in_memory(config()).unwrap();
        let command = ReserveCommand {
            envelope: EventEnvelope {
                event_id: "evt-1".into(),
                event_version: 1,
                symbol: "BTC-KRW".into(),
                seq: 1,
                occurred_at: Utc::now(),
                correlation_id: "corr".into(),
                causation_id: "cause".into(),
            },
            order_id: "o-1".into(),
            user_id: "alice".into(),
            side: "BUY".into(),
            amount: 10,
        };
        services.settlement.reserve(&command).await.unwrap();

        assert_eq!(services.list_balances().await.unwrap().len(), 2);
        // Reserve without prior funding drives AVAILABLE below zero
        let check = services.check_invariants().await.unwrap();
        assert_eq!(check.violations, vec!["negative_balances=1".to_string()]);
        assert_eq!(services.metrics.snapshot().reserved_total, 10);
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown() {
        let services = LedgerServices::in_memory(config()).unwrap();
        let (tx, rx) = watch::channel(false);
        let handles = services.spawn_workers(rx);
        assert_eq!(handles.len(), 2);

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn test_disabled_actuator_by_default() {
        let actuator =
            actuator_from_config(&ActuatorConfig::default(), Arc::new(SystemClock)).unwrap();
        assert_eq!(actuator.name(), "disabled");
    }

    #[test]
    fn test_bad_actuator_url_is_config_error() {
        let config = ActuatorConfig {
            enabled: true,
            base_url: "not a url".to_string(),
            ..ActuatorConfig::default()
        };
        let err = actuator_from_config(&config, Arc::new(SystemClock))
            .err()
            .unwrap();
        assert_eq!(err.code(), "config_invalid");

        let config = ActuatorConfig {
            enabled: true,
            ..ActuatorConfig::default()
        };
        let actuator = actuator_from_config(&config, Arc::new(SystemClock)).unwrap();
        assert_eq!(actuator.name(), "http");
    }
}
