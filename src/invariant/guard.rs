//! Invariant Guard
//!
//! Periodic invariant check. After `trigger_after_consecutive` failing checks
//! in a row, and with auto-switch enabled, every tracked symbol is forced into
//! the configured safety mode.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::{InvariantCheckResult, InvariantChecker};
use crate::config::GuardConfig;
use crate::error::LedgerError;
use crate::reconciliation::ReconciliationEngine;
use crate::reconciliation::types::SafetyModeActivationSummary;

/// Outcome of one guard tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardTick {
    pub result: InvariantCheckResult,
    pub consecutive_failures: u32,
    /// Set when this tick escalated to the actuator
    pub activation: Option<SafetyModeActivationSummary>,
}

pub struct InvariantGuard {
    checker: Arc<InvariantChecker>,
    reconciliation: Arc<ReconciliationEngine>,
    config: GuardConfig,
    consecutive_failures: AtomicU32,
}

impl InvariantGuard {
    pub fn new(
        checker: Arc<InvariantChecker>,
        reconciliation: Arc<ReconciliationEngine>,
        config: GuardConfig,
    ) -> Self {
        Self {
            checker,
            reconciliation,
            config,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval_ms,
            trigger_after = self.config.trigger_after_consecutive,
            "Starting invariant guard"
        );
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, code = e.code(), "Invariant guard tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Invariant guard stopped");
    }

    pub async fn tick(&self) -> Result<GuardTick, LedgerError> {
        let result = self.checker.check().await?;
        if result.ok {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            return Ok(GuardTick {
                result,
                consecutive_failures: 0,
                activation: None,
            });
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        error!(
            violations = %result.violations.join(","),
            consecutive = failures,
            "Invariant guard alert"
        );

        let threshold = self.config.trigger_after_consecutive.max(1);
        let activation = if self.config.auto_switch_enabled && failures >= threshold {
            let reason = format!("invariant_violation:{}", result.violations.join("|"));
            let summary = self
                .reconciliation
                .activate_safety_mode_for_tracked_symbols(self.config.safety_mode, &reason)
                .await?;
            error!(
                symbols = %summary.requested_symbols.join(","),
                switched = %summary.switched_symbols.join(","),
                failed = %summary.failed_symbols.join(","),
                mode = %self.config.safety_mode,
                "Invariant guard forced safety mode"
            );
            Some(summary)
        } else {
            None
        };

        Ok(GuardTick {
            result,
            consecutive_failures: failures,
            activation,
        })
    }
}
