//! Reconciliation Engine
//!
//! Compares engine-reported and settled sequence numbers per symbol and
//! drives the sticky safety latch:
//!
//! ```text
//! NORMAL ──breach──► BREACHED ──recovered──► LATCHED ──release_latch──► NORMAL
//!                        ▲                       │
//!                        └────────breach─────────┘
//! ```
//!
//! The latch never clears on its own. Only [`ReconciliationEngine::release_latch`]
//! clears it, gated on the symbol being back within threshold and the
//! invariant check passing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tracing::{error, info, warn};

use super::actuator::{ModeChangeOutcome, SafetyModeActuator};
use super::types::{
    BreachReason, LatchClear, LatchReleaseRequest, LatchReleaseResult, ReconciliationDashboard,
    ReconciliationEvaluation, ReconciliationRunSummary, ReconciliationState,
    ReconciliationStatusView, ReleaseDenial, SafetyMode, SafetyModeActivationSummary, SafetyState,
};
use crate::clock::Clock;
use crate::config::{LatchReleaseConfig, ReconciliationConfig};
use crate::error::LedgerError;
use crate::invariant::{InvariantCheckResult, InvariantChecker};
use crate::metrics::LedgerMetrics;
use crate::store::LedgerStore;

/// Sequence gap classification for one symbol at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Gap {
    lag: i64,
    mismatch: bool,
    threshold_breached: bool,
    stale: bool,
    age_ms: Option<i64>,
}

impl Gap {
    fn measure(
        state: &ReconciliationState,
        config: &ReconciliationConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let lag = state.lag();
        let age_ms = state
            .updated_at
            .map(|at| (now - at).num_milliseconds().max(0));
        let stale = config.state_stale_ms > 0
            && age_ms.is_some_and(|age| age > config.state_stale_ms);
        Self {
            lag,
            mismatch: lag < 0,
            threshold_breached: lag > config.lag_threshold,
            stale,
            age_ms,
        }
    }

    #[inline]
    fn breached(&self) -> bool {
        self.mismatch || self.stale || self.threshold_breached
    }

    fn reason(&self) -> BreachReason {
        BreachReason::classify(self.mismatch, self.stale, self.threshold_breached)
    }
}

pub struct ReconciliationEngine {
    store: Arc<dyn LedgerStore>,
    actuator: Arc<dyn SafetyModeActuator>,
    checker: Arc<InvariantChecker>,
    clock: Arc<dyn Clock>,
    metrics: Arc<LedgerMetrics>,
    config: ReconciliationConfig,
    release_config: LatchReleaseConfig,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        actuator: Arc<dyn SafetyModeActuator>,
        checker: Arc<InvariantChecker>,
        clock: Arc<dyn Clock>,
        metrics: Arc<LedgerMetrics>,
        config: ReconciliationConfig,
        release_config: LatchReleaseConfig,
    ) -> Self {
        Self {
            store,
            actuator,
            checker,
            clock,
            metrics,
            config,
            release_config,
        }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    /// Evaluate every tracked symbol once
    pub async fn run_evaluation(&self) -> Result<ReconciliationRunSummary, LedgerError> {
        let checked_at = self.clock.now();
        let states = self.store.reconciliation_states().await?;
        let previous: FxHashMap<String, SafetyState> = self
            .store
            .safety_states()
            .await?
            .into_iter()
            .map(|s| (s.symbol.clone(), s))
            .collect();

        let mut evaluations = Vec::with_capacity(states.len());
        let mut skipped_symbols = Vec::new();
        let mut active_breaches = 0i64;
        let mut max_lag = 0i64;

        for state in &states {
            let prev = previous.get(&state.symbol);
            let (next, evaluation) = self.evaluate_symbol(state, prev, checked_at).await;

            if next.breach_active {
                active_breaches += 1;
            }
            max_lag = max_lag.max(evaluation.lag);

            let written = self
                .store
                .record_evaluation(&next, prev.map(|p| p.version), &evaluation)
                .await?;
            if !written {
                warn!(
                    symbol = %state.symbol,
                    "Safety state changed concurrently, evaluation skipped"
                );
                skipped_symbols.push(state.symbol.clone());
                continue;
            }
            evaluations.push(evaluation);
        }

        self.metrics
            .set_reconciliation_summary(max_lag, active_breaches);

        let summary = ReconciliationRunSummary {
            checked_at,
            evaluations,
            skipped_symbols,
        };
        let breached = summary.breached_symbols();
        if !breached.is_empty() {
            error!(
                symbols = %breached.join(","),
                mode = %self.config.safety_mode,
                threshold = self.config.lag_threshold,
                "Reconciliation breach"
            );
        }
        Ok(summary)
    }

    /// Compute the next safety state for one symbol, calling the actuator if due
    async fn evaluate_symbol(
        &self,
        state: &ReconciliationState,
        prev: Option<&SafetyState>,
        checked_at: DateTime<Utc>,
    ) -> (SafetyState, ReconciliationEvaluation) {
        let gap = Gap::measure(state, &self.config, checked_at);
        let breached = gap.breached();
        let reason = gap.reason().as_str().to_string();
        let prev_engaged = prev.is_some_and(|p| p.latch_engaged);

        let latch_engaged = self.config.safety_latch_enabled && (prev_engaged || breached);
        let breach_active = latch_engaged || breached;
        let held_without_breach = latch_engaged && !breached;
        let effective_reason = if held_without_breach {
            BreachReason::ManualReleaseRequired.as_str().to_string()
        } else {
            reason.clone()
        };

        let (latch_updated_at, latch_reason) = if !latch_engaged {
            (None, None)
        } else if held_without_breach && prev_engaged {
            let prev = prev.map(|p| (p.latch_updated_at, p.latch_reason.clone()));
            let (at, why) = prev.unwrap_or((None, None));
            (
                Some(at.unwrap_or(checked_at)),
                Some(why.unwrap_or_else(|| BreachReason::ManualReleaseRequired.as_str().to_string())),
            )
        } else {
            (Some(checked_at), Some(reason.clone()))
        };

        if gap.mismatch {
            self.metrics.incr_reconciliation_mismatch();
        }
        if gap.stale {
            self.metrics.incr_reconciliation_stale();
        }
        self.metrics
            .set_reconciliation_for_symbol(&state.symbol, gap.lag, gap.age_ms.unwrap_or(0));

        let first_breach = prev.is_none_or(|p| !p.breach_active);
        let retry_due =
            self.config.auto_switch_enabled && prev.is_some_and(|p| !p.last_action_taken);
        let should_trigger = breached && (first_breach || retry_due);
        if breached && first_breach {
            self.metrics.incr_reconciliation_alert();
        }

        let mut action_taken = false;
        let mut last_action_at = prev.and_then(|p| p.last_action_at);
        if should_trigger && self.config.auto_switch_enabled {
            match self
                .actuator
                .set_symbol_mode(&state.symbol, self.config.safety_mode, &reason)
                .await
            {
                ModeChangeOutcome::Accepted => {
                    action_taken = true;
                    last_action_at = Some(checked_at);
                    self.metrics.incr_reconciliation_safety_trigger();
                    info!(symbol = %state.symbol, mode = %self.config.safety_mode, reason = %reason, "Safety mode engaged");
                }
                ModeChangeOutcome::Rejected(why) | ModeChangeOutcome::Failed(why) => {
                    self.metrics.incr_reconciliation_safety_failure();
                    warn!(
                        symbol = %state.symbol,
                        actuator = self.actuator.name(),
                        error = %why,
                        "Safety mode switch failed, retrying next tick"
                    );
                }
            }
        }

        let last_action_taken = if should_trigger {
            action_taken
        } else if breach_active {
            prev.is_some_and(|p| p.last_action_taken)
        } else {
            false
        };

        let next = SafetyState {
            symbol: state.symbol.clone(),
            breach_active,
            last_lag: gap.lag,
            last_mismatch: gap.mismatch,
            safety_mode: if breached {
                Some(self.config.safety_mode)
            } else {
                prev.and_then(|p| p.safety_mode)
            },
            last_action_taken,
            last_action_at,
            reason: Some(effective_reason.clone()),
            latch_engaged,
            latch_reason,
            latch_updated_at,
            latch_released_at: if latch_engaged {
                None
            } else {
                prev.and_then(|p| p.latch_released_at)
            },
            latch_released_by: if latch_engaged {
                None
            } else {
                prev.and_then(|p| p.latch_released_by.clone())
            },
            updated_at: checked_at,
            version: prev.map_or(1, |p| p.version + 1),
        };

        let evaluation = ReconciliationEvaluation {
            symbol: state.symbol.clone(),
            last_engine_seq: state.last_engine_seq,
            last_settled_seq: state.last_settled_seq,
            lag: gap.lag,
            mismatch: gap.mismatch,
            stale: gap.stale,
            threshold: self.config.lag_threshold,
            breached,
            reason: effective_reason,
            safety_mode: self.config.safety_mode,
            safety_action_taken: action_taken,
            checked_at,
        };
        (next, evaluation)
    }

    /// Operator-gated latch release
    pub async fn release_latch(
        &self,
        request: &LatchReleaseRequest,
    ) -> Result<LatchReleaseResult, LedgerError> {
        let symbol = request.symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(LedgerError::InvalidSymbol(request.symbol.clone()));
        }
        let approved_by = request.approved_by.trim();
        if approved_by.is_empty() {
            return Err(LedgerError::InvalidEnvelope(
                "approved_by must not be blank".to_string(),
            ));
        }
        self.metrics.incr_latch_release_attempt();

        let state = self
            .store
            .reconciliation_state(&symbol)
            .await?
            .unwrap_or_else(|| ReconciliationState::empty(&symbol));
        let gap = Gap::measure(&state, &self.config, self.clock.now());
        let denied = |denial: ReleaseDenial, invariants: Option<&InvariantCheckResult>, mode_restored| {
            self.metrics.incr_latch_release_denied(denial.as_str());
            warn!(symbol = %symbol, approved_by, reason = denial.as_str(), "Latch release denied");
            LatchReleaseResult {
                symbol: symbol.clone(),
                released: false,
                mode_restored,
                reason: denial.as_str().to_string(),
                lag: gap.lag,
                mismatch: gap.mismatch,
                threshold_breached: gap.threshold_breached,
                invariants_ok: invariants.is_some_and(|r| r.ok),
                invariant_violations: invariants.map(|r| r.violations.clone()).unwrap_or_default(),
                released_at: None,
                released_by: None,
            }
        };

        if gap.mismatch || gap.threshold_breached {
            return Ok(denied(ReleaseDenial::StillBreached, None, false));
        }
        let Some(safety) = self.store.safety_state(&symbol).await? else {
            return Ok(denied(ReleaseDenial::SafetyStateNotFound, None, false));
        };
        if !safety.latch_engaged {
            return Ok(denied(ReleaseDenial::LatchNotEngaged, None, false));
        }

        let invariants = self.checker.check().await?;
        let gate_passes = invariants.ok
            || (self.release_config.allow_negative_balance_violations
                && invariants.only_negative_balances());
        if !gate_passes {
            return Ok(denied(ReleaseDenial::InvariantsFailed, Some(&invariants), false));
        }

        let mode_restored = if request.restore_symbol_mode {
            let outcome = self
                .actuator
                .restore_symbol_mode(
                    &symbol,
                    &format!("reconciliation_latch_release:{}", request.reason),
                )
                .await;
            if !outcome.is_accepted() {
                return Ok(denied(ReleaseDenial::ModeRestoreFailed, Some(&invariants), false));
            }
            true
        } else {
            false
        };

        let released_at = self.clock.now();
        let release_reason = format!("manual_latch_release:{}", request.reason);
        let next_mode = if mode_restored {
            Some(SafetyMode::Normal)
        } else {
            safety.safety_mode
        };
        let clear = LatchClear {
            symbol: symbol.clone(),
            expected_version: safety.version,
            lag: gap.lag,
            mismatch: gap.mismatch,
            safety_mode: next_mode,
            release_reason: release_reason.clone(),
            released_by: approved_by.to_string(),
            released_at,
        };
        let evaluation = ReconciliationEvaluation {
            symbol: symbol.clone(),
            last_engine_seq: state.last_engine_seq,
            last_settled_seq: state.last_settled_seq,
            lag: gap.lag,
            mismatch: gap.mismatch,
            stale: gap.stale,
            threshold: self.config.lag_threshold,
            breached: false,
            reason: release_reason.clone(),
            safety_mode: next_mode.unwrap_or(SafetyMode::CancelOnly),
            safety_action_taken: mode_restored,
            checked_at: released_at,
        };

        if !self.store.release_latch(&clear, &evaluation).await? {
            return Ok(denied(
                ReleaseDenial::ReleaseNotApplied,
                Some(&invariants),
                mode_restored,
            ));
        }

        self.metrics.incr_latch_release_success();
        self.refresh_summary_metrics().await;
        info!(
            symbol = %symbol,
            approved_by,
            mode_restored,
            reason = %release_reason,
            "Reconciliation latch released"
        );

        Ok(LatchReleaseResult {
            symbol,
            released: true,
            mode_restored,
            reason: release_reason,
            lag: gap.lag,
            mismatch: gap.mismatch,
            threshold_breached: gap.threshold_breached,
            invariants_ok: invariants.ok,
            invariant_violations: invariants.violations,
            released_at: Some(released_at),
            released_by: Some(approved_by.to_string()),
        })
    }

    /// Dashboard of every tracked symbol plus the latest history rows
    pub async fn status(&self, history_limit: usize) -> Result<ReconciliationDashboard, LedgerError> {
        let checked_at = self.clock.now();
        let states = self.store.reconciliation_states().await?;
        let safety: FxHashMap<String, SafetyState> = self
            .store
            .safety_states()
            .await?
            .into_iter()
            .map(|s| (s.symbol.clone(), s))
            .collect();

        let statuses = states
            .iter()
            .map(|state| {
                let gap = Gap::measure(state, &self.config, checked_at);
                self.metrics.set_reconciliation_for_symbol(
                    &state.symbol,
                    gap.lag,
                    gap.age_ms.unwrap_or(0),
                );
                let s = safety.get(&state.symbol);
                ReconciliationStatusView {
                    symbol: state.symbol.clone(),
                    last_engine_seq: state.last_engine_seq,
                    last_settled_seq: state.last_settled_seq,
                    lag: gap.lag,
                    mismatch: gap.mismatch,
                    threshold_breached: gap.threshold_breached,
                    stale: gap.stale,
                    breached: gap.breached(),
                    state_age_ms: gap.age_ms,
                    breach_active: s.is_some_and(|s| s.breach_active),
                    safety_mode: s.and_then(|s| s.safety_mode),
                    last_action_at: s.and_then(|s| s.last_action_at),
                    latch_engaged: s.is_some_and(|s| s.latch_engaged),
                    latch_reason: s.and_then(|s| s.latch_reason.clone()),
                    latch_updated_at: s.and_then(|s| s.latch_updated_at),
                    latch_released_at: s.and_then(|s| s.latch_released_at),
                    latch_released_by: s.and_then(|s| s.latch_released_by.clone()),
                    updated_at: state.updated_at,
                }
            })
            .collect();

        let history = self.store.reconciliation_history(history_limit).await?;
        Ok(ReconciliationDashboard {
            checked_at,
            statuses,
            history,
        })
    }

    /// Force every tracked symbol into `mode`
    pub async fn activate_safety_mode_for_tracked_symbols(
        &self,
        mode: SafetyMode,
        reason: &str,
    ) -> Result<SafetyModeActivationSummary, LedgerError> {
        let symbols = self.store.tracked_symbols().await?;
        let mut summary = SafetyModeActivationSummary::default();

        for symbol in symbols {
            let outcome = self.actuator.set_symbol_mode(&symbol, mode, reason).await;
            if outcome.is_accepted() {
                summary.switched_symbols.push(symbol.clone());
            } else {
                summary.failed_symbols.push(symbol.clone());
            }
            summary.requested_symbols.push(symbol);
        }

        self.metrics
            .add_invariant_safety_trigger(summary.switched_symbols.len() as u64);
        self.metrics
            .add_invariant_safety_failure(summary.failed_symbols.len() as u64);
        Ok(summary)
    }

    async fn refresh_summary_metrics(&self) {
        let states = match self.store.reconciliation_states().await {
            Ok(states) => states,
            Err(e) => {
                warn!(error = %e, "Failed to refresh reconciliation metrics");
                return;
            }
        };
        let active = match self.store.safety_states().await {
            Ok(safety) => safety.iter().filter(|s| s.breach_active).count() as i64,
            Err(e) => {
                warn!(error = %e, "Failed to refresh reconciliation metrics");
                return;
            }
        };
        let max_lag = states.iter().map(|s| s.lag()).max().unwrap_or(0);
        self.metrics.set_reconciliation_summary(max_lag, active);
    }
}
