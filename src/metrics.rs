//! Ledger observation hooks
//!
//! Counters and gauges updated by the engine, settlement adapter,
//! reconciliation and invariant paths. Rendering is left to the caller;
//! [`LedgerMetrics::snapshot`] returns a plain serializable copy.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Last-value gauges and monotone counters
#[derive(Debug, Default)]
pub struct LedgerMetrics {
    // Settlement
    pub append_latency_ms: AtomicI64,
    pub unique_violation_total: AtomicU64,
    pub settlement_lag_ms: AtomicI64,
    pub settlement_failure_total: AtomicU64,
    pub dlq_total: AtomicU64,
    pub reserved_total: AtomicI64,
    pub available_total: AtomicI64,

    // Invariants
    pub invariant_violation_total: AtomicU64,
    pub invariant_check_ms: AtomicI64,
    pub rebuild_duration_ms: AtomicI64,
    pub invariant_safety_trigger_total: AtomicU64,
    pub invariant_safety_failure_total: AtomicU64,

    // Reconciliation
    pub reconciliation_max_lag: AtomicI64,
    pub reconciliation_active_breaches: AtomicI64,
    pub reconciliation_alert_total: AtomicU64,
    pub reconciliation_mismatch_total: AtomicU64,
    pub reconciliation_stale_total: AtomicU64,
    pub reconciliation_safety_trigger_total: AtomicU64,
    pub reconciliation_safety_failure_total: AtomicU64,
    pub latch_release_attempt_total: AtomicU64,
    pub latch_release_success_total: AtomicU64,
    pub latch_release_denied_total: AtomicU64,

    // Corrections
    pub corrections_total: AtomicU64,
    pub correction_pending_age_ms: AtomicI64,

    /// symbol -> (lag, state age ms)
    reconciliation_by_symbol: DashMap<String, (i64, i64)>,
    /// denial reason -> count
    latch_release_denied_by_reason: DashMap<String, u64>,
}

impl LedgerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_append_latency(&self, ms: i64) {
        self.append_latency_ms.store(ms.max(0), Ordering::Relaxed);
    }

    pub fn incr_unique_violation(&self) {
        self.unique_violation_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_settlement_lag(&self, ms: i64) {
        self.settlement_lag_ms.store(ms.max(0), Ordering::Relaxed);
    }

    pub fn incr_settlement_failure(&self) {
        self.settlement_failure_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_dlq(&self) {
        self.dlq_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_reserve_available(&self, reserved: i64, available: i64) {
        self.reserved_total.store(reserved, Ordering::Relaxed);
        self.available_total.store(available, Ordering::Relaxed);
    }

    pub fn incr_invariant_violation(&self) {
        self.invariant_violation_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_invariant_check(&self, ms: i64) {
        self.invariant_check_ms.store(ms.max(0), Ordering::Relaxed);
    }

    pub fn observe_rebuild_duration(&self, ms: i64) {
        self.rebuild_duration_ms.store(ms.max(0), Ordering::Relaxed);
    }

    pub fn add_invariant_safety_trigger(&self, count: u64) {
        self.invariant_safety_trigger_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_invariant_safety_failure(&self, count: u64) {
        self.invariant_safety_failure_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_reconciliation_for_symbol(&self, symbol: &str, lag: i64, age_ms: i64) {
        self.reconciliation_by_symbol
            .insert(symbol.to_string(), (lag, age_ms.max(0)));
    }

    pub fn set_reconciliation_summary(&self, max_lag: i64, active_breaches: i64) {
        self.reconciliation_max_lag
            .store(max_lag.max(0), Ordering::Relaxed);
        self.reconciliation_active_breaches
            .store(active_breaches, Ordering::Relaxed);
    }

    pub fn incr_reconciliation_alert(&self) {
        self.reconciliation_alert_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_reconciliation_mismatch(&self) {
        self.reconciliation_mismatch_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_reconciliation_stale(&self) {
        self.reconciliation_stale_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_reconciliation_safety_trigger(&self) {
        self.reconciliation_safety_trigger_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_reconciliation_safety_failure(&self) {
        self.reconciliation_safety_failure_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_latch_release_attempt(&self) {
        self.latch_release_attempt_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_latch_release_success(&self) {
        self.latch_release_success_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_latch_release_denied(&self, reason: &str) {
        self.latch_release_denied_total
            .fetch_add(1, Ordering::Relaxed);
        *self
            .latch_release_denied_by_reason
            .entry(reason.to_string())
            .or_insert(0) += 1;
    }

    pub fn incr_corrections(&self) {
        self.corrections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_correction_pending_age(&self, ms: i64) {
        self.correction_pending_age_ms
            .store(ms.max(0), Ordering::Relaxed);
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> LedgerMetricsSnapshot {
        let mut by_symbol: Vec<SymbolReconciliationGauge> = self
            .reconciliation_by_symbol
            .iter()
            .map(|e| SymbolReconciliationGauge {
                symbol: e.key().clone(),
                lag: e.value().0,
                age_ms: e.value().1,
            })
            .collect();
        by_symbol.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let mut denied: Vec<(String, u64)> = self
            .latch_release_denied_by_reason
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        denied.sort();

        LedgerMetricsSnapshot {
            append_latency_ms: self.append_latency_ms.load(Ordering::Relaxed),
            unique_violation_total: self.unique_violation_total.load(Ordering::Relaxed),
            settlement_lag_ms: self.settlement_lag_ms.load(Ordering::Relaxed),
            settlement_failure_total: self.settlement_failure_total.load(Ordering::Relaxed),
            dlq_total: self.dlq_total.load(Ordering::Relaxed),
            reserved_total: self.reserved_total.load(Ordering::Relaxed),
            available_total: self.available_total.load(Ordering::Relaxed),
            invariant_violation_total: self.invariant_violation_total.load(Ordering::Relaxed),
            invariant_check_ms: self.invariant_check_ms.load(Ordering::Relaxed),
            rebuild_duration_ms: self.rebuild_duration_ms.load(Ordering::Relaxed),
            invariant_safety_trigger_total: self
                .invariant_safety_trigger_total
                .load(Ordering::Relaxed),
            invariant_safety_failure_total: self
                .invariant_safety_failure_total
                .load(Ordering::Relaxed),
            reconciliation_max_lag: self.reconciliation_max_lag.load(Ordering::Relaxed),
            reconciliation_active_breaches: self
                .reconciliation_active_breaches
                .load(Ordering::Relaxed),
            reconciliation_alert_total: self.reconciliation_alert_total.load(Ordering::Relaxed),
            reconciliation_mismatch_total: self
                .reconciliation_mismatch_total
                .load(Ordering::Relaxed),
            reconciliation_stale_total: self.reconciliation_stale_total.load(Ordering::Relaxed),
            reconciliation_safety_trigger_total: self
                .reconciliation_safety_trigger_total
                .load(Ordering::Relaxed),
            reconciliation_safety_failure_total: self
                .reconciliation_safety_failure_total
                .load(Ordering::Relaxed),
            latch_release_attempt_total: self.latch_release_attempt_total.load(Ordering::Relaxed),
            latch_release_success_total: self.latch_release_success_total.load(Ordering::Relaxed),
            latch_release_denied_total: self.latch_release_denied_total.load(Ordering::Relaxed),
            latch_release_denied_by_reason: denied,
            corrections_total: self.corrections_total.load(Ordering::Relaxed),
            correction_pending_age_ms: self.correction_pending_age_ms.load(Ordering::Relaxed),
            reconciliation_by_symbol: by_symbol,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolReconciliationGauge {
    pub symbol: String,
    pub lag: i64,
    pub age_ms: i64,
}

/// Immutable snapshot of metrics (for reporting)
#[derive(Debug, Clone, Serialize)]
pub struct LedgerMetricsSnapshot {
    pub append_latency_ms: i64,
    pub unique_violation_total: u64,
    pub settlement_lag_ms: i64,
    pub settlement_failure_total: u64,
    pub dlq_total: u64,
    pub reserved_total: i64,
    pub available_total: i64,
    pub invariant_violation_total: u64,
    pub invariant_check_ms: i64,
    pub rebuild_duration_ms: i64,
    pub invariant_safety_trigger_total: u64,
    pub invariant_safety_failure_total: u64,
    pub reconciliation_max_lag: i64,
    pub reconciliation_active_breaches: i64,
    pub reconciliation_alert_total: u64,
    pub reconciliation_mismatch_total: u64,
    pub reconciliation_stale_total: u64,
    pub reconciliation_safety_trigger_total: u64,
    pub reconciliation_safety_failure_total: u64,
    pub latch_release_attempt_total: u64,
    pub latch_release_success_total: u64,
    pub latch_release_denied_total: u64,
    pub latch_release_denied_by_reason: Vec<(String, u64)>,
    pub corrections_total: u64,
    pub correction_pending_age_ms: i64,
    pub reconciliation_by_symbol: Vec<SymbolReconciliationGauge>,
}

impl LedgerMetricsSnapshot {
    pub fn denied_for(&self, reason: &str) -> u64 {
        self.latch_release_denied_by_reason
            .iter()
            .find(|(r, _)| r == reason)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

impl std::fmt::Display for LedgerMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Ledger Metrics: dup={}, dlq={}, max_lag={}, breaches={}, alerts={}, safety_fail={}, invariant_violations={}, corrections={}",
            self.unique_violation_total,
            self.dlq_total,
            self.reconciliation_max_lag,
            self.reconciliation_active_breaches,
            self.reconciliation_alert_total,
            self.reconciliation_safety_failure_total,
            self.invariant_violation_total,
            self.corrections_total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_by_reason() {
        let metrics = LedgerMetrics::new();
        metrics.incr_latch_release_denied("still_breached");
        metrics.incr_latch_release_denied("still_breached");
        metrics.incr_latch_release_denied("invariants_failed");

        let snap = metrics.snapshot();
        assert_eq!(snap.latch_release_denied_total, 3);
        assert_eq!(snap.denied_for("still_breached"), 2);
        assert_eq!(snap.denied_for("invariants_failed"), 1);
        assert_eq!(snap.denied_for("latch_not_engaged"), 0);
    }

    #[test]
    fn test_gauges_clamp_negative() {
        let metrics = LedgerMetrics::new();
        metrics.observe_append_latency(-5);
        metrics.set_reconciliation_summary(-3, 2);
        metrics.set_reconciliation_for_symbol("BTC-KRW", 4, -1);

        let snap = metrics.snapshot();
        assert_eq!(snap.append_latency_ms, 0);
        assert_eq!(snap.reconciliation_max_lag, 0);
        assert_eq!(snap.reconciliation_active_breaches, 2);
        assert_eq!(snap.reconciliation_by_symbol[0].age_ms, 0);
    }
}
