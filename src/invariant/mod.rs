//! Invariant Checker
//!
//! Verifies that every entry nets to zero per currency and that no user
//! balance is negative. Each violation is persisted as an alert. Also owns
//! the rebuild path that recomputes materialized balances from postings.

pub mod guard;

pub use guard::InvariantGuard;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::LedgerError;
use crate::metrics::LedgerMetrics;
use crate::store::LedgerStore;

pub const ALERT_KIND_INVARIANT_VIOLATION: &str = "INVARIANT_VIOLATION";

/// Violation prefix for user balances below zero
pub const NEGATIVE_BALANCES: &str = "negative_balances";
/// Violation prefix for entries that do not net to zero
pub const UNBALANCED_ENTRIES: &str = "unbalanced_entries";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantAlert {
    pub alert_kind: String,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantCheckResult {
    pub ok: bool,
    /// `unbalanced_entries=N` and/or `negative_balances=N`
    pub violations: Vec<String>,
}

impl InvariantCheckResult {
    pub fn passed() -> Self {
        Self {
            ok: true,
            violations: Vec::new(),
        }
    }

    /// True when there are violations and all of them are negative balances
    pub fn only_negative_balances(&self) -> bool {
        !self.violations.is_empty()
            && self
                .violations
                .iter()
                .all(|v| v.starts_with(&format!("{}=", NEGATIVE_BALANCES)))
    }
}

pub struct InvariantChecker {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<LedgerMetrics>,
}

impl InvariantChecker {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
        }
    }

    pub async fn check(&self) -> Result<InvariantCheckResult, LedgerError> {
        let started = Instant::now();

        let mut violations = Vec::new();
        let unbalanced = self.store.unbalanced_entry_count().await?;
        if unbalanced > 0 {
            violations.push(format!("{}={}", UNBALANCED_ENTRIES, unbalanced));
        }
        let negative = self.store.negative_balance_count().await?;
        if negative > 0 {
            violations.push(format!("{}={}", NEGATIVE_BALANCES, negative));
        }

        let now = self.clock.now();
        for violation in &violations {
            let alert = InvariantAlert {
                alert_kind: ALERT_KIND_INVARIANT_VIOLATION.to_string(),
                details: violation.clone(),
                created_at: now,
            };
            if let Err(e) = self.store.record_alert(&alert).await {
                warn!(details = %violation, error = %e, "Failed to persist invariant alert");
            }
        }

        self.metrics
            .observe_invariant_check(started.elapsed().as_millis() as i64);

        if violations.is_empty() {
            return Ok(InvariantCheckResult::passed());
        }
        self.metrics.incr_invariant_violation();
        error!(violations = %violations.join(","), "Invariant violation");
        Ok(InvariantCheckResult {
            ok: false,
            violations,
        })
    }

    /// Replace every materialized balance with totals recomputed from postings
    pub async fn rebuild_balances(&self) -> Result<usize, LedgerError> {
        let started = Instant::now();
        let rows = self.store.rebuild_balances(self.clock.now()).await?;
        let elapsed_ms = started.elapsed().as_millis() as i64;
        self.metrics.observe_rebuild_duration(elapsed_ms);

        match self.store.balance_totals_by_kind().await {
            Ok(totals) => self
                .metrics
                .set_reserve_available(totals.hold, totals.available),
            Err(e) => warn!(error = %e, "Failed to refresh reserve metrics"),
        }

        info!(rows, elapsed_ms, "Balances rebuilt from postings");
        Ok(rows)
    }

    pub async fn recent_alerts(&self, limit: usize) -> Result<Vec<InvariantAlert>, LedgerError> {
        self.store.recent_alerts(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::ledger::types::{
        AccountId, AccountKind, EntryKind, LedgerEntry, Posting, ReferenceType,
    };
    use crate::store::InMemoryLedgerStore;

    fn checker() -> (InvariantChecker, Arc<InMemoryLedgerStore>, Arc<LedgerMetrics>) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let metrics = Arc::new(LedgerMetrics::new());
        (
            InvariantChecker::new(store.clone(), Arc::new(SystemClock), metrics.clone()),
            store,
            metrics,
        )
    }

    fn transfer(entry_id: &str, from: &str, to: &str, amount: i64) -> LedgerEntry {
        LedgerEntry {
            entry_id: entry_id.into(),
            reference_type: ReferenceType::Adjustment,
            reference_id: entry_id.into(),
            entry_kind: EntryKind::ManualAdjustment,
            symbol: "BTC-KRW".into(),
            engine_seq: 1,
            occurred_at: Utc::now(),
            correlation_id: "corr".into(),
            causation_id: "cause".into(),
            postings: vec![
                Posting::debit(AccountId::user(to, "KRW", AccountKind::Available), amount),
                Posting::credit(AccountId::system(from, "KRW"), amount),
            ],
        }
    }

    #[tokio::test]
    async fn test_clean_ledger_passes() {
        let (checker, store, _) = checker();
        store
            .append_entry(&transfer("e1", "treasury", "alice", 50))
            .await
            .unwrap();

        let result = checker.check().await.unwrap();
        assert_eq!(result, InvariantCheckResult::passed());
        assert!(checker.recent_alerts(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_negative_user_balance_reported_and_alerted() {
        let (checker, store, metrics) = checker();
        let alice = AccountId::user("alice", "KRW", AccountKind::Available);
        store.overwrite_balance(&alice, -5);

        let result = checker.check().await.unwrap();
        assert!(!result.ok);
        assert_eq!(result.violations, vec!["negative_balances=1".to_string()]);
        assert!(result.only_negative_balances());

        let alerts = checker.recent_alerts(10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_kind, ALERT_KIND_INVARIANT_VIOLATION);
        assert_eq!(metrics.snapshot().invariant_violation_total, 1);
    }

    #[tokio::test]
    async fn test_rebuild_restores_materialized_view() {
        let (checker, store, _) = checker();
        store
            .append_entry(&transfer("e1", "treasury", "alice", 50))
            .await
            .unwrap();
        let alice = AccountId::user("alice", "KRW", AccountKind::Available);
        store.overwrite_balance(&alice, -999);
        assert!(!checker.check().await.unwrap().ok);

        checker.rebuild_balances().await.unwrap();
        assert!(checker.check().await.unwrap().ok);
        assert_eq!(
            store.list_balances().await.unwrap(),
            store.posting_totals().await.unwrap()
        );
    }

    #[test]
    fn test_only_negative_balances() {
        let mixed = InvariantCheckResult {
            ok: false,
            violations: vec!["unbalanced_entries=1".into(), "negative_balances=2".into()],
        };
        assert!(!mixed.only_negative_balances());
        assert!(!InvariantCheckResult::passed().only_negative_balances());
    }
}
