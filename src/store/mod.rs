//! Ledger Store
//!
//! Durable storage for entries, postings, accounts, materialized balances,
//! reconciliation state and history, safety latch state, invariant alerts
//! and correction requests.
//!
//! Every mutating method is one atomic unit: either everything it describes
//! is visible afterwards or nothing is. Two implementations exist:
//! [`PgLedgerStore`] (one Postgres transaction per call) and
//! [`InMemoryLedgerStore`] (one critical section per call).

pub mod memory;
pub mod postgres;
pub mod schema;

pub use memory::InMemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core_types::SeqNum;
use crate::correction::types::{ApplyOutcome, CorrectionRequest};
use crate::error::LedgerError;
use crate::invariant::InvariantAlert;
use crate::ledger::types::{
    AccountBalance, AppendOutcome, DeadLetter, LedgerEntry, TradeLookup,
};
use crate::reconciliation::types::{
    HistoryPoint, LatchClear, ReconciliationEvaluation, ReconciliationState, SafetyState,
};

/// Upper bound on history rows returned by one query
pub const MAX_HISTORY_LIMIT: usize = 500;

/// Clamp a requested history size into `1..=MAX_HISTORY_LIMIT`
#[inline]
pub fn clamp_history_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_HISTORY_LIMIT)
}

/// Sum of balances per account kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceTotals {
    pub available: i64,
    pub hold: i64,
}

/// Storage seam for the whole ledger core
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Store name for logging
    fn name(&self) -> &'static str;

    // === Entries & balances ===

    /// Insert entry, postings and balance deltas atomically.
    ///
    /// # Idempotency
    /// A second call with the same `entry_id` writes nothing and returns
    /// [`AppendOutcome::Duplicate`]. Balance validation is the caller's job.
    async fn append_entry(&self, entry: &LedgerEntry) -> Result<AppendOutcome, LedgerError>;

    async fn get_entry(&self, entry_id: &str) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Latest TRADE entry referencing `trade_id`
    async fn find_trade(&self, trade_id: &str) -> Result<Option<TradeLookup>, LedgerError>;

    async fn list_balances(&self) -> Result<Vec<AccountBalance>, LedgerError>;

    /// Per account/currency sums computed from postings, ignoring the materialized view
    async fn posting_totals(&self) -> Result<Vec<AccountBalance>, LedgerError>;

    async fn balance_totals_by_kind(&self) -> Result<BalanceTotals, LedgerError>;

    /// Replace every materialized balance with the posting totals.
    ///
    /// Returns the number of balance rows written.
    async fn rebuild_balances(&self, at: DateTime<Utc>) -> Result<usize, LedgerError>;

    async fn append_dead_letter(&self, letter: &DeadLetter) -> Result<(), LedgerError>;

    async fn dead_letter_count(&self) -> Result<i64, LedgerError>;

    // === Sequence tracking ===

    /// Raise `last_engine_seq` to `seq` if higher (creates the row on first sight)
    async fn advance_engine_seq(
        &self,
        symbol: &str,
        seq: SeqNum,
        at: DateTime<Utc>,
    ) -> Result<ReconciliationState, LedgerError>;

    /// Raise `last_settled_seq` to `seq` if higher (creates the row on first sight)
    async fn advance_settled_seq(
        &self,
        symbol: &str,
        seq: SeqNum,
        at: DateTime<Utc>,
    ) -> Result<ReconciliationState, LedgerError>;

    async fn reconciliation_state(
        &self,
        symbol: &str,
    ) -> Result<Option<ReconciliationState>, LedgerError>;

    /// All tracked states ordered by symbol
    async fn reconciliation_states(&self) -> Result<Vec<ReconciliationState>, LedgerError>;

    /// Symbols seen in sequence tracking or in any entry
    async fn tracked_symbols(&self) -> Result<Vec<String>, LedgerError>;

    // === Safety latch ===

    async fn safety_state(&self, symbol: &str) -> Result<Option<SafetyState>, LedgerError>;

    async fn safety_states(&self) -> Result<Vec<SafetyState>, LedgerError>;

    /// Write `state` and append `evaluation` to history atomically.
    ///
    /// `expected_version` is `None` when no row existed at read time. Returns
    /// false, writing nothing, when the stored version no longer matches.
    async fn record_evaluation(
        &self,
        state: &SafetyState,
        expected_version: Option<i64>,
        evaluation: &ReconciliationEvaluation,
    ) -> Result<bool, LedgerError>;

    /// Clear an engaged latch and append `evaluation` to history atomically.
    ///
    /// Returns false when the latch was no longer engaged at `clear.expected_version`.
    async fn release_latch(
        &self,
        clear: &LatchClear,
        evaluation: &ReconciliationEvaluation,
    ) -> Result<bool, LedgerError>;

    /// Newest first, `limit` clamped to `1..=500`
    async fn reconciliation_history(&self, limit: usize) -> Result<Vec<HistoryPoint>, LedgerError>;

    // === Invariants ===

    /// Count of (entry, currency) groups whose postings do not net to zero
    async fn unbalanced_entry_count(&self) -> Result<i64, LedgerError>;

    /// Count of negative balances on non-system accounts
    async fn negative_balance_count(&self) -> Result<i64, LedgerError>;

    async fn record_alert(&self, alert: &InvariantAlert) -> Result<(), LedgerError>;

    /// Newest first
    async fn recent_alerts(&self, limit: usize) -> Result<Vec<InvariantAlert>, LedgerError>;

    // === Corrections ===

    /// Fails with `CorrectionAlreadyExists` on a duplicate id
    async fn create_correction(&self, request: &CorrectionRequest) -> Result<(), LedgerError>;

    async fn get_correction(
        &self,
        correction_id: &str,
    ) -> Result<Option<CorrectionRequest>, LedgerError>;

    /// Record one approval under a row lock and return the resulting request
    async fn approve_correction(
        &self,
        correction_id: &str,
        approver: &str,
        at: DateTime<Utc>,
    ) -> Result<CorrectionRequest, LedgerError>;

    /// Under a row lock: check status, append `reversal`, mark APPLIED
    async fn apply_correction(
        &self,
        correction_id: &str,
        reversal: &LedgerEntry,
        at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, LedgerError>;

    async fn oldest_pending_correction(&self) -> Result<Option<DateTime<Utc>>, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_history_limit() {
        assert_eq!(clamp_history_limit(0), 1);
        assert_eq!(clamp_history_limit(20), 20);
        assert_eq!(clamp_history_limit(10_000), 500);
    }
}
