//! In-memory ledger store
//!
//! All state sits behind one mutex, and every trait method is a single
//! critical section, so each call is atomic the same way a Postgres
//! transaction is. The lock is never held across an await point.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};

use super::{BalanceTotals, LedgerStore, clamp_history_limit};
use crate::core_types::SeqNum;
use crate::correction::types::{ApplyOutcome, CorrectionRequest, CorrectionStatus};
use crate::error::LedgerError;
use crate::invariant::InvariantAlert;
use crate::ledger::types::{
    AccountBalance, AccountId, AccountKind, AppendOutcome, DeadLetter, LedgerEntry,
    ReferenceType, TradeLookup,
};
use crate::reconciliation::types::{
    HistoryPoint, LatchClear, ReconciliationEvaluation, ReconciliationState, SafetyState,
};

type BalanceKey = (AccountId, String);

#[derive(Default)]
struct Inner {
    entries: FxHashMap<String, LedgerEntry>,
    /// Insertion order, used for trade lookups
    entry_order: Vec<String>,
    accounts: FxHashSet<BalanceKey>,
    balances: FxHashMap<BalanceKey, i64>,
    dead_letters: Vec<DeadLetter>,
    recon: BTreeMap<String, ReconciliationState>,
    safety: BTreeMap<String, SafetyState>,
    history: Vec<HistoryPoint>,
    next_history_id: i64,
    alerts: Vec<InvariantAlert>,
    corrections: FxHashMap<String, CorrectionRequest>,
}

impl Inner {
    /// Apply an entry that is known to be new. Every new balance is computed
    /// before anything is written, so an overflow leaves the store untouched.
    fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let mut next: FxHashMap<BalanceKey, i64> = FxHashMap::default();
        for posting in &entry.postings {
            let key = (posting.account_id.clone(), posting.currency.clone());
            let current = match next.get(&key) {
                Some(balance) => *balance,
                None => self.balances.get(&key).copied().unwrap_or(0),
            };
            let updated = current
                .checked_add(posting.signed_delta())
                .ok_or(LedgerError::Overflow)?;
            next.insert(key, updated);
        }

        for (key, balance) in next {
            self.accounts.insert(key.clone());
            self.balances.insert(key, balance);
        }
        self.entry_order.push(entry.entry_id.clone());
        self.entries.insert(entry.entry_id.clone(), entry.clone());
        Ok(())
    }

    fn push_history(&mut self, evaluation: &ReconciliationEvaluation) {
        self.next_history_id += 1;
        self.history.push(HistoryPoint {
            id: self.next_history_id,
            evaluation: evaluation.clone(),
        });
    }

    fn posting_totals(&self) -> Result<FxHashMap<BalanceKey, i64>, LedgerError> {
        let mut totals: FxHashMap<BalanceKey, i64> = FxHashMap::default();
        for entry in self.entries.values() {
            for posting in &entry.postings {
                let total = totals
                    .entry((posting.account_id.clone(), posting.currency.clone()))
                    .or_insert(0);
                *total = total
                    .checked_add(posting.signed_delta())
                    .ok_or(LedgerError::Overflow)?;
            }
        }
        Ok(totals)
    }
}

/// Mutex-guarded store for tests and embedded use
pub struct InMemoryLedgerStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every entry append fail with a storage error until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, LedgerError> {
        self.inner
            .lock()
            .map_err(|_| LedgerError::Storage("in-memory store lock poisoned".to_string()))
    }

    fn check_writable(&self) -> Result<(), LedgerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::Storage("injected write failure".to_string()));
        }
        Ok(())
    }

    /// Overwrite one materialized balance, bypassing postings
    #[cfg(test)]
    pub(crate) fn overwrite_balance(&self, account_id: &AccountId, balance: i64) {
        if let Ok(mut inner) = self.inner.lock() {
            let key = (account_id.clone(), account_id.currency().to_string());
            inner.accounts.insert(key.clone());
            inner.balances.insert(key, balance);
        }
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

fn to_balances(map: &FxHashMap<BalanceKey, i64>) -> Vec<AccountBalance> {
    let mut rows: Vec<AccountBalance> = map
        .iter()
        .map(|((account_id, currency), balance)| AccountBalance {
            account_id: account_id.clone(),
            currency: currency.clone(),
            balance: *balance,
        })
        .collect();
    rows.sort_by_key(|b| b.key());
    rows
}

fn advance(
    recon: &mut BTreeMap<String, ReconciliationState>,
    symbol: &str,
    at: DateTime<Utc>,
    bump: impl FnOnce(&mut ReconciliationState),
) -> ReconciliationState {
    let state = recon
        .entry(symbol.to_string())
        .or_insert_with(|| ReconciliationState::empty(symbol));
    bump(state);
    state.updated_at = Some(at);
    state.clone()
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append_entry(&self, entry: &LedgerEntry) -> Result<AppendOutcome, LedgerError> {
        self.check_writable()?;
        let mut inner = self.lock()?;
        if inner.entries.contains_key(&entry.entry_id) {
            return Ok(AppendOutcome::Duplicate);
        }
        inner.insert_entry(entry)?;
        Ok(AppendOutcome::Applied)
    }

    async fn get_entry(&self, entry_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.lock()?.entries.get(entry_id).cloned())
    }

    async fn find_trade(&self, trade_id: &str) -> Result<Option<TradeLookup>, LedgerError> {
        let inner = self.lock()?;
        let found = inner
            .entry_order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .filter(|e| e.reference_type == ReferenceType::Trade && e.reference_id == trade_id)
            .max_by_key(|e| e.occurred_at)
            .map(|e| TradeLookup {
                trade_id: trade_id.to_string(),
                entry_id: e.entry_id.clone(),
                symbol: e.symbol.clone(),
                engine_seq: e.engine_seq,
                occurred_at: e.occurred_at,
            });
        Ok(found)
    }

    async fn list_balances(&self) -> Result<Vec<AccountBalance>, LedgerError> {
        Ok(to_balances(&self.lock()?.balances))
    }

    async fn posting_totals(&self) -> Result<Vec<AccountBalance>, LedgerError> {
        Ok(to_balances(&self.lock()?.posting_totals()?))
    }

    async fn balance_totals_by_kind(&self) -> Result<BalanceTotals, LedgerError> {
        let inner = self.lock()?;
        let mut totals = BalanceTotals::default();
        for ((account_id, _), balance) in &inner.balances {
            let total = match account_id.kind() {
                AccountKind::Available => &mut totals.available,
                AccountKind::Hold => &mut totals.hold,
            };
            *total = total.checked_add(*balance).ok_or(LedgerError::Overflow)?;
        }
        Ok(totals)
    }

    async fn rebuild_balances(&self, _at: DateTime<Utc>) -> Result<usize, LedgerError> {
        let mut inner = self.lock()?;
        let totals = inner.posting_totals()?;
        let rows = totals.len();
        inner.balances = totals;
        Ok(rows)
    }

    async fn append_dead_letter(&self, letter: &DeadLetter) -> Result<(), LedgerError> {
        self.lock()?.dead_letters.push(letter.clone());
        Ok(())
    }

    async fn dead_letter_count(&self) -> Result<i64, LedgerError> {
        Ok(self.lock()?.dead_letters.len() as i64)
    }

    async fn advance_engine_seq(
        &self,
        symbol: &str,
        seq: SeqNum,
        at: DateTime<Utc>,
    ) -> Result<ReconciliationState, LedgerError> {
        let mut inner = self.lock()?;
        Ok(advance(&mut inner.recon, symbol, at, |s| {
            s.last_engine_seq = s.last_engine_seq.max(seq)
        }))
    }

    async fn advance_settled_seq(
        &self,
        symbol: &str,
        seq: SeqNum,
        at: DateTime<Utc>,
    ) -> Result<ReconciliationState, LedgerError> {
        let mut inner = self.lock()?;
        Ok(advance(&mut inner.recon, symbol, at, |s| {
            s.last_settled_seq = s.last_settled_seq.max(seq)
        }))
    }

    async fn reconciliation_state(
        &self,
        symbol: &str,
    ) -> Result<Option<ReconciliationState>, LedgerError> {
        Ok(self.lock()?.recon.get(symbol).cloned())
    }

    async fn reconciliation_states(&self) -> Result<Vec<ReconciliationState>, LedgerError> {
        Ok(self.lock()?.recon.values().cloned().collect())
    }

    async fn tracked_symbols(&self) -> Result<Vec<String>, LedgerError> {
        let inner = self.lock()?;
        let mut symbols: Vec<String> = inner
            .recon
            .keys()
            .cloned()
            .chain(inner.entries.values().map(|e| e.symbol.clone()))
            .filter(|s| !s.trim().is_empty())
            .collect();
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }

    async fn safety_state(&self, symbol: &str) -> Result<Option<SafetyState>, LedgerError> {
        Ok(self.lock()?.safety.get(symbol).cloned())
    }

    async fn safety_states(&self) -> Result<Vec<SafetyState>, LedgerError> {
        Ok(self.lock()?.safety.values().cloned().collect())
    }

    async fn record_evaluation(
        &self,
        state: &SafetyState,
        expected_version: Option<i64>,
        evaluation: &ReconciliationEvaluation,
    ) -> Result<bool, LedgerError> {
        let mut inner = self.lock()?;
        let current = inner.safety.get(&state.symbol).map(|s| s.version);
        if current != expected_version {
            return Ok(false);
        }
        inner.safety.insert(state.symbol.clone(), state.clone());
        inner.push_history(evaluation);
        Ok(true)
    }

    async fn release_latch(
        &self,
        clear: &LatchClear,
        evaluation: &ReconciliationEvaluation,
    ) -> Result<bool, LedgerError> {
        let mut inner = self.lock()?;
        let Some(state) = inner.safety.get_mut(&clear.symbol) else {
            return Ok(false);
        };
        if !state.latch_engaged || state.version != clear.expected_version {
            return Ok(false);
        }
        state.breach_active = false;
        state.last_lag = clear.lag;
        state.last_mismatch = clear.mismatch;
        state.safety_mode = clear.safety_mode;
        state.last_action_taken = false;
        state.reason = Some(clear.release_reason.clone());
        state.updated_at = clear.released_at;
        state.latch_engaged = false;
        state.latch_reason = None;
        state.latch_released_at = Some(clear.released_at);
        state.latch_released_by = Some(clear.released_by.clone());
        state.version += 1;
        inner.push_history(evaluation);
        Ok(true)
    }

    async fn reconciliation_history(&self, limit: usize) -> Result<Vec<HistoryPoint>, LedgerError> {
        let inner = self.lock()?;
        let mut rows = inner.history.clone();
        rows.sort_by(|a, b| {
            b.evaluation
                .checked_at
                .cmp(&a.evaluation.checked_at)
                .then(b.id.cmp(&a.id))
        });
        rows.truncate(clamp_history_limit(limit));
        Ok(rows)
    }

    async fn unbalanced_entry_count(&self) -> Result<i64, LedgerError> {
        let inner = self.lock()?;
        let mut count = 0i64;
        for entry in inner.entries.values() {
            let mut nets: FxHashMap<&str, i64> = FxHashMap::default();
            for posting in &entry.postings {
                let net = nets.entry(posting.currency.as_str()).or_insert(0);
                *net = net
                    .checked_add(posting.signed_delta())
                    .ok_or(LedgerError::Overflow)?;
            }
            count += nets.values().filter(|net| **net != 0).count() as i64;
        }
        Ok(count)
    }

    async fn negative_balance_count(&self) -> Result<i64, LedgerError> {
        let inner = self.lock()?;
        Ok(inner
            .balances
            .iter()
            .filter(|((account_id, _), balance)| !account_id.is_system() && **balance < 0)
            .count() as i64)
    }

    async fn record_alert(&self, alert: &InvariantAlert) -> Result<(), LedgerError> {
        self.lock()?.alerts.push(alert.clone());
        Ok(())
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<InvariantAlert>, LedgerError> {
        let inner = self.lock()?;
        Ok(inner.alerts.iter().rev().take(limit).cloned().collect())
    }

    async fn create_correction(&self, request: &CorrectionRequest) -> Result<(), LedgerError> {
        let mut inner = self.lock()?;
        if inner.corrections.contains_key(&request.correction_id) {
            return Err(LedgerError::CorrectionAlreadyExists(
                request.correction_id.clone(),
            ));
        }
        inner
            .corrections
            .insert(request.correction_id.clone(), request.clone());
        Ok(())
    }

    async fn get_correction(
        &self,
        correction_id: &str,
    ) -> Result<Option<CorrectionRequest>, LedgerError> {
        Ok(self.lock()?.corrections.get(correction_id).cloned())
    }

    async fn approve_correction(
        &self,
        correction_id: &str,
        approver: &str,
        at: DateTime<Utc>,
    ) -> Result<CorrectionRequest, LedgerError> {
        let mut inner = self.lock()?;
        let request = inner
            .corrections
            .get_mut(correction_id)
            .ok_or_else(|| LedgerError::CorrectionNotFound(correction_id.to_string()))?;
        request.record_approval(approver, at);
        Ok(request.clone())
    }

    async fn apply_correction(
        &self,
        correction_id: &str,
        reversal: &LedgerEntry,
        at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, LedgerError> {
        self.check_writable()?;
        let mut inner = self.lock()?;
        let status = inner
            .corrections
            .get(correction_id)
            .map(|c| c.status)
            .ok_or_else(|| LedgerError::CorrectionNotFound(correction_id.to_string()))?;
        match status {
            CorrectionStatus::Applied => return Ok(ApplyOutcome::AlreadyApplied),
            CorrectionStatus::Pending => return Ok(ApplyOutcome::NotApproved),
            CorrectionStatus::Approved => {}
        }
        if inner.entries.contains_key(&reversal.entry_id) {
            return Ok(ApplyOutcome::Duplicate);
        }
        inner.insert_entry(reversal)?;
        if let Some(request) = inner.corrections.get_mut(correction_id) {
            request.status = CorrectionStatus::Applied;
            request.applied_at = Some(at);
            if request.approved_at.is_none() {
                request.approved_at = Some(at);
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    async fn oldest_pending_correction(&self) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let inner = self.lock()?;
        Ok(inner
            .corrections
            .values()
            .filter(|c| c.status == CorrectionStatus::Pending)
            .map(|c| c.created_at)
            .min())
    }
}
