//! Double-Entry Engine
//!
//! Validates that an entry balances per currency and hands it to the store
//! as one atomic unit. Duplicates are reported, never treated as errors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use super::types::{AppendOutcome, LedgerEntry};
use crate::error::LedgerError;
use crate::metrics::LedgerMetrics;
use crate::store::LedgerStore;

pub struct DoubleEntryEngine {
    store: Arc<dyn LedgerStore>,
    metrics: Arc<LedgerMetrics>,
}

impl DoubleEntryEngine {
    pub fn new(store: Arc<dyn LedgerStore>, metrics: Arc<LedgerMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Reject empty, non-positive, blank or unbalanced entries
    pub fn validate(entry: &LedgerEntry) -> Result<(), LedgerError> {
        if entry.entry_id.trim().is_empty() {
            return Err(LedgerError::InvalidEnvelope(
                "entry_id must not be blank".to_string(),
            ));
        }
        if entry.postings.is_empty() {
            return Err(LedgerError::EmptyEntry {
                entry_id: entry.entry_id.clone(),
            });
        }

        let mut nets: BTreeMap<&str, i64> = BTreeMap::new();
        for posting in &entry.postings {
            if posting.amount <= 0 {
                return Err(LedgerError::NonPositiveAmount(posting.amount));
            }
            if posting.currency.trim().is_empty() {
                return Err(LedgerError::InvalidAccountId(format!(
                    "blank currency on {}",
                    posting.account_id
                )));
            }
            let net = nets.entry(posting.currency.as_str()).or_insert(0);
            *net = net
                .checked_add(posting.signed_delta())
                .ok_or(LedgerError::Overflow)?;
        }

        if let Some((currency, net)) = nets.into_iter().find(|(_, net)| *net != 0) {
            return Err(LedgerError::UnbalancedEntry {
                currency: currency.to_string(),
                net,
            });
        }
        Ok(())
    }

    /// Validate and append one entry.
    ///
    /// `Ok(Duplicate)` means the entry id was already stored and nothing changed.
    pub async fn append_entry(&self, entry: &LedgerEntry) -> Result<AppendOutcome, LedgerError> {
        Self::validate(entry)?;

        let started = Instant::now();
        let outcome = self.store.append_entry(entry).await?;
        self.metrics
            .observe_append_latency(started.elapsed().as_millis() as i64);

        match outcome {
            AppendOutcome::Applied => {
                debug!(entry_id = %entry.entry_id, kind = %entry.entry_kind, "Entry appended");
            }
            AppendOutcome::Duplicate => {
                self.metrics.incr_unique_violation();
                info!(entry_id = %entry.entry_id, "Duplicate entry ignored");
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::{AccountId, AccountKind, EntryKind, Posting, ReferenceType};
    use crate::store::InMemoryLedgerStore;
    use chrono::Utc;

    fn entry(postings: Vec<Posting>) -> LedgerEntry {
        LedgerEntry {
            entry_id: "le_test_1".into(),
            reference_type: ReferenceType::Adjustment,
            reference_id: "ref-1".into(),
            entry_kind: EntryKind::ManualAdjustment,
            symbol: "BTC-KRW".into(),
            engine_seq: 3,
            occurred_at: Utc::now(),
            correlation_id: "corr".into(),
            causation_id: "cause".into(),
            postings,
        }
    }

    fn krw(user: &str) -> AccountId {
        AccountId::user(user, "KRW", AccountKind::Available)
    }

    fn engine() -> (DoubleEntryEngine, Arc<InMemoryLedgerStore>, Arc<LedgerMetrics>) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let metrics = Arc::new(LedgerMetrics::new());
        (
            DoubleEntryEngine::new(store.clone(), metrics.clone()),
            store,
            metrics,
        )
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(matches!(
            DoubleEntryEngine::validate(&entry(vec![])),
            Err(LedgerError::EmptyEntry { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_non_positive() {
        let e = entry(vec![Posting::debit(krw("a"), 0), Posting::credit(krw("b"), 0)]);
        assert_eq!(
            DoubleEntryEngine::validate(&e),
            Err(LedgerError::NonPositiveAmount(0))
        );
    }

    #[test]
    fn test_validate_rejects_unbalanced_per_currency() {
        let btc = AccountId::user("b", "BTC", AccountKind::Available);
        // Totals across currencies net to zero, per currency they do not
        let e = entry(vec![Posting::debit(krw("a"), 5), Posting::credit(btc, 5)]);
        assert_eq!(
            DoubleEntryEngine::validate(&e),
            Err(LedgerError::UnbalancedEntry {
                currency: "BTC".into(),
                net: -5
            })
        );
    }

    #[test]
    fn test_validate_rejects_overflow() {
        let e = entry(vec![
            Posting::debit(krw("a"), i64::MAX),
            Posting::debit(krw("b"), 1),
            Posting::credit(krw("c"), 1),
        ]);
        assert_eq!(DoubleEntryEngine::validate(&e), Err(LedgerError::Overflow));
    }

    #[tokio::test]
    async fn test_balance_overflow_rejected_without_writes() {
        let (engine, store, _) = engine();
        let mut first = entry(vec![
            Posting::debit(krw("a"), i64::MAX),
            Posting::credit(krw("b"), i64::MAX),
        ]);
        first.entry_id = "le_test_max".into();
        engine.append_entry(&first).await.unwrap();

        let mut second = entry(vec![Posting::debit(krw("a"), 1), Posting::credit(krw("c"), 1)]);
        second.entry_id = "le_test_over".into();
        assert_eq!(engine.append_entry(&second).await, Err(LedgerError::Overflow));
        assert!(store.get_entry("le_test_over").await.unwrap().is_none());
        assert_eq!(store.list_balances().await.unwrap().len(), 2);

        // Store stays usable for other accounts
        let mut other = entry(vec![Posting::debit(krw("d"), 5), Posting::credit(krw("e"), 5)]);
        other.entry_id = "le_test_other".into();
        assert_eq!(engine.append_entry(&other).await.unwrap(), AppendOutcome::Applied);
        assert_eq!(store.list_balances().await.unwrap().len(), 4);
        assert_eq!(store.unbalanced_entry_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_append_then_duplicate() {
        let (engine, store, metrics) = engine();
        let e = entry(vec![Posting::debit(krw("a"), 7), Posting::credit(krw("b"), 7)]);

        assert_eq!(engine.append_entry(&e).await.unwrap(), AppendOutcome::Applied);
        assert_eq!(engine.append_entry(&e).await.unwrap(), AppendOutcome::Duplicate);
        assert_eq!(metrics.snapshot().unique_violation_total, 1);

        let stored = store.get_entry("le_test_1").await.unwrap().unwrap();
        assert_eq!(stored.postings.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_entry_writes_nothing() {
        let (engine, store, _) = engine();
        let e = entry(vec![Posting::debit(krw("a"), 7), Posting::credit(krw("b"), 6)]);

        assert!(engine.append_entry(&e).await.is_err());
        assert!(store.get_entry("le_test_1").await.unwrap().is_none());
        assert!(store.list_balances().await.unwrap().is_empty());
    }
}
