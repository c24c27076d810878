//! Settlement Adapter
//!
//! Turns trade fills, order holds and manual adjustments into balanced
//! entries and drives them through the [`DoubleEntryEngine`].
//!
//! # Trade fill postings (BASE-QUOTE)
//!
//! | Account                          | Side   | Amount                 |
//! |----------------------------------|--------|------------------------|
//! | seller `QUOTE` AVAILABLE         | debit  | quote - fee_seller     |
//! | buyer `QUOTE` HOLD               | credit | quote + fee_buyer      |
//! | buyer `BASE` AVAILABLE           | debit  | quantity               |
//! | seller `BASE` HOLD               | credit | quantity               |
//! | `system:fees:QUOTE:AVAILABLE`    | debit  | fee_buyer + fee_seller |
//!
//! Zero-amount legs are left out. A trade that cannot be settled for any
//! reason is written to the dead-letter store and reported as `dlq`.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::engine::DoubleEntryEngine;
use super::events::{BalanceAdjustmentCommand, EventEnvelope, ReserveCommand, TradeExecuted};
use super::types::{
    AccountId, AccountKind, DeadLetter, EntryKind, LedgerEntry, Posting, ReferenceType,
    SettlementReason, SettlementResult, Side, SymbolParts, TradeLookup,
};
use crate::clock::Clock;
use crate::core_types::{Amount, EntryId, SeqNum};
use crate::error::LedgerError;
use crate::ledger::events::normalize_symbol;
use crate::metrics::LedgerMetrics;
use crate::reconciliation::types::ReconciliationState;
use crate::store::LedgerStore;

/// Direction of a hold movement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldMove {
    Reserve,
    Release,
}

pub struct SettlementAdapter {
    engine: Arc<DoubleEntryEngine>,
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<LedgerMetrics>,
}

impl SettlementAdapter {
    pub fn new(
        engine: Arc<DoubleEntryEngine>,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        Self {
            engine,
            store,
            clock,
            metrics,
        }
    }

    /// Settle one trade fill. Never fails: errors become dead letters.
    pub async fn consume_trade(&self, event: &TradeExecuted) -> SettlementResult {
        let entry_id = format!("le_trade_{}", event.trade_id);

        match self.settle_trade(&entry_id, event).await {
            Ok(result) => result,
            Err(e) => {
                self.metrics.incr_settlement_failure();
                self.metrics.incr_dlq();
                error!(
                    trade_id = %event.trade_id,
                    error = %e,
                    code = e.code(),
                    "Settlement failed, writing dead letter"
                );

                let letter = DeadLetter {
                    event_id: event.trade_id.clone(),
                    reason: e.to_string(),
                    payload: event.dead_letter_payload(),
                    created_at: self.clock.now(),
                };
                if let Err(dlq_err) = self.store.append_dead_letter(&letter).await {
                    error!(
                        trade_id = %event.trade_id,
                        error = %dlq_err,
                        "CRITICAL: Dead letter write failed"
                    );
                }
                SettlementResult::new(entry_id, SettlementReason::Dlq)
            }
        }
    }

    async fn settle_trade(
        &self,
        entry_id: &str,
        event: &TradeExecuted,
    ) -> Result<SettlementResult, LedgerError> {
        let envelope = event.envelope.validate()?;
        let entry = trade_to_entry(entry_id, event, &envelope)?;

        let outcome = self.engine.append_entry(&entry).await?;
        if !outcome.is_applied() {
            info!(trade_id = %event.trade_id, "Duplicate trade");
            return Ok(SettlementResult::from_outcome(entry_id, outcome));
        }

        let now = self.clock.now();
        self.store
            .advance_settled_seq(&envelope.symbol, envelope.seq, now)
            .await?;
        self.metrics
            .observe_settlement_lag((now - envelope.occurred_at).num_milliseconds());
        self.refresh_reserve_metrics().await;

        info!(
            trade_id = %event.trade_id,
            symbol = %envelope.symbol,
            seq = envelope.seq,
            "Trade settled"
        );
        Ok(SettlementResult::from_outcome(entry_id, outcome))
    }

    /// Move `amount` from AVAILABLE to HOLD for the side's currency
    pub async fn reserve(&self, command: &ReserveCommand) -> Result<SettlementResult, LedgerError> {
        self.move_hold(command, HoldMove::Reserve).await
    }

    /// Move `amount` from HOLD back to AVAILABLE for the side's currency
    pub async fn release(&self, command: &ReserveCommand) -> Result<SettlementResult, LedgerError> {
        self.move_hold(command, HoldMove::Release).await
    }

    async fn move_hold(
        &self,
        command: &ReserveCommand,
        direction: HoldMove,
    ) -> Result<SettlementResult, LedgerError> {
        if command.amount <= 0 {
            return Err(LedgerError::NonPositiveAmount(command.amount));
        }
        require_id("order_id", &command.order_id)?;
        let envelope = command.envelope.validate()?;
        let parts = SymbolParts::parse(&envelope.symbol)?;
        let side: Side = command.side.parse()?;
        let currency = side.hold_currency(&parts);

        let available = AccountId::try_user(&command.user_id, currency, AccountKind::Available)?;
        let hold = AccountId::try_user(&command.user_id, currency, AccountKind::Hold)?;

        let (entry_id, kind, postings) = match direction {
            HoldMove::Reserve => (
                format!("le_reserve_{}", command.order_id),
                EntryKind::Reserve,
                vec![
                    Posting::debit(hold, command.amount),
                    Posting::credit(available, command.amount),
                ],
            ),
            HoldMove::Release => (
                format!("le_release_{}", command.order_id),
                EntryKind::Release,
                vec![
                    Posting::debit(available, command.amount),
                    Posting::credit(hold, command.amount),
                ],
            ),
        };

        let entry = entry_from_envelope(
            entry_id,
            ReferenceType::Order,
            &command.order_id,
            kind,
            &envelope,
            postings,
        );
        let outcome = self.engine.append_entry(&entry).await?;
        self.refresh_reserve_metrics().await;
        Ok(SettlementResult::from_outcome(entry.entry_id, outcome))
    }

    /// Credit (positive delta) or debit (negative delta) a user's AVAILABLE
    /// balance against the currency's treasury account
    pub async fn adjust_available(
        &self,
        command: &BalanceAdjustmentCommand,
    ) -> Result<SettlementResult, LedgerError> {
        if command.amount_delta == 0 {
            return Err(LedgerError::ZeroAdjustment);
        }
        require_id("reference_id", &command.reference_id)?;
        let amount = command
            .amount_delta
            .checked_abs()
            .ok_or(LedgerError::Overflow)?;
        let envelope = command.envelope.validate()?;

        let user = AccountId::try_user(&command.user_id, &command.currency, AccountKind::Available)?;
        let treasury = AccountId::system("treasury", &command.currency);
        let postings = if command.amount_delta > 0 {
            vec![Posting::debit(user, amount), Posting::credit(treasury, amount)]
        } else {
            vec![Posting::debit(treasury, amount), Posting::credit(user, amount)]
        };

        let entry = entry_from_envelope(
            format!("le_adj_{}", command.reference_id),
            ReferenceType::Adjustment,
            &command.reference_id,
            EntryKind::ManualAdjustment,
            &envelope,
            postings,
        );
        let outcome = self.engine.append_entry(&entry).await?;
        self.refresh_reserve_metrics().await;

        info!(
            reference_id = %command.reference_id,
            user_id = %command.user_id,
            delta = command.amount_delta,
            applied = outcome.is_applied(),
            "Balance adjusted"
        );
        Ok(SettlementResult::from_outcome(entry.entry_id, outcome))
    }

    /// Side-channel that only advances `last_engine_seq`
    pub async fn observe_engine_seq(
        &self,
        symbol: &str,
        seq: SeqNum,
    ) -> Result<ReconciliationState, LedgerError> {
        let symbol = normalize_symbol(symbol)?;
        if seq < 0 {
            return Err(LedgerError::InvalidEnvelope(format!(
                "seq must be >= 0: got {}",
                seq
            )));
        }
        self.store
            .advance_engine_seq(&symbol, seq, self.clock.now())
            .await
    }

    /// Advance `last_engine_seq` and return the refreshed status
    pub async fn update_engine_seq(
        &self,
        symbol: &str,
        seq: SeqNum,
    ) -> Result<ReconciliationState, LedgerError> {
        self.observe_engine_seq(symbol, seq).await?;
        self.reconciliation(symbol).await
    }

    /// Current sequence status for one symbol (zeros when never seen)
    pub async fn reconciliation(&self, symbol: &str) -> Result<ReconciliationState, LedgerError> {
        let symbol = normalize_symbol(symbol)?;
        let state = self
            .store
            .reconciliation_state(&symbol)
            .await?
            .unwrap_or_else(|| ReconciliationState::empty(&symbol));
        let age_ms = state
            .updated_at
            .map(|at| (self.clock.now() - at).num_milliseconds())
            .unwrap_or(0);
        self.metrics
            .set_reconciliation_for_symbol(&state.symbol, state.lag(), age_ms);
        Ok(state)
    }

    pub async fn find_trade(&self, trade_id: &str) -> Result<Option<TradeLookup>, LedgerError> {
        self.store.find_trade(trade_id).await
    }

    pub async fn dead_letter_count(&self) -> Result<i64, LedgerError> {
        self.store.dead_letter_count().await
    }

    async fn refresh_reserve_metrics(&self) {
        match self.store.balance_totals_by_kind().await {
            Ok(totals) => self
                .metrics
                .set_reserve_available(totals.hold, totals.available),
            Err(e) => warn!(error = %e, "Failed to refresh reserve metrics"),
        }
    }
}

fn require_id(field: &str, value: &str) -> Result<(), LedgerError> {
    if value.trim().is_empty() {
        return Err(LedgerError::InvalidEnvelope(format!("{} must not be blank", field)));
    }
    Ok(())
}

fn entry_from_envelope(
    entry_id: EntryId,
    reference_type: ReferenceType,
    reference_id: &str,
    entry_kind: EntryKind,
    envelope: &EventEnvelope,
    postings: Vec<Posting>,
) -> LedgerEntry {
    LedgerEntry {
        entry_id,
        reference_type,
        reference_id: reference_id.to_string(),
        entry_kind,
        symbol: envelope.symbol.clone(),
        engine_seq: envelope.seq,
        occurred_at: envelope.occurred_at,
        correlation_id: envelope.correlation_id.clone(),
        causation_id: envelope.causation_id.clone(),
        postings,
    }
}

/// Build the FILL entry for a trade. `envelope` must already be validated.
fn trade_to_entry(
    entry_id: &str,
    event: &TradeExecuted,
    envelope: &EventEnvelope,
) -> Result<LedgerEntry, LedgerError> {
    require_id("trade_id", &event.trade_id)?;
    if event.price <= 0 {
        return Err(LedgerError::InvalidTrade(format!(
            "price must be > 0: got {}",
            event.price
        )));
    }
    if event.quantity <= 0 {
        return Err(LedgerError::InvalidTrade(format!(
            "quantity must be > 0: got {}",
            event.quantity
        )));
    }
    if event.fee_buyer < 0 || event.fee_seller < 0 {
        return Err(LedgerError::InvalidTrade("fees must be >= 0".to_string()));
    }

    let parts = SymbolParts::parse(&envelope.symbol)?;
    let quote_amount: Amount = if event.quote_amount > 0 {
        event.quote_amount
    } else {
        event
            .price
            .checked_mul(event.quantity)
            .ok_or(LedgerError::Overflow)?
    };
    let buyer_gross_quote = quote_amount
        .checked_add(event.fee_buyer)
        .ok_or(LedgerError::Overflow)?;
    let seller_net_quote = quote_amount - event.fee_seller;
    if seller_net_quote < 0 {
        return Err(LedgerError::InvalidTrade(
            "fee_seller exceeds quote amount".to_string(),
        ));
    }
    let total_fee = event
        .fee_buyer
        .checked_add(event.fee_seller)
        .ok_or(LedgerError::Overflow)?;

    let buyer = &event.buyer_user_id;
    let seller = &event.seller_user_id;
    let mut postings = Vec::with_capacity(5);
    if seller_net_quote > 0 {
        postings.push(Posting::debit(
            AccountId::try_user(seller, &parts.quote, AccountKind::Available)?,
            seller_net_quote,
        ));
    }
    postings.push(Posting::credit(
        AccountId::try_user(buyer, &parts.quote, AccountKind::Hold)?,
        buyer_gross_quote,
    ));
    postings.push(Posting::debit(
        AccountId::try_user(buyer, &parts.base, AccountKind::Available)?,
        event.quantity,
    ));
    postings.push(Posting::credit(
        AccountId::try_user(seller, &parts.base, AccountKind::Hold)?,
        event.quantity,
    ));
    if total_fee > 0 {
        postings.push(Posting::debit(
            AccountId::system("fees", &parts.quote),
            total_fee,
        ));
    }

    Ok(entry_from_envelope(
        entry_id.to_string(),
        ReferenceType::Trade,
        &event.trade_id,
        EntryKind::Fill,
        envelope,
        postings,
    ))
}
