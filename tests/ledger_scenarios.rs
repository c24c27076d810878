use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};

use exchange_ledger::clock::ManualClock;
use exchange_ledger::config::AppConfig;
use exchange_ledger::correction::{CorrectionStatus, NewCorrection};
use exchange_ledger::ledger::types::{AccountId, AccountKind, SettlementReason};
use exchange_ledger::ledger::{
    BalanceAdjustmentCommand, EventEnvelope, ReserveCommand, TradeExecuted,
};
use exchange_ledger::reconciliation::{
    DisabledSafetyActuator, LatchReleaseRequest, ModeChangeOutcome, SafetyMode,
    SafetyModeActuator,
};
use exchange_ledger::LedgerServices;

const SYMBOL: &str = "BTC-KRW";
const ONE_BTC_PRICE: i64 = 100_000_000;

/// Records every mode request and accepts them all
#[derive(Default)]
struct RecordingActuator {
    requests: Mutex<Vec<(String, SafetyMode)>>,
}

#[async_trait]
impl SafetyModeActuator for RecordingActuator {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn set_symbol_mode(
        &self,
        symbol: &str,
        mode: SafetyMode,
        _reason: &str,
    ) -> ModeChangeOutcome {
        self.requests
            .lock()
            .unwrap()
            .push((symbol.to_string(), mode));
        ModeChangeOutcome::Accepted
    }
}

struct Harness {
    services: LedgerServices,
    clock: Arc<ManualClock>,
}

fn config() -> AppConfig {
    AppConfig::from_yaml(
        "inline",
        r#"
log_level: info
log_dir: ./logs
log_file: ledger.log
use_json: false
rotation: never
reconciliation:
  lag_threshold: 10
  state_stale_ms: 0
"#,
    )
    .unwrap()
}

fn harness_with(actuator: Arc<dyn SafetyModeActuator>) -> Harness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
    ));
    let services = LedgerServices::new(
        Arc::new(exchange_ledger::store::InMemoryLedgerStore::new()),
        actuator,
        clock.clone(),
        config(),
    );
    Harness { services, clock }
}

fn harness() -> Harness {
    harness_with(Arc::new(DisabledSafetyActuator))
}

fn envelope(event_id: &str, seq: i64) -> EventEnvelope {
    EventEnvelope {
        event_id: event_id.to_string(),
        event_version: 1,
        symbol: SYMBOL.to_string(),
        seq,
        occurred_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        correlation_id: "corr-1".to_string(),
        causation_id: "cause-1".to_string(),
    }
}

fn trade(trade_id: &str, seq: i64) -> TradeExecuted {
    TradeExecuted {
        envelope: envelope(&format!("evt-{}", trade_id), seq),
        trade_id: trade_id.to_string(),
        buyer_user_id: "buyer".to_string(),
        seller_user_id: "seller".to_string(),
        price: ONE_BTC_PRICE,
        quantity: 1,
        quote_amount: 0,
        fee_buyer: 0,
        fee_seller: 0,
    }
}

async fn fund(h: &Harness, user: &str, currency: &str, amount: i64) {
    let command = BalanceAdjustmentCommand {
        envelope: envelope(&format!("fund-{}-{}", user, currency), 0),
        reference_id: format!("fund-{}-{}", user, currency),
        user_id: user.to_string(),
        currency: currency.to_string(),
        amount_delta: amount,
    };
    let result = h.services.settlement.adjust_available(&command).await.unwrap();
    assert!(result.applied);
}

async fn reserve(h: &Harness, order_id: &str, user: &str, side: &str, amount: i64) {
    let command = ReserveCommand {
        envelope: envelope(&format!("reserve-{}", order_id), 0),
        order_id: order_id.to_string(),
        user_id: user.to_string(),
        side: side.to_string(),
        amount,
    };
    let result = h.services.settlement.reserve(&command).await.unwrap();
    assert!(result.applied);
}

/// Fund and hold both sides of a one-BTC trade
async fn prepare_trade(h: &Harness) {
    fund(h, "buyer", "KRW", ONE_BTC_PRICE).await;
    fund(h, "seller", "BTC", 1).await;
    reserve(h, "o-buy", "buyer", "BUY", ONE_BTC_PRICE).await;
    reserve(h, "o-sell", "seller", "SELL", 1).await;
}

async fn balance(h: &Harness, user: &str, currency: &str, kind: AccountKind) -> i64 {
    let account = AccountId::user(user, currency, kind);
    h.services
        .list_balances()
        .await
        .unwrap()
        .into_iter()
        .find(|b| b.account_id == account)
        .map(|b| b.balance)
        .unwrap_or(0)
}

#[tokio::test]
async fn test_fill_moves_holds_to_counterparties() {
    let h = harness();
    prepare_trade(&h).await;
    assert_eq!(balance(&h, "buyer", "KRW", AccountKind::Hold).await, ONE_BTC_PRICE);
    assert_eq!(balance(&h, "buyer", "KRW", AccountKind::Available).await, 0);

    let result = h.services.settlement.consume_trade(&trade("t-1", 1)).await;
    assert!(result.applied);
    assert_eq!(result.entry_id, "le_trade_t-1");

    assert_eq!(balance(&h, "buyer", "KRW", AccountKind::Hold).await, 0);
    assert_eq!(balance(&h, "buyer", "BTC", AccountKind::Available).await, 1);
    assert_eq!(balance(&h, "seller", "BTC", AccountKind::Hold).await, 0);
    assert_eq!(
        balance(&h, "seller", "KRW", AccountKind::Available).await,
        ONE_BTC_PRICE
    );

    let check = h.services.check_invariants().await.unwrap();
    assert!(check.ok, "violations: {:?}", check.violations);

    let lookup = h.services.settlement.find_trade("t-1").await.unwrap().unwrap();
    assert_eq!(lookup.symbol, SYMBOL);
    assert_eq!(lookup.engine_seq, 1);
}

#[tokio::test]
async fn test_concurrent_duplicate_trades_settle_once() {
    let h = harness();
    prepare_trade(&h).await;

    let event = trade("t-dup", 1);
    let results = futures::future::join_all(
        (0..8).map(|_| h.services.settlement.consume_trade(&event)),
    )
    .await;

    let applied = results.iter().filter(|r| r.applied).count();
    let duplicates = results
        .iter()
        .filter(|r| r.reason == SettlementReason::Duplicate)
        .count();
    assert_eq!(applied, 1);
    assert_eq!(duplicates, 7);
    assert_eq!(
        balance(&h, "seller", "KRW", AccountKind::Available).await,
        ONE_BTC_PRICE
    );
    assert_eq!(h.services.settlement.dead_letter_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_reserve_then_release_restores_balances() {
    let h = harness();
    fund(&h, "alice", "KRW", 5_000).await;
    reserve(&h, "o-1", "alice", "BUY", 3_000).await;
    assert_eq!(balance(&h, "alice", "KRW", AccountKind::Available).await, 2_000);
    assert_eq!(balance(&h, "alice", "KRW", AccountKind::Hold).await, 3_000);

    let release = ReserveCommand {
        envelope: envelope("release-o-1", 0),
        order_id: "o-1".to_string(),
        user_id: "alice".to_string(),
        side: "buy".to_string(),
        amount: 3_000,
    };
    let result = h.services.settlement.release(&release).await.unwrap();
    assert!(result.applied);
    assert_eq!(result.entry_id, "le_release_o-1");

    assert_eq!(balance(&h, "alice", "KRW", AccountKind::Available).await, 5_000);
    assert_eq!(balance(&h, "alice", "KRW", AccountKind::Hold).await, 0);
}

#[tokio::test]
async fn test_rebuild_matches_incremental_view() {
    let h = harness();
    prepare_trade(&h).await;
    h.services.settlement.consume_trade(&trade("t-1", 1)).await;

    let before = h.services.list_balances().await.unwrap();
    let rebuilt = h.services.rebuild_balances().await.unwrap();
    let after = h.services.list_balances().await.unwrap();

    assert_eq!(rebuilt, after.len());
    let mut before: Vec<(String, i64)> = before.iter().map(|b| (b.key(), b.balance)).collect();
    let mut after: Vec<(String, i64)> = after.iter().map(|b| (b.key(), b.balance)).collect();
    before.sort();
    after.sort();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_latch_sticks_until_operator_release() {
    let h = harness();
    prepare_trade(&h).await;

    // Engine runs 20 ahead of settlement: lag 20 > threshold 10
    h.services.settlement.observe_engine_seq(SYMBOL, 20).await.unwrap();
    let summary = h.services.reconciliation.run_evaluation().await.unwrap();
    assert_eq!(summary.breached_symbols(), vec![SYMBOL]);

    let request = LatchReleaseRequest {
        symbol: "btc-krw".to_string(),
        approved_by: "ops-1".to_string(),
        reason: "caught up".to_string(),
        restore_symbol_mode: false,
    };
    let denied = h.services.release_latch(&request).await.unwrap();
    assert!(!denied.released);
    assert_eq!(denied.reason, "still_breached");
    assert_eq!(denied.lag, 20);

    // Settlement catches up; the latch stays engaged
    h.services.settlement.consume_trade(&trade("t-20", 20)).await;
    h.clock.advance(Duration::seconds(1));
    let summary = h.services.reconciliation.run_evaluation().await.unwrap();
    assert!(summary.breached_symbols().is_empty());

    let dashboard = h.services.reconciliation_status(10).await.unwrap();
    let status = dashboard
        .statuses
        .iter()
        .find(|s| s.symbol == SYMBOL)
        .unwrap();
    assert_eq!(status.lag, 0);
    assert!(status.latch_engaged);
    assert!(status.breach_active);

    let released = h.services.release_latch(&request).await.unwrap();
    assert!(released.released, "denied: {}", released.reason);
    assert_eq!(released.reason, "manual_latch_release:caught up");
    assert_eq!(released.released_by.as_deref(), Some("ops-1"));
    assert!(!released.mode_restored);

    let again = h.services.release_latch(&request).await.unwrap();
    assert_eq!(again.reason, "latch_not_engaged");

    let snapshot = h.services.metrics.snapshot();
    assert_eq!(snapshot.latch_release_attempt_total, 3);
    assert_eq!(snapshot.latch_release_success_total, 1);
}

#[tokio::test]
async fn test_release_can_restore_normal_mode() {
    let actuator = Arc::new(RecordingActuator::default());
    let h = harness_with(actuator.clone());
    prepare_trade(&h).await;

    h.services.settlement.observe_engine_seq(SYMBOL, 15).await.unwrap();
    h.services.reconciliation.run_evaluation().await.unwrap();
    h.services.settlement.consume_trade(&trade("t-15", 15)).await;
    h.services.reconciliation.run_evaluation().await.unwrap();

    let result = h
        .services
        .release_latch(&LatchReleaseRequest {
            symbol: SYMBOL.to_string(),
            approved_by: "ops-1".to_string(),
            reason: "recovered".to_string(),
            restore_symbol_mode: true,
        })
        .await
        .unwrap();
    assert!(result.released);
    assert!(result.mode_restored);

    let requests = actuator.requests.lock().unwrap().clone();
    assert_eq!(
        requests,
        vec![
            (SYMBOL.to_string(), SafetyMode::CancelOnly),
            (SYMBOL.to_string(), SafetyMode::Normal),
        ]
    );
}

#[tokio::test]
async fn test_correction_needs_two_approvers_and_applies_once() {
    let h = harness();
    prepare_trade(&h).await;
    h.services.settlement.consume_trade(&trade("t-1", 1)).await;

    let request = h
        .services
        .corrections
        .create(&NewCorrection {
            correction_id: "c-1".to_string(),
            original_entry_id: "le_trade_t-1".to_string(),
            mode: "reversal".to_string(),
            reason: "wrong counterparty".to_string(),
            ticket_id: "OPS-42".to_string(),
            requested_by: "ops-0".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(request.status, CorrectionStatus::Pending);

    let not_yet = h.services.corrections.apply("c-1", "corr", "cause").await.unwrap();
    assert_eq!(not_yet.reason, SettlementReason::NotApproved);

    h.services.corrections.approve("c-1", "ops-1").await.unwrap();
    let same = h.services.corrections.approve("c-1", "ops-1").await.unwrap();
    assert_eq!(same.status, CorrectionStatus::Pending);
    let approved = h.services.corrections.approve("c-1", "ops-2").await.unwrap();
    assert_eq!(approved.status, CorrectionStatus::Approved);

    let applied = h.services.corrections.apply("c-1", "corr", "cause").await.unwrap();
    assert!(applied.applied);
    assert_eq!(applied.entry_id, "le_corr_c-1");
    let again = h.services.corrections.apply("c-1", "corr", "cause").await.unwrap();
    assert_eq!(again.reason, SettlementReason::AlreadyApplied);

    // Reversal puts the funds back on hold
    assert_eq!(balance(&h, "buyer", "KRW", AccountKind::Hold).await, ONE_BTC_PRICE);
    assert_eq!(balance(&h, "buyer", "BTC", AccountKind::Available).await, 0);
    assert_eq!(balance(&h, "seller", "KRW", AccountKind::Available).await, 0);
    assert_eq!(
        h.services.corrections.get("c-1").await.unwrap().unwrap().status,
        CorrectionStatus::Applied
    );
}

#[tokio::test]
async fn test_invalid_trade_lands_in_dead_letters() {
    let h = harness();
    let mut bad = trade("t-bad", 1);
    bad.price = 0;

    let result = h.services.settlement.consume_trade(&bad).await;
    assert!(!result.applied);
    assert_eq!(result.reason, SettlementReason::Dlq);
    assert_eq!(h.services.settlement.dead_letter_count().await.unwrap(), 1);
    assert!(h.services.list_balances().await.unwrap().is_empty());
}
