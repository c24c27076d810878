//! Inbound Event Types
//!
//! Trade fills, order holds and manual adjustments as they arrive from the
//! upstream bus or admin tooling. Every event carries an [`EventEnvelope`]
//! that is validated and normalized before it reaches the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{Amount, SeqNum};
use crate::error::LedgerError;

/// Only envelope version accepted at the boundary
pub const SUPPORTED_EVENT_VERSION: i32 = 1;

const SYMBOL_SIDE_MIN: usize = 2;
const SYMBOL_SIDE_MAX: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_version: i32,
    pub symbol: String,
    pub seq: SeqNum,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: String,
    pub causation_id: String,
}

impl EventEnvelope {
    /// Boundary validation. Returns the envelope with its symbol uppercased.
    pub fn validate(&self) -> Result<Self, LedgerError> {
        require_non_blank("event_id", &self.event_id)?;
        require_non_blank("correlation_id", &self.correlation_id)?;
        require_non_blank("causation_id", &self.causation_id)?;

        if self.event_version != SUPPORTED_EVENT_VERSION {
            return Err(LedgerError::UnsupportedEventVersion(self.event_version));
        }
        if self.seq < 0 {
            return Err(LedgerError::InvalidEnvelope(format!(
                "seq must be >= 0: got {}",
                self.seq
            )));
        }

        Ok(Self {
            symbol: normalize_symbol(&self.symbol)?,
            event_id: self.event_id.trim().to_string(),
            ..self.clone()
        })
    }
}

/// Uppercase a symbol and check it is `BASE-QUOTE` with 2..=16 alphanumerics per side
pub fn normalize_symbol(symbol: &str) -> Result<String, LedgerError> {
    let upper = symbol.trim().to_ascii_uppercase();
    let valid_side = |side: &str| {
        (SYMBOL_SIDE_MIN..=SYMBOL_SIDE_MAX).contains(&side.len())
            && side.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
    };
    match upper.split_once('-') {
        Some((base, quote)) if valid_side(base) && valid_side(quote) => Ok(upper),
        _ => Err(LedgerError::InvalidSymbol(symbol.to_string())),
    }
}

fn require_non_blank(field: &str, value: &str) -> Result<(), LedgerError> {
    if value.trim().is_empty() {
        return Err(LedgerError::InvalidEnvelope(format!("{} must not be blank", field)));
    }
    Ok(())
}

/// Matched trade reported by the matching engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeExecuted {
    pub envelope: EventEnvelope,
    pub trade_id: String,
    pub buyer_user_id: String,
    pub seller_user_id: String,
    pub price: Amount,
    pub quantity: Amount,
    /// Explicit quote amount; `price * quantity` is used when this is <= 0
    #[serde(default)]
    pub quote_amount: Amount,
    #[serde(default)]
    pub fee_buyer: Amount,
    #[serde(default)]
    pub fee_seller: Amount,
}

impl TradeExecuted {
    /// Compact payload stored with dead letters
    pub fn dead_letter_payload(&self) -> String {
        format!(
            "trade_id={},symbol={},seq={}",
            self.trade_id, self.envelope.symbol, self.envelope.seq
        )
    }
}

/// Hold or release of funds against an open order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveCommand {
    pub envelope: EventEnvelope,
    pub order_id: String,
    pub user_id: String,
    /// BUY or SELL, case-insensitive
    pub side: String,
    pub amount: Amount,
}

/// Manual credit or debit of a user's AVAILABLE balance against treasury
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceAdjustmentCommand {
    pub envelope: EventEnvelope,
    pub reference_id: String,
    pub user_id: String,
    pub currency: String,
    pub amount_delta: Amount,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(symbol: &str) -> EventEnvelope {
        EventEnvelope {
            event_id: "evt-1".into(),
            event_version: 1,
            symbol: symbol.into(),
            seq: 7,
            occurred_at: Utc::now(),
            correlation_id: "corr-1".into(),
            causation_id: "cause-1".into(),
        }
    }

    #[test]
    fn test_validate_normalizes_symbol() {
        let validated = envelope("btc-krw").validate().unwrap();
        assert_eq!(validated.symbol, "BTC-KRW");
        assert_eq!(validated.seq, 7);
    }

    #[test]
    fn test_validate_rejects_bad_symbols() {
        for symbol in ["BTC", "B-KRW", "BTC-K", "BTC_KRW", "BTC-KRW-X", "ABCDEFGHIJKLMNOPQ-KRW"] {
            assert!(
                matches!(envelope(symbol).validate(), Err(LedgerError::InvalidSymbol(_))),
                "{} should be rejected",
                symbol
            );
        }
    }

    #[test]
    fn test_validate_rejects_version_and_blank_ids() {
        let mut env = envelope("BTC-KRW");
        env.event_version = 2;
        assert_eq!(env.validate(), Err(LedgerError::UnsupportedEventVersion(2)));

        let mut env = envelope("BTC-KRW");
        env.correlation_id = "  ".into();
        assert!(matches!(env.validate(), Err(LedgerError::InvalidEnvelope(_))));

        let mut env = envelope("BTC-KRW");
        env.seq = -1;
        assert!(matches!(env.validate(), Err(LedgerError::InvalidEnvelope(_))));
    }
}
