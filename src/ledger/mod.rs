//! Double-entry ledger core
//!
//! - [`types`]: accounts, postings, entries and settlement results
//! - [`events`]: inbound event payloads and envelope validation
//! - [`engine`]: balance validation plus idempotent append
//! - [`settlement`]: trade, hold and adjustment translation

pub mod engine;
pub mod events;
pub mod settlement;
pub mod types;

pub use engine::DoubleEntryEngine;
pub use events::{BalanceAdjustmentCommand, EventEnvelope, ReserveCommand, TradeExecuted};
pub use settlement::SettlementAdapter;
pub use types::{
    AccountBalance, AccountId, AccountKind, AppendOutcome, EntryKind, LedgerEntry, Posting,
    ReferenceType, SettlementReason, SettlementResult,
};
