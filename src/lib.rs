//! Exchange Ledger - double-entry ledger of record
//!
//! Turns trade fills, order holds and manual adjustments into an immutable
//! double-entry log with a materialized balance view, and cross-checks its
//! settlement progress against the upstream matching engine.
//!
//! # Modules
//!
//! - [`core_types`] - Amount / sequence / id aliases
//! - [`ledger`] - Double-entry engine and settlement adapter
//! - [`store`] - Storage trait with Postgres and in-memory backends
//! - [`reconciliation`] - Sequence reconciliation, safety latch, actuator
//! - [`correction`] - Dual-approval reversal workflow
//! - [`invariant`] - Invariant checker, balance rebuild, guard
//! - [`service`] - Component wiring and admin surface
//! - [`metrics`] - Observation hooks

// Core types - must be first!
pub mod core_types;

pub mod clock;
pub mod error;
pub mod metrics;

// Ledger core
pub mod correction;
pub mod invariant;
pub mod ledger;
pub mod reconciliation;
pub mod store;

// Wiring & infrastructure
pub mod config;
pub mod db;
pub mod logging;
pub mod service;

pub use core_types::{Amount, CorrectionId, EntryId, SeqNum};
pub use error::LedgerError;
pub use ledger::{DoubleEntryEngine, SettlementAdapter};
pub use metrics::{LedgerMetrics, LedgerMetricsSnapshot};
pub use service::LedgerServices;
