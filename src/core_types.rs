//! Core types used throughout the ledger
//!
//! Type aliases that give semantic meaning to the primitive columns the
//! ledger stores. Amounts and sequences are `i64` because that is what the
//! store persists (`BIGINT`), and every arithmetic step on them is checked.

/// Amount in the smallest unit of a currency (satoshi, won, cent, ...).
///
/// # Constraints:
/// - Posting amounts are strictly positive
/// - Balances are signed: system accounts may go negative
pub type Amount = i64;

/// Upstream matching engine sequence number for a symbol.
///
/// Both `last_engine_seq` and `last_settled_seq` are monotone high-water marks.
pub type SeqNum = i64;

/// Globally unique business key of a ledger entry (also the idempotency key)
pub type EntryId = String;

/// Correction request identifier, supplied by the operator tooling
pub type CorrectionId = String;
