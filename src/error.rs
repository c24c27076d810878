//! Ledger Error Types
//!
//! One error enum for the whole core. Validation variants are rejected
//! synchronously and never retried; `Storage` is the only transient kind.
//! Duplicates are not errors and never appear here.

use thiserror::Error;

/// Ledger error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    // === Entry Validation ===
    #[error("Entry {entry_id} has no postings")]
    EmptyEntry { entry_id: String },

    #[error("Entry is not balanced for currency {currency}: net {net}")]
    UnbalancedEntry { currency: String, net: i64 },

    #[error("Amount must be greater than zero: got {0}")]
    NonPositiveAmount(i64),

    #[error("Amount would overflow")]
    Overflow,

    #[error("Invalid account id: {0}")]
    InvalidAccountId(String),

    // === Event Validation ===
    #[error("Symbol must be BASE-QUOTE: got '{0}'")]
    InvalidSymbol(String),

    #[error("Invalid event envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Unsupported event version: {0}")]
    UnsupportedEventVersion(i32),

    #[error("Invalid order side: {0}")]
    InvalidSide(String),

    #[error("Adjustment amount must not be zero")]
    ZeroAdjustment,

    #[error("Invalid trade: {0}")]
    InvalidTrade(String),

    // === Corrections ===
    #[error("Original entry not found: {0}")]
    OriginalEntryNotFound(String),

    #[error("Unsupported correction mode: {0}")]
    UnsupportedCorrectionMode(String),

    #[error("Correction not found: {0}")]
    CorrectionNotFound(String),

    #[error("Correction already exists: {0}")]
    CorrectionAlreadyExists(String),

    // === System ===
    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Machine-readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::EmptyEntry { .. } => "empty_entry",
            LedgerError::UnbalancedEntry { .. } => "unbalanced_entry",
            LedgerError::NonPositiveAmount(_) => "non_positive_amount",
            LedgerError::Overflow => "overflow",
            LedgerError::InvalidAccountId(_) => "invalid_account_id",
            LedgerError::InvalidSymbol(_) => "invalid_symbol",
            LedgerError::InvalidEnvelope(_) => "invalid_envelope",
            LedgerError::UnsupportedEventVersion(_) => "unsupported_event_version",
            LedgerError::InvalidSide(_) => "invalid_side",
            LedgerError::ZeroAdjustment => "zero_adjustment",
            LedgerError::InvalidTrade(_) => "invalid_trade",
            LedgerError::OriginalEntryNotFound(_) => "original_entry_not_found",
            LedgerError::UnsupportedCorrectionMode(_) => "unsupported_correction_mode",
            LedgerError::CorrectionNotFound(_) => "correction_not_found",
            LedgerError::CorrectionAlreadyExists(_) => "correction_already_exists",
            LedgerError::Storage(_) => "storage_error",
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LedgerError::ZeroAdjustment.code(), "zero_adjustment");
        assert_eq!(
            LedgerError::OriginalEntryNotFound("le_x".into()).code(),
            "original_entry_not_found"
        );
        assert_eq!(
            LedgerError::UnsupportedCorrectionMode("ADJUSTMENT".into()).code(),
            "unsupported_correction_mode"
        );
    }

    #[test]
    fn test_display() {
        let err = LedgerError::UnbalancedEntry {
            currency: "KRW".into(),
            net: 5,
        };
        assert_eq!(
            err.to_string(),
            "Entry is not balanced for currency KRW: net 5"
        );
    }
}
