//! PostgreSQL schema for the ledger store
//!
//! Every statement is idempotent so `init_schema` can run on each startup.

use sqlx::PgPool;

use crate::error::LedgerError;

/// Initialize ledger tables and indexes
pub async fn init_schema(pool: &PgPool) -> Result<(), LedgerError> {
    tracing::info!("Initializing ledger schema...");

    for (name, ddl) in SCHEMA {
        sqlx::query(ddl).execute(pool).await.map_err(|e| {
            LedgerError::Storage(format!("Failed to create {}: {}", name, e))
        })?;
    }

    tracing::info!("Ledger schema initialized successfully");
    Ok(())
}

const SCHEMA: &[(&str, &str)] = &[
    ("ledger_entries", CREATE_ENTRIES_TABLE),
    ("ledger_entries index", CREATE_ENTRIES_REFERENCE_INDEX),
    ("accounts", CREATE_ACCOUNTS_TABLE),
    ("ledger_postings", CREATE_POSTINGS_TABLE),
    ("ledger_postings index", CREATE_POSTINGS_ENTRY_INDEX),
    ("account_balances", CREATE_BALANCES_TABLE),
    ("settlement_dlq", CREATE_DLQ_TABLE),
    ("reconciliation_state", CREATE_RECONCILIATION_STATE_TABLE),
    ("reconciliation_safety_state", CREATE_SAFETY_STATE_TABLE),
    ("reconciliation_history", CREATE_HISTORY_TABLE),
    ("reconciliation_history index", CREATE_HISTORY_INDEX),
    ("invariant_alerts", CREATE_ALERTS_TABLE),
    ("correction_requests", CREATE_CORRECTIONS_TABLE),
];

const CREATE_ENTRIES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS ledger_entries (
        entry_id TEXT PRIMARY KEY,
        reference_type TEXT NOT NULL,
        reference_id TEXT NOT NULL,
        entry_kind TEXT NOT NULL,
        symbol TEXT NOT NULL,
        engine_seq BIGINT NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL,
        correlation_id TEXT NOT NULL,
        causation_id TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

const CREATE_ENTRIES_REFERENCE_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_ledger_entries_reference
        ON ledger_entries (reference_type, reference_id)
"#;

const CREATE_ACCOUNTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS accounts (
        account_id TEXT NOT NULL,
        currency TEXT NOT NULL,
        owner_type TEXT NOT NULL,
        owner_id TEXT NOT NULL,
        account_kind TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (account_id, currency)
    )
"#;

const CREATE_POSTINGS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS ledger_postings (
        posting_id TEXT PRIMARY KEY,
        entry_id TEXT NOT NULL REFERENCES ledger_entries (entry_id),
        posting_index INT NOT NULL,
        account_id TEXT NOT NULL,
        currency TEXT NOT NULL,
        amount BIGINT NOT NULL CHECK (amount > 0),
        is_debit BOOLEAN NOT NULL
    )
"#;

const CREATE_POSTINGS_ENTRY_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_ledger_postings_entry
        ON ledger_postings (entry_id, posting_index)
"#;

const CREATE_BALANCES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS account_balances (
        account_id TEXT NOT NULL,
        currency TEXT NOT NULL,
        balance BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (account_id, currency)
    )
"#;

const CREATE_DLQ_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS settlement_dlq (
        id BIGSERIAL PRIMARY KEY,
        event_id TEXT NOT NULL,
        reason TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

const CREATE_RECONCILIATION_STATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS reconciliation_state (
        symbol TEXT PRIMARY KEY,
        last_engine_seq BIGINT NOT NULL DEFAULT 0,
        last_settled_seq BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

const CREATE_SAFETY_STATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS reconciliation_safety_state (
        symbol TEXT PRIMARY KEY,
        breach_active BOOLEAN NOT NULL DEFAULT FALSE,
        last_lag BIGINT NOT NULL DEFAULT 0,
        last_mismatch BOOLEAN NOT NULL DEFAULT FALSE,
        safety_mode TEXT,
        last_action_taken BOOLEAN NOT NULL DEFAULT FALSE,
        last_action_at TIMESTAMPTZ,
        reason TEXT,
        latch_engaged BOOLEAN NOT NULL DEFAULT FALSE,
        latch_reason TEXT,
        latch_updated_at TIMESTAMPTZ,
        latch_released_at TIMESTAMPTZ,
        latch_released_by TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        version BIGINT NOT NULL DEFAULT 0
    )
"#;

const CREATE_HISTORY_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS reconciliation_history (
        id BIGSERIAL PRIMARY KEY,
        symbol TEXT NOT NULL,
        last_engine_seq BIGINT NOT NULL,
        last_settled_seq BIGINT NOT NULL,
        lag BIGINT NOT NULL,
        mismatch BOOLEAN NOT NULL,
        stale BOOLEAN NOT NULL DEFAULT FALSE,
        threshold BIGINT NOT NULL,
        breached BOOLEAN NOT NULL,
        safety_mode TEXT NOT NULL,
        safety_action_taken BOOLEAN NOT NULL,
        reason TEXT NOT NULL,
        checked_at TIMESTAMPTZ NOT NULL
    )
"#;

const CREATE_HISTORY_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_reconciliation_history_checked
        ON reconciliation_history (checked_at DESC, id DESC)
"#;

const CREATE_ALERTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS invariant_alerts (
        id BIGSERIAL PRIMARY KEY,
        alert_kind TEXT NOT NULL,
        details TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

const CREATE_CORRECTIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS correction_requests (
        correction_id TEXT PRIMARY KEY,
        original_entry_id TEXT NOT NULL REFERENCES ledger_entries (entry_id),
        mode TEXT NOT NULL,
        reason TEXT NOT NULL,
        ticket_id TEXT NOT NULL,
        requested_by TEXT NOT NULL,
        approver1 TEXT,
        approver2 TEXT,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        approved_at TIMESTAMPTZ,
        applied_at TIMESTAMPTZ,
        CHECK (approver1 IS NULL OR approver2 IS NULL OR approver1 <> approver2)
    )
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_are_idempotent() {
        for (name, ddl) in SCHEMA {
            assert!(
                ddl.contains("IF NOT EXISTS"),
                "{} must be safe to re-run",
                name
            );
        }
    }
}
