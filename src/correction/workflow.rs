//! Correction Workflow
//!
//! Create, dual-approve and apply reversal corrections. The reversal entry is
//! appended and the request marked APPLIED in one atomic store call, so
//! concurrent applies produce exactly one reversal.

use std::sync::Arc;

use tracing::{info, warn};

use super::types::{
    ApplyOutcome, CorrectionMode, CorrectionRequest, CorrectionStatus, NewCorrection,
    reversal_entry_id,
};
use crate::clock::Clock;
use crate::error::LedgerError;
use crate::ledger::engine::DoubleEntryEngine;
use crate::ledger::types::{EntryKind, LedgerEntry, ReferenceType, SettlementReason, SettlementResult};
use crate::metrics::LedgerMetrics;
use crate::store::LedgerStore;

pub struct CorrectionWorkflow {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<LedgerMetrics>,
}

impl CorrectionWorkflow {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
        }
    }

    pub async fn create(&self, input: &NewCorrection) -> Result<CorrectionRequest, LedgerError> {
        require("correction_id", &input.correction_id)?;
        require("original_entry_id", &input.original_entry_id)?;
        require("ticket_id", &input.ticket_id)?;
        require("requested_by", &input.requested_by)?;

        let mode = CorrectionMode::parse(&input.mode)
            .ok_or_else(|| LedgerError::UnsupportedCorrectionMode(input.mode.clone()))?;
        if self.store.get_entry(&input.original_entry_id).await?.is_none() {
            return Err(LedgerError::OriginalEntryNotFound(
                input.original_entry_id.clone(),
            ));
        }

        let request = CorrectionRequest {
            correction_id: input.correction_id.trim().to_string(),
            original_entry_id: input.original_entry_id.clone(),
            mode,
            reason: input.reason.clone(),
            ticket_id: input.ticket_id.clone(),
            requested_by: input.requested_by.clone(),
            approver1: None,
            approver2: None,
            status: CorrectionStatus::Pending,
            created_at: self.clock.now(),
            approved_at: None,
            applied_at: None,
        };
        self.store.create_correction(&request).await?;
        self.refresh_pending_age().await;

        info!(
            correction_id = %request.correction_id,
            original_entry_id = %request.original_entry_id,
            ticket_id = %request.ticket_id,
            requested_by = %request.requested_by,
            "Correction requested"
        );
        Ok(request)
    }

    /// Record one approval. Returns the request as stored afterwards.
    pub async fn approve(
        &self,
        correction_id: &str,
        approver: &str,
    ) -> Result<CorrectionRequest, LedgerError> {
        require("approver", approver)?;
        let request = self
            .store
            .approve_correction(correction_id, approver.trim(), self.clock.now())
            .await?;
        self.refresh_pending_age().await;

        info!(
            correction_id,
            approver,
            status = %request.status,
            "Correction approval recorded"
        );
        Ok(request)
    }

    /// Append the reversal of an APPROVED correction
    pub async fn apply(
        &self,
        correction_id: &str,
        correlation_id: &str,
        causation_id: &str,
    ) -> Result<SettlementResult, LedgerError> {
        let entry_id = reversal_entry_id(correction_id);
        let request = self
            .store
            .get_correction(correction_id)
            .await?
            .ok_or_else(|| LedgerError::CorrectionNotFound(correction_id.to_string()))?;
        match request.status {
            CorrectionStatus::Applied => {
                return Ok(SettlementResult::new(entry_id, SettlementReason::AlreadyApplied));
            }
            CorrectionStatus::Pending => {
                return Ok(SettlementResult::new(entry_id, SettlementReason::NotApproved));
            }
            CorrectionStatus::Approved => {}
        }

        let original = self
            .store
            .get_entry(&request.original_entry_id)
            .await?
            .ok_or_else(|| LedgerError::OriginalEntryNotFound(request.original_entry_id.clone()))?;
        let reversal = LedgerEntry {
            entry_id: entry_id.clone(),
            reference_type: ReferenceType::Correction,
            reference_id: request.correction_id.clone(),
            entry_kind: EntryKind::Reversal,
            symbol: original.symbol.clone(),
            engine_seq: original.engine_seq,
            occurred_at: self.clock.now(),
            correlation_id: correlation_id.to_string(),
            causation_id: causation_id.to_string(),
            postings: original.postings.iter().map(|p| p.reversed()).collect(),
        };
        DoubleEntryEngine::validate(&reversal)?;

        let outcome = self
            .store
            .apply_correction(correction_id, &reversal, self.clock.now())
            .await?;
        let reason = match outcome {
            ApplyOutcome::Applied => {
                self.metrics.incr_corrections();
                self.refresh_pending_age().await;
                self.refresh_reserve_metrics().await;
                info!(
                    correction_id,
                    entry_id = %entry_id,
                    original_entry_id = %request.original_entry_id,
                    "Correction applied"
                );
                SettlementReason::Applied
            }
            ApplyOutcome::AlreadyApplied => SettlementReason::AlreadyApplied,
            ApplyOutcome::NotApproved => SettlementReason::NotApproved,
            ApplyOutcome::Duplicate => {
                self.metrics.incr_unique_violation();
                warn!(correction_id, entry_id = %entry_id, "Reversal entry already exists");
                SettlementReason::Duplicate
            }
        };
        Ok(SettlementResult::new(entry_id, reason))
    }

    pub async fn get(&self, correction_id: &str) -> Result<Option<CorrectionRequest>, LedgerError> {
        self.store.get_correction(correction_id).await
    }

    async fn refresh_pending_age(&self) {
        match self.store.oldest_pending_correction().await {
            Ok(oldest) => {
                let age_ms = oldest
                    .map(|at| (self.clock.now() - at).num_milliseconds())
                    .unwrap_or(0);
                self.metrics.set_correction_pending_age(age_ms);
            }
            Err(e) => warn!(error = %e, "Failed to refresh correction pending age"),
        }
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

fn require(field: &str, value: &str) -> Result<(), LedgerError> {
    if value.trim().is_empty() {
        return Err(LedgerError::InvalidEnvelope(format!("{} must not be blank", field)));
    }
    Ok(())
}
