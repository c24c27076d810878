//! Correction Request Types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{CorrectionId, EntryId};

/// Correction request lifecycle: PENDING -> APPROVED -> APPLIED.
///
/// Transitions are monotone, nothing moves back out of APPLIED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrectionStatus {
    Pending,
    Approved,
    Applied,
}

impl CorrectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionStatus::Pending => "PENDING",
            CorrectionStatus::Approved => "APPROVED",
            CorrectionStatus::Applied => "APPLIED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(CorrectionStatus::Pending),
            "APPROVED" => Some(CorrectionStatus::Approved),
            "APPLIED" => Some(CorrectionStatus::Applied),
            _ => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, CorrectionStatus::Applied)
    }
}

impl fmt::Display for CorrectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Only REVERSAL exists today
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrectionMode {
    Reversal,
}

impl CorrectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionMode::Reversal => "REVERSAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REVERSAL" => Some(CorrectionMode::Reversal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionRequest {
    pub correction_id: CorrectionId,
    pub original_entry_id: EntryId,
    pub mode: CorrectionMode,
    pub reason: String,
    pub ticket_id: String,
    pub requested_by: String,
    pub approver1: Option<String>,
    pub approver2: Option<String>,
    pub status: CorrectionStatus,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
}

impl CorrectionRequest {
    /// Record one approval. The same identity never fills both slots.
    ///
    /// Returns true when the request changed.
    pub fn record_approval(&mut self, approver: &str, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        match (&self.approver1, &self.approver2) {
            (None, _) => self.approver1 = Some(approver.to_string()),
            (Some(first), None) if first != approver => {
                self.approver2 = Some(approver.to_string())
            }
            _ => return false,
        }
        if self.approver1.is_some() && self.approver2.is_some() && self.approver1 != self.approver2 {
            self.status = CorrectionStatus::Approved;
            self.approved_at = Some(now);
        }
        true
    }
}

pub fn reversal_entry_id(correction_id: &str) -> EntryId {
    format!("le_corr_{}", correction_id)
}

/// Input to `CorrectionWorkflow::create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCorrection {
    pub correction_id: CorrectionId,
    pub original_entry_id: EntryId,
    /// Free-form mode string, only REVERSAL is accepted
    pub mode: String,
    pub reason: String,
    pub ticket_id: String,
    pub requested_by: String,
}

/// Store-level result of an atomic apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    AlreadyApplied,
    NotApproved,
    /// Reversal entry id already present. Request left unchanged.
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> CorrectionRequest {
        CorrectionRequest {
            correction_id: "c1".into(),
            original_entry_id: "le_trade_1".into(),
            mode: CorrectionMode::Reversal,
            reason: "fat finger".into(),
            ticket_id: "OPS-1".into(),
            requested_by: "ops".into(),
            approver1: None,
            approver2: None,
            status: CorrectionStatus::Pending,
            created_at: Utc::now(),
            approved_at: None,
            applied_at: None,
        }
    }

    #[test]
    fn test_two_distinct_approvers_required() {
        let mut req = pending();
        let now = Utc::now();
        assert!(req.record_approval("alice", now));
        assert_eq!(req.status, CorrectionStatus::Pending);

        assert!(!req.record_approval("alice", now));
        assert_eq!(req.approver2, None);
        assert_eq!(req.status, CorrectionStatus::Pending);

        assert!(req.record_approval("bob", now));
        assert_eq!(req.status, CorrectionStatus::Approved);
        assert_eq!(req.approver1.as_deref(), Some("alice"));
        assert_eq!(req.approver2.as_deref(), Some("bob"));
        assert!(req.approved_at.is_some());
    }

    #[test]
    fn test_applied_is_terminal() {
        let mut req = pending();
        req.status = CorrectionStatus::Applied;
        assert!(!req.record_approval("carol", Utc::now()));
        assert_eq!(req.approver1, None);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(CorrectionMode::parse("reversal"), Some(CorrectionMode::Reversal));
        assert_eq!(CorrectionMode::parse("ADJUSTMENT"), None);
        assert_eq!(reversal_entry_id("c9"), "le_corr_c9");
    }
}
