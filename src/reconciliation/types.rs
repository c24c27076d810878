//! Reconciliation Types
//!
//! Per-symbol sequence tracking, the safety/latch state row, history points
//! and the result shapes returned to admin callers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::SeqNum;

/// Trading mode applied to a symbol by the external actuator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyMode {
    Normal,
    CancelOnly,
    SoftHalt,
    HardHalt,
}

impl SafetyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyMode::Normal => "NORMAL",
            SafetyMode::CancelOnly => "CANCEL_ONLY",
            SafetyMode::SoftHalt => "SOFT_HALT",
            SafetyMode::HardHalt => "HARD_HALT",
        }
    }

    /// Lenient parse used for config and stored rows. Unknown values fall back to CANCEL_ONLY.
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or(SafetyMode::CancelOnly)
    }
}

impl fmt::Display for SafetyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SafetyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(SafetyMode::Normal),
            "CANCEL_ONLY" => Ok(SafetyMode::CancelOnly),
            "SOFT_HALT" => Ok(SafetyMode::SoftHalt),
            "HARD_HALT" => Ok(SafetyMode::HardHalt),
            other => Err(format!("unknown safety mode '{}'", other)),
        }
    }
}

/// Why an evaluation did or did not breach. Only one reason is surfaced,
/// in the priority order mismatch, stale, threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachReason {
    SettledAheadOfEngine,
    StateStale,
    LagThresholdExceeded,
    WithinThreshold,
    ManualReleaseRequired,
}

impl BreachReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachReason::SettledAheadOfEngine => "settled_seq_ahead_of_engine_seq",
            BreachReason::StateStale => "state_stale",
            BreachReason::LagThresholdExceeded => "lag_threshold_exceeded",
            BreachReason::WithinThreshold => "within_threshold",
            BreachReason::ManualReleaseRequired => "MANUAL_RELEASE_REQUIRED",
        }
    }

    pub fn classify(mismatch: bool, stale: bool, threshold_breached: bool) -> Self {
        if mismatch {
            BreachReason::SettledAheadOfEngine
        } else if stale {
            BreachReason::StateStale
        } else if threshold_breached {
            BreachReason::LagThresholdExceeded
        } else {
            BreachReason::WithinThreshold
        }
    }
}

impl fmt::Display for BreachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sequence high-water marks for one symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationState {
    pub symbol: String,
    pub last_engine_seq: SeqNum,
    pub last_settled_seq: SeqNum,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ReconciliationState {
    /// Zero state for a symbol that has never been observed
    pub fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            last_engine_seq: 0,
            last_settled_seq: 0,
            updated_at: None,
        }
    }

    #[inline]
    pub fn lag(&self) -> i64 {
        self.last_engine_seq - self.last_settled_seq
    }
}

/// Persisted safety and latch state for one symbol.
///
/// `version` increments on every write and guards compare-and-swap updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyState {
    pub symbol: String,
    pub breach_active: bool,
    pub last_lag: i64,
    pub last_mismatch: bool,
    pub safety_mode: Option<SafetyMode>,
    pub last_action_taken: bool,
    pub last_action_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub latch_engaged: bool,
    pub latch_reason: Option<String>,
    pub latch_updated_at: Option<DateTime<Utc>>,
    pub latch_released_at: Option<DateTime<Utc>>,
    pub latch_released_by: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

/// One evaluation of one symbol, appended to history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationEvaluation {
    pub symbol: String,
    pub last_engine_seq: SeqNum,
    pub last_settled_seq: SeqNum,
    pub lag: i64,
    pub mismatch: bool,
    pub stale: bool,
    pub threshold: i64,
    pub breached: bool,
    pub reason: String,
    pub safety_mode: SafetyMode,
    pub safety_action_taken: bool,
    pub checked_at: DateTime<Utc>,
}

/// Stored history row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub id: i64,
    #[serde(flatten)]
    pub evaluation: ReconciliationEvaluation,
}

/// Fields written when a latch is cleared by an operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatchClear {
    pub symbol: String,
    pub expected_version: i64,
    pub lag: i64,
    pub mismatch: bool,
    pub safety_mode: Option<SafetyMode>,
    pub release_reason: String,
    pub released_by: String,
    pub released_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRunSummary {
    pub checked_at: DateTime<Utc>,
    pub evaluations: Vec<ReconciliationEvaluation>,
    /// Symbols whose safety state write lost a version race this tick
    pub skipped_symbols: Vec<String>,
}

impl ReconciliationRunSummary {
    pub fn breached_symbols(&self) -> Vec<&str> {
        self.evaluations
            .iter()
            .filter(|e| e.breached)
            .map(|e| e.symbol.as_str())
            .collect()
    }
}

/// Operator request to clear a symbol's latch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatchReleaseRequest {
    pub symbol: String,
    pub approved_by: String,
    pub reason: String,
    #[serde(default)]
    pub restore_symbol_mode: bool,
}

/// Why a latch release was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseDenial {
    StillBreached,
    SafetyStateNotFound,
    LatchNotEngaged,
    InvariantsFailed,
    ModeRestoreFailed,
    ReleaseNotApplied,
}

impl ReleaseDenial {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseDenial::StillBreached => "still_breached",
            ReleaseDenial::SafetyStateNotFound => "safety_state_not_found",
            ReleaseDenial::LatchNotEngaged => "latch_not_engaged",
            ReleaseDenial::InvariantsFailed => "invariants_failed",
            ReleaseDenial::ModeRestoreFailed => "mode_restore_failed",
            ReleaseDenial::ReleaseNotApplied => "release_not_applied",
        }
    }
}

impl fmt::Display for ReleaseDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatchReleaseResult {
    pub symbol: String,
    pub released: bool,
    pub mode_restored: bool,
    pub reason: String,
    pub lag: i64,
    pub mismatch: bool,
    pub threshold_breached: bool,
    pub invariants_ok: bool,
    pub invariant_violations: Vec<String>,
    pub released_at: Option<DateTime<Utc>>,
    pub released_by: Option<String>,
}

/// Per-symbol row of the status dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationStatusView {
    pub symbol: String,
    pub last_engine_seq: SeqNum,
    pub last_settled_seq: SeqNum,
    pub lag: i64,
    pub mismatch: bool,
    pub threshold_breached: bool,
    pub stale: bool,
    pub breached: bool,
    pub state_age_ms: Option<i64>,
    pub breach_active: bool,
    pub safety_mode: Option<SafetyMode>,
    pub last_action_at: Option<DateTime<Utc>>,
    pub latch_engaged: bool,
    pub latch_reason: Option<String>,
    pub latch_updated_at: Option<DateTime<Utc>>,
    pub latch_released_at: Option<DateTime<Utc>>,
    pub latch_released_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationDashboard {
    pub checked_at: DateTime<Utc>,
    pub statuses: Vec<ReconciliationStatusView>,
    pub history: Vec<HistoryPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyModeActivationSummary {
    pub requested_symbols: Vec<String>,
    pub switched_symbols: Vec<String>,
    pub failed_symbols: Vec<String>,
}
