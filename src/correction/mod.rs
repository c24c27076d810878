//! Dual-approval correction (reversal) workflow

pub mod types;
pub mod workflow;

pub use types::{CorrectionMode, CorrectionRequest, CorrectionStatus, NewCorrection};
pub use workflow::CorrectionWorkflow;
