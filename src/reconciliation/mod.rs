//! Reconciliation
//!
//! Cross-checks settled progress against the matching engine per symbol and
//! escalates through the safety latch and the external mode actuator.

pub mod actuator;
pub mod engine;
pub mod types;
pub mod worker;

pub use actuator::{
    DisabledSafetyActuator, HttpSafetyActuator, ModeChangeOutcome, SafetyModeActuator,
};
pub use engine::ReconciliationEngine;
pub use types::{LatchReleaseRequest, LatchReleaseResult, SafetyMode};
pub use worker::ReconciliationWorker;
