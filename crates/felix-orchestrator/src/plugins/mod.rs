//! Per-attempt policies: cost ceiling, retry backoff, validation and the
//! end-of-run quality gate.

pub mod cost;
pub mod quality;
pub mod retry;
pub mod validation;

pub use cost::{CostTracker, ModelUsage, Reservation};
pub use quality::{CommandQualityGate, QualityGate, QualityGateConfig, QualityReport};
pub use retry::{BackoffStrategy, RetryConfig, RetryPolicy};
pub use validation::{CommandValidator, ValidationConfig, ValidationReport, ValidationStep, Validator};
