//! Core types and error definitions for the Felix orchestrator.
//!
//! This crate holds everything the other Felix crates share: the plan model,
//! run state, attempts, checkpoints, loop events and the unified error type.
//!
//! # Main types
//!
//! - [`FelixError`]: Unified error enum for all Felix subsystems.
//! - [`FelixResult`]: Convenience alias for `Result<T, FelixError>`.
//! - [`Prd`] / [`Task`]: The declarative plan of work and its tasks.
//! - [`OrchestratorState`]: Mutable run state snapshotted into [`Checkpoint`]s.
//! - [`EventBus`]: Handler registry for [`LoopEvent`]s.

/// Durable run snapshots.
pub mod checkpoint;
/// Loop events and the handler registry.
pub mod event;
/// Plan documents, validation and plan hashing.
pub mod prd;
/// Provider and backend identifiers.
pub mod provider;
/// Run state, attempts and task results.
pub mod state;
/// Tasks and their attributes.
pub mod task;

pub use checkpoint::Checkpoint;
pub use event::{EventBus, EventHandler, LoopEvent, LoopEventKind};
pub use prd::{Prd, PrdConfig};
pub use provider::{Backend, Provider};
pub use state::{
    Attempt, OrchestratorState, OrchestratorStatus, SkipReason, SkippedTask, TaskExecutionResult,
    TokenUsage,
};
pub use task::{Complexity, Priority, Task};

use serde::{Deserialize, Serialize};

// --- Error types ---

/// One candidate the fallback router tried while resolving a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackAttempt {
    pub provider: Provider,
    pub backend: Backend,
    pub model: String,
    /// Failure description, or `None` when this candidate succeeded.
    pub error: Option<String>,
    /// True when the candidate was skipped as unhealthy without being invoked.
    pub skipped: bool,
}

/// Every candidate tried before the fallback router gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackReport {
    pub attempts: Vec<FallbackAttempt>,
}

impl std::fmt::Display for FallbackReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "no worker available after {} candidate(s):",
            self.attempts.len()
        )?;
        for (i, attempt) in self.attempts.iter().enumerate() {
            write!(
                f,
                "\n  {}. {}/{} ({}): {}",
                i + 1,
                attempt.provider,
                attempt.backend,
                attempt.model,
                attempt.error.as_deref().unwrap_or("ok")
            )?;
        }
        Ok(())
    }
}

/// Top-level error type for Felix.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, thiserror::Error)]
pub enum FelixError {
    /// The plan failed validation; every problem is listed.
    #[error("Invalid plan: {}", .0.join("; "))]
    InvalidPlan(Vec<String>),

    /// An error reported by an LLM worker while executing a task.
    #[error("Worker error: {0}")]
    Worker(String),

    /// An error from an outbound HTTP request (e.g. LLM API call).
    #[error("HTTP error: {0}")]
    Http(String),

    /// A worker call exceeded its deadline.
    #[error("Timeout after {0}s")]
    Timeout(u64),

    /// Every fallback candidate failed.
    #[error("{0}")]
    FallbackExhausted(FallbackReport),

    /// The cost ceiling would be breached.
    #[error("Budget exceeded: spent ${spent:.4} + estimated ${estimated:.4} > limit ${limit:.4}")]
    BudgetExceeded {
        spent: f64,
        estimated: f64,
        limit: f64,
    },

    /// The state machine rejected a status change.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: OrchestratorStatus,
        to: OrchestratorStatus,
    },

    /// An error from the persistence layer.
    #[error("Store error: {0}")]
    Store(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the orchestrator itself.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FelixError {
    /// Retry class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            FelixError::Timeout(_) => ErrorClass::Transient,
            FelixError::Http(msg) | FelixError::Worker(msg) => classify_message(msg),
            FelixError::Io(_) if self.is_transient() => ErrorClass::Transient,
            FelixError::Io(_) => ErrorClass::Unknown,
            FelixError::FallbackExhausted(_) => ErrorClass::Unknown,
            _ => ErrorClass::Permanent,
        }
    }

    /// Whether retrying the same operation could plausibly succeed.
    ///
    /// Timeouts, network failures, rate limits and server-side errors are
    /// transient; plan, budget, state and client-side errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            FelixError::Timeout(_) => true,
            FelixError::Http(msg) | FelixError::Worker(msg) => is_transient_message(msg),
            FelixError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// How a failure should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Timeouts, network errors, rate limits, overload and 5xx responses.
    Transient,
    /// Syntax errors, failed assertions, type errors and 4xx responses.
    Permanent,
    /// Nothing recognisable in the message.
    Unknown,
}

/// Classify a free-form error message.
///
/// Non-retryable patterns win over retryable ones.
pub fn classify_message(msg: &str) -> ErrorClass {
    let lower = msg.to_lowercase();

    const PERMANENT: [&str; 14] = [
        "400",
        "401",
        "403",
        "404",
        "422",
        "syntax error",
        "syntaxerror",
        "assertion",
        "type error",
        "typeerror",
        "invalid api key",
        "permission denied",
        "logic error",
        "missing api key",
    ];
    if PERMANENT.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Permanent;
    }

    const TRANSIENT: [&str; 14] = [
        "timeout",
        "timed out",
        "429",
        "rate limit",
        "overloaded",
        "500",
        "502",
        "503",
        "504",
        "5xx",
        "econnreset",
        "connection reset",
        "connection refused",
        "network",
    ];
    if TRANSIENT.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Transient;
    }
    ErrorClass::Unknown
}

/// Whether a free-form error message describes a transient failure.
pub fn is_transient_message(msg: &str) -> bool {
    classify_message(msg) == ErrorClass::Transient
}

/// A convenience `Result` alias using [`FelixError`].
pub type FelixResult<T> = Result<T, FelixError>;
