//! Execution engine for Felix plans.
//!
//! The [`Orchestrator`] turns a validated [`Prd`](felix_core::Prd) into
//! dependency levels, routes each task to a model tier, dispatches tasks to
//! workers under the chosen [`ExecutionMode`], retries and escalates failed
//! attempts, enforces the cost budget and checkpoints progress so an
//! interrupted run can resume without repeating finished work.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Run lifecycle and the dispatch loop.
//! - [`LoopControl`]: Cooperative pause, resume and cancel.
//! - [`Scheduler`]: Dependency levels, readiness and skip cascades.
//! - [`ModelRouter`]: Complexity scoring, history-aware tier selection and escalation.
//! - [`TaskExecutor`]: One task's attempt loop.
//! - [`CheckpointManager`]: Snapshot persistence and resume.

/// Snapshot persistence and resume.
pub mod checkpoint;
/// Layered run configuration.
pub mod config;
/// The run lifecycle.
pub mod engine;
/// Per-task attempt loop.
pub mod executor;
/// Dispatch strategies.
pub mod modes;
/// Cost, retry, validation and quality policies.
pub mod plugins;
/// Model routing.
pub mod router;
/// Dependency levels and readiness.
pub mod scheduler;

pub use checkpoint::{CheckpointManager, ResumePoint};
pub use config::{ExecutionConfig, OrchestratorConfig};
pub use engine::{fix_task, LoopControl, LoopResult, Orchestrator, FIX_TASK_ID};
pub use executor::{ExecutorSettings, TaskExecutor, TaskRun};
pub use modes::{select_mode, ExecutionMode};
pub use plugins::{
    BackoffStrategy, CommandQualityGate, CommandValidator, CostTracker, ModelUsage, QualityGate,
    QualityGateConfig, QualityReport, Reservation, RetryConfig, RetryPolicy, ValidationConfig,
    ValidationReport, ValidationStep, Validator,
};
pub use router::{ModelRouter, RouterConfig, RoutingDecision, RoutingSource};
pub use scheduler::{compute_levels, Scheduler};
