//! LLM workers, model catalog, provider health and fallback routing.
//!
//! A [`Worker`] executes one task with one model and reports usage and cost.
//! Workers come in two flavours: [`CliWorker`] drives a provider's coding CLI
//! and [`ApiWorker`] calls the provider's HTTP API. The [`FallbackRouter`]
//! picks a worker through an ordered candidate chain, consulting the
//! [`HealthMonitor`] and building instances through the [`ModelRegistry`].

pub mod backends;
pub mod catalog;
pub mod config;
pub mod fallback;
pub mod health;
pub mod registry;
pub mod worker;

pub use backends::{ApiWorker, CliWorker};
pub use catalog::{ModelCatalog, ModelSpec, ModelTier};
pub use config::ModelConfig;
pub use fallback::{Dispatch, FallbackConfig, FallbackRouter, WorkerResolution, WorkerSource};
pub use health::{CliProbe, HealthConfig, HealthMonitor, HealthProbe, ProviderHealth};
pub use registry::{DefaultWorkerFactory, ModelRegistry, WorkerFactory};
pub use worker::{build_task_prompt, WorkOutcome, WorkRequest, Worker};
