use crate::health::HealthMonitor;
use crate::registry::ModelRegistry;
use crate::worker::{WorkOutcome, WorkRequest, Worker};
use async_trait::async_trait;
use felix_core::{
    Backend, EventBus, FallbackAttempt, FallbackReport, FelixError, FelixResult, LoopEventKind,
    Provider,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Fallback behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Candidates tried after the primary.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Providers eligible as alternates, in preference order.
    #[serde(default = "default_providers")]
    pub providers: Vec<Provider>,
}

fn default_max_retries() -> usize {
    2
}

fn default_providers() -> Vec<Provider> {
    Provider::ALL.to_vec()
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            providers: default_providers(),
        }
    }
}

/// A worker together with the path taken to obtain it.
#[derive(Clone)]
pub struct WorkerResolution {
    pub worker: Arc<dyn Worker>,
    pub provider: Provider,
    pub backend: Backend,
    pub model: String,
    pub used_fallback: bool,
    /// Every candidate considered, in order, including the winner.
    pub attempts: Vec<FallbackAttempt>,
}

impl std::fmt::Debug for WorkerResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerResolution")
            .field("provider", &self.provider)
            .field("backend", &self.backend)
            .field("model", &self.model)
            .field("used_fallback", &self.used_fallback)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Outcome of one task execution routed through the fallback chain.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub outcome: WorkOutcome,
    pub provider: Provider,
    pub backend: Backend,
    /// The model that actually ran (may differ from the requested one on
    /// another provider).
    pub model: String,
    pub used_fallback: bool,
    pub attempts: Vec<FallbackAttempt>,
}

/// Where the orchestrator gets workers from.
#[async_trait]
pub trait WorkerSource: Send + Sync {
    /// Find a usable worker for `model`, without running anything.
    async fn resolve(&self, model: &str) -> FelixResult<WorkerResolution>;

    /// Run `request` on the first candidate that can be driven. Each
    /// candidate is bounded by `request.timeout`.
    async fn dispatch(&self, request: &WorkRequest) -> FelixResult<Dispatch>;
}

/// Resolves workers through an ordered chain of `(provider, backend)`
/// candidates, skipping unhealthy CLIs.
///
/// Candidate order: the primary pair, the primary provider on the other
/// backend, the other providers on the primary backend, then the other
/// providers on the other backend. The chain is cut to `1 + max_retries`.
pub struct FallbackRouter {
    registry: Arc<ModelRegistry>,
    health: Arc<HealthMonitor>,
    config: FallbackConfig,
    primary: (Provider, Backend),
    events: EventBus,
}

impl FallbackRouter {
    pub fn new(
        registry: Arc<ModelRegistry>,
        health: Arc<HealthMonitor>,
        config: FallbackConfig,
        primary: (Provider, Backend),
    ) -> Self {
        Self {
            registry,
            health,
            config,
            primary,
            events: EventBus::new(),
        }
    }

    /// Emit `fallback_used` events on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// The ordered, truncated candidate chain.
    pub fn candidates(&self) -> Vec<(Provider, Backend)> {
        let (provider, backend) = self.primary;
        let alternates: Vec<Provider> = self
            .config
            .providers
            .iter()
            .copied()
            .filter(|p| *p != provider)
            .collect();

        let mut chain = vec![(provider, backend), (provider, backend.alternate())];
        chain.extend(alternates.iter().map(|p| (*p, backend)));
        chain.extend(alternates.iter().map(|p| (*p, backend.alternate())));
        chain.truncate(1 + self.config.max_retries);
        chain
    }

    /// Model to request on `provider` for a plan that asked for `model`.
    fn model_for(&self, model: &str, provider: Provider) -> FelixResult<String> {
        match self.registry.equivalent(model, provider) {
            Ok(spec) => Ok(spec.id.clone()),
            // Models outside the catalog go to the primary provider untouched.
            Err(_) if provider == self.primary.0 => Ok(model.to_string()),
            Err(e) => Err(e),
        }
    }

    /// Build the worker for a candidate, or say why it cannot be used.
    async fn prepare(
        &self,
        provider: Provider,
        backend: Backend,
        model: &str,
    ) -> Result<(Arc<dyn Worker>, String), (String, bool)> {
        if backend == Backend::Cli && !self.health.is_healthy(provider, false).await {
            let reason = self
                .health
                .snapshot(provider)
                .last_error
                .unwrap_or_else(|| "provider unhealthy".into());
            return Err((format!("skipped, unhealthy: {reason}"), true));
        }
        let model = self.model_for(model, provider).map_err(|e| (e.to_string(), false))?;
        let worker = self
            .registry
            .worker(provider, backend, &model)
            .map_err(|e| (e.to_string(), false))?;
        worker.ready().map_err(|e| (e.to_string(), false))?;
        Ok((worker, model))
    }

    fn announce(&self, provider: Provider, backend: Backend, model: &str) {
        let (requested_provider, requested_backend) = self.primary;
        warn!(
            %requested_provider,
            %requested_backend,
            %provider,
            %backend,
            model,
            "Using fallback worker"
        );
        self.events.emit(LoopEventKind::FallbackUsed {
            requested_provider,
            requested_backend,
            provider,
            backend,
            model: model.to_string(),
        });
    }
}

fn attempt(provider: Provider, backend: Backend, model: &str, error: Option<String>, skipped: bool) -> FallbackAttempt {
    FallbackAttempt {
        provider,
        backend,
        model: model.to_string(),
        error,
        skipped,
    }
}

#[async_trait]
impl WorkerSource for FallbackRouter {
    async fn resolve(&self, model: &str) -> FelixResult<WorkerResolution> {
        let mut attempts = Vec::new();
        for (i, (provider, backend)) in self.candidates().into_iter().enumerate() {
            match self.prepare(provider, backend, model).await {
                Ok((worker, resolved)) => {
                    attempts.push(attempt(provider, backend, &resolved, None, false));
                    let used_fallback = i > 0;
                    if used_fallback {
                        self.announce(provider, backend, &resolved);
                    }
                    info!(%provider, %backend, model = %resolved, "Worker resolved");
                    return Ok(WorkerResolution {
                        worker,
                        provider,
                        backend,
                        model: resolved,
                        used_fallback,
                        attempts,
                    });
                }
                Err((error, skipped)) => {
                    warn!(%provider, %backend, error = %error, "Worker candidate unavailable");
                    attempts.push(attempt(provider, backend, model, Some(error), skipped));
                }
            }
        }
        Err(FelixError::FallbackExhausted(FallbackReport { attempts }))
    }

    async fn dispatch(&self, request: &WorkRequest) -> FelixResult<Dispatch> {
        let mut attempts = Vec::new();
        for (i, (provider, backend)) in self.candidates().into_iter().enumerate() {
            let (worker, model) = match self.prepare(provider, backend, &request.model).await {
                Ok(found) => found,
                Err((error, skipped)) => {
                    attempts.push(attempt(provider, backend, &request.model, Some(error), skipped));
                    continue;
                }
            };

            let mut routed = request.clone();
            routed.model = model.clone();
            // Each candidate gets the full task timeout, so a hung primary
            // still leaves room for the alternates.
            let executed = match tokio::time::timeout(request.timeout, worker.execute(&routed)).await {
                Ok(result) => result,
                Err(_) => Err(FelixError::Timeout(request.timeout.as_secs())),
            };
            match executed {
                Ok(outcome) => {
                    // The provider answered; a task-level failure is not a health problem.
                    self.health.record_success(provider);
                    attempts.push(attempt(provider, backend, &model, None, false));
                    let used_fallback = i > 0;
                    if used_fallback {
                        self.announce(provider, backend, &model);
                    }
                    return Ok(Dispatch {
                        outcome,
                        provider,
                        backend,
                        model,
                        used_fallback,
                        attempts,
                    });
                }
                Err(e) => {
                    warn!(
                        task_id = %request.task.id,
                        %provider,
                        %backend,
                        error = %e,
                        "Worker failed, trying next candidate"
                    );
                    self.health.record_failure(provider, e.to_string());
                    attempts.push(attempt(provider, backend, &model, Some(e.to_string()), false));
                }
            }
        }
        Err(FelixError::FallbackExhausted(FallbackReport { attempts }))
    }
}
