use crate::plugins::{CostTracker, Reservation, RetryPolicy, Validator};
use crate::router::{ModelRouter, RoutingDecision};
use felix_agent::{build_task_prompt, WorkRequest, WorkerSource};
use felix_core::{
    classify_message, Attempt, ErrorClass, EventBus, LoopEventKind, Task,
    TaskExecutionResult, TokenUsage,
};
use felix_session::AttemptLog;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// How one task's execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRun {
    /// The retry policy ran its course.
    Finished(TaskExecutionResult),
    /// The cost ceiling rejected the next attempt before it reached a
    /// worker. `partial` is set when earlier attempts already ran.
    BudgetExceeded {
        partial: Option<TaskExecutionResult>,
        error: String,
    },
    /// Cancelled between attempts; the task is left for a later resume.
    Interrupted,
}

/// Per-run settings the executor needs.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub session_id: Uuid,
    pub project: String,
    pub working_dir: PathBuf,
    pub temperature: f32,
    pub dry_run: bool,
    pub retry: RetryPolicy,
}

/// Runs a task through attempts, retries and model escalation.
pub struct TaskExecutor {
    source: Arc<dyn WorkerSource>,
    router: Arc<ModelRouter>,
    costs: Arc<CostTracker>,
    validator: Arc<dyn Validator>,
    attempts: Arc<dyn AttemptLog>,
    events: EventBus,
    cancel: CancellationToken,
    settings: ExecutorSettings,
}

struct AttemptOutcome {
    model: String,
    success: bool,
    tokens: TokenUsage,
    cost_usd: f64,
    files: Vec<String>,
    error: Option<String>,
    class: ErrorClass,
}

impl TaskExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn WorkerSource>,
        router: Arc<ModelRouter>,
        costs: Arc<CostTracker>,
        validator: Arc<dyn Validator>,
        attempts: Arc<dyn AttemptLog>,
        events: EventBus,
        cancel: CancellationToken,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            source,
            router,
            costs,
            validator,
            attempts,
            events,
            cancel,
            settings,
        }
    }

    /// Execute `task` until it succeeds, its failures stop being retryable,
    /// the budget refuses another attempt or the run is cancelled.
    ///
    /// Attempt numbers keep counting across escalations; each tier gets a
    /// fresh attempt budget.
    pub async fn execute(&self, task: &Task) -> TaskRun {
        let started = Instant::now();
        let mut decision = match self.router.decision_for(task) {
            Ok(d) => d,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Routing failed");
                return TaskRun::Finished(TaskExecutionResult::failure(&task.id, "", e.to_string()));
            }
        };
        let max_escalations = self.router.config().max_escalations;
        let cascade = self.router.config().enable_cascade;

        let mut summary = TaskExecutionResult::failure(&task.id, &decision.selected_model, "not attempted");
        let mut tier_attempt = 0u32;
        let mut escalations = 0u32;

        loop {
            if summary.attempts > 0 && self.cancel.is_cancelled() {
                info!(task_id = %task.id, attempts = summary.attempts, "Task interrupted by cancellation");
                return TaskRun::Interrupted;
            }
            let reserved = tokio::select! {
                _ = self.cancel.cancelled(), if summary.attempts > 0 => {
                    info!(task_id = %task.id, "Task interrupted waiting for budget");
                    return TaskRun::Interrupted;
                }
                reserved = self.costs.reserve(task, &decision.selected_model) => reserved,
            };
            let reservation = match reserved {
                Ok(r) => r,
                Err(e) => {
                    let error = e.to_string();
                    let partial = (summary.attempts > 0).then(|| {
                        summary.error = Some(error.clone());
                        summary.duration_ms = started.elapsed().as_millis() as u64;
                        summary.clone()
                    });
                    return TaskRun::BudgetExceeded { partial, error };
                }
            };

            summary.attempts += 1;
            tier_attempt += 1;
            let attempt_number = summary.attempts;
            let outcome = self.attempt(task, &decision, attempt_number, reservation).await;

            summary.model.clone_from(&outcome.model);
            summary.tokens += outcome.tokens;
            summary.cost_usd += outcome.cost_usd;
            for file in &outcome.files {
                if !summary.files_modified.contains(file) {
                    summary.files_modified.push(file.clone());
                }
            }

            if outcome.success {
                summary.success = true;
                summary.error = None;
                summary.duration_ms = started.elapsed().as_millis() as u64;
                info!(
                    task_id = %task.id,
                    attempt_number,
                    model = %outcome.model,
                    cost_usd = summary.cost_usd,
                    "Task completed"
                );
                self.events.emit(LoopEventKind::TaskCompleted {
                    task_id: task.id.clone(),
                    attempt_number,
                    model: outcome.model,
                    cost_usd: summary.cost_usd,
                    files_modified: summary.files_modified.clone(),
                });
                return TaskRun::Finished(summary);
            }

            let error = outcome.error.unwrap_or_else(|| "worker reported failure".into());
            summary.error = Some(error.clone());
            let retry = self.settings.retry.should_retry(outcome.class, tier_attempt);

            if !retry && cascade && escalations < max_escalations {
                if let Some(next) = self.router.escalate(&decision) {
                    self.events.emit(LoopEventKind::TaskFailed {
                        task_id: task.id.clone(),
                        attempt_number,
                        model: outcome.model,
                        error,
                        will_retry: true,
                    });
                    self.events.emit(LoopEventKind::ModelEscalated {
                        task_id: task.id.clone(),
                        from_model: decision.selected_model.clone(),
                        to_model: next.selected_model.clone(),
                        tier: next.tier.to_string(),
                    });
                    decision = next;
                    escalations += 1;
                    tier_attempt = 0;
                    continue;
                }
            }

            warn!(
                task_id = %task.id,
                attempt_number,
                class = ?outcome.class,
                will_retry = retry,
                error = %error,
                "Task attempt failed"
            );
            self.events.emit(LoopEventKind::TaskFailed {
                task_id: task.id.clone(),
                attempt_number,
                model: outcome.model,
                error,
                will_retry: retry,
            });
            if !retry {
                summary.duration_ms = started.elapsed().as_millis() as u64;
                return TaskRun::Finished(summary);
            }

            let delay = self.settings.retry.delay(tier_attempt);
            self.events.emit(LoopEventKind::TaskRetrying {
                task_id: task.id.clone(),
                next_attempt: attempt_number + 1,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(task_id = %task.id, "Task interrupted during backoff");
                    return TaskRun::Interrupted;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One attempt: open it, dispatch, validate, close it and feed the
    /// router's history. The reservation is settled with the worker's cost,
    /// or released when dispatch errors.
    async fn attempt(
        &self,
        task: &Task,
        decision: &RoutingDecision,
        attempt_number: u32,
        reservation: Reservation<'_>,
    ) -> AttemptOutcome {
        let mut record = Attempt::open(
            self.settings.session_id,
            &task.id,
            attempt_number,
            &decision.selected_model,
            &decision.signature,
        );
        self.log(&record).await;
        info!(
            task_id = %task.id,
            attempt_number,
            model = %decision.selected_model,
            "Task attempt started"
        );
        self.events.emit(LoopEventKind::TaskStarted {
            task_id: task.id.clone(),
            attempt_number,
            model: decision.selected_model.clone(),
        });

        let request = WorkRequest {
            task: task.clone(),
            prompt: build_task_prompt(task, &self.settings.project),
            model: decision.selected_model.clone(),
            temperature: self.settings.temperature,
            timeout: task.timeout(),
            working_dir: self.settings.working_dir.clone(),
            dry_run: self.settings.dry_run,
        };

        let dispatched = self.source.dispatch(&request).await;

        let outcome = match dispatched {
            Ok(dispatch) => {
                let work = dispatch.outcome;
                reservation.settle(&dispatch.model, work.tokens, work.cost_usd);
                let (success, error, class) = if work.success {
                    let report = self.validator.validate_task(task, &self.settings.working_dir).await;
                    if report.passed {
                        (true, None, ErrorClass::Transient)
                    } else {
                        let error = format!("post-task validation failed:\n{}", report.errors.join("\n"));
                        (false, Some(error), ErrorClass::Transient)
                    }
                } else {
                    let error = work.error.unwrap_or_else(|| "worker reported failure".into());
                    let class = classify_message(&error);
                    (false, Some(error), class)
                };
                AttemptOutcome {
                    model: dispatch.model,
                    success,
                    tokens: work.tokens,
                    cost_usd: work.cost_usd.max(0.0),
                    files: work.file_changes,
                    error,
                    class,
                }
            }
            Err(e) => {
                drop(reservation);
                AttemptOutcome {
                    model: decision.selected_model.clone(),
                    success: false,
                    tokens: TokenUsage::default(),
                    cost_usd: 0.0,
                    files: Vec::new(),
                    error: Some(e.to_string()),
                    class: e.class(),
                }
            }
        };

        record.close(
            outcome.success,
            outcome.tokens,
            outcome.cost_usd,
            outcome.files.clone(),
            outcome.error.clone(),
        );
        self.log(&record).await;
        self.router
            .record_attempt(decision, &outcome.model, outcome.success, outcome.cost_usd)
            .await;

        self.events.emit(LoopEventKind::CostUpdate {
            task_id: task.id.clone(),
            cost_usd: outcome.cost_usd,
            total_cost_usd: self.costs.total_cost(),
            total_tokens: self.costs.total_tokens(),
            budget_usd: self.costs.budget(),
        });
        outcome
    }

    async fn log(&self, attempt: &Attempt) {
        if let Err(e) = self.attempts.record(attempt).await {
            warn!(task_id = %attempt.task_id, error = %e, "Failed to record attempt");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::plugins::{CommandValidator, RetryConfig, ValidationReport};
    use crate::router::RouterConfig;
    use async_trait::async_trait;
    use felix_agent::{Dispatch, ModelCatalog, ModelTier, WorkOutcome, WorkerResolution};
    use felix_core::{Backend, FelixError, FelixResult, LoopEvent, Provider};
    use felix_session::MemoryStore;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::path::Path;

    /// Replays canned results and remembers which models were asked for.
    #[derive(Default)]
    struct Scripted {
        results: Mutex<VecDeque<FelixResult<WorkOutcome>>>,
        models: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(results: Vec<FelixResult<WorkOutcome>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                models: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl WorkerSource for Scripted {
        async fn resolve(&self, _model: &str) -> FelixResult<WorkerResolution> {
            Err(FelixError::Config("not used".into()))
        }

        async fn dispatch(&self, request: &WorkRequest) -> FelixResult<Dispatch> {
            self.models.lock().push(request.model.clone());
            let next = self
                .results
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(WorkOutcome::succeeded("ok", TokenUsage::new(1, 1), 0.0)));
            next.map(|outcome| Dispatch {
                outcome,
                provider: Provider::Anthropic,
                backend: Backend::Cli,
                model: request.model.clone(),
                used_fallback: false,
                attempts: Vec::new(),
            })
        }
    }

    struct FailingValidator;

    #[async_trait]
    impl Validator for FailingValidator {
        fn has_final(&self) -> bool {
            false
        }

        async fn validate_task(&self, _task: &Task, _dir: &Path) -> ValidationReport {
            ValidationReport::fail(vec!["typecheck: 3 errors".into()])
        }

        async fn validate_final(&self, _dir: &Path) -> ValidationReport {
            ValidationReport::pass()
        }
    }

    struct Harness {
        executor: TaskExecutor,
        store: Arc<MemoryStore>,
        costs: Arc<CostTracker>,
        events: Arc<Mutex<Vec<LoopEvent>>>,
        cancel: CancellationToken,
        session_id: Uuid,
    }

    fn harness(
        source: Arc<Scripted>,
        router_config: RouterConfig,
        budget: Option<f64>,
        validator: Arc<dyn Validator>,
    ) -> Harness {
        let catalog = Arc::new(ModelCatalog::default());
        let store = Arc::new(MemoryStore::new());
        let router = Arc::new(ModelRouter::new(router_config, catalog.clone(), (Provider::Anthropic, Backend::Cli)));
        let costs = Arc::new(CostTracker::new(catalog, budget));
        let bus = EventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        bus.subscribe(move |e| sink.lock().push(e.clone()));
        let cancel = CancellationToken::new();
        let session_id = Uuid::new_v4();
        let executor = TaskExecutor::new(
            source,
            router,
            costs.clone(),
            validator,
            store.clone(),
            bus,
            cancel.clone(),
            ExecutorSettings {
                session_id,
                project: "shop".into(),
                working_dir: std::env::temp_dir(),
                temperature: 0.2,
                dry_run: false,
                retry: RetryPolicy::new(
                    3,
                    RetryConfig {
                        base_delay_ms: 1,
                        max_delay_ms: 5,
                        ..RetryConfig::default()
                    },
                ),
            },
        );
        Harness {
            executor,
            store,
            costs,
            events,
            cancel,
            session_id,
        }
    }

    fn names(events: &Mutex<Vec<LoopEvent>>) -> Vec<&'static str> {
        events.lock().iter().map(LoopEvent::name).collect()
    }

    fn finished(run: TaskRun) -> TaskExecutionResult {
        match run {
            TaskRun::Finished(r) => r,
            other => panic!("expected a finished run, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let source = Scripted::new(vec![
            Err(FelixError::Timeout(5)),
            Ok(WorkOutcome::succeeded("done", TokenUsage::new(10, 5), 0.25)),
        ]);
        let h = harness(source, RouterConfig::default(), None, Arc::new(CommandValidator::default()));
        let result = finished(h.executor.execute(&Task::new("A", "a")).await);
        assert!(result.success);
        assert_eq!(result.attempts, 2);
        assert!((result.cost_usd - 0.25).abs() < 1e-9);
        assert!(names(&h.events).contains(&"task_retrying"));

        let attempts = h.store.attempts(h.session_id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|a| !a.is_open()));
        let logged: f64 = attempts.iter().map(|a| a.cost_usd).sum();
        assert!((logged - h.costs.total_cost()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let source = Scripted::new(vec![Ok(WorkOutcome::failed(
            "SyntaxError: unexpected token",
            TokenUsage::new(5, 5),
            0.1,
        ))]);
        let h = harness(source.clone(), RouterConfig::default(), None, Arc::new(CommandValidator::default()));
        let result = finished(h.executor.execute(&Task::new("A", "a")).await);
        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert!(result.error.unwrap().contains("SyntaxError"));
        assert_eq!(source.models.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_failure_exhausts_attempts() {
        let source = Scripted::new(vec![
            Ok(WorkOutcome::failed("tests did not pass", TokenUsage::default(), 0.0)),
            Ok(WorkOutcome::failed("tests did not pass", TokenUsage::default(), 0.0)),
            Ok(WorkOutcome::failed("tests did not pass", TokenUsage::default(), 0.0)),
        ]);
        let h = harness(source, RouterConfig::default(), None, Arc::new(CommandValidator::default()));
        let result = finished(h.executor.execute(&Task::new("A", "a")).await);
        assert_eq!(result.attempts, 3);
        let failed: Vec<bool> = h
            .events
            .lock()
            .iter()
            .filter_map(|e| match &e.kind {
                LoopEventKind::TaskFailed { will_retry, .. } => Some(*will_retry),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![true, true, false]);
    }

    #[tokio::test]
    async fn test_validation_failure_triggers_retry() {
        let source = Scripted::new(vec![]);
        let h = harness(source.clone(), RouterConfig::default(), None, Arc::new(FailingValidator));
        let result = finished(h.executor.execute(&Task::new("A", "a")).await);
        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert!(result.error.unwrap().contains("post-task validation failed"));
    }

    #[tokio::test]
    async fn test_permanent_failure_escalates_with_cascade() {
        let source = Scripted::new(vec![Ok(WorkOutcome::failed(
            "AssertionError: expected 2",
            TokenUsage::default(),
            0.0,
        ))]);
        let config = RouterConfig {
            enable_cascade: true,
            ..RouterConfig::default()
        };
        let h = harness(source.clone(), config, None, Arc::new(CommandValidator::default()));
        let task = Task::new("A", "Tiny").with_complexity(felix_core::Complexity::Trivial);
        let result = finished(h.executor.execute(&task).await);
        assert!(result.success);
        assert_eq!(result.attempts, 2);
        assert_eq!(*source.models.lock(), vec!["claude-3-5-haiku", "claude-sonnet-4"]);
        let escalated = h.events.lock().iter().any(|e| {
            matches!(&e.kind, LoopEventKind::ModelEscalated { to_model, tier, .. }
                if to_model == "claude-sonnet-4" && tier == &ModelTier::Mid.to_string())
        });
        assert!(escalated);
    }

    #[tokio::test]
    async fn test_budget_rejects_before_dispatch() {
        let source = Scripted::new(vec![]);
        let h = harness(source.clone(), RouterConfig::default(), Some(0.5), Arc::new(CommandValidator::default()));
        h.costs.record("m", TokenUsage::default(), 0.4);
        let run = h.executor.execute(&Task::new("A", "a")).await;
        match run {
            TaskRun::BudgetExceeded { partial, error } => {
                assert!(partial.is_none());
                assert!(error.contains("Budget exceeded"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(source.models.lock().is_empty());
    }

    #[tokio::test]
    async fn test_budget_breach_before_retry_keeps_partial() {
        let source = Scripted::new(vec![Ok(WorkOutcome::failed(
            "503 overloaded",
            TokenUsage::new(100, 10),
            0.9,
        ))]);
        let h = harness(source.clone(), RouterConfig::default(), Some(1.0), Arc::new(CommandValidator::default()));
        // The catalog estimate lets the first attempt through; the retry
        // would cost another 0.9 on top of the 0.9 already spent.
        let run = h.executor.execute(&Task::new("A", "a")).await;
        match run {
            TaskRun::BudgetExceeded { partial: Some(partial), error } => {
                assert_eq!(partial.attempts, 1);
                assert!(!partial.success);
                assert!((partial.cost_usd - 0.9).abs() < 1e-9);
                assert_eq!(partial.error.as_deref(), Some(error.as_str()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(source.models.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_between_attempts() {
        let source = Scripted::new(vec![Err(FelixError::Timeout(1))]);
        let h = harness(source.clone(), RouterConfig::default(), None, Arc::new(CommandValidator::default()));
        h.cancel.cancel();
        // The first attempt still runs; the retry does not.
        assert_eq!(h.executor.execute(&Task::new("A", "a")).await, TaskRun::Interrupted);
        assert_eq!(source.models.lock().len(), 1);
    }
}
