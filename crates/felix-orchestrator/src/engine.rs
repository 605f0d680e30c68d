use crate::checkpoint::CheckpointManager;
use crate::config::OrchestratorConfig;
use crate::executor::{ExecutorSettings, TaskExecutor, TaskRun};
use crate::modes::{select_mode, ExecutionMode};
use crate::plugins::{
    CommandQualityGate, CommandValidator, CostTracker, QualityGate, QualityReport, RetryPolicy,
    ValidationReport, Validator,
};
use crate::router::ModelRouter;
use crate::scheduler::Scheduler;
use chrono::{DateTime, Utc};
use felix_agent::{ModelCatalog, ModelTier, WorkerSource};
use felix_core::{
    Backend, Complexity, EventBus, FelixError, FelixResult, LoopEventKind, OrchestratorState,
    OrchestratorStatus, Prd, Provider, SkipReason, SkippedTask, Task, TaskExecutionResult,
};
use felix_session::{SessionRecord, Stores};
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Id of the task synthesised when the final validation pass fails.
pub const FIX_TASK_ID: &str = "fix-validation";

/// Pause, resume and cancel handle for a running orchestrator.
///
/// All three are cooperative: the loop observes them before each level and
/// before each task it dispatches. Tasks already started run to completion.
#[derive(Clone)]
pub struct LoopControl {
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    resumed: Arc<Notify>,
}

impl LoopControl {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(AtomicBool::new(false)),
            resumed: Arc::new(Notify::new()),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resumed.notify_waiters();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until resumed. Returns `false` if cancelled instead.
    async fn wait_until_resumed(&self) -> bool {
        loop {
            let notified = self.resumed.notified();
            if self.is_cancelled() {
                return false;
            }
            if !self.is_paused() {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.cancel.cancelled() => return false,
            }
        }
    }
}

impl Default for LoopControl {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopControl")
            .field("paused", &self.is_paused())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Everything a finished run reports.
#[derive(Debug, Clone, Serialize)]
pub struct LoopResult {
    pub status: OrchestratorStatus,
    pub session_id: Uuid,
    pub mode: Option<ExecutionMode>,
    pub resumed: bool,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<SkippedTask>,
    pub task_results: Vec<TaskExecutionResult>,
    pub fix_task: Option<TaskExecutionResult>,
    pub validation: Option<ValidationReport>,
    pub quality: Option<QualityReport>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub duration_ms: u64,
}

impl LoopResult {
    /// Process exit code: 0 completed, 130 cancelled, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            OrchestratorStatus::Completed => 0,
            OrchestratorStatus::Cancelled => 130,
            _ => 1,
        }
    }

    /// Human-readable report.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Run {} ({}): {} completed, {} failed, {} skipped, {} tokens, ${:.4}, {:.1}s\n",
            self.status,
            self.session_id,
            self.completed.len(),
            self.failed.len(),
            self.skipped.len(),
            self.total_tokens,
            self.total_cost_usd,
            self.duration_ms as f64 / 1000.0
        );
        for result in self.task_results.iter().filter(|r| !r.success) {
            out.push_str(&format!(
                "  failed  {} after {} attempt(s): {}\n",
                result.task_id,
                result.attempts,
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }
        for skip in &self.skipped {
            out.push_str(&format!("  skipped {}: {}\n", skip.task_id, skip.reason));
        }
        if let Some(validation) = &self.validation {
            let verdict = if validation.passed { "passed" } else { "failed" };
            out.push_str(&format!("  final validation {verdict}\n"));
        }
        if let Some(quality) = &self.quality {
            if !quality.passed {
                out.push_str(&format!("  quality gate reported {} issue(s)\n", quality.issues.len()));
            }
        }
        out
    }
}

type Pending = BoxFuture<'static, (String, Result<TaskRun, JoinError>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Finished,
    Cancelled,
}

/// Drives a plan to completion.
///
/// `start` checks that a worker is reachable, validates the plan and
/// restores any matching checkpoint; `run` routes, dispatches, validates
/// and settles the final status. All state mutation happens on the task
/// calling `run`; workers run on spawned tasks and report back.
pub struct Orchestrator {
    prd: Prd,
    plan_hash: String,
    config: OrchestratorConfig,
    source: Arc<dyn WorkerSource>,
    router: Arc<ModelRouter>,
    costs: Arc<CostTracker>,
    validator: Arc<dyn Validator>,
    quality_gate: Arc<dyn QualityGate>,
    stores: Stores,
    events: EventBus,
    control: LoopControl,
    checkpoints: CheckpointManager,
    state: OrchestratorState,
    task_results: Vec<TaskExecutionResult>,
    prepared: Option<(Arc<Scheduler>, Arc<TaskExecutor>)>,
    created_at: DateTime<Utc>,
    resumed: bool,
    dispatched: usize,
    stop: Option<SkipReason>,
}

impl Orchestrator {
    /// The plan's `config` block is layered over `config` unless the caller
    /// already did so with [`OrchestratorConfig::apply_prd`] (so overrides
    /// applied after that call keep precedence).
    pub fn new(
        prd: Prd,
        mut config: OrchestratorConfig,
        source: Arc<dyn WorkerSource>,
        catalog: Arc<ModelCatalog>,
        primary: (Provider, Backend),
        stores: Stores,
    ) -> FelixResult<Self> {
        if !config.plan_layered {
            config.apply_prd(&prd.config);
        }
        config.validate()?;
        let plan_hash = prd.plan_hash();
        let router = ModelRouter::new(config.router.clone(), catalog.clone(), primary)
            .with_patterns(stores.patterns.clone())
            .with_model_override(config.execution.model.clone());
        let costs = CostTracker::new(catalog, config.execution.max_cost_usd);
        let events = EventBus::new();
        let checkpoints = Self::checkpoint_manager(&stores, &events, &prd, &plan_hash, &config);

        Ok(Self {
            validator: Arc::new(CommandValidator::new(config.validation.clone())),
            quality_gate: Arc::new(CommandQualityGate::new(config.quality_gate.clone())),
            router: Arc::new(router),
            costs: Arc::new(costs),
            prd,
            plan_hash,
            config,
            source,
            stores,
            events,
            control: LoopControl::new(),
            checkpoints,
            state: OrchestratorState::new(),
            task_results: Vec::new(),
            prepared: None,
            created_at: Utc::now(),
            resumed: false,
            dispatched: 0,
            stop: None,
        })
    }

    fn checkpoint_manager(
        stores: &Stores,
        events: &EventBus,
        prd: &Prd,
        plan_hash: &str,
        config: &OrchestratorConfig,
    ) -> CheckpointManager {
        CheckpointManager::new(
            stores.checkpoints.clone(),
            stores.attempts.clone(),
            events.clone(),
            prd.project.clone(),
            plan_hash,
        )
        .with_flags(config.execution.enable_checkpoints, config.execution.dry_run)
    }

    /// Share an event bus with other components (e.g. the fallback router).
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.checkpoints =
            Self::checkpoint_manager(&self.stores, &events, &self.prd, &self.plan_hash, &self.config);
        self.events = events;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_quality_gate(mut self, gate: Arc<dyn QualityGate>) -> Self {
        self.quality_gate = gate;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn control(&self) -> LoopControl {
        self.control.clone()
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    pub fn costs(&self) -> &Arc<CostTracker> {
        &self.costs
    }

    pub fn plan_hash(&self) -> &str {
        &self.plan_hash
    }

    /// Resolve a worker, validate the plan and initialise or resume state.
    /// Any error here is fatal and leaves the run `failed`.
    pub async fn start(&mut self) -> FelixResult<()> {
        if self.prepared.is_some() {
            return Ok(());
        }
        if let Err(e) = self.prepare().await {
            self.fail(&e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn prepare(&mut self) -> FelixResult<()> {
        let probe_model = self
            .config
            .execution
            .model
            .clone()
            .or_else(|| self.router.default_model(ModelTier::Mid))
            .unwrap_or_default();
        let resolution = self.source.resolve(&probe_model).await?;
        info!(
            provider = %resolution.provider,
            backend = %resolution.backend,
            model = %resolution.model,
            used_fallback = resolution.used_fallback,
            "Worker available"
        );

        self.prd.validate()?;
        let scheduler = Arc::new(Scheduler::new(&self.prd.tasks)?);

        if let Err(e) = self.router.load_history().await {
            warn!(error = %e, "Failed to load routing history");
        }

        if let Some(point) = self.checkpoints.resume().await? {
            let attempts: u32 = point.task_results.iter().map(|r| r.attempts).sum();
            self.costs
                .restore(point.state.total_tokens, point.state.total_cost_usd, attempts);
            self.state = point.state;
            self.task_results = point.task_results;
            self.resumed = true;
        }

        let executor = TaskExecutor::new(
            self.source.clone(),
            self.router.clone(),
            self.costs.clone(),
            self.validator.clone(),
            self.stores.attempts.clone(),
            self.events.clone(),
            self.control.cancellation_token(),
            ExecutorSettings {
                session_id: self.state.session_id,
                project: self.prd.project.clone(),
                working_dir: self.config.execution.working_dir.clone(),
                temperature: self.config.execution.temperature,
                dry_run: self.config.execution.dry_run,
                retry: RetryPolicy::new(self.config.execution.max_attempts, self.config.retry.clone()),
            },
        );
        self.prepared = Some((scheduler, Arc::new(executor)));
        self.persist_session().await;
        Ok(())
    }

    /// Execute the plan to a terminal status.
    pub async fn run(&mut self) -> FelixResult<LoopResult> {
        self.start().await?;
        if self.state.status.is_terminal() {
            return Err(FelixError::Orchestrator(format!(
                "run already finished with status {}",
                self.state.status
            )));
        }
        match self.execute().await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn execute(&mut self) -> FelixResult<LoopResult> {
        let started = Instant::now();
        let (scheduler, executor) = self
            .prepared
            .clone()
            .ok_or_else(|| FelixError::Orchestrator("orchestrator not started".into()))?;

        let decisions = self.router.route_all(scheduler.tasks())?;
        for d in &decisions {
            debug!(
                task_id = %d.task_id,
                model = %d.selected_model,
                tier = %d.tier,
                source = %d.source,
                score = d.score,
                "Routing decision"
            );
        }

        let execution = &self.config.execution;
        let mode = select_mode(
            execution.mode,
            execution.enable_hierarchical,
            execution.max_parallel_tasks,
            &scheduler,
        );
        let limit = match mode {
            ExecutionMode::Sequential => 1,
            _ => execution.max_parallel_tasks.max(1),
        };

        self.state.transition(OrchestratorStatus::Running)?;
        if self.resumed {
            self.events.emit(LoopEventKind::LoopResumed {
                session_id: self.state.session_id,
                completed: self.state.completed_tasks.len(),
                failed: self.state.failed_tasks.len(),
                remaining: scheduler.unsettled(&self.state).len(),
            });
        }
        self.events.emit(LoopEventKind::LoopStarted {
            session_id: self.state.session_id,
            project: self.prd.project.clone(),
            total_tasks: scheduler.tasks().len(),
            mode: mode.to_string(),
        });
        info!(
            project = %self.prd.project,
            session_id = %self.state.session_id,
            tasks = scheduler.tasks().len(),
            levels = scheduler.levels().len(),
            %mode,
            resumed = self.resumed,
            "Orchestrator: starting run"
        );

        self.skip_dependents_of_failed(&scheduler).await;
        let flow = match mode {
            ExecutionMode::Hierarchical => self.dispatch_ready(&scheduler, &executor, limit).await,
            _ => self.dispatch_levels(&scheduler, &executor, limit).await,
        };
        if flow == Flow::Cancelled || self.control.is_cancelled() {
            return self.finish_cancelled(mode, started).await;
        }

        self.skip_remaining(&scheduler).await;

        let (validation, fix_task, quality) = if self.stop.is_none() {
            let (validation, fix_task) = self.final_validation(&executor).await;
            (validation, fix_task, self.run_quality_gate().await)
        } else {
            (None, None, None)
        };

        let validation_failed = validation.as_ref().is_some_and(|v| !v.passed);
        let clean_skips = self
            .state
            .skipped_tasks
            .iter()
            .all(|s| s.reason == SkipReason::TaskLimit);
        let status = if self.state.failed_tasks.is_empty() && clean_skips && !validation_failed {
            OrchestratorStatus::Completed
        } else {
            OrchestratorStatus::Failed
        };

        self.state.transition(status)?;
        self.sync_totals();
        if status == OrchestratorStatus::Completed {
            if let Err(e) = self.checkpoints.clear().await {
                warn!(error = %e, "Failed to clear checkpoint");
            }
        } else {
            self.save_checkpoint().await;
        }
        self.persist_session().await;

        self.events.emit(LoopEventKind::LoopCompleted {
            status,
            completed: self.state.completed_tasks.len(),
            failed: self.state.failed_tasks.len(),
            skipped: self.state.skipped_tasks.len(),
            total_cost_usd: self.state.total_cost_usd,
        });
        if status == OrchestratorStatus::Failed {
            let reason = self.failure_reason(validation_failed);
            warn!(reason = %reason, "Orchestrator: run failed");
            self.events.emit(LoopEventKind::LoopFailed { error: reason });
        }
        info!(
            %status,
            completed = self.state.completed_tasks.len(),
            failed = self.state.failed_tasks.len(),
            skipped = self.state.skipped_tasks.len(),
            total_cost_usd = self.state.total_cost_usd,
            duration_ms = started.elapsed().as_millis() as u64,
            "Orchestrator: run finished"
        );

        Ok(self.result(Some(mode), validation, fix_task, quality, started))
    }

    /// Level by level; at most `limit` tasks of a level in flight.
    async fn dispatch_levels(&mut self, scheduler: &Scheduler, executor: &Arc<TaskExecutor>, limit: usize) -> Flow {
        for (index, level) in scheduler.levels().iter().enumerate() {
            if self.halted() {
                break;
            }
            if !self.gate().await {
                return Flow::Cancelled;
            }
            let (runnable, skipped) = scheduler.filter_runnable(level, &mut self.state);
            if !skipped.is_empty() {
                self.emit_skips(&skipped);
                self.save_checkpoint().await;
            }
            if runnable.is_empty() {
                continue;
            }

            info!(level = index, tasks = runnable.len(), "Starting level");
            self.events.emit(LoopEventKind::LevelStarted {
                level: index,
                task_ids: runnable.clone(),
            });

            let mut queue: VecDeque<String> = runnable.into();
            let mut running: FuturesUnordered<Pending> = FuturesUnordered::new();
            loop {
                while running.len() < limit && !self.halted() {
                    let Some(id) = queue.pop_front() else {
                        break;
                    };
                    if self.state.is_settled(&id) {
                        continue;
                    }
                    let Some(task) = scheduler.task(&id).cloned() else {
                        continue;
                    };
                    if !self.gate().await {
                        self.drain(scheduler, &mut running).await;
                        return Flow::Cancelled;
                    }
                    running.push(self.spawn(executor, task));
                }
                match running.next().await {
                    Some((id, run)) => self.complete(scheduler, id, run).await,
                    None => break,
                }
            }
        }
        Flow::Finished
    }

    /// No level barrier: dispatch every task whose dependencies completed,
    /// keeping at most `limit` in flight.
    async fn dispatch_ready(&mut self, scheduler: &Scheduler, executor: &Arc<TaskExecutor>, limit: usize) -> Flow {
        let mut running: FuturesUnordered<Pending> = FuturesUnordered::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        loop {
            if !self.halted() {
                for id in scheduler.ready(&self.state, &in_flight) {
                    if running.len() >= limit || self.halted() {
                        break;
                    }
                    let Some(task) = scheduler.task(&id).cloned() else {
                        continue;
                    };
                    if !self.gate().await {
                        self.drain(scheduler, &mut running).await;
                        return Flow::Cancelled;
                    }
                    in_flight.insert(id);
                    running.push(self.spawn(executor, task));
                }
            }
            match running.next().await {
                Some((id, run)) => {
                    in_flight.remove(&id);
                    self.complete(scheduler, id, run).await;
                }
                None => break,
            }
        }
        Flow::Finished
    }

    /// A resumed run starts with its skip list cleared; dependents of tasks
    /// that already failed are recorded again before anything is dispatched.
    async fn skip_dependents_of_failed(&mut self, scheduler: &Scheduler) {
        let failed = self.state.failed_tasks.clone();
        let mut skipped = Vec::new();
        for id in &failed {
            skipped.extend(scheduler.cascade_skip(id, &mut self.state));
        }
        if !skipped.is_empty() {
            self.emit_skips(&skipped);
            self.save_checkpoint().await;
        }
    }

    fn spawn(&mut self, executor: &Arc<TaskExecutor>, task: Task) -> Pending {
        self.dispatched += 1;
        let id = task.id.clone();
        let executor = executor.clone();
        let handle = tokio::spawn(async move { executor.execute(&task).await });
        async move { (id, handle.await) }.boxed()
    }

    async fn drain(&mut self, scheduler: &Scheduler, running: &mut FuturesUnordered<Pending>) {
        while let Some((id, run)) = running.next().await {
            self.complete(scheduler, id, run).await;
        }
    }

    /// True once no further task may be dispatched.
    fn halted(&self) -> bool {
        self.stop.is_some()
            || self
                .config
                .execution
                .max_tasks
                .is_some_and(|max| self.dispatched >= max)
    }

    /// Observe cancel and pause. Returns `false` when the run is cancelled.
    async fn gate(&mut self) -> bool {
        if self.control.is_cancelled() {
            return false;
        }
        if !self.control.is_paused() {
            return true;
        }
        if let Err(e) = self.state.transition(OrchestratorStatus::Paused) {
            warn!(error = %e, "Cannot pause");
            return true;
        }
        info!(session_id = %self.state.session_id, "Orchestrator paused");
        self.events.emit(LoopEventKind::LoopPaused);
        self.save_checkpoint().await;

        if !self.control.wait_until_resumed().await {
            return false;
        }
        if let Err(e) = self.state.transition(OrchestratorStatus::Running) {
            warn!(error = %e, "Cannot resume");
        }
        info!(session_id = %self.state.session_id, "Orchestrator resumed");
        self.events.emit(LoopEventKind::LoopUnpaused);
        true
    }

    /// Fold one task's outcome into the run state. The single writer of
    /// [`OrchestratorState`] while tasks are in flight.
    async fn complete(&mut self, scheduler: &Scheduler, id: String, run: Result<TaskRun, JoinError>) {
        match run {
            Ok(TaskRun::Finished(result)) => self.settle(scheduler, result),
            Ok(TaskRun::BudgetExceeded { partial, error }) => {
                warn!(task_id = %id, error = %error, "Task rejected by the cost budget");
                if !self.config.execution.continue_on_failure && self.stop.is_none() {
                    self.stop = Some(SkipReason::BudgetExceeded);
                }
                match partial {
                    Some(result) => self.settle(scheduler, result),
                    None => {
                        self.state.mark_skipped(&id, SkipReason::BudgetExceeded);
                        let mut skipped = vec![SkippedTask {
                            task_id: id.clone(),
                            reason: SkipReason::BudgetExceeded,
                        }];
                        skipped.extend(scheduler.cascade_skip(&id, &mut self.state));
                        self.emit_skips(&skipped);
                    }
                }
            }
            Ok(TaskRun::Interrupted) => {
                info!(task_id = %id, "Task left unsettled for a later resume");
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "Task execution panicked");
                let result = TaskExecutionResult::failure(&id, "", format!("task execution panicked: {e}"));
                self.settle(scheduler, result);
            }
        }
        self.sync_totals();
        self.save_checkpoint().await;
    }

    fn settle(&mut self, scheduler: &Scheduler, result: TaskExecutionResult) {
        let id = result.task_id.clone();
        if result.success {
            self.state.mark_completed(&id);
        } else {
            self.state.mark_failed(&id);
            let skipped = scheduler.cascade_skip(&id, &mut self.state);
            self.emit_skips(&skipped);
            if !self.config.execution.continue_on_failure && self.stop.is_none() {
                warn!(task_id = %id, "Task failed, stopping the run");
                self.stop = Some(SkipReason::RunAborted);
            }
        }
        match self.task_results.iter_mut().find(|r| r.task_id == id) {
            Some(existing) => *existing = result,
            None => self.task_results.push(result),
        }
    }

    /// Skip whatever is still unsettled after the run stopped early or hit
    /// the task limit.
    async fn skip_remaining(&mut self, scheduler: &Scheduler) {
        let reason = match &self.stop {
            Some(reason) => reason.clone(),
            None if self.halted() => SkipReason::TaskLimit,
            None => return,
        };
        let mut skipped = Vec::new();
        for id in scheduler.unsettled(&self.state) {
            self.state.mark_skipped(&id, reason.clone());
            skipped.push(SkippedTask {
                task_id: id,
                reason: reason.clone(),
            });
        }
        if !skipped.is_empty() {
            self.emit_skips(&skipped);
            self.save_checkpoint().await;
        }
    }

    /// Final validation; on failure one fix task carrying the raw errors,
    /// then a second validation.
    async fn final_validation(
        &mut self,
        executor: &TaskExecutor,
    ) -> (Option<ValidationReport>, Option<TaskExecutionResult>) {
        if !self.validator.has_final() {
            return (None, None);
        }
        let dir = self.config.execution.working_dir.clone();
        let report = self.validator.validate_final(&dir).await;
        self.events.emit(LoopEventKind::ValidationCompleted {
            passed: report.passed,
            errors: report.errors.clone(),
        });
        if report.passed || !self.config.validation.fix_task || self.control.is_cancelled() {
            return (Some(report), None);
        }

        let fix = fix_task(&report.errors);
        info!(task_id = %fix.id, errors = report.errors.len(), "Final validation failed, running fix task");
        self.events.emit(LoopEventKind::FixTaskCreated {
            task_id: fix.id.clone(),
            error_count: report.errors.len(),
        });
        let fix_result = match executor.execute(&fix).await {
            TaskRun::Finished(result) => Some(result),
            TaskRun::BudgetExceeded { partial, error } => {
                warn!(task_id = %fix.id, error = %error, "Fix task rejected by the cost budget");
                partial
            }
            TaskRun::Interrupted => None,
        };
        self.sync_totals();

        let again = self.validator.validate_final(&dir).await;
        self.events.emit(LoopEventKind::ValidationCompleted {
            passed: again.passed,
            errors: again.errors.clone(),
        });
        (Some(again), fix_result)
    }

    async fn run_quality_gate(&mut self) -> Option<QualityReport> {
        if !self.config.quality_gate.enabled {
            return None;
        }
        let report = self.quality_gate.check(&self.config.execution.working_dir).await;
        if report.passed {
            self.events.emit(LoopEventKind::QualityGatePassed);
        } else {
            warn!(issues = report.issues.len(), "Quality gate reported issues");
            self.events.emit(LoopEventKind::QualityGateFailed {
                issues: report.issues.clone(),
            });
        }
        Some(report)
    }

    async fn finish_cancelled(&mut self, mode: ExecutionMode, started: Instant) -> FelixResult<LoopResult> {
        self.state.transition(OrchestratorStatus::Cancelled)?;
        self.sync_totals();
        self.save_checkpoint().await;
        self.persist_session().await;
        info!(
            completed = self.state.completed_tasks.len(),
            remaining = self
                .prepared
                .as_ref()
                .map_or(0, |(s, _)| s.unsettled(&self.state).len()),
            "Orchestrator: run cancelled"
        );
        self.events.emit(LoopEventKind::LoopCancelled {
            completed: self.state.completed_tasks.len(),
        });
        Ok(self.result(Some(mode), None, None, None, started))
    }

    /// Record a fatal error.
    async fn fail(&mut self, e: &FelixError) {
        error!(error = %e, "Orchestrator: fatal error");
        if !self.state.status.is_terminal() {
            if let Err(t) = self.state.transition(OrchestratorStatus::Failed) {
                warn!(error = %t, "Cannot mark run failed");
            }
        }
        self.sync_totals();
        self.persist_session().await;
        self.events.emit(LoopEventKind::LoopFailed { error: e.to_string() });
    }

    fn failure_reason(&self, validation_failed: bool) -> String {
        if let Some(reason) = &self.stop {
            return format!("run stopped: {reason}");
        }
        if !self.state.failed_tasks.is_empty() {
            return format!(
                "{} task(s) failed: {}",
                self.state.failed_tasks.len(),
                self.state.failed_tasks.join(", ")
            );
        }
        if validation_failed {
            return "final validation failed".to_string();
        }
        format!("{} task(s) skipped", self.state.skipped_tasks.len())
    }

    fn emit_skips(&self, skipped: &[SkippedTask]) {
        for skip in skipped {
            info!(task_id = %skip.task_id, reason = %skip.reason, "Task skipped");
            self.events.emit(LoopEventKind::TaskSkipped {
                task_id: skip.task_id.clone(),
                reason: skip.reason.clone(),
            });
        }
    }

    fn sync_totals(&mut self) {
        self.state.total_tokens = self.costs.total_tokens();
        self.state.total_cost_usd = self.costs.total_cost();
    }

    async fn save_checkpoint(&self) {
        let config = serde_json::to_value(&self.config).unwrap_or_default();
        if let Err(e) = self.checkpoints.save(&self.state, &self.task_results, config).await {
            warn!(error = %e, "Failed to write checkpoint");
        }
    }

    async fn persist_session(&self) {
        let record = SessionRecord {
            id: self.state.session_id,
            project: self.prd.project.clone(),
            plan_hash: self.plan_hash.clone(),
            status: self.state.status,
            started_at: self.state.started_at.unwrap_or(self.created_at),
            completed_at: self.state.completed_at,
            total_tokens: self.state.total_tokens,
            total_cost_usd: self.state.total_cost_usd,
        };
        if let Err(e) = self.stores.sessions.upsert_session(&record).await {
            warn!(session_id = %record.id, error = %e, "Failed to record session");
        }
    }

    fn result(
        &self,
        mode: Option<ExecutionMode>,
        validation: Option<ValidationReport>,
        fix_task: Option<TaskExecutionResult>,
        quality: Option<QualityReport>,
        started: Instant,
    ) -> LoopResult {
        LoopResult {
            status: self.state.status,
            session_id: self.state.session_id,
            mode,
            resumed: self.resumed,
            completed: self.state.completed_tasks.clone(),
            failed: self.state.failed_tasks.clone(),
            skipped: self.state.skipped_tasks.clone(),
            task_results: self.task_results.clone(),
            fix_task,
            validation,
            quality,
            total_tokens: self.state.total_tokens,
            total_cost_usd: self.state.total_cost_usd,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// A task asking the worker to repair whatever the final validation found.
pub fn fix_task(errors: &[String]) -> Task {
    let mut description = String::from(
        "The final validation pass failed after all planned tasks ran. \
         Fix the code so that every check passes without changing intended behaviour.\n\n\
         Validation errors:\n",
    );
    for e in errors {
        description.push('\n');
        description.push_str(e);
        description.push('\n');
    }
    Task::new(FIX_TASK_ID, "Fix final validation errors")
        .with_description(description)
        .with_complexity(Complexity::Moderate)
        .with_tags(["fix"])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_task_carries_raw_errors() {
        let task = fix_task(&["typecheck failed (exit 2):\nerror TS2322".to_string(), "lint: 4 warnings".into()]);
        assert_eq!(task.id, FIX_TASK_ID);
        assert_eq!(task.complexity, Complexity::Moderate);
        assert!(task.description.contains("error TS2322"));
        assert!(task.description.contains("lint: 4 warnings"));
    }

    #[test]
    fn test_exit_codes() {
        let mut result = LoopResult {
            status: OrchestratorStatus::Completed,
            session_id: Uuid::new_v4(),
            mode: None,
            resumed: false,
            completed: vec!["A".into()],
            failed: Vec::new(),
            skipped: Vec::new(),
            task_results: Vec::new(),
            fix_task: None,
            validation: None,
            quality: None,
            total_tokens: 0,
            total_cost_usd: 0.0,
            duration_ms: 1500,
        };
        assert_eq!(result.exit_code(), 0);
        assert!(result.summary().contains("1 completed"));
        result.status = OrchestratorStatus::Failed;
        assert_eq!(result.exit_code(), 1);
        result.status = OrchestratorStatus::Cancelled;
        assert_eq!(result.exit_code(), 130);
    }

    #[tokio::test]
    async fn test_control_resume_wakes_waiter() {
        let control = LoopControl::new();
        control.pause();
        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.wait_until_resumed().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        control.resume();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_control_cancel_wakes_waiter() {
        let control = LoopControl::new();
        control.pause();
        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.wait_until_resumed().await });
        control.cancel();
        assert!(!handle.await.unwrap());
    }
}
