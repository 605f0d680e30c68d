use felix_core::{
    Checkpoint, EventBus, FelixResult, LoopEventKind, OrchestratorState, OrchestratorStatus,
    TaskExecutionResult,
};
use felix_session::{AttemptLog, CheckpointStore};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// State recovered from an interrupted run.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub state: OrchestratorState,
    pub task_results: Vec<TaskExecutionResult>,
    /// Attempts that were still open and got closed as interrupted.
    pub interrupted_attempts: usize,
}

/// Saves and restores run snapshots for one project and plan.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    attempts: Arc<dyn AttemptLog>,
    events: EventBus,
    project: String,
    plan_hash: String,
    enabled: bool,
    dry_run: bool,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        attempts: Arc<dyn AttemptLog>,
        events: EventBus,
        project: impl Into<String>,
        plan_hash: impl Into<String>,
    ) -> Self {
        Self {
            store,
            attempts,
            events,
            project: project.into(),
            plan_hash: plan_hash.into(),
            enabled: true,
            dry_run: false,
        }
    }

    /// `enabled` gates both resume and writes; `dry_run` only gates writes.
    pub fn with_flags(mut self, enabled: bool, dry_run: bool) -> Self {
        self.enabled = enabled;
        self.dry_run = dry_run;
        self
    }

    pub fn writes_enabled(&self) -> bool {
        self.enabled && !self.dry_run
    }

    /// Load the project's checkpoint if it belongs to the current plan.
    ///
    /// The returned state is back at `idle` with its skip list emptied so
    /// the scheduler can recompute it, and every attempt the previous run
    /// left open is closed as failed.
    pub async fn resume(&self) -> FelixResult<Option<ResumePoint>> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(checkpoint) = self.store.load(&self.project).await? else {
            return Ok(None);
        };
        if !checkpoint.matches_plan(&self.plan_hash) {
            warn!(
                project = %self.project,
                checkpoint_hash = %checkpoint.plan_hash,
                plan_hash = %self.plan_hash,
                "Plan changed since the checkpoint was written, ignoring it"
            );
            return Ok(None);
        }

        let mut state = checkpoint.state;
        state.status = OrchestratorStatus::Idle;
        state.completed_at = None;
        state.skipped_tasks.clear();

        let interrupted_attempts = self
            .attempts
            .close_open_attempts(state.session_id, "interrupted")
            .await?;

        info!(
            project = %self.project,
            session_id = %state.session_id,
            completed = state.completed_tasks.len(),
            failed = state.failed_tasks.len(),
            interrupted_attempts,
            "Resuming from checkpoint"
        );

        Ok(Some(ResumePoint {
            state,
            task_results: checkpoint.task_results,
            interrupted_attempts,
        }))
    }

    /// Replace the project's checkpoint. Returns the new checkpoint id, or
    /// `None` when writes are disabled.
    pub async fn save(
        &self,
        state: &OrchestratorState,
        task_results: &[TaskExecutionResult],
        config: serde_json::Value,
    ) -> FelixResult<Option<Uuid>> {
        if !self.writes_enabled() {
            return Ok(None);
        }
        let checkpoint = Checkpoint::new(
            &self.project,
            &self.plan_hash,
            state.clone(),
            task_results.to_vec(),
            config,
        );
        self.store.save(&checkpoint).await?;
        self.events.emit(LoopEventKind::CheckpointSaved {
            checkpoint_id: checkpoint.id,
            completed: state.completed_tasks.len(),
        });
        Ok(Some(checkpoint.id))
    }

    pub async fn clear(&self) -> FelixResult<()> {
        if !self.writes_enabled() {
            return Ok(());
        }
        self.store.clear(&self.project).await
    }
}
