use crate::state::{OrchestratorState, TaskExecutionResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable snapshot of a run, written at task-completion boundaries.
///
/// Checkpoints are replaced wholesale, never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Key the checkpoint is stored under (the project path or name).
    pub project: String,
    pub plan_hash: String,
    pub state: OrchestratorState,
    pub task_results: Vec<TaskExecutionResult>,
    /// Effective orchestrator configuration at the time of the snapshot.
    #[serde(default)]
    pub config: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        project: impl Into<String>,
        plan_hash: impl Into<String>,
        state: OrchestratorState,
        task_results: Vec<TaskExecutionResult>,
        config: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: state.session_id,
            project: project.into(),
            plan_hash: plan_hash.into(),
            state,
            task_results,
            config,
            updated_at: Utc::now(),
        }
    }

    pub fn matches_plan(&self, plan_hash: &str) -> bool {
        self.plan_hash == plan_hash
    }
}
