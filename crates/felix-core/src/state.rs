use crate::{FelixError, FelixResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl OrchestratorStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestratorStatus::Completed | OrchestratorStatus::Failed | OrchestratorStatus::Cancelled
        )
    }

    /// Allowed edges: `idle → running ⇄ paused`, `running|paused → terminal`.
    pub fn can_transition_to(&self, next: OrchestratorStatus) -> bool {
        use OrchestratorStatus::{Cancelled, Completed, Failed, Idle, Paused, Running};
        match (self, next) {
            (Idle, Running) => true,
            (Idle, Failed) | (Idle, Cancelled) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            (Paused, Failed) | (Paused, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OrchestratorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrchestratorStatus::Idle => "idle",
            OrchestratorStatus::Running => "running",
            OrchestratorStatus::Paused => "paused",
            OrchestratorStatus::Completed => "completed",
            OrchestratorStatus::Failed => "failed",
            OrchestratorStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Why a task was never executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    DependencyFailed { dependency: String },
    DependencySkipped { dependency: String },
    BudgetExceeded,
    RunAborted,
    TaskLimit,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::DependencyFailed { dependency } => {
                write!(f, "dependency '{dependency}' failed")
            }
            SkipReason::DependencySkipped { dependency } => {
                write!(f, "dependency '{dependency}' was skipped")
            }
            SkipReason::BudgetExceeded => write!(f, "cost budget exceeded"),
            SkipReason::RunAborted => write!(f, "run stopped before the task started"),
            SkipReason::TaskLimit => write!(f, "task limit reached"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedTask {
    pub task_id: String,
    pub reason: SkipReason,
}

/// Mutable run state. Owned by a single orchestrator loop and snapshotted
/// into checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub status: OrchestratorStatus,
    pub session_id: Uuid,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_tasks: Vec<String>,
    pub failed_tasks: Vec<String>,
    pub skipped_tasks: Vec<SkippedTask>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub completed_at: Option<DateTime<Utc>>,
}

impl OrchestratorState {
    pub fn new() -> Self {
        Self {
            status: OrchestratorStatus::Idle,
            session_id: Uuid::new_v4(),
            started_at: None,
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            skipped_tasks: Vec::new(),
            total_tokens: 0,
            total_cost_usd: 0.0,
            completed_at: None,
        }
    }

    /// Move to `next`, rejecting edges the state machine does not allow.
    pub fn transition(&mut self, next: OrchestratorStatus) -> FelixResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(FelixError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if next == OrchestratorStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed_tasks.iter().any(|t| t == task_id)
    }

    pub fn is_failed(&self, task_id: &str) -> bool {
        self.failed_tasks.iter().any(|t| t == task_id)
    }

    pub fn is_skipped(&self, task_id: &str) -> bool {
        self.skipped_tasks.iter().any(|s| s.task_id == task_id)
    }

    /// Completed, failed or skipped.
    pub fn is_settled(&self, task_id: &str) -> bool {
        self.is_completed(task_id) || self.is_failed(task_id) || self.is_skipped(task_id)
    }

    pub fn mark_completed(&mut self, task_id: &str) {
        if !self.is_completed(task_id) {
            self.completed_tasks.push(task_id.to_string());
        }
    }

    pub fn mark_failed(&mut self, task_id: &str) {
        if !self.is_failed(task_id) {
            self.failed_tasks.push(task_id.to_string());
        }
    }

    pub fn mark_skipped(&mut self, task_id: &str, reason: SkipReason) {
        if !self.is_settled(task_id) {
            self.skipped_tasks.push(SkippedTask {
                task_id: task_id.to_string(),
                reason,
            });
        }
    }

    pub fn skipped_ids(&self) -> Vec<String> {
        self.skipped_tasks.iter().map(|s| s.task_id.clone()).collect()
    }

    pub fn add_usage(&mut self, tokens: u64, cost_usd: f64) {
        self.total_tokens += tokens;
        self.total_cost_usd += cost_usd;
    }
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self::new()
    }
}

/// Input and output token counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input += rhs.input;
        self.output += rhs.output;
    }
}

/// One try of one task with one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    pub session_id: Uuid,
    pub task_id: String,
    pub attempt_number: u32,
    pub model: String,
    pub signature_hash: String,
    /// `None` while the attempt is still open.
    pub success: Option<bool>,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub files_modified: Vec<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Attempt {
    pub fn open(
        session_id: Uuid,
        task_id: impl Into<String>,
        attempt_number: u32,
        model: impl Into<String>,
        signature_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            task_id: task_id.into(),
            attempt_number,
            model: model.into(),
            signature_hash: signature_hash.into(),
            success: None,
            tokens: TokenUsage::default(),
            cost_usd: 0.0,
            files_modified: Vec::new(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.success.is_none()
    }

    pub fn close(
        &mut self,
        success: bool,
        tokens: TokenUsage,
        cost_usd: f64,
        files_modified: Vec<String>,
        error: Option<String>,
    ) {
        self.success = Some(success);
        self.tokens = tokens;
        self.cost_usd = cost_usd;
        self.files_modified = files_modified;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }
}

/// Outcome of running one task to the end of its retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionResult {
    pub task_id: String,
    pub success: bool,
    pub model: String,
    pub attempts: u32,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub files_modified: Vec<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TaskExecutionResult {
    pub fn failure(task_id: impl Into<String>, model: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            model: model.into(),
            attempts: 0,
            tokens: TokenUsage::default(),
            cost_usd: 0.0,
            files_modified: Vec::new(),
            error: Some(error.into()),
            duration_ms: 0,
        }
    }
}
