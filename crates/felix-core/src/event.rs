use crate::provider::{Backend, Provider};
use crate::state::{OrchestratorStatus, SkipReason};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// A timestamped orchestrator event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: LoopEventKind,
}

impl LoopEvent {
    pub fn new(kind: LoopEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// The `type` tag, e.g. `task_completed`.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Event payloads, discriminated by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEventKind {
    LoopStarted {
        session_id: Uuid,
        project: String,
        total_tasks: usize,
        mode: String,
    },
    LoopResumed {
        session_id: Uuid,
        completed: usize,
        failed: usize,
        remaining: usize,
    },
    LevelStarted {
        level: usize,
        task_ids: Vec<String>,
    },
    TaskStarted {
        task_id: String,
        attempt_number: u32,
        model: String,
    },
    TaskCompleted {
        task_id: String,
        attempt_number: u32,
        model: String,
        cost_usd: f64,
        files_modified: Vec<String>,
    },
    TaskFailed {
        task_id: String,
        attempt_number: u32,
        model: String,
        error: String,
        will_retry: bool,
    },
    TaskSkipped {
        task_id: String,
        reason: SkipReason,
    },
    TaskRetrying {
        task_id: String,
        next_attempt: u32,
        delay_ms: u64,
    },
    ModelEscalated {
        task_id: String,
        from_model: String,
        to_model: String,
        tier: String,
    },
    FallbackUsed {
        requested_provider: Provider,
        requested_backend: Backend,
        provider: Provider,
        backend: Backend,
        model: String,
    },
    CostUpdate {
        task_id: String,
        cost_usd: f64,
        total_cost_usd: f64,
        total_tokens: u64,
        budget_usd: Option<f64>,
    },
    CheckpointSaved {
        checkpoint_id: Uuid,
        completed: usize,
    },
    ValidationCompleted {
        passed: bool,
        errors: Vec<String>,
    },
    FixTaskCreated {
        task_id: String,
        error_count: usize,
    },
    QualityGatePassed,
    QualityGateFailed {
        issues: Vec<String>,
    },
    LoopPaused,
    LoopUnpaused,
    LoopCompleted {
        status: OrchestratorStatus,
        completed: usize,
        failed: usize,
        skipped: usize,
        total_cost_usd: f64,
    },
    LoopFailed {
        error: String,
    },
    LoopCancelled {
        completed: usize,
    },
}

impl LoopEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            LoopEventKind::LoopStarted { .. } => "loop_started",
            LoopEventKind::LoopResumed { .. } => "loop_resumed",
            LoopEventKind::LevelStarted { .. } => "level_started",
            LoopEventKind::TaskStarted { .. } => "task_started",
            LoopEventKind::TaskCompleted { .. } => "task_completed",
            LoopEventKind::TaskFailed { .. } => "task_failed",
            LoopEventKind::TaskSkipped { .. } => "task_skipped",
            LoopEventKind::TaskRetrying { .. } => "task_retrying",
            LoopEventKind::ModelEscalated { .. } => "model_escalated",
            LoopEventKind::FallbackUsed { .. } => "fallback_used",
            LoopEventKind::CostUpdate { .. } => "cost_update",
            LoopEventKind::CheckpointSaved { .. } => "checkpoint_saved",
            LoopEventKind::ValidationCompleted { .. } => "validation_completed",
            LoopEventKind::FixTaskCreated { .. } => "fix_task_created",
            LoopEventKind::QualityGatePassed => "quality_gate_passed",
            LoopEventKind::QualityGateFailed { .. } => "quality_gate_failed",
            LoopEventKind::LoopPaused => "loop_paused",
            LoopEventKind::LoopUnpaused => "loop_unpaused",
            LoopEventKind::LoopCompleted { .. } => "loop_completed",
            LoopEventKind::LoopFailed { .. } => "loop_failed",
            LoopEventKind::LoopCancelled { .. } => "loop_cancelled",
        }
    }
}

/// Callback invoked for every emitted event.
pub type EventHandler = Arc<dyn Fn(&LoopEvent) + Send + Sync>;

/// Handler registry. Events are delivered synchronously, in emission order,
/// to every subscriber.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<(u64, EventHandler)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; the returned id can be passed to [`EventBus::unsubscribe`].
    pub fn subscribe<F>(&self, handler: F) -> u64
    where
        F: Fn(&LoopEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    pub fn emit(&self, kind: LoopEventKind) {
        let event = LoopEvent::new(kind);
        tracing::debug!(event = event.name(), "Loop event");
        // Clone the list so handlers may subscribe without deadlocking.
        let handlers: Vec<EventHandler> =
            self.handlers.read().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
