use crate::records::{RoutingPattern, SessionRecord};
use async_trait::async_trait;
use felix_core::{Attempt, Checkpoint, FelixError, FelixResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Latest checkpoint per project.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Replace the project's checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> FelixResult<()>;
    async fn load(&self, project: &str) -> FelixResult<Option<Checkpoint>>;
    async fn clear(&self, project: &str) -> FelixResult<()>;
}

/// Every attempt of every task.
#[async_trait]
pub trait AttemptLog: Send + Sync {
    /// Insert or update an attempt by id.
    async fn record(&self, attempt: &Attempt) -> FelixResult<()>;
    async fn attempts(&self, session_id: Uuid) -> FelixResult<Vec<Attempt>>;
    /// Close every still-open attempt of a session as failed with `reason`.
    /// Returns how many were closed.
    async fn close_open_attempts(&self, session_id: Uuid, reason: &str) -> FelixResult<usize>;
}

/// Routing history keyed by `(signature, model)`.
#[async_trait]
pub trait PatternStore: Send + Sync {
    async fn load_patterns(&self) -> FelixResult<Vec<RoutingPattern>>;
    async fn save_pattern(&self, pattern: &RoutingPattern) -> FelixResult<()>;
}

/// Run records.
#[async_trait]
pub trait SessionLog: Send + Sync {
    async fn upsert_session(&self, session: &SessionRecord) -> FelixResult<()>;
    /// Sessions of a project, newest first.
    async fn sessions(&self, project: &str) -> FelixResult<Vec<SessionRecord>>;
}

/// The set of stores an orchestrator run writes to.
#[derive(Clone)]
pub struct Stores {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub attempts: Arc<dyn AttemptLog>,
    pub patterns: Arc<dyn PatternStore>,
    pub sessions: Arc<dyn SessionLog>,
}

impl Stores {
    /// Every concern served by one backend.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: CheckpointStore + AttemptLog + PatternStore + SessionLog + 'static,
    {
        Self {
            checkpoints: store.clone(),
            attempts: store.clone(),
            patterns: store.clone(),
            sessions: store,
        }
    }

    /// Volatile stores; nothing survives the process.
    pub fn memory() -> Self {
        Self::shared(Arc::new(MemoryStore::new()))
    }

    /// Checkpoints as JSON files in `dir`, everything else in memory.
    pub async fn files(dir: PathBuf) -> FelixResult<Self> {
        let mut stores = Self::memory();
        stores.checkpoints = Arc::new(FileCheckpointStore::new(dir).await?);
        Ok(stores)
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

/// Checkpoints as JSON files on disk, one per project.
///
/// Writes go to a temporary file that is then renamed over the target, so a
/// crash never leaves a half-written checkpoint.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub async fn new(dir: PathBuf) -> FelixResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn checkpoint_path(&self, project: &str) -> PathBuf {
        let name: String = project
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.checkpoint.json"))
    }
}

async fn atomic_write(path: &Path, data: &str) -> FelixResult<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> FelixResult<()> {
        let json = serde_json::to_string_pretty(checkpoint)?;
        atomic_write(&self.checkpoint_path(&checkpoint.project), &json).await
    }

    async fn load(&self, project: &str) -> FelixResult<Option<Checkpoint>> {
        let path = self.checkpoint_path(project);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let checkpoint: Checkpoint = serde_json::from_str(&data)
            .map_err(|e| FelixError::Store(format!("Failed to parse checkpoint: {e}")))?;
        Ok(Some(checkpoint))
    }

    async fn clear(&self, project: &str) -> FelixResult<()> {
        let path = self.checkpoint_path(project);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

/// All stores in memory. Used by tests and `--no-persist` style runs.
#[derive(Default)]
pub struct MemoryStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
    attempts: RwLock<Vec<Attempt>>,
    patterns: RwLock<HashMap<(String, String), RoutingPattern>>,
    sessions: RwLock<HashMap<Uuid, SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn save(&self, checkpoint: &Checkpoint) -> FelixResult<()> {
        self.checkpoints
            .write()
            .insert(checkpoint.project.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, project: &str) -> FelixResult<Option<Checkpoint>> {
        Ok(self.checkpoints.read().get(project).cloned())
    }

    async fn clear(&self, project: &str) -> FelixResult<()> {
        self.checkpoints.write().remove(project);
        Ok(())
    }
}

#[async_trait]
impl AttemptLog for MemoryStore {
    async fn record(&self, attempt: &Attempt) -> FelixResult<()> {
        let mut attempts = self.attempts.write();
        match attempts.iter_mut().find(|a| a.id == attempt.id) {
            Some(existing) => *existing = attempt.clone(),
            None => attempts.push(attempt.clone()),
        }
        Ok(())
    }

    async fn attempts(&self, session_id: Uuid) -> FelixResult<Vec<Attempt>> {
        Ok(self
            .attempts
            .read()
            .iter()
            .filter(|a| a.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn close_open_attempts(&self, session_id: Uuid, reason: &str) -> FelixResult<usize> {
        let mut closed = 0;
        for attempt in self
            .attempts
            .write()
            .iter_mut()
            .filter(|a| a.session_id == session_id && a.is_open())
        {
            attempt.close(false, attempt.tokens, attempt.cost_usd, Vec::new(), Some(reason.to_string()));
            closed += 1;
        }
        Ok(closed)
    }
}

#[async_trait]
impl PatternStore for MemoryStore {
    async fn load_patterns(&self) -> FelixResult<Vec<RoutingPattern>> {
        let mut patterns: Vec<RoutingPattern> = self.patterns.read().values().cloned().collect();
        patterns.sort_by(|a, b| (&a.signature, &a.model).cmp(&(&b.signature, &b.model)));
        Ok(patterns)
    }

    async fn save_pattern(&self, pattern: &RoutingPattern) -> FelixResult<()> {
        self.patterns.write().insert(
            (pattern.signature.clone(), pattern.model.clone()),
            pattern.clone(),
        );
        Ok(())
    }
}

#[async_trait]
impl SessionLog for MemoryStore {
    async fn upsert_session(&self, session: &SessionRecord) -> FelixResult<()> {
        self.sessions.write().insert(session.id, session.clone());
        Ok(())
    }

    async fn sessions(&self, project: &str) -> FelixResult<Vec<SessionRecord>> {
        let mut sessions: Vec<SessionRecord> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.project == project)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }
}
