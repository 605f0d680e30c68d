//! SQLite persistence.
//!
//! One database per project directory. The schema evolves through the
//! ordered, additive [`MIGRATIONS`] list; `PRAGMA user_version` records how
//! many have been applied. Every query runs on the blocking pool.

use crate::records::{RoutingPattern, SessionRecord};
use crate::store::{AttemptLog, CheckpointStore, PatternStore, SessionLog};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use felix_core::{Attempt, Checkpoint, FelixError, FelixResult, TokenUsage};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Schema migrations, applied in order. Never edit a released entry; append.
pub const MIGRATIONS: &[&str] = &[
    // 1: sessions, checkpoints, attempts
    "CREATE TABLE sessions (
        id             TEXT PRIMARY KEY,
        project        TEXT NOT NULL,
        plan_hash      TEXT NOT NULL,
        status         TEXT NOT NULL,
        started_at     TEXT NOT NULL,
        completed_at   TEXT,
        total_tokens   INTEGER NOT NULL DEFAULT 0,
        total_cost_usd REAL NOT NULL DEFAULT 0
    );
    CREATE TABLE checkpoints (
        project    TEXT PRIMARY KEY,
        id         TEXT NOT NULL,
        session_id TEXT NOT NULL,
        plan_hash  TEXT NOT NULL,
        data       TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE attempts (
        id             TEXT PRIMARY KEY,
        session_id     TEXT NOT NULL,
        task_id        TEXT NOT NULL,
        attempt_number INTEGER NOT NULL,
        model          TEXT NOT NULL,
        signature_hash TEXT NOT NULL,
        success        INTEGER,
        input_tokens   INTEGER NOT NULL DEFAULT 0,
        output_tokens  INTEGER NOT NULL DEFAULT 0,
        cost_usd       REAL NOT NULL DEFAULT 0,
        files_modified TEXT NOT NULL DEFAULT '[]',
        error          TEXT,
        started_at     TEXT NOT NULL,
        completed_at   TEXT
    );",
    // 2: routing history
    "CREATE TABLE routing_patterns (
        signature     TEXT NOT NULL,
        model         TEXT NOT NULL,
        success_count INTEGER NOT NULL DEFAULT 0,
        fail_count    INTEGER NOT NULL DEFAULT 0,
        avg_cost_usd  REAL NOT NULL DEFAULT 0,
        updated_at    TEXT NOT NULL,
        PRIMARY KEY (signature, model)
    );",
    // 3: lookups by session
    "CREATE INDEX idx_attempts_session ON attempts(session_id);
     CREATE INDEX idx_sessions_project ON sessions(project, started_at);",
];

/// Default database file inside a project's data directory.
pub const DB_FILE: &str = "felix.db";

fn store_err(e: impl std::fmt::Display) -> FelixError {
    FelixError::Store(e.to_string())
}

/// Apply pending migrations; returns the resulting schema version.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<usize> {
    let current: usize = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    for (idx, sql) in MIGRATIONS.iter().enumerate().skip(current) {
        let version = idx + 1;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        tracing::info!(version, "Applied schema migration");
    }
    Ok(MIGRATIONS.len().max(current))
}

/// All stores in one SQLite database.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and migrate it.
    pub async fn open(path: &Path) -> FelixResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let owned = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let mut conn = Connection::open(&owned)?;
            conn.busy_timeout(Duration::from_secs(10))?;
            // journal_mode returns a row.
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
            migrate(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(store_err)?
        .map_err(store_err)?;

        tracing::debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> FelixResult<Self> {
        let mut conn = Connection::open_in_memory().map_err(store_err)?;
        migrate(&mut conn).map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn schema_version(&self) -> FelixResult<usize> {
        self.with_conn(|conn| conn.query_row("PRAGMA user_version", [], |row| row.get(0)))
            .await
    }

    async fn with_conn<T, F>(&self, f: F) -> FelixResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(store_err)?
        .map_err(store_err)
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<Attempt> {
    let completed_at: Option<String> = row.get("completed_at")?;
    let files: String = row.get("files_modified")?;
    Ok(Attempt {
        id: parse_uuid(&row.get::<_, String>("id")?)?,
        session_id: parse_uuid(&row.get::<_, String>("session_id")?)?,
        task_id: row.get("task_id")?,
        attempt_number: row.get("attempt_number")?,
        model: row.get("model")?,
        signature_hash: row.get("signature_hash")?,
        success: row.get("success")?,
        tokens: TokenUsage::new(row.get("input_tokens")?, row.get("output_tokens")?),
        cost_usd: row.get("cost_usd")?,
        files_modified: parse_json(&files)?,
        error: row.get("error")?,
        started_at: parse_ts(&row.get::<_, String>("started_at")?)?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status: String = row.get("status")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    Ok(SessionRecord {
        id: parse_uuid(&row.get::<_, String>("id")?)?,
        project: row.get("project")?,
        plan_hash: row.get("plan_hash")?,
        status: parse_json(&format!("\"{status}\""))?,
        started_at: parse_ts(&row.get::<_, String>("started_at")?)?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        total_tokens: row.get("total_tokens")?,
        total_cost_usd: row.get("total_cost_usd")?,
    })
}

fn write_attempt(conn: &Connection, a: &Attempt) -> rusqlite::Result<()> {
    let files = serde_json::to_string(&a.files_modified)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        "INSERT OR REPLACE INTO attempts
         (id, session_id, task_id, attempt_number, model, signature_hash, success,
          input_tokens, output_tokens, cost_usd, files_modified, error, started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            a.id.to_string(),
            a.session_id.to_string(),
            a.task_id,
            a.attempt_number,
            a.model,
            a.signature_hash,
            a.success,
            a.tokens.input,
            a.tokens.output,
            a.cost_usd,
            files,
            a.error,
            ts(&a.started_at),
            a.completed_at.as_ref().map(ts),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn save(&self, checkpoint: &Checkpoint) -> FelixResult<()> {
        let data = serde_json::to_string(checkpoint)?;
        let cp = checkpoint.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO checkpoints (project, id, session_id, plan_hash, data, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    cp.project,
                    cp.id.to_string(),
                    cp.session_id.to_string(),
                    cp.plan_hash,
                    data,
                    ts(&cp.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn load(&self, project: &str) -> FelixResult<Option<Checkpoint>> {
        let project = project.to_string();
        let data: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT data FROM checkpoints WHERE project = ?1",
                    params![project],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        data.map(|d| {
            serde_json::from_str(&d)
                .map_err(|e| FelixError::Store(format!("Failed to parse checkpoint: {e}")))
        })
        .transpose()
    }

    async fn clear(&self, project: &str) -> FelixResult<()> {
        let project = project.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM checkpoints WHERE project = ?1", params![project])?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl AttemptLog for SqliteStore {
    async fn record(&self, attempt: &Attempt) -> FelixResult<()> {
        let attempt = attempt.clone();
        self.with_conn(move |conn| write_attempt(conn, &attempt)).await
    }

    async fn attempts(&self, session_id: Uuid) -> FelixResult<Vec<Attempt>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM attempts WHERE session_id = ?1 ORDER BY started_at, attempt_number",
            )?;
            let rows = stmt.query_map(params![session_id.to_string()], attempt_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn close_open_attempts(&self, session_id: Uuid, reason: &str) -> FelixResult<usize> {
        let reason = reason.to_string();
        self.with_conn(move |conn| {
            let now = ts(&Utc::now());
            conn.execute(
                "UPDATE attempts SET success = 0, error = ?1, completed_at = ?2
                 WHERE session_id = ?3 AND success IS NULL",
                params![reason, now, session_id.to_string()],
            )
        })
        .await
    }
}

#[async_trait]
impl PatternStore for SqliteStore {
    async fn load_patterns(&self) -> FelixResult<Vec<RoutingPattern>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT signature, model, success_count, fail_count, avg_cost_usd, updated_at
                 FROM routing_patterns ORDER BY signature, model",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(RoutingPattern {
                    signature: row.get(0)?,
                    model: row.get(1)?,
                    success_count: row.get(2)?,
                    fail_count: row.get(3)?,
                    avg_cost_usd: row.get(4)?,
                    updated_at: parse_ts(&row.get::<_, String>(5)?)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn save_pattern(&self, pattern: &RoutingPattern) -> FelixResult<()> {
        let p = pattern.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO routing_patterns
                 (signature, model, success_count, fail_count, avg_cost_usd, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    p.signature,
                    p.model,
                    p.success_count,
                    p.fail_count,
                    p.avg_cost_usd,
                    ts(&p.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SessionLog for SqliteStore {
    async fn upsert_session(&self, session: &SessionRecord) -> FelixResult<()> {
        let s = session.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sessions
                 (id, project, plan_hash, status, started_at, completed_at, total_tokens, total_cost_usd)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    s.id.to_string(),
                    s.project,
                    s.plan_hash,
                    s.status.to_string(),
                    ts(&s.started_at),
                    s.completed_at.as_ref().map(ts),
                    s.total_tokens,
                    s.total_cost_usd,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn sessions(&self, project: &str) -> FelixResult<Vec<SessionRecord>> {
        let project = project.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM sessions WHERE project = ?1 ORDER BY started_at DESC",
            )?;
            let rows = stmt.query_map(params![project], session_from_row)?;
            rows.collect()
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use felix_core::{OrchestratorState, OrchestratorStatus};

    #[tokio::test]
    async fn test_migrations_applied_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DB_FILE);
        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), MIGRATIONS.len());
        drop(store);

        // Reopening does not re-run anything.
        let again = SqliteStore::open(&path).await.unwrap();
        assert_eq!(again.schema_version().await.unwrap(), MIGRATIONS.len());
    }

    #[tokio::test]
    async fn test_checkpoint_replace_and_clear() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut state = OrchestratorState::new();
        state.mark_completed("A");
        let first = Checkpoint::new("shop", "h1", state.clone(), vec![], serde_json::json!({}));
        store.save(&first).await.unwrap();
        state.mark_completed("B");
        let second = Checkpoint::new("shop", "h1", state, vec![], serde_json::json!({}));
        store.save(&second).await.unwrap();

        let loaded = store.load("shop").await.unwrap().unwrap();
        assert_eq!(loaded.id, second.id);
        assert_eq!(loaded.state.completed_tasks, vec!["A", "B"]);

        store.clear("shop").await.unwrap();
        assert!(store.load("shop").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attempts_and_interrupted_close() {
        let store = SqliteStore::open_in_memory().unwrap();
        let session = Uuid::new_v4();
        let mut done = Attempt::open(session, "A", 1, "claude-sonnet-4", "sig-a");
        done.close(true, TokenUsage::new(100, 20), 0.25, vec!["src/a.rs".into()], None);
        let open = Attempt::open(session, "B", 1, "claude-sonnet-4", "sig-b");
        store.record(&done).await.unwrap();
        store.record(&open).await.unwrap();

        assert_eq!(store.close_open_attempts(session, "interrupted").await.unwrap(), 1);
        let attempts = store.attempts(session).await.unwrap();
        assert_eq!(attempts.len(), 2);
        let a = attempts.iter().find(|a| a.task_id == "A").unwrap();
        assert_eq!(a.files_modified, vec!["src/a.rs"]);
        assert_eq!(a.tokens, TokenUsage::new(100, 20));
        let b = attempts.iter().find(|a| a.task_id == "B").unwrap();
        assert_eq!(b.success, Some(false));
        assert_eq!(b.error.as_deref(), Some("interrupted"));
        assert!(b.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_patterns_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut p = RoutingPattern::new("sig", "gpt-4.1");
        p.record(true, 0.2);
        store.save_pattern(&p).await.unwrap();
        p.record(false, 0.4);
        store.save_pattern(&p).await.unwrap();
        let all = store.load_patterns().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].fail_count, 1);
        assert!((all[0].avg_cost_usd - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sessions_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let older = SessionRecord {
            id: Uuid::new_v4(),
            project: "shop".into(),
            plan_hash: "h".into(),
            status: OrchestratorStatus::Failed,
            started_at: Utc::now() - chrono::Duration::hours(1),
            completed_at: Some(Utc::now()),
            total_tokens: 10,
            total_cost_usd: 0.1,
        };
        let newer = SessionRecord {
            id: Uuid::new_v4(),
            status: OrchestratorStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            ..older.clone()
        };
        store.upsert_session(&older).await.unwrap();
        store.upsert_session(&newer).await.unwrap();
        let sessions = store.sessions("shop").await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, newer.id);
        assert_eq!(sessions[1].status, OrchestratorStatus::Failed);
    }
}
