//! Cross-backend persistence tests: the same checkpoint survives every store.

use felix_core::{Checkpoint, OrchestratorState, SkipReason, TaskExecutionResult};
use felix_session::{CheckpointStore, FileCheckpointStore, MemoryStore, Stores};
use std::sync::Arc;

fn sample_checkpoint() -> Checkpoint {
    let mut state = OrchestratorState::new();
    state.mark_completed("A");
    state.mark_failed("B");
    state.mark_skipped(
        "C",
        SkipReason::DependencyFailed {
            dependency: "B".into(),
        },
    );
    state.add_usage(1200, 0.42);
    let results = vec![TaskExecutionResult::failure("B", "claude-sonnet-4", "assertion failed")];
    Checkpoint::new("shop", "plan-hash", state, results, serde_json::json!({"maxParallel": 2}))
}

async fn roundtrip(store: Arc<dyn CheckpointStore>) {
    let cp = sample_checkpoint();
    store.save(&cp).await.unwrap();
    let loaded = store.load("shop").await.unwrap().unwrap();
    assert_eq!(loaded, cp);
    assert!(loaded.matches_plan("plan-hash"));
    assert!(store.load("other").await.unwrap().is_none());
}

#[tokio::test]
async fn test_memory_backend() {
    roundtrip(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_file_backend() {
    let dir = tempfile::tempdir().unwrap();
    roundtrip(Arc::new(FileCheckpointStore::new(dir.path().to_path_buf()).await.unwrap())).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sqlite_backend_survives_reopen() {
    use felix_session::{AttemptLog, SqliteStore};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("felix.db");
    let store = Arc::new(SqliteStore::open(&path).await.unwrap());
    roundtrip(store.clone()).await;

    let attempt = felix_core::Attempt::open(uuid::Uuid::new_v4(), "A", 1, "m", "sig");
    let stores = Stores::shared(store.clone());
    stores.attempts.record(&attempt).await.unwrap();
    drop(stores);
    drop(store);

    let reopened = SqliteStore::open(&path).await.unwrap();
    assert!(reopened.load("shop").await.unwrap().is_some());
    assert_eq!(reopened.attempts(attempt.session_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_file_stores_keep_attempts_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let stores = Stores::files(dir.path().to_path_buf()).await.unwrap();
    let cp = sample_checkpoint();
    stores.checkpoints.save(&cp).await.unwrap();
    assert!(dir.path().join("shop.checkpoint.json").exists());
}
