//! Persistence for Felix runs.
//!
//! Four concerns, each behind an async trait: checkpoints ([`CheckpointStore`]),
//! attempts ([`AttemptLog`]), routing history ([`PatternStore`]) and run
//! records ([`SessionLog`]). Backends: [`MemoryStore`], [`FileCheckpointStore`]
//! and, with the `sqlite` feature, [`SqliteStore`].

pub mod records;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod store;

pub use records::{RoutingPattern, SessionRecord};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use store::{
    AttemptLog, CheckpointStore, FileCheckpointStore, MemoryStore, PatternStore, SessionLog,
    Stores,
};
