//! Relational store boundary - SQLite-backed persistence for documents,
//! update log, snapshots, versions, and projection bookkeeping
pub mod schema;
pub mod sqlite;
pub use schema::*;
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;

/// The transactional relational store the persistence core writes through.
///
/// Everything the core needs reduces to upsert-by-primary-key, durable
/// append, ordered range scan by foreign key, bulk delete, and one
/// multi-statement atomic transaction (`apply_compaction`). Tests wrap this
/// trait to inject slow or failing storage.
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Create the document row if it does not exist yet. Never clobbers an
    /// existing title or sidecar columns.
    async fn ensure_document(&self, doc_id: &str) -> Result<()>;

    /// Create or retitle a document.
    async fn upsert_document(&self, doc_id: &str, title: &str) -> Result<()>;

    async fn get_document(&self, doc_id: &str) -> Result<Option<DocumentRow>>;

    /// All documents with their sidecar columns, most recently updated first.
    async fn list_documents(&self) -> Result<Vec<DocumentRow>>;

    /// Delete a document; cascades to log, snapshot, versions, and
    /// projection state.
    async fn delete_document(&self, doc_id: &str) -> Result<usize>;

    /// Durable append of one merged update batch. Returns the new row id.
    async fn append_update(&self, doc_id: &str, update: &[u8]) -> Result<i64>;

    /// All log entries for a document in ascending id order (the replay
    /// order the merge algorithm requires).
    async fn load_updates(&self, doc_id: &str) -> Result<Vec<UpdateLogEntry>>;

    async fn count_updates(&self, doc_id: &str) -> Result<usize>;

    async fn load_snapshot(&self, doc_id: &str) -> Result<Option<SnapshotRow>>;

    /// In one atomic transaction: upsert the snapshot row and delete every
    /// update-log row for the document. A crash must leave either the old
    /// snapshot with the old log, or the new snapshot with an empty log.
    async fn apply_compaction(&self, doc_id: &str, state: &[u8]) -> Result<()>;

    async fn create_version(
        &self,
        doc_id: &str,
        state: &[u8],
        label: Option<&str>,
    ) -> Result<i64>;

    async fn get_version(&self, version_id: i64) -> Result<Option<VersionSnapshot>>;

    /// Versions for a document, newest first.
    async fn list_versions(&self, doc_id: &str) -> Result<Vec<VersionSnapshot>>;

    /// Delete versions beyond `keep_max`, oldest first. Returns rows removed.
    async fn prune_versions(&self, doc_id: &str, keep_max: usize) -> Result<usize>;

    /// Upsert the three sidecar level columns for a document.
    async fn update_levels(&self, doc_id: &str, levels: DocumentLevels) -> Result<()>;

    /// Record a projection run. `error: None` marks success (timestamp set,
    /// error cleared); `Some` records the failure without touching the
    /// last-applied timestamp.
    async fn record_projection_run(
        &self,
        doc_id: &str,
        projection: &str,
        version: i64,
        error: Option<&str>,
    ) -> Result<()>;

    async fn projection_state(
        &self,
        doc_id: &str,
        projection: &str,
    ) -> Result<Option<ProjectionStateRow>>;

    async fn stats(&self) -> Result<StoreStats>;
}
