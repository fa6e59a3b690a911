//! Database schema definitions for the persistence store
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A document row with its sidecar scalar columns (used by list views).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRow {
    pub id: String,
    pub title: String,
    pub levels: DocumentLevels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The three derived level columns. 0 = unset, 1..=3 ascending severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLevels {
    pub risk: i64,
    pub impact: i64,
    pub effort: i64,
}

/// One merged batch of CRDT mutations not yet folded into a snapshot.
/// Replaying entries for a document in ascending id order on top of the
/// latest snapshot reconstructs current state exactly.
#[derive(Debug, Clone)]
pub struct UpdateLogEntry {
    pub id: i64,
    pub document_id: String,
    pub update_blob: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// One full-state snapshot per document, upserted by compaction.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub document_id: String,
    pub state_blob: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

/// User/operator-facing save point, independent of the snapshot/log pair.
#[derive(Debug, Clone)]
pub struct VersionSnapshot {
    pub id: i64,
    pub document_id: String,
    pub state_blob: Vec<u8>,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Idempotent-recovery bookkeeping for one `(document, projection)` pair.
#[derive(Debug, Clone)]
pub struct ProjectionStateRow {
    pub document_id: String,
    pub projection: String,
    pub version: i64,
    pub last_applied_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Row counts across the store, used by operators and tests.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total_documents: i64,
    pub total_log_entries: i64,
    pub total_snapshots: i64,
    pub total_versions: i64,
}

pub const SCHEMA_SQL: &str = "
-- Documents table: identity plus sidecar projection columns
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    risk_level INTEGER NOT NULL DEFAULT 0,
    impact_level INTEGER NOT NULL DEFAULT 0,
    effort_level INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
-- Append-only update log, cleared in bulk by compaction
CREATE TABLE IF NOT EXISTS update_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id TEXT NOT NULL,
    update_blob BLOB NOT NULL,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
);
-- One full-state snapshot per document
CREATE TABLE IF NOT EXISTS snapshots (
    document_id TEXT PRIMARY KEY,
    state_blob BLOB NOT NULL,
    updated_at TIMESTAMP NOT NULL,
    FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
);
-- Explicit and automatic save points, pruned oldest-first past the cap
CREATE TABLE IF NOT EXISTS version_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id TEXT NOT NULL,
    state_blob BLOB NOT NULL,
    label TEXT,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
);
-- Per-(document, projection) run bookkeeping
CREATE TABLE IF NOT EXISTS projection_state (
    document_id TEXT NOT NULL,
    projection TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    last_applied_at TIMESTAMP,
    last_error TEXT,
    PRIMARY KEY (document_id, projection),
    FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
);
-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_update_log_document ON update_log (document_id);
CREATE INDEX IF NOT EXISTS idx_versions_document ON version_snapshots (document_id, id);
";
