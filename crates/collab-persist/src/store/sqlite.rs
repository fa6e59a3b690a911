//! SQLite implementation of the store boundary
use crate::store::schema::*;
use crate::store::DocStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// SQLite-backed document store behind an r2d2 connection pool.
pub struct SqliteStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("Opening persistence store at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;
        {
            let conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            conn.execute_batch(SCHEMA_SQL)?;
        }
        info!("Persistence store initialized");
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// In-memory store for tests. The pool is pinned to a single connection
    /// because each pooled `:memory:` connection would otherwise get its own
    /// private database.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(SCHEMA_SQL)?;
        }
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    fn parse_datetime_safe(datetime_str: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(datetime_str) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S") {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
        None
    }

    fn parse_column(datetime_str: &str, column: &str) -> DateTime<Utc> {
        Self::parse_datetime_safe(datetime_str).unwrap_or_else(|| {
            warn!("Failed to parse {} timestamp", column);
            Utc::now()
        })
    }

    fn row_to_document(row: &Row) -> Result<DocumentRow> {
        Ok(DocumentRow {
            id: row.get(0)?,
            title: row.get(1)?,
            levels: DocumentLevels {
                risk: row.get(2)?,
                impact: row.get(3)?,
                effort: row.get(4)?,
            },
            created_at: Self::parse_column(&row.get::<_, String>(5)?, "created_at"),
            updated_at: Self::parse_column(&row.get::<_, String>(6)?, "updated_at"),
        })
    }

    fn row_to_version(row: &Row) -> Result<VersionSnapshot> {
        Ok(VersionSnapshot {
            id: row.get(0)?,
            document_id: row.get(1)?,
            state_blob: row.get(2)?,
            label: row.get(3)?,
            created_at: Self::parse_column(&row.get::<_, String>(4)?, "created_at"),
        })
    }
}

#[async_trait]
impl DocStore for SqliteStore {
    async fn ensure_document(&self, doc_id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO documents (id, title, created_at, updated_at)
             VALUES (?1, '', ?2, ?2)",
            params![doc_id, now],
        )?;
        Ok(())
    }

    async fn upsert_document(&self, doc_id: &str, title: &str) -> Result<()> {
        let conn = self.get_conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO documents (id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, updated_at = excluded.updated_at",
            params![doc_id, title, now],
        )?;
        Ok(())
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<DocumentRow>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, risk_level, impact_level, effort_level, created_at, updated_at
             FROM documents WHERE id = ?1",
        )?;
        let mut rows = stmt.query([doc_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::row_to_document(row)?))
        } else {
            Ok(None)
        }
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRow>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, risk_level, impact_level, effort_level, created_at, updated_at
             FROM documents ORDER BY updated_at DESC",
        )?;
        let mut rows = stmt.query([])?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            documents.push(Self::row_to_document(row)?);
        }
        Ok(documents)
    }

    async fn delete_document(&self, doc_id: &str) -> Result<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM documents WHERE id = ?1", [doc_id])?;
        info!("Deleted document {}", doc_id);
        Ok(deleted)
    }

    async fn append_update(&self, doc_id: &str, update: &[u8]) -> Result<i64> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO update_log (document_id, update_blob, created_at) VALUES (?1, ?2, ?3)",
            params![doc_id, update, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn load_updates(&self, doc_id: &str) -> Result<Vec<UpdateLogEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, update_blob, created_at
             FROM update_log WHERE document_id = ?1 ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([doc_id])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(UpdateLogEntry {
                id: row.get(0)?,
                document_id: row.get(1)?,
                update_blob: row.get(2)?,
                created_at: Self::parse_column(&row.get::<_, String>(3)?, "created_at"),
            });
        }
        Ok(entries)
    }

    async fn count_updates(&self, doc_id: &str) -> Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM update_log WHERE document_id = ?1",
            [doc_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn load_snapshot(&self, doc_id: &str) -> Result<Option<SnapshotRow>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT document_id, state_blob, updated_at FROM snapshots WHERE document_id = ?1",
        )?;
        let mut rows = stmt.query([doc_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(SnapshotRow {
                document_id: row.get(0)?,
                state_blob: row.get(1)?,
                updated_at: Self::parse_column(&row.get::<_, String>(2)?, "updated_at"),
            }))
        } else {
            Ok(None)
        }
    }

    async fn apply_compaction(&self, doc_id: &str, state: &[u8]) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO snapshots (document_id, state_blob, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(document_id) DO UPDATE
                SET state_blob = excluded.state_blob, updated_at = excluded.updated_at",
            params![doc_id, state, Utc::now().to_rfc3339()],
        )?;
        tx.execute("DELETE FROM update_log WHERE document_id = ?1", [doc_id])?;
        tx.commit()?;
        Ok(())
    }

    async fn create_version(
        &self,
        doc_id: &str,
        state: &[u8],
        label: Option<&str>,
    ) -> Result<i64> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO version_snapshots (document_id, state_blob, label, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![doc_id, state, label, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn get_version(&self, version_id: i64) -> Result<Option<VersionSnapshot>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, state_blob, label, created_at
             FROM version_snapshots WHERE id = ?1",
        )?;
        let mut rows = stmt.query([version_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::row_to_version(row)?))
        } else {
            Ok(None)
        }
    }

    async fn list_versions(&self, doc_id: &str) -> Result<Vec<VersionSnapshot>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, state_blob, label, created_at
             FROM version_snapshots WHERE document_id = ?1 ORDER BY id DESC",
        )?;
        let mut rows = stmt.query([doc_id])?;
        let mut versions = Vec::new();
        while let Some(row) = rows.next()? {
            versions.push(Self::row_to_version(row)?);
        }
        Ok(versions)
    }

    async fn prune_versions(&self, doc_id: &str, keep_max: usize) -> Result<usize> {
        let conn = self.get_conn()?;
        // Creation order is id order, so keeping the highest ids keeps the
        // newest versions.
        let deleted = conn.execute(
            "DELETE FROM version_snapshots
             WHERE document_id = ?1
               AND id NOT IN (
                   SELECT id FROM version_snapshots
                   WHERE document_id = ?1
                   ORDER BY id DESC LIMIT ?2
               )",
            params![doc_id, keep_max as i64],
        )?;
        Ok(deleted)
    }

    async fn update_levels(&self, doc_id: &str, levels: DocumentLevels) -> Result<()> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE documents
             SET risk_level = ?1, impact_level = ?2, effort_level = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                levels.risk,
                levels.impact,
                levels.effort,
                Utc::now().to_rfc3339(),
                doc_id
            ],
        )?;
        if updated == 0 {
            return Err(anyhow::anyhow!("Document {} not found", doc_id));
        }
        Ok(())
    }

    async fn record_projection_run(
        &self,
        doc_id: &str,
        projection: &str,
        version: i64,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.get_conn()?;
        match error {
            None => {
                conn.execute(
                    "INSERT INTO projection_state (document_id, projection, version, last_applied_at, last_error)
                     VALUES (?1, ?2, ?3, ?4, NULL)
                     ON CONFLICT(document_id, projection) DO UPDATE
                        SET version = excluded.version,
                            last_applied_at = excluded.last_applied_at,
                            last_error = NULL",
                    params![doc_id, projection, version, Utc::now().to_rfc3339()],
                )?;
            }
            Some(err) => {
                conn.execute(
                    "INSERT INTO projection_state (document_id, projection, version, last_error)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(document_id, projection) DO UPDATE
                        SET version = excluded.version,
                            last_error = excluded.last_error",
                    params![doc_id, projection, version, err],
                )?;
            }
        }
        Ok(())
    }

    async fn projection_state(
        &self,
        doc_id: &str,
        projection: &str,
    ) -> Result<Option<ProjectionStateRow>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT document_id, projection, version, last_applied_at, last_error
             FROM projection_state WHERE document_id = ?1 AND projection = ?2",
        )?;
        let mut rows = stmt.query(params![doc_id, projection])?;
        if let Some(row) = rows.next()? {
            let applied: Option<String> = row.get(3)?;
            Ok(Some(ProjectionStateRow {
                document_id: row.get(0)?,
                projection: row.get(1)?,
                version: row.get(2)?,
                last_applied_at: applied.as_deref().and_then(Self::parse_datetime_safe),
                last_error: row.get(4)?,
            }))
        } else {
            Ok(None)
        }
    }

    async fn stats(&self) -> Result<StoreStats> {
        let conn = self.get_conn()?;
        let count = |table: &str| -> Result<i64> {
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })?)
        };
        Ok(StoreStats {
            total_documents: count("documents")?,
            total_log_entries: count("update_log")?,
            total_snapshots: count("snapshots")?,
            total_versions: count("version_snapshots")?,
        })
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_replay_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_document("d1").await.unwrap();
        store.append_update("d1", b"first").await.unwrap();
        store.append_update("d1", b"second").await.unwrap();
        store.append_update("d1", b"third").await.unwrap();

        let entries = store.load_updates("d1").await.unwrap();
        let blobs: Vec<&[u8]> = entries.iter().map(|e| e.update_blob.as_slice()).collect();
        assert_eq!(blobs, vec![b"first" as &[u8], b"second", b"third"]);
        assert!(entries.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_compaction_upserts_snapshot_and_clears_log() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_document("d1").await.unwrap();
        store.append_update("d1", b"u1").await.unwrap();
        store.append_update("d1", b"u2").await.unwrap();

        store.apply_compaction("d1", b"full-state").await.unwrap();

        assert_eq!(store.count_updates("d1").await.unwrap(), 0);
        let snapshot = store.load_snapshot("d1").await.unwrap().unwrap();
        assert_eq!(snapshot.state_blob, b"full-state");

        // Second compaction replaces, never duplicates.
        store.apply_compaction("d1", b"newer-state").await.unwrap();
        let snapshot = store.load_snapshot("d1").await.unwrap().unwrap();
        assert_eq!(snapshot.state_blob, b"newer-state");
    }

    #[tokio::test]
    async fn test_version_pruning_keeps_newest() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_document("d1").await.unwrap();
        for i in 0..7 {
            store
                .create_version("d1", format!("state-{}", i).as_bytes(), None)
                .await
                .unwrap();
        }
        let removed = store.prune_versions("d1", 4).await.unwrap();
        assert_eq!(removed, 3);

        let versions = store.list_versions("d1").await.unwrap();
        assert_eq!(versions.len(), 4);
        assert_eq!(versions[0].state_blob, b"state-6");
        assert_eq!(versions[3].state_blob, b"state-3");
    }

    #[tokio::test]
    async fn test_delete_document_cascades() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_document("d1").await.unwrap();
        store.append_update("d1", b"u1").await.unwrap();
        store.apply_compaction("d1", b"s").await.unwrap();
        store.create_version("d1", b"v", Some("manual")).await.unwrap();
        store
            .record_projection_run("d1", "levels", 1, None)
            .await
            .unwrap();

        store.delete_document("d1").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_documents, 0);
        assert_eq!(stats.total_log_entries, 0);
        assert_eq!(stats.total_snapshots, 0);
        assert_eq!(stats.total_versions, 0);
        assert!(store.projection_state("d1", "levels").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_projection_run_bookkeeping() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_document("d1").await.unwrap();

        store
            .record_projection_run("d1", "levels", 1, Some("store offline"))
            .await
            .unwrap();
        let state = store.projection_state("d1", "levels").await.unwrap().unwrap();
        assert_eq!(state.last_error.as_deref(), Some("store offline"));
        assert!(state.last_applied_at.is_none());

        store
            .record_projection_run("d1", "levels", 1, None)
            .await
            .unwrap();
        let state = store.projection_state("d1", "levels").await.unwrap().unwrap();
        assert!(state.last_error.is_none());
        assert!(state.last_applied_at.is_some());
    }

    #[tokio::test]
    async fn test_ensure_document_never_clobbers() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_document("d1", "My Title").await.unwrap();
        store
            .update_levels(
                "d1",
                DocumentLevels {
                    risk: 1,
                    impact: 2,
                    effort: 3,
                },
            )
            .await
            .unwrap();

        store.ensure_document("d1").await.unwrap();
        let doc = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(doc.title, "My Title");
        assert_eq!(doc.levels.risk, 1);
    }
}
