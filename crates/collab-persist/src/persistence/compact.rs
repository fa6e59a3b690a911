//! Periodic log compaction and automatic version snapshots

use super::PersistenceEngine;
use crate::projection::ProjectionTrigger;
use crate::registry::DocMeta;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

impl PersistenceEngine {
    /// Fold the update log into a fresh snapshot.
    ///
    /// Flushes first so the log is current, then writes the snapshot and
    /// clears the log in one store transaction. `forced` bypasses the
    /// idle early-return; close paths use it so a final consistent state is
    /// always persisted.
    pub async fn compact_document(&self, doc_id: &str, forced: bool) -> Result<()> {
        let meta = self
            .registry()
            .get(doc_id)
            .ok_or_else(|| anyhow::anyhow!("Document {} is not bound", doc_id))?;
        let _guard = meta.writer.lock().await;
        self.compact_locked(&meta, forced).await
    }

    /// Compaction body. The caller holds the document's writer lock; unbind
    /// uses this directly so the close-tier projections run inside the same
    /// critical section.
    pub(super) async fn compact_locked(&self, meta: &Arc<DocMeta>, forced: bool) -> Result<()> {
        self.flush_locked(meta).await?;

        if !forced && meta.rows_since_compaction() == 0 {
            debug!("Skipping compaction for idle document {}", meta.doc_id);
            return Ok(());
        }
        let Some(doc) = meta.live_doc() else {
            debug!("Skipping compaction for {}: no live document", meta.doc_id);
            return Ok(());
        };

        let state = doc.encode_full_state();
        self.store().apply_compaction(&meta.doc_id, &state).await?;
        meta.reset_rows_since_compaction();
        debug!(
            "Compacted document {} ({} snapshot bytes)",
            meta.doc_id,
            state.len()
        );

        self.runner().run(meta, ProjectionTrigger::Compact).await;
        self.maybe_auto_version(meta, &state).await;
        Ok(())
    }

    /// Create an automatic version snapshot when the minimum interval has
    /// elapsed, then prune past the retention cap. Failures are logged; the
    /// compaction that got us here already succeeded.
    async fn maybe_auto_version(&self, meta: &Arc<DocMeta>, state: &[u8]) {
        if !meta.auto_version_due(self.config().autoversion_min()) {
            return;
        }
        let label = format!("autosave {}", Utc::now().format("%Y-%m-%d %H:%M UTC"));
        match self
            .store()
            .create_version(&meta.doc_id, state, Some(&label))
            .await
        {
            Ok(version_id) => {
                meta.record_auto_version();
                debug!("Auto-versioned {} as version {}", meta.doc_id, version_id);
                if let Err(e) = self
                    .store()
                    .prune_versions(&meta.doc_id, self.config().version_retention)
                    .await
                {
                    warn!("Version pruning failed for {}: {}", meta.doc_id, e);
                }
            }
            Err(e) => warn!("Auto-version failed for {}: {}", meta.doc_id, e),
        }
    }

    /// Start the fire-repeating compaction timer for a bound document.
    pub(super) fn start_compaction_task(&self, meta: &Arc<DocMeta>) {
        let engine = self.weak_self();
        let doc_id = meta.doc_id.clone();
        let period = self.config().compact_interval();
        let handle = self.runtime().spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if let Err(e) = engine.compact_document(&doc_id, false).await {
                    warn!("Periodic compaction failed for {}: {}", doc_id, e);
                }
            }
        });
        meta.set_compaction_task(handle);
    }
}
