//! Debounced flush scheduling and the lost-update-safe log writer

use super::PersistenceEngine;
use crate::projection::ProjectionTrigger;
use crate::registry::DocMeta;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, warn};

impl PersistenceEngine {
    /// (Re)arm the debounce timer for a document. Each call cancels the
    /// previously armed timer, so a burst of rapid edits collapses into one
    /// log write after the window quiets.
    pub fn schedule_flush(&self, doc_id: &str) {
        let Some(meta) = self.registry().get(doc_id) else {
            return;
        };
        let engine = self.weak_self();
        let id = doc_id.to_string();
        let delay = self.config().flush_debounce();
        let handle = self.runtime().spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(engine) = engine.upgrade() else {
                return;
            };
            if let Err(e) = engine.flush_pending_updates(&id).await {
                // No scheduled retry: the buffer was not trimmed, so the next
                // mutation or compaction tick persists it.
                warn!("Debounced flush failed for {}: {}", id, e);
            }
        });
        meta.set_debounce_task(handle);
    }

    /// Merge and append the buffered updates as one durable log row, then run
    /// flush-tier projections.
    pub async fn flush_pending_updates(&self, doc_id: &str) -> Result<()> {
        let meta = self
            .registry()
            .get(doc_id)
            .ok_or_else(|| anyhow::anyhow!("Document {} is not bound", doc_id))?;
        let _guard = meta.writer.lock().await;
        self.flush_locked(&meta).await
    }

    /// Flush body, writer lock already held.
    ///
    /// The capture is length-bounded: we note `n`, merge exactly those `n`
    /// entries, and after the append succeeds remove exactly the first `n`.
    /// An update appended while the write was in flight stays buffered for
    /// the next cycle instead of being wiped by a wholesale clear.
    pub(super) async fn flush_locked(&self, meta: &Arc<DocMeta>) -> Result<()> {
        let n = meta.pending_len();
        if n > 0 {
            let batch = meta.pending_head(n);
            let merged = self.merge_engine().merge_updates(&batch)?;
            self.store().append_update(&meta.doc_id, &merged).await?;
            meta.drain_pending(n);
            meta.add_rows_since_compaction(1);
            debug!("Flushed {} buffered updates for {}", n, meta.doc_id);
        }
        // An empty buffer still runs projections: a flush can be triggered
        // purely to re-evaluate derived state.
        self.runner().run(meta, ProjectionTrigger::Flush).await;
        Ok(())
    }
}
