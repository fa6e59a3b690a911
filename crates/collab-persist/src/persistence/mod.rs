//! Persistence engine - wires the pending-update capture, debounced flushes,
//! periodic compaction, and document lifecycle together
mod compact;
mod flush;
pub mod loader;

use crate::config::Config;
use crate::crdt::{LiveDoc, MergeEngine, Origin};
use crate::projection::{Projection, ProjectionRunner, ProjectionTrigger};
use crate::registry::{BindState, DocRegistry};
use crate::store::DocStore;
use anyhow::Result;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// The CRDT document persistence engine.
///
/// One instance is shared process-wide. Per-document state lives in the
/// registry; every DB-affecting operation for a document runs under that
/// document's writer lock, while different documents proceed independently.
pub struct PersistenceEngine {
    store: Arc<dyn DocStore>,
    merge: Arc<dyn MergeEngine>,
    registry: DocRegistry,
    runner: ProjectionRunner,
    config: Config,
    /// Cleared when shutdown begins; new binds are refused from then on.
    accepting: AtomicBool,
    runtime: tokio::runtime::Handle,
    /// Self-reference handed to timers and capture callbacks, so a dropped
    /// engine cannot be kept alive (or called back) by a stray timer.
    weak: Weak<PersistenceEngine>,
}

impl PersistenceEngine {
    /// Must be called from within a tokio runtime; the engine captures the
    /// runtime handle so synchronous mutation callbacks can arm timers.
    pub fn new(
        store: Arc<dyn DocStore>,
        merge: Arc<dyn MergeEngine>,
        projections: Vec<Arc<dyn Projection>>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            runner: ProjectionRunner::new(Arc::clone(&store), projections),
            store,
            merge,
            registry: DocRegistry::new(),
            config,
            accepting: AtomicBool::new(true),
            runtime: tokio::runtime::Handle::current(),
            weak: weak.clone(),
        })
    }

    pub fn store(&self) -> &Arc<dyn DocStore> {
        &self.store
    }

    pub fn merge_engine(&self) -> &Arc<dyn MergeEngine> {
        &self.merge
    }

    pub fn registry(&self) -> &DocRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn runner(&self) -> &ProjectionRunner {
        &self.runner
    }

    pub(crate) fn runtime(&self) -> &tokio::runtime::Handle {
        &self.runtime
    }

    pub(crate) fn weak_self(&self) -> Weak<PersistenceEngine> {
        self.weak.clone()
    }

    /// Bind a live document: attach the mutation capture, load persisted
    /// state, and start the compaction timer.
    ///
    /// Idempotent under concurrency: simultaneous first binders serialize on
    /// the per-document bind lock, and every later call is a no-op.
    pub async fn bind_document(&self, doc_id: &str, doc: Arc<dyn LiveDoc>) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Persistence engine is shutting down"));
        }
        self.store.ensure_document(doc_id).await?;
        let meta = self.registry.get_or_create(doc_id, Some(&doc));

        let mut bind = meta.bind.lock().await;
        if bind.is_bound() {
            debug!("Document {} already bound", doc_id);
            return Ok(());
        }

        // The capture callback is synchronous: the update lands in the
        // pending buffer before the mutating call returns, so nothing can be
        // missed. Replays of our own storage are filtered by origin.
        let weak_engine = self.weak.clone();
        let capture_id = doc_id.to_string();
        let capture = doc.on_update(Arc::new(move |update: &[u8], origin: Origin| {
            if origin == Origin::Persistence {
                return;
            }
            let Some(engine) = weak_engine.upgrade() else {
                return;
            };
            let Some(meta) = engine.registry.get(&capture_id) else {
                return;
            };
            meta.push_pending(update.to_vec());
            meta.mark_coarse_dirty();
            engine.schedule_flush(&capture_id);
        }));

        let mut projection_subs = Vec::new();
        let mut coarse = Vec::new();
        for projection in self.runner.projections() {
            let name = projection.name();
            let weak_meta = Arc::downgrade(&meta);
            let mark_dirty: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
                if let Some(meta) = weak_meta.upgrade() {
                    meta.mark_dirty(name);
                }
            });
            match projection.bind(&doc, mark_dirty) {
                Some(sub) => projection_subs.push(sub),
                None => coarse.push(name),
            }
        }
        meta.set_projection_names(self.runner.names(), coarse);

        if let Err(e) = loader::load_doc_from_db(self.store.as_ref(), doc_id, &doc).await {
            // A failed bind must not leave inert metadata behind; the next
            // attempt starts from scratch.
            drop(bind);
            self.registry.remove(doc_id);
            return Err(e);
        }
        self.start_compaction_task(&meta);

        *bind = BindState::Bound {
            _capture: capture,
            _projection_subs: projection_subs,
        };
        info!("Bound document {}", doc_id);
        Ok(())
    }

    /// Last client disconnected: persist a final consistent state, run
    /// close-tier projections, stop timers, discard metadata.
    pub async fn unbind_document(&self, doc_id: &str) -> Result<()> {
        let Some(meta) = self.registry.get(doc_id) else {
            return Ok(());
        };
        {
            // One critical section: the final compaction and the close-tier
            // projections must not interleave with a late debounced flush.
            let _guard = meta.writer.lock().await;
            // Forced: closing must persist even when no log rows were written.
            if let Err(e) = self.compact_locked(&meta, true).await {
                // Leave the document bound so buffered edits survive and the
                // periodic pass retries.
                warn!("Final compaction for {} failed, keeping it bound: {}", doc_id, e);
                return Ok(());
            }
            self.runner.run(&meta, ProjectionTrigger::Close).await;
        }
        meta.abort_timers();
        {
            let mut bind = meta.bind.lock().await;
            *bind = BindState::Unbound;
        }
        self.registry.remove(doc_id);
        info!("Unbound document {}", doc_id);
        Ok(())
    }

    /// Explicit "save now": flush plus forced compaction, returning only
    /// after both complete so the caller gets a durability guarantee. Unlike
    /// the timer-driven paths, failures surface to the caller.
    pub async fn force_save(&self, doc_id: &str) -> Result<()> {
        self.compact_document(doc_id, true).await
    }

    /// Process shutdown: stop accepting binds, drain every bound document's
    /// pending updates concurrently, and only then stop the timers.
    pub async fn shutdown(&self) {
        // Ingress is cut before the drain starts; a mutation captured before
        // this point is still in some pending buffer and will be flushed.
        self.accepting.store(false, Ordering::SeqCst);
        let metas = self.registry.all();
        info!("Persistence shutdown: draining {} bound documents", metas.len());

        let flushes = metas.iter().map(|meta| {
            let doc_id = meta.doc_id.clone();
            async move {
                if let Err(e) = self.flush_pending_updates(&doc_id).await {
                    warn!("Shutdown flush failed for {}: {}", doc_id, e);
                }
            }
        });
        join_all(flushes).await;

        for meta in &metas {
            meta.abort_timers();
            let mut bind = meta.bind.lock().await;
            *bind = BindState::Unbound;
        }
        info!("Persistence shutdown complete");
    }
}
