//! Sidecar projections - derived scalar columns kept consistent with the
//! replicated document state
pub mod levels;
pub use levels::LevelsProjection;

use crate::crdt::LiveDoc;
use crate::registry::DocMeta;
use crate::store::DocStore;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle events a projection can respond to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionTrigger {
    Flush,
    Compact,
    Close,
}

/// What a projection sees when it runs.
pub struct ProjectionContext<'a> {
    pub doc_id: &'a str,
    pub doc: &'a Arc<dyn LiveDoc>,
    pub trigger: ProjectionTrigger,
}

/// A named, versioned unit extracting derived fields from document state.
///
/// `apply` must be idempotent: re-running it against unchanged state must
/// produce the same columns.
#[async_trait]
pub trait Projection: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> i64 {
        1
    }

    fn triggers(&self) -> &'static [ProjectionTrigger];

    /// Attach a fine-grained observer scoped to the sub-structure this
    /// projection cares about, returning its subscription. Returning `None`
    /// makes the runner treat the projection as dirty on every mutation.
    fn bind(
        &self,
        _doc: &Arc<dyn LiveDoc>,
        _mark_dirty: Arc<dyn Fn() + Send + Sync>,
    ) -> Option<crate::crdt::UpdateSubscription> {
        None
    }

    /// Cheap gate evaluated even when dirty.
    fn should_run(&self, _ctx: &ProjectionContext<'_>) -> bool {
        true
    }

    async fn apply(&self, store: &dyn DocStore, ctx: &ProjectionContext<'_>) -> Result<()>;
}

/// Runs the registered projections for one `(document, trigger)` pair.
///
/// Flush runs only dirty projections; compact and close always run, since
/// they are infrequent and must guarantee consistency. One projection's
/// failure is recorded and never blocks its siblings or the caller.
pub struct ProjectionRunner {
    store: Arc<dyn DocStore>,
    projections: Vec<Arc<dyn Projection>>,
}

impl ProjectionRunner {
    pub fn new(store: Arc<dyn DocStore>, projections: Vec<Arc<dyn Projection>>) -> Self {
        Self { store, projections }
    }

    pub fn projections(&self) -> &[Arc<dyn Projection>] {
        &self.projections
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.projections.iter().map(|p| p.name()).collect()
    }

    pub async fn run(&self, meta: &DocMeta, trigger: ProjectionTrigger) {
        let Some(doc) = meta.live_doc() else {
            debug!(
                "Skipping {:?} projections for {}: no live document",
                trigger, meta.doc_id
            );
            return;
        };
        for projection in &self.projections {
            if !projection.triggers().contains(&trigger) {
                continue;
            }
            let name = projection.name();
            if trigger == ProjectionTrigger::Flush && !meta.is_dirty(name) {
                continue;
            }
            let ctx = ProjectionContext {
                doc_id: &meta.doc_id,
                doc: &doc,
                trigger,
            };
            if !projection.should_run(&ctx) {
                continue;
            }
            match projection.apply(self.store.as_ref(), &ctx).await {
                Ok(()) => {
                    meta.clear_dirty(name);
                    if let Err(e) = self
                        .store
                        .record_projection_run(&meta.doc_id, name, projection.version(), None)
                        .await
                    {
                        warn!(
                            "Failed to record projection {} run for {}: {}",
                            name, meta.doc_id, e
                        );
                    }
                    debug!("Projection {} applied for {} ({:?})", name, meta.doc_id, trigger);
                }
                Err(e) => {
                    // Keep dirty so the next trigger retries.
                    warn!(
                        "Projection {} failed for {} ({:?}): {}",
                        name, meta.doc_id, trigger, e
                    );
                    let err_text = e.to_string();
                    if let Err(e) = self
                        .store
                        .record_projection_run(
                            &meta.doc_id,
                            name,
                            projection.version(),
                            Some(&err_text),
                        )
                        .await
                    {
                        warn!(
                            "Failed to record projection {} error for {}: {}",
                            name, meta.doc_id, e
                        );
                    }
                }
            }
        }
    }
}
