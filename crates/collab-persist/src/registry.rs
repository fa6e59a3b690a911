//! In-memory per-document bookkeeping: pending buffer, dirty set, timers,
//! and the per-document writer lock

use crate::crdt::{LiveDoc, UpdateSubscription};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::debug;

/// Lifecycle of one document's binding. The surrounding `tokio::sync::Mutex`
/// doubles as the per-document initialization lock: concurrent first binders
/// serialize on it, and later ones see `Bound` and return.
pub enum BindState {
    Unbound,
    Bound {
        /// Capture subscription feeding the pending buffer.
        _capture: UpdateSubscription,
        /// Fine-grained observers attached by projections.
        _projection_subs: Vec<UpdateSubscription>,
    },
}

impl BindState {
    pub fn is_bound(&self) -> bool {
        matches!(self, BindState::Bound { .. })
    }
}

/// Per-document in-memory state. Created on first bind, discarded on unbind.
///
/// The pending buffer is only ever appended outside the writer lock (by the
/// synchronous capture callback) and only ever trimmed while holding it.
pub struct DocMeta {
    pub doc_id: String,
    /// Serializes every DB-affecting operation for this document.
    pub writer: tokio::sync::Mutex<()>,
    /// Bind state plus initialization lock.
    pub bind: tokio::sync::Mutex<BindState>,
    pending: Mutex<Vec<Vec<u8>>>,
    dirty: Mutex<HashSet<&'static str>>,
    /// Projections without a fine-grained observer; dirtied on every mutation.
    coarse_projections: Mutex<Vec<&'static str>>,
    all_projections: Mutex<Vec<&'static str>>,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
    compaction_task: Mutex<Option<JoinHandle<()>>>,
    rows_since_compaction: AtomicUsize,
    last_auto_version: Mutex<Option<Instant>>,
    live: Mutex<Option<Weak<dyn LiveDoc>>>,
}

impl DocMeta {
    fn new(doc_id: &str) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            writer: tokio::sync::Mutex::new(()),
            bind: tokio::sync::Mutex::new(BindState::Unbound),
            pending: Mutex::new(Vec::new()),
            dirty: Mutex::new(HashSet::new()),
            coarse_projections: Mutex::new(Vec::new()),
            all_projections: Mutex::new(Vec::new()),
            debounce_task: Mutex::new(None),
            compaction_task: Mutex::new(None),
            rows_since_compaction: AtomicUsize::new(0),
            last_auto_version: Mutex::new(None),
            live: Mutex::new(None),
        }
    }

    /// Synchronous append from the mutation callback. Never blocks on the
    /// writer lock.
    pub fn push_pending(&self, update: Vec<u8>) {
        self.pending.lock().expect("pending poisoned").push(update);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending poisoned").len()
    }

    /// Clone the first `n` buffered updates without trimming them. The trim
    /// happens separately, after the durable write succeeds.
    pub fn pending_head(&self, n: usize) -> Vec<Vec<u8>> {
        let pending = self.pending.lock().expect("pending poisoned");
        pending.iter().take(n).cloned().collect()
    }

    /// Remove exactly the first `n` entries. Entries appended while the write
    /// was in flight stay put for the next cycle.
    pub fn drain_pending(&self, n: usize) {
        let mut pending = self.pending.lock().expect("pending poisoned");
        let n = n.min(pending.len());
        pending.drain(..n);
    }

    pub fn mark_dirty(&self, projection: &'static str) {
        self.dirty.lock().expect("dirty poisoned").insert(projection);
    }

    /// Dirty every projection that has no fine-grained observer.
    pub fn mark_coarse_dirty(&self) {
        let coarse = self.coarse_projections.lock().expect("coarse poisoned");
        let mut dirty = self.dirty.lock().expect("dirty poisoned");
        for name in coarse.iter() {
            dirty.insert(name);
        }
    }

    /// Dirty every registered projection.
    pub fn mark_all_dirty(&self) {
        let all = self.all_projections.lock().expect("projections poisoned");
        let mut dirty = self.dirty.lock().expect("dirty poisoned");
        for name in all.iter() {
            dirty.insert(name);
        }
    }

    pub fn is_dirty(&self, projection: &str) -> bool {
        self.dirty.lock().expect("dirty poisoned").contains(projection)
    }

    pub fn clear_dirty(&self, projection: &str) {
        self.dirty.lock().expect("dirty poisoned").remove(projection);
    }

    pub fn set_projection_names(&self, all: Vec<&'static str>, coarse: Vec<&'static str>) {
        *self.all_projections.lock().expect("projections poisoned") = all;
        *self.coarse_projections.lock().expect("coarse poisoned") = coarse;
    }

    /// Arm the debounce timer, cancelling any previously armed one.
    pub fn set_debounce_task(&self, handle: JoinHandle<()>) {
        let mut slot = self.debounce_task.lock().expect("debounce poisoned");
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    pub fn set_compaction_task(&self, handle: JoinHandle<()>) {
        let mut slot = self.compaction_task.lock().expect("compaction poisoned");
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Cancel both timers. Must run on unbind and shutdown so no orphaned
    /// timer fires for a document whose metadata is gone.
    pub fn abort_timers(&self) {
        if let Some(task) = self.debounce_task.lock().expect("debounce poisoned").take() {
            task.abort();
        }
        if let Some(task) = self
            .compaction_task
            .lock()
            .expect("compaction poisoned")
            .take()
        {
            task.abort();
        }
    }

    pub fn add_rows_since_compaction(&self, n: usize) {
        self.rows_since_compaction.fetch_add(n, Ordering::Relaxed);
    }

    pub fn rows_since_compaction(&self) -> usize {
        self.rows_since_compaction.load(Ordering::Relaxed)
    }

    pub fn reset_rows_since_compaction(&self) {
        self.rows_since_compaction.store(0, Ordering::Relaxed);
    }

    /// Whether enough wall-clock time has passed for another auto-version.
    pub fn auto_version_due(&self, min_interval: std::time::Duration) -> bool {
        let last = self.last_auto_version.lock().expect("autoversion poisoned");
        match *last {
            Some(at) => at.elapsed() >= min_interval,
            None => true,
        }
    }

    /// Record a successful auto-version write. A failed write leaves the
    /// previous timestamp so the next compaction retries immediately.
    pub fn record_auto_version(&self) {
        *self.last_auto_version.lock().expect("autoversion poisoned") = Some(Instant::now());
    }

    pub fn set_live_doc(&self, doc: &Arc<dyn LiveDoc>) {
        *self.live.lock().expect("live poisoned") = Some(Arc::downgrade(doc));
    }

    /// Upgrade the weak back-reference to the live in-memory document.
    pub fn live_doc(&self) -> Option<Arc<dyn LiveDoc>> {
        self.live
            .lock()
            .expect("live poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

/// Owned registry of active documents, keyed by document id.
pub struct DocRegistry {
    docs: DashMap<String, Arc<DocMeta>>,
}

impl DocRegistry {
    pub fn new() -> Self {
        Self {
            docs: DashMap::new(),
        }
    }

    /// Idempotent: repeated calls for the same id return the same instance.
    /// A supplied live reference replaces the stored one (documents may be
    /// rebound across reconnects).
    pub fn get_or_create(&self, doc_id: &str, live: Option<&Arc<dyn LiveDoc>>) -> Arc<DocMeta> {
        let meta = self
            .docs
            .entry(doc_id.to_string())
            .or_insert_with(|| {
                debug!("Tracking document {}", doc_id);
                Arc::new(DocMeta::new(doc_id))
            })
            .value()
            .clone();
        if let Some(doc) = live {
            meta.set_live_doc(doc);
        }
        meta
    }

    pub fn get(&self, doc_id: &str) -> Option<Arc<DocMeta>> {
        self.docs.get(doc_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, doc_id: &str) -> Option<Arc<DocMeta>> {
        self.docs.remove(doc_id).map(|(_, meta)| meta)
    }

    pub fn all(&self) -> Vec<Arc<DocMeta>> {
        self.docs.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

impl Default for DocRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = DocRegistry::new();
        let a = registry.get_or_create("d1", None);
        let b = registry.get_or_create("d1", None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_drain_removes_only_head() {
        let meta = DocMeta::new("d1");
        meta.push_pending(b"a".to_vec());
        meta.push_pending(b"b".to_vec());
        let head = meta.pending_head(2);
        assert_eq!(head.len(), 2);

        // An update lands while the write is "in flight".
        meta.push_pending(b"c".to_vec());
        meta.drain_pending(2);
        assert_eq!(meta.pending_len(), 1);
        assert_eq!(meta.pending_head(1), vec![b"c".to_vec()]);
    }

    #[test]
    fn test_coarse_dirty_marking() {
        let meta = DocMeta::new("d1");
        meta.set_projection_names(vec!["fine", "coarse"], vec!["coarse"]);
        meta.mark_coarse_dirty();
        assert!(meta.is_dirty("coarse"));
        assert!(!meta.is_dirty("fine"));

        meta.mark_all_dirty();
        assert!(meta.is_dirty("fine"));
        meta.clear_dirty("fine");
        assert!(!meta.is_dirty("fine"));
    }

    #[test]
    fn test_auto_version_gating() {
        let meta = DocMeta::new("d1");
        let minute = std::time::Duration::from_secs(60);
        assert!(meta.auto_version_due(minute));
        // The interval is only consumed when a version write succeeds, so a
        // failed write gets an immediate retry on the next compaction.
        assert!(meta.auto_version_due(minute));
        meta.record_auto_version();
        assert!(!meta.auto_version_due(minute));
        assert!(meta.auto_version_due(std::time::Duration::ZERO));
    }
}
