//! Seam to the replication/merge library.
//!
//! The persistence core never inspects update bytes: it moves opaque blobs
//! between the live document and the relational store, and relies on the
//! engine behind these traits for conflict-free merging. Any backend that can
//! encode full state, apply updates, and merge update blobs (e.g. a Yjs-style
//! library) can sit behind this boundary.

use anyhow::Result;
use std::sync::Arc;

/// Where an applied update came from.
///
/// Replaying our own persisted data must never re-enter the pending buffer,
/// so the capture path filters on this tag. A revert is a genuine new edit
/// and carries its own tag precisely so it is *not* filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A new local edit (or an edit relayed from a peer).
    Local,
    /// Replay of our own storage during load.
    Persistence,
    /// Programmatic revert to a saved version.
    Revert,
}

/// Change callback fired on every document mutation: `(update_bytes, origin)`.
pub type UpdateCallback = Arc<dyn Fn(&[u8], Origin) + Send + Sync>;

/// RAII guard for a registered observer. Dropping it detaches the callback.
pub struct UpdateSubscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl UpdateSubscription {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }
}

impl Drop for UpdateSubscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for UpdateSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSubscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

/// A live replicated document.
///
/// Mutation notification is synchronous: callbacks fire before the mutating
/// call returns, so no update can slip between an edit and its capture.
pub trait LiveDoc: Send + Sync {
    /// Full-state encoding sufficient on its own to reconstruct the document.
    fn encode_full_state(&self) -> Vec<u8>;

    /// Apply one opaque update blob, tagged with its origin.
    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<()>;

    /// Register a change callback fired on every mutation.
    fn on_update(&self, callback: UpdateCallback) -> UpdateSubscription;

    /// Observe only a named key-value sub-structure. Used by projections that
    /// declare fine-grained interest instead of re-running on every edit.
    fn observe_map(&self, map: &str, callback: Arc<dyn Fn() + Send + Sync>) -> UpdateSubscription;

    /// Read one string value from a named key-value sub-structure.
    fn map_get(&self, map: &str, key: &str) -> Option<String>;

    /// Write one string value into a named key-value sub-structure.
    fn map_set(&self, map: &str, key: &str, value: &str, origin: Origin) -> Result<()>;

    /// Atomically replace the whole document content from a full-state
    /// encoding: clear plus repopulate in one transaction, emitted as a single
    /// update. This is the revert primitive.
    fn replace_with(&self, full_state: &[u8], origin: Origin) -> Result<()>;
}

/// Engine factory plus the document-free merge primitive.
pub trait MergeEngine: Send + Sync {
    /// Create an empty live document.
    fn new_document(&self) -> Arc<dyn LiveDoc>;

    /// Merge `n` update blobs into one equivalent blob.
    fn merge_updates(&self, updates: &[Vec<u8>]) -> Result<Vec<u8>>;
}
