//! Document reconstruction on first access

use crate::crdt::{LiveDoc, Origin};
use crate::store::DocStore;
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

/// Rebuild a document's state: apply the snapshot first (if any), then replay
/// every log entry in ascending id order.
///
/// Every apply is tagged `Origin::Persistence` so the capture callback can
/// tell replay from a genuine new edit; otherwise each reload would re-append
/// the same bytes to the pending buffer.
pub async fn load_doc_from_db(
    store: &dyn DocStore,
    doc_id: &str,
    doc: &Arc<dyn LiveDoc>,
) -> Result<()> {
    let snapshot = store.load_snapshot(doc_id).await?;
    let had_snapshot = snapshot.is_some();
    if let Some(snapshot) = snapshot {
        doc.apply_update(&snapshot.state_blob, Origin::Persistence)?;
    }
    let entries = store.load_updates(doc_id).await?;
    let replayed = entries.len();
    for entry in entries {
        doc.apply_update(&entry.update_blob, Origin::Persistence)?;
    }
    debug!(
        "Loaded document {}: snapshot={}, {} log entries replayed",
        doc_id, had_snapshot, replayed
    );
    Ok(())
}
