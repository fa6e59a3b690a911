//! Explicit save points and revert

use crate::crdt::Origin;
use crate::persistence::PersistenceEngine;
use crate::store::VersionSnapshot;
use anyhow::Result;
use tracing::info;

impl PersistenceEngine {
    /// Create an explicit version snapshot of the live state, then prune past
    /// the retention cap.
    pub async fn create_version(&self, doc_id: &str, label: Option<&str>) -> Result<i64> {
        let meta = self
            .registry()
            .get(doc_id)
            .ok_or_else(|| anyhow::anyhow!("Document {} is not bound", doc_id))?;
        let _guard = meta.writer.lock().await;
        let doc = meta
            .live_doc()
            .ok_or_else(|| anyhow::anyhow!("Document {} has no live instance", doc_id))?;
        let state = doc.encode_full_state();
        let version_id = self.store().create_version(doc_id, &state, label).await?;
        self.store()
            .prune_versions(doc_id, self.config().version_retention)
            .await?;
        info!("Created version {} for document {}", version_id, doc_id);
        Ok(version_id)
    }

    /// Versions for a document, newest first.
    pub async fn list_versions(&self, doc_id: &str) -> Result<Vec<VersionSnapshot>> {
        self.store().list_versions(doc_id).await
    }

    /// Revert the live document to a saved version.
    ///
    /// Validation errors (unknown version, version from another document)
    /// surface before any mutation. The replacement runs under the same
    /// writer lock as flush and compaction, so it cannot interleave with a
    /// concurrent storage write, and it is tagged `Origin::Revert`: a revert
    /// is a genuine new edit that must reach peers and the pending buffer.
    pub async fn revert_to_version(&self, doc_id: &str, version_id: i64) -> Result<()> {
        let version = self
            .store()
            .get_version(version_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Version {} not found", version_id))?;
        if version.document_id != doc_id {
            return Err(anyhow::anyhow!(
                "Version {} does not belong to document {}",
                version_id,
                doc_id
            ));
        }
        let meta = self
            .registry()
            .get(doc_id)
            .ok_or_else(|| anyhow::anyhow!("Document {} is not bound", doc_id))?;
        let _guard = meta.writer.lock().await;
        let doc = meta
            .live_doc()
            .ok_or_else(|| anyhow::anyhow!("Document {} has no live instance", doc_id))?;
        doc.replace_with(&version.state_blob, Origin::Revert)?;
        info!("Reverted document {} to version {}", doc_id, version_id);
        Ok(())
    }
}
