//! Reference projection: three string-valued levels from the document's
//! properties map, stored as small integer columns for list views

use crate::crdt::{LiveDoc, UpdateSubscription};
use crate::projection::{Projection, ProjectionContext, ProjectionTrigger};
use crate::store::{DocStore, DocumentLevels};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// The key-value sub-structure this projection observes.
pub const PROPERTIES_MAP: &str = "properties";
pub const RISK_KEY: &str = "risk";
pub const IMPACT_KEY: &str = "impact";
pub const EFFORT_KEY: &str = "effort";

/// Map a level label to its column integer. The top two labels collapse to
/// the same maximum; anything unknown counts as unset.
fn level_to_int(label: Option<&str>) -> i64 {
    match label {
        Some("Low") => 1,
        Some("Medium") => 2,
        Some("High") | Some("Critical") => 3,
        _ => 0,
    }
}

pub struct LevelsProjection;

#[async_trait]
impl Projection for LevelsProjection {
    fn name(&self) -> &'static str {
        "levels"
    }

    fn triggers(&self) -> &'static [ProjectionTrigger] {
        &[
            ProjectionTrigger::Flush,
            ProjectionTrigger::Compact,
            ProjectionTrigger::Close,
        ]
    }

    fn bind(
        &self,
        doc: &Arc<dyn LiveDoc>,
        mark_dirty: Arc<dyn Fn() + Send + Sync>,
    ) -> Option<UpdateSubscription> {
        // Only edits to the properties map concern us.
        Some(doc.observe_map(PROPERTIES_MAP, mark_dirty))
    }

    async fn apply(&self, store: &dyn DocStore, ctx: &ProjectionContext<'_>) -> Result<()> {
        let levels = DocumentLevels {
            risk: level_to_int(ctx.doc.map_get(PROPERTIES_MAP, RISK_KEY).as_deref()),
            impact: level_to_int(ctx.doc.map_get(PROPERTIES_MAP, IMPACT_KEY).as_deref()),
            effort: level_to_int(ctx.doc.map_get(PROPERTIES_MAP, EFFORT_KEY).as_deref()),
        };
        store.update_levels(ctx.doc_id, levels).await
    }
}
