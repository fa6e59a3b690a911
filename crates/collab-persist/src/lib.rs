//! collab-persist: persistence engine for multi-writer replicated documents.
//!
//! Bridges in-memory CRDT documents to durable relational storage without
//! losing updates that arrive mid-write: mutations are captured synchronously
//! into a pending buffer, debounced into merged update-log appends, and
//! periodically compacted into full-state snapshots. Sidecar projections keep
//! derived scalar columns queryable, and version snapshots give operators
//! save points to revert to.

pub mod config;
pub mod crdt;
pub mod persistence;
pub mod projection;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod testkit;
pub mod versions;

// Public API exports
pub use config::Config;
pub use crdt::{LiveDoc, MergeEngine, Origin, UpdateSubscription};
pub use persistence::loader::load_doc_from_db;
pub use persistence::PersistenceEngine;
pub use projection::{LevelsProjection, Projection, ProjectionContext, ProjectionRunner, ProjectionTrigger};
pub use registry::{DocMeta, DocRegistry};
pub use store::{DocStore, DocumentLevels, SqliteStore};
pub use telemetry::init_tracing;
