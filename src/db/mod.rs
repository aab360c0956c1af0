//! Graph store adapters
//!
//! `GraphStore` is the minimal capability surface the record machinery
//! consumes; `MongoStore` backs it with MongoDB and `MemoryStore` backs it
//! with an in-process map for tests and embedded use.

mod memory;
mod mongo;
mod store;

pub use memory::MemoryStore;
pub use mongo::MongoStore;
pub use store::{GraphStore, InsertOutcome};

use bson::{doc, Document};

/// Reads never surface soft-deleted documents.
pub(crate) fn live_guard(mut filter: Document) -> Document {
    filter.insert("meta.is_deleted", doc! { "$ne": true });
    filter
}
