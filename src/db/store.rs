//! Graph store capability interface
//!
//! The record machinery is written against this trait, never against a
//! concrete store. Implementations must provide atomic single-document
//! semantics; in particular `insert_one` is insert-if-absent keyed on the
//! record `hash`, so two racing constructions of the same logical record
//! resolve to exactly one persisted document.

use async_trait::async_trait;
use bson::Document;

use crate::types::Result;

/// Outcome of an insert-if-absent keyed on the record hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The document was persisted.
    Inserted,
    /// A document with the same hash already exists; nothing was written.
    DuplicateHash,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Find all live documents matching the filter.
    async fn find(
        &self,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Vec<Document>>;

    /// Find one live document matching the filter.
    async fn find_one(
        &self,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Option<Document>>;

    /// Insert-if-absent keyed on `hash`.
    async fn insert_one(&self, document: Document) -> Result<InsertOutcome>;

    /// Apply an update to the first matching document. Returns the number
    /// of documents matched (0 or 1). Updates see soft-deleted documents.
    async fn update_one(&self, filter: Document, update: Document) -> Result<u64>;

    /// Apply an update to every matching document. Returns the number of
    /// documents matched.
    async fn update_many(&self, filter: Document, update: Document) -> Result<u64>;

    /// Count live documents matching the filter.
    async fn count(&self, filter: Document) -> Result<u64>;

    /// Run an aggregation pipeline.
    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>>;
}
