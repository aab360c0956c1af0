//! In-memory graph store
//!
//! Backs tests and embedded use with the same capability surface as the
//! MongoDB adapter. Documents are keyed by record hash, and filter/update
//! support covers the operator subset this crate issues: top-level and
//! dotted-path equality (with array containment), `$in`, `$ne`, `$exists`,
//! `$and`/`$or`, and `$set`/`$addToSet`/`$pull`/`$unset` updates.

use bson::{Bson, Document};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::db::live_guard;
use crate::db::store::{GraphStore, InsertOutcome};
use crate::types::{Result, WatchtowerError};

/// DashMap-backed adapter, hash → flattened document
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, Document>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matching hashes in deterministic order.
    fn matching_hashes(&self, filter: &Document) -> Vec<String> {
        let mut hashes: Vec<String> = self
            .records
            .iter()
            .filter(|entry| matches(entry.value(), filter))
            .map(|entry| entry.key().clone())
            .collect();
        hashes.sort();
        hashes
    }
}

#[async_trait::async_trait]
impl GraphStore for MemoryStore {
    async fn find(
        &self,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Vec<Document>> {
        let filter = live_guard(filter);
        let docs = self
            .matching_hashes(&filter)
            .into_iter()
            .filter_map(|hash| self.records.get(&hash).map(|e| e.value().clone()))
            .map(|doc| apply_projection(doc, projection.as_ref()))
            .collect();
        Ok(docs)
    }

    async fn find_one(
        &self,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Option<Document>> {
        Ok(self.find(filter, projection).await?.into_iter().next())
    }

    async fn insert_one(&self, document: Document) -> Result<InsertOutcome> {
        let hash = document
            .get_str("hash")
            .map_err(|_| WatchtowerError::Malformed("document carries no hash".to_string()))?
            .to_string();

        // The entry guard makes racing inserts of one hash serialize
        match self.records.entry(hash) {
            Entry::Occupied(_) => Ok(InsertOutcome::DuplicateHash),
            Entry::Vacant(slot) => {
                slot.insert(document);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn update_one(&self, filter: Document, update: Document) -> Result<u64> {
        for hash in self.matching_hashes(&filter) {
            if let Some(mut entry) = self.records.get_mut(&hash) {
                apply_update(entry.value_mut(), &update)?;
                return Ok(1);
            }
        }
        Ok(0)
    }

    async fn update_many(&self, filter: Document, update: Document) -> Result<u64> {
        let mut matched = 0;
        for hash in self.matching_hashes(&filter) {
            if let Some(mut entry) = self.records.get_mut(&hash) {
                apply_update(entry.value_mut(), &update)?;
                matched += 1;
            }
        }
        Ok(matched)
    }

    async fn count(&self, filter: Document) -> Result<u64> {
        let filter = live_guard(filter);
        Ok(self.matching_hashes(&filter).len() as u64)
    }

    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        // Enough of the pipeline surface for adapter parity: $match + $count
        let mut docs: Vec<Document> = {
            let mut hashes: Vec<String> = self.records.iter().map(|e| e.key().clone()).collect();
            hashes.sort();
            hashes
                .into_iter()
                .filter_map(|h| self.records.get(&h).map(|e| e.value().clone()))
                .collect()
        };

        for stage in &pipeline {
            if let Ok(filter) = stage.get_document("$match") {
                docs.retain(|doc| matches(doc, filter));
            } else if let Ok(name) = stage.get_str("$count") {
                let mut out = Document::new();
                out.insert(name, docs.len() as i64);
                return Ok(vec![out]);
            } else {
                return Err(WatchtowerError::Store(format!(
                    "unsupported aggregation stage: {stage}"
                )));
            }
        }

        Ok(docs)
    }
}

/// Resolve a possibly dotted path against a document.
fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut current = doc;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        let value = current.get(segment)?;
        if segments.peek().is_none() {
            return Some(value);
        }
        current = value.as_document()?;
    }
    None
}

fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| match key.as_str() {
        "$and" => match expected.as_array() {
            Some(clauses) => clauses
                .iter()
                .all(|c| c.as_document().is_some_and(|d| matches(doc, d))),
            None => false,
        },
        "$or" => match expected.as_array() {
            Some(clauses) => clauses
                .iter()
                .any(|c| c.as_document().is_some_and(|d| matches(doc, d))),
            None => false,
        },
        path => field_matches(lookup_path(doc, path), expected),
    })
}

fn field_matches(actual: Option<&Bson>, expected: &Bson) -> bool {
    if let Bson::Document(ops) = expected {
        if ops.keys().any(|k| k.starts_with('$')) {
            return ops.iter().all(|(op, operand)| match op.as_str() {
                "$in" => operand
                    .as_array()
                    .is_some_and(|choices| choices.iter().any(|c| value_matches(actual, c))),
                "$ne" => !value_matches(actual, operand),
                "$exists" => operand.as_bool() == Some(actual.is_some()),
                _ => false,
            });
        }
    }
    value_matches(actual, expected)
}

/// Equality with array containment, as the document stores compare it.
fn value_matches(actual: Option<&Bson>, expected: &Bson) -> bool {
    match actual {
        None => matches!(expected, Bson::Null),
        Some(Bson::Array(items)) => {
            items.iter().any(|item| item == expected) || Bson::Array(items.clone()) == *expected
        }
        Some(value) => value == expected,
    }
}

fn apply_update(doc: &mut Document, update: &Document) -> Result<()> {
    for (op, fields) in update {
        let fields = fields.as_document().ok_or_else(|| {
            WatchtowerError::Store(format!("malformed update operand for {op}"))
        })?;

        for (path, value) in fields {
            match op.as_str() {
                "$set" => set_path(doc, path, value.clone()),
                "$unset" => unset_path(doc, path),
                "$addToSet" => {
                    let values = array_at_mut(doc, path);
                    if !values.contains(value) {
                        values.push(value.clone());
                    }
                }
                "$pull" => {
                    let values = array_at_mut(doc, path);
                    values.retain(|v| v != value);
                }
                other => {
                    return Err(WatchtowerError::Store(format!(
                        "unsupported update operator: {other}"
                    )))
                }
            }
        }
    }
    Ok(())
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                set_path(child, rest, value);
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                unset_path(child, rest);
            }
        }
    }
}

fn array_at_mut<'a>(doc: &'a mut Document, path: &str) -> &'a mut Vec<Bson> {
    if !matches!(doc.get(path), Some(Bson::Array(_))) {
        doc.insert(path, Bson::Array(Vec::new()));
    }
    match doc.get_mut(path) {
        Some(Bson::Array(values)) => values,
        _ => unreachable!("array was just inserted"),
    }
}

/// Include-style projection over top-level fields.
fn apply_projection(doc: Document, projection: Option<&Document>) -> Document {
    match projection {
        None => doc,
        Some(fields) => {
            let mut out = Document::new();
            for key in fields.keys() {
                if let Some(value) = doc.get(key) {
                    out.insert(key.clone(), value.clone());
                }
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn store_with(docs: Vec<Document>) -> MemoryStore {
        let store = MemoryStore::new();
        for doc in docs {
            let hash = doc.get_str("hash").unwrap().to_string();
            store.records.insert(hash, doc);
        }
        store
    }

    #[tokio::test]
    async fn test_insert_is_keyed_on_hash() {
        let store = MemoryStore::new();
        let doc = doc! { "hash": "aa", "kind": "attribute" };

        assert_eq!(
            store.insert_one(doc.clone()).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_one(doc).await.unwrap(),
            InsertOutcome::DuplicateHash
        );
        assert_eq!(store.count(doc! {}).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_equality_and_array_containment() {
        let store = store_with(vec![
            doc! { "hash": "a", "kind": "object", "acl": ["u1", "u2"] },
            doc! { "hash": "b", "kind": "object", "acl": ["u3"] },
        ]);

        let hits = store.find(doc! { "acl": "u1" }, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get_str("hash").unwrap(), "a");
    }

    #[tokio::test]
    async fn test_dotted_paths_and_operators() {
        let store = store_with(vec![
            doc! { "hash": "a", "payload": { "email": ["x@example.com"] }, "n": 1 },
            doc! { "hash": "b", "payload": { "email": ["y@example.com"] }, "n": 2 },
        ]);

        let by_email = store
            .find_one(doc! { "payload.email": "y@example.com" }, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_email.get_str("hash").unwrap(), "b");

        let by_in = store
            .find(doc! { "n": { "$in": [1, 2] } }, None)
            .await
            .unwrap();
        assert_eq!(by_in.len(), 2);

        let by_ne = store.find(doc! { "n": { "$ne": 1 } }, None).await.unwrap();
        assert_eq!(by_ne.len(), 1);

        let absent = store
            .find(doc! { "orgid": { "$exists": false } }, None)
            .await
            .unwrap();
        assert_eq!(absent.len(), 2);

        let either = store
            .find(doc! { "$or": [ { "hash": "a" }, { "hash": "b" } ] }, None)
            .await
            .unwrap();
        assert_eq!(either.len(), 2);
    }

    #[tokio::test]
    async fn test_updates() {
        let store = store_with(vec![doc! { "hash": "a", "transitive_refs": ["x"] }]);

        store
            .update_one(
                doc! { "hash": "a" },
                doc! { "$addToSet": { "transitive_refs": "y" } },
            )
            .await
            .unwrap();
        store
            .update_one(
                doc! { "hash": "a" },
                doc! { "$addToSet": { "transitive_refs": "y" } },
            )
            .await
            .unwrap();
        store
            .update_one(doc! { "hash": "a" }, doc! { "$set": { "meta.is_deleted": true } })
            .await
            .unwrap();

        let raw = store.records.get("a").unwrap().value().clone();
        assert_eq!(raw.get_array("transitive_refs").unwrap().len(), 2);
        assert_eq!(
            lookup_path(&raw, "meta.is_deleted"),
            Some(&Bson::Boolean(true))
        );

        store
            .update_one(
                doc! { "hash": "a" },
                doc! { "$pull": { "transitive_refs": "x" }, "$unset": { "meta.is_deleted": "" } },
            )
            .await
            .unwrap();
        let raw = store.records.get("a").unwrap().value().clone();
        assert_eq!(raw.get_array("transitive_refs").unwrap().len(), 1);
        assert!(lookup_path(&raw, "meta.is_deleted").is_none());
    }

    #[tokio::test]
    async fn test_soft_deleted_documents_are_hidden_from_reads() {
        let store = store_with(vec![doc! { "hash": "a", "kind": "event" }]);

        store
            .update_one(doc! { "hash": "a" }, doc! { "$set": { "meta.is_deleted": true } })
            .await
            .unwrap();

        assert!(store.find_one(doc! { "hash": "a" }, None).await.unwrap().is_none());
        assert_eq!(store.count(doc! {}).await.unwrap(), 0);

        // Updates still reach the document for bookkeeping and revival
        let matched = store
            .update_one(doc! { "hash": "a" }, doc! { "$set": { "meta.is_deleted": false } })
            .await
            .unwrap();
        assert_eq!(matched, 1);
        assert!(store.find_one(doc! { "hash": "a" }, None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_projection_keeps_listed_fields() {
        let store = store_with(vec![doc! { "hash": "a", "kind": "object", "acl": ["u"] }]);

        let hit = store
            .find_one(doc! { "hash": "a" }, Some(doc! { "hash": 1 }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.get_str("hash").unwrap(), "a");
        assert!(hit.get("kind").is_none());
    }

    #[tokio::test]
    async fn test_aggregate_match_and_count() {
        let store = store_with(vec![
            doc! { "hash": "a", "kind": "event" },
            doc! { "hash": "b", "kind": "event" },
            doc! { "hash": "c", "kind": "object" },
        ]);

        let out = store
            .aggregate(vec![
                doc! { "$match": { "kind": "event" } },
                doc! { "$count": "events" },
            ])
            .await
            .unwrap();
        assert_eq!(out[0].get_i64("events").unwrap(), 2);
    }
}
