//! Dedup/construction engine
//!
//! Every record enters the graph through `materialize`: compute the
//! reference sets from the children, content-hash the identity triple, and
//! either hand back the already persisted record or insert the new one and
//! extend its children's reverse-reachability bookkeeping. At most one
//! record exists per unique `(kind, sub_type, payload)` triple.

use std::collections::BTreeSet;
use std::sync::Arc;

use bson::{doc, Bson, Document};
use chrono::Utc;
use tracing::debug;

use crate::canonical::{bson_type_name, content_hash};
use crate::db::{GraphStore, InsertOutcome};
use crate::record::{self, Category, Record, RecordKind, RecordMeta};
use crate::types::{Result, WatchtowerError};

/// Constructs records against an injected graph store.
#[derive(Clone)]
pub struct Materializer {
    store: Arc<dyn GraphStore>,
}

impl Materializer {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Reconcile a fully-populated record with the store.
    ///
    /// Returns the existing record when the hash is already present,
    /// otherwise persists the new one. Construction contract failures
    /// (`EmptyChildren`, `UnsupportedType`) are detected before any store
    /// round-trip.
    pub async fn materialize(
        &self,
        kind: RecordKind,
        sub_type: &str,
        payload: Bson,
        children: &[Record],
    ) -> Result<Record> {
        if kind == RecordKind::Object && children.is_empty() {
            return Err(WatchtowerError::EmptyChildren);
        }
        if matches!(kind, RecordKind::Attribute | RecordKind::Raw) && !children.is_empty() {
            return Err(WatchtowerError::Malformed(format!(
                "{kind} records take no children"
            )));
        }
        if kind == RecordKind::Attribute && !record::is_scalar(&payload) {
            return Err(WatchtowerError::UnsupportedType(bson_type_name(&payload)));
        }

        let record = self.assemble(kind, sub_type, payload, children)?;
        self.commit(record, children).await
    }

    /// Leaf fact holding one scalar.
    pub async fn attribute(&self, sub_type: &str, value: Bson) -> Result<Record> {
        self.materialize(RecordKind::Attribute, sub_type, value, &[]).await
    }

    /// Composite of at least one child; the payload is the denormalized
    /// snapshot of the children's values.
    pub async fn object(&self, sub_type: &str, children: &[Record]) -> Result<Record> {
        if children.is_empty() {
            return Err(WatchtowerError::EmptyChildren);
        }
        let payload = Bson::Document(Record::compose_payload(children));
        self.materialize(RecordKind::Object, sub_type, payload, children).await
    }

    /// Org-owned observation. `orgid` and `timestamp` are folded into the
    /// hashed payload (two orgs' otherwise identical events must not
    /// deduplicate into one shared record) and mirrored as top-level
    /// query fields. Category starts at `unknown`.
    pub async fn event(
        &self,
        sub_type: &str,
        orgid: &str,
        timestamp: i64,
        children: &[Record],
    ) -> Result<Record> {
        let mut payload = doc! { "orgid": orgid, "timestamp": timestamp };
        payload.insert("attrs", Record::compose_payload(children));

        let mut record =
            self.assemble(RecordKind::Event, sub_type, Bson::Document(payload), children)?;
        record.orgid = Some(orgid.to_string());
        record.timestamp = Some(timestamp);
        record.category = Some(Category::Unknown);

        self.commit(record, children).await
    }

    /// `event` stamped with the current wall clock.
    pub async fn event_now(
        &self,
        sub_type: &str,
        orgid: &str,
        children: &[Record],
    ) -> Result<Record> {
        self.event(sub_type, orgid, Utc::now().timestamp_millis(), children)
            .await
    }

    /// Grouping keyed by identifier objects. Events are attached later via
    /// the edit engine and never participate in the session's hash.
    pub async fn session(&self, sub_type: &str, identifiers: &[Record]) -> Result<Record> {
        if identifiers.is_empty() {
            return Err(WatchtowerError::EmptyChildren);
        }
        for identifier in identifiers {
            if identifier.kind != RecordKind::Object {
                return Err(WatchtowerError::Malformed(format!(
                    "session identifier {} is not an object",
                    identifier.hash
                )));
            }
        }

        let payload = doc! { "identifiers": Record::compose_payload(identifiers) };
        self.materialize(
            RecordKind::Session,
            sub_type,
            Bson::Document(payload),
            identifiers,
        )
        .await
    }

    /// Verbatim externally-ingested document; never decomposed.
    pub async fn raw(
        &self,
        sub_type: &str,
        document: Document,
        orgid: Option<&str>,
        timestamp: Option<i64>,
    ) -> Result<Record> {
        let mut payload = doc! { "document": document };
        if let Some(orgid_value) = orgid {
            payload.insert("orgid", orgid_value);
        }
        if let Some(ts) = timestamp {
            payload.insert("timestamp", ts);
        }

        let mut record = self.assemble(RecordKind::Raw, sub_type, Bson::Document(payload), &[])?;
        record.orgid = orgid.map(str::to_string);
        record.timestamp = timestamp;

        self.commit(record, &[]).await
    }

    /// `raw` for a JSON capture.
    pub async fn raw_from_json(
        &self,
        sub_type: &str,
        capture: serde_json::Value,
        orgid: Option<&str>,
        timestamp: Option<i64>,
    ) -> Result<Record> {
        let converted = bson::to_bson(&capture)
            .map_err(|e| WatchtowerError::Malformed(format!("raw capture: {e}")))?;
        let document = converted
            .as_document()
            .cloned()
            .ok_or_else(|| {
                WatchtowerError::Malformed("raw capture must be a json object".to_string())
            })?;
        self.raw(sub_type, document, orgid, timestamp).await
    }

    /// Fetch a live record by hash.
    pub async fn fetch(&self, hash: &str) -> Result<Option<Record>> {
        match self.store.find_one(doc! { "hash": hash }, None).await? {
            Some(document) => Ok(Some(Record::decode(document)?)),
            None => Ok(None),
        }
    }

    /// Records whose reference closure contains the hash.
    pub async fn related(&self, hash: &str) -> Result<Vec<Record>> {
        let documents = self
            .store
            .find(doc! { "transitive_refs": hash }, None)
            .await?;
        documents.into_iter().map(Record::decode).collect()
    }

    /// Build the record without touching the store: reference sets from
    /// the children, hash from the identity triple.
    pub(crate) fn assemble(
        &self,
        kind: RecordKind,
        sub_type: &str,
        payload: Bson,
        children: &[Record],
    ) -> Result<Record> {
        let direct_refs: BTreeSet<String> =
            children.iter().map(|child| child.hash.clone()).collect();
        let mut transitive_refs = direct_refs.clone();
        for child in children {
            transitive_refs.extend(child.transitive_refs.iter().cloned());
        }

        let hash = content_hash(kind, sub_type, &payload)?;

        Ok(Record {
            kind,
            sub_type: sub_type.to_string(),
            payload,
            hash,
            direct_refs,
            transitive_refs,
            orgid: None,
            timestamp: None,
            category: None,
            benign_refs: BTreeSet::new(),
            malicious_refs: BTreeSet::new(),
            admin_refs: BTreeSet::new(),
            member_refs: BTreeSet::new(),
            acl: BTreeSet::new(),
            meta: RecordMeta::now(),
        })
    }

    /// Dedup lookup, insert, and child bookkeeping.
    pub(crate) async fn commit(&self, record: Record, children: &[Record]) -> Result<Record> {
        if let Some(existing) = self
            .store
            .find_one(doc! { "hash": &record.hash }, None)
            .await?
        {
            debug!(hash = %record.hash, "record already materialized");
            return Record::decode(existing);
        }

        match self.store.insert_one(record.to_document()?).await? {
            InsertOutcome::Inserted => {
                // The children learn they are now reachable from this record
                for child in children {
                    self.store
                        .update_one(
                            doc! { "hash": &child.hash },
                            doc! { "$addToSet": { "transitive_refs": &record.hash } },
                        )
                        .await?;
                }
                debug!(hash = %record.hash, kind = %record.kind, "materialized new record");
                Ok(record)
            }
            InsertOutcome::DuplicateHash => {
                if let Some(winner) = self
                    .store
                    .find_one(doc! { "hash": &record.hash }, None)
                    .await?
                {
                    // Lost the race; the winner's document is canonical
                    return Record::decode(winner);
                }

                // The hash belongs to a soft-deleted record:
                // re-materializing identical content revives it
                debug!(hash = %record.hash, "reviving deleted record");
                self.store
                    .update_one(
                        doc! { "hash": &record.hash },
                        doc! {
                            "$set": {
                                "meta.is_deleted": false,
                                "meta.updated_at": bson::DateTime::now(),
                            },
                            "$unset": { "meta.deleted_at": "" },
                        },
                    )
                    .await?;

                let revived = self
                    .store
                    .find_one(doc! { "hash": &record.hash }, None)
                    .await?
                    .ok_or_else(|| {
                        WatchtowerError::Store(format!(
                            "record {} vanished during revival",
                            record.hash
                        ))
                    })?;
                Record::decode(revived)
            }
        }
    }
}
