//! Record model: the tagged entity family persisted to the graph store
//!
//! Every fact in the graph is one flattened document in the `records`
//! collection: the identity triple (`kind`, `sub_type`, `payload`), the
//! derived content `hash`, the reference sets linking it to other records,
//! and kind-specific query mirrors (org ownership, event category and
//! context tags, org ACL membership).
//!
//! Identity fields never change after persistence; everything mutable here
//! is bookkeeping layered beside the hash, not under it.

mod kind;
mod meta;

pub use kind::RecordKind;
pub use meta::RecordMeta;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::{Result, WatchtowerError};

/// Collection name for the record graph
pub const RECORD_COLLECTION: &str = "records";

/// Event classification, mutable via explicit transition only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Benign,
    Malicious,
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Benign => "benign",
            Category::Malicious => "malicious",
            Category::Unknown => "unknown",
        }
    }
}

/// A record in its flattened, store-ready form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub kind: RecordKind,

    /// Free-form tag refining the kind ("ip", "file", "sighting", "user", …)
    pub sub_type: String,

    /// Kind-specific payload; hashed together with `kind` and `sub_type`
    pub payload: Bson,

    /// Lowercase hex SHA-256 of the canonical identity triple
    pub hash: String,

    /// Hashes of the immediate children embedded in the payload
    #[serde(default)]
    pub direct_refs: BTreeSet<String>,

    /// Reference closure: descendants at construction time, plus the
    /// hashes of parents that came to reference this record later
    #[serde(default)]
    pub transitive_refs: BTreeSet<String>,

    /// Owning org hash (events; optionally raw captures)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orgid: Option<String>,

    /// Epoch milliseconds (events; optionally raw captures)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    /// Event classification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,

    /// Descendants tagged benign in the context of this event
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub benign_refs: BTreeSet<String>,

    /// Descendants tagged malicious in the context of this event
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub malicious_refs: BTreeSet<String>,

    /// Admin user hashes (org objects)
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub admin_refs: BTreeSet<String>,

    /// Member user hashes (org objects)
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub member_refs: BTreeSet<String>,

    /// User hashes authorized to read this org's events (org objects)
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub acl: BTreeSet<String>,

    #[serde(default)]
    pub meta: RecordMeta,
}

impl Record {
    /// Decode a flattened store document into a validated record.
    ///
    /// Dispatches on the `kind` tag: an unrecognized tag fails with
    /// `UnknownKind`, a structurally invalid document for its kind with
    /// `Malformed`. Fields outside the record shape (such as a store's
    /// `_id`) are ignored.
    pub fn decode(document: Document) -> Result<Record> {
        let kind = match document.get_str("kind") {
            Ok(tag) => RecordKind::parse(tag)?,
            Err(_) => {
                return Err(WatchtowerError::Malformed(
                    "document carries no kind tag".to_string(),
                ))
            }
        };

        let record: Record = bson::from_document(document)
            .map_err(|e| WatchtowerError::Malformed(format!("record decode: {e}")))?;

        match kind {
            RecordKind::Attribute => record.check_attribute()?,
            RecordKind::Object => record.check_object()?,
            RecordKind::Event => record.check_event()?,
            RecordKind::Session => record.check_session()?,
            RecordKind::Raw => record.check_raw()?,
        }

        Ok(record)
    }

    /// Flatten back to the persisted document shape.
    pub fn to_document(&self) -> Result<Document> {
        bson::to_document(self)
            .map_err(|e| WatchtowerError::Malformed(format!("record encode: {e}")))
    }

    /// The value this record contributes to a parent's denormalized
    /// payload: an attribute's scalar, or a composite's mapping.
    pub fn denormalized_value(&self) -> Bson {
        self.payload.clone()
    }

    /// Group children into the denormalized payload mapping:
    /// child `sub_type` → ordered list of child values.
    pub fn compose_payload(children: &[Record]) -> Document {
        let mut map = Document::new();
        for child in children {
            match map.get_mut(&child.sub_type) {
                Some(Bson::Array(values)) => values.push(child.denormalized_value()),
                _ => {
                    map.insert(
                        child.sub_type.clone(),
                        Bson::Array(vec![child.denormalized_value()]),
                    );
                }
            }
        }
        map
    }

    /// Reference-set invariants: children are a subset of the closure, and
    /// a record never contains itself.
    pub fn refs_consistent(&self) -> bool {
        self.direct_refs.is_subset(&self.transitive_refs)
            && !self.transitive_refs.contains(&self.hash)
            && !self.direct_refs.contains(&self.hash)
    }

    fn check_attribute(&self) -> Result<()> {
        if !is_scalar(&self.payload) {
            return Err(WatchtowerError::Malformed(
                "attribute payload must be a scalar".to_string(),
            ));
        }
        if !self.direct_refs.is_empty() {
            return Err(WatchtowerError::Malformed(
                "attribute records have no children".to_string(),
            ));
        }
        Ok(())
    }

    fn check_object(&self) -> Result<()> {
        if self.payload.as_document().is_none() {
            return Err(WatchtowerError::Malformed(
                "object payload must be a mapping".to_string(),
            ));
        }
        if self.direct_refs.is_empty() {
            return Err(WatchtowerError::Malformed(
                "object records require at least one child".to_string(),
            ));
        }
        Ok(())
    }

    fn check_event(&self) -> Result<()> {
        if self.payload.as_document().is_none() {
            return Err(WatchtowerError::Malformed(
                "event payload must be a mapping".to_string(),
            ));
        }
        if self.orgid.is_none() {
            return Err(WatchtowerError::Malformed(
                "event records require an orgid".to_string(),
            ));
        }
        if self.timestamp.is_none() {
            return Err(WatchtowerError::Malformed(
                "event records require a timestamp".to_string(),
            ));
        }
        if self.category.is_none() {
            return Err(WatchtowerError::Malformed(
                "event records require a category".to_string(),
            ));
        }
        Ok(())
    }

    fn check_session(&self) -> Result<()> {
        match self.payload.as_document() {
            Some(payload) if payload.get_document("identifiers").is_ok() => Ok(()),
            _ => Err(WatchtowerError::Malformed(
                "session payload must carry an identifiers mapping".to_string(),
            )),
        }
    }

    fn check_raw(&self) -> Result<()> {
        match self.payload.as_document() {
            Some(payload) if payload.get_document("document").is_ok() => {}
            _ => {
                return Err(WatchtowerError::Malformed(
                    "raw payload must carry the ingested document".to_string(),
                ))
            }
        }
        if !self.direct_refs.is_empty() {
            return Err(WatchtowerError::Malformed(
                "raw records are not decomposed into children".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where a composite kind keeps its denormalized children mapping inside
/// the payload document: `None` means the payload document itself.
pub(crate) fn children_map_key(kind: RecordKind) -> Option<&'static str> {
    match kind {
        RecordKind::Event => Some("attrs"),
        RecordKind::Session => Some("identifiers"),
        _ => None,
    }
}

/// Attribute payloads are restricted to this scalar family.
pub(crate) fn is_scalar(value: &Bson) -> bool {
    matches!(
        value,
        Bson::Null | Bson::Boolean(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)
            | Bson::String(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn attribute(sub_type: &str, value: Bson, hash: &str) -> Record {
        Record {
            kind: RecordKind::Attribute,
            sub_type: sub_type.to_string(),
            payload: value,
            hash: hash.to_string(),
            direct_refs: BTreeSet::new(),
            transitive_refs: BTreeSet::new(),
            orgid: None,
            timestamp: None,
            category: None,
            benign_refs: BTreeSet::new(),
            malicious_refs: BTreeSet::new(),
            admin_refs: BTreeSet::new(),
            member_refs: BTreeSet::new(),
            acl: BTreeSet::new(),
            meta: RecordMeta::now(),
        }
    }

    #[test]
    fn test_decode_round_trip() {
        let record = attribute("ip", Bson::from("10.0.0.1"), "aa11");
        let doc = record.to_document().unwrap();
        let decoded = Record::decode(doc).unwrap();
        assert_eq!(decoded.kind, RecordKind::Attribute);
        assert_eq!(decoded.sub_type, "ip");
        assert_eq!(decoded.hash, "aa11");
    }

    #[test]
    fn test_decode_ignores_store_private_fields() {
        let record = attribute("ip", Bson::from("10.0.0.1"), "aa11");
        let mut doc = record.to_document().unwrap();
        doc.insert("_id", bson::oid::ObjectId::new());
        assert!(Record::decode(doc).is_ok());
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let mut doc = attribute("ip", Bson::from("x"), "aa11").to_document().unwrap();
        doc.insert("kind", "indicator");
        let err = Record::decode(doc).unwrap_err();
        assert!(matches!(err, WatchtowerError::UnknownKind(_)));
    }

    #[test]
    fn test_decode_rejects_missing_kind() {
        let mut doc = attribute("ip", Bson::from("x"), "aa11").to_document().unwrap();
        doc.remove("kind");
        let err = Record::decode(doc).unwrap_err();
        assert!(matches!(err, WatchtowerError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_composite_attribute_payload() {
        let mut record = attribute("ip", Bson::from("x"), "aa11");
        record.payload = Bson::Document(doc! { "nested": 1 });
        let err = Record::decode(record.to_document().unwrap()).unwrap_err();
        assert!(matches!(err, WatchtowerError::Malformed(_)));
    }

    #[test]
    fn test_compose_payload_groups_by_sub_type() {
        let a = attribute("ip", Bson::from("10.0.0.1"), "a1");
        let b = attribute("ip", Bson::from("10.0.0.2"), "a2");
        let c = attribute("domain", Bson::from("example.com"), "a3");

        let payload = Record::compose_payload(&[a, b, c]);
        let ips = payload.get_array("ip").unwrap();
        assert_eq!(ips.len(), 2);
        assert_eq!(payload.get_array("domain").unwrap().len(), 1);
    }

    #[test]
    fn test_refs_consistency_check() {
        let mut record = attribute("ip", Bson::from("x"), "self");
        assert!(record.refs_consistent());

        record.direct_refs.insert("child".to_string());
        assert!(!record.refs_consistent(), "child missing from closure");

        record.transitive_refs.insert("child".to_string());
        assert!(record.refs_consistent());

        record.transitive_refs.insert("self".to_string());
        assert!(!record.refs_consistent(), "self-reference must be impossible");
    }
}
