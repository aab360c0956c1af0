//! Edit engine
//!
//! Content edits are copy-on-write: synthesize the parent's new payload,
//! route it through the dedup/construction engine, and leave the original
//! record untouched under its old hash. Ancestors of the edited parent are
//! deliberately not rewritten: chained edits are performed bottom-up by
//! the caller, one level at a time, so every reconstruction stays local
//! and auditable.
//!
//! Event category/context and session membership are the exception: they
//! describe a record's relation to others, not its content, and mutate
//! bookkeeping fields in place.

use std::sync::Arc;

use bson::{doc, Bson, DateTime, Document};
use tracing::debug;

use crate::canonical::canonicalize;
use crate::db::GraphStore;
use crate::engine::Materializer;
use crate::record::{self, Category, Record, RecordKind};
use crate::types::{Result, WatchtowerError};

/// Applies edits on top of a `Materializer`.
#[derive(Clone)]
pub struct Editor {
    materializer: Materializer,
}

impl Editor {
    pub fn new(materializer: Materializer) -> Self {
        Self { materializer }
    }

    fn store(&self) -> &Arc<dyn GraphStore> {
        self.materializer.store()
    }

    /// Swap one direct child for another, producing the edited parent as a
    /// new record.
    pub async fn replace(
        &self,
        parent: &Record,
        old_child: &Record,
        new_child: &Record,
    ) -> Result<Record> {
        self.ensure_child(parent, old_child)?;

        let mut payload = composite_payload(parent)?;
        {
            let slot = children_slot(parent.kind, &mut payload)?;
            remove_denormalized(slot, old_child, &parent.hash)?;
            insert_denormalized(slot, new_child);
        }

        let children = self
            .rebuild_children(parent, Some(old_child.hash.as_str()), Some(new_child))
            .await?;
        self.rematerialize(parent, payload, &children).await
    }

    /// Append a child, producing the edited parent as a new record.
    pub async fn add(&self, parent: &Record, new_child: &Record) -> Result<Record> {
        let mut payload = composite_payload(parent)?;
        {
            let slot = children_slot(parent.kind, &mut payload)?;
            insert_denormalized(slot, new_child);
        }

        let children = self.rebuild_children(parent, None, Some(new_child)).await?;
        self.rematerialize(parent, payload, &children).await
    }

    /// Drop a child, producing the edited parent as a new record. Removing
    /// an Object's last child fails with `EmptyChildren`.
    pub async fn remove(&self, parent: &Record, child: &Record) -> Result<Record> {
        self.ensure_child(parent, child)?;

        let mut payload = composite_payload(parent)?;
        {
            let slot = children_slot(parent.kind, &mut payload)?;
            remove_denormalized(slot, child, &parent.hash)?;
        }

        let children = self
            .rebuild_children(parent, Some(child.hash.as_str()), None)
            .await?;
        self.rematerialize(parent, payload, &children).await
    }

    /// Explicit category transition; in place, never part of the hash.
    pub async fn set_category(&self, event: &Record, category: Category) -> Result<()> {
        self.ensure_event(event)?;

        let matched = self
            .store()
            .update_one(
                doc! { "hash": &event.hash },
                doc! { "$set": {
                    "category": category.as_str(),
                    "meta.updated_at": DateTime::now(),
                } },
            )
            .await?;
        if matched == 0 {
            return Err(WatchtowerError::Store(format!(
                "event {} is not persisted",
                event.hash
            )));
        }

        debug!(event = %event.hash, category = category.as_str(), "category transition");
        Ok(())
    }

    /// Tag a descendant's relation to this event without forking the
    /// subtree. `unknown` clears the tag.
    pub async fn set_context(
        &self,
        event: &Record,
        child: &Record,
        class: Category,
    ) -> Result<()> {
        self.ensure_event(event)?;
        if !event.transitive_refs.contains(&child.hash) {
            return Err(WatchtowerError::NotAChild {
                parent: event.hash.clone(),
                child: child.hash.clone(),
            });
        }

        let update = match class {
            Category::Benign => doc! {
                "$addToSet": { "benign_refs": &child.hash },
                "$pull": { "malicious_refs": &child.hash },
            },
            Category::Malicious => doc! {
                "$addToSet": { "malicious_refs": &child.hash },
                "$pull": { "benign_refs": &child.hash },
            },
            Category::Unknown => doc! {
                "$pull": { "benign_refs": &child.hash, "malicious_refs": &child.hash },
            },
        };

        let matched = self
            .store()
            .update_one(doc! { "hash": &event.hash }, update)
            .await?;
        if matched == 0 {
            return Err(WatchtowerError::Store(format!(
                "event {} is not persisted",
                event.hash
            )));
        }
        Ok(())
    }

    /// Group an event into a session. Touches only the session's reference
    /// sets; neither record is re-hashed.
    pub async fn attach_event(&self, session: &Record, event: &Record) -> Result<()> {
        self.ensure_session(session)?;
        self.ensure_event(event)?;

        let matched = self
            .store()
            .update_one(
                doc! { "hash": &session.hash },
                doc! { "$addToSet": {
                    "direct_refs": &event.hash,
                    "transitive_refs": &event.hash,
                } },
            )
            .await?;
        if matched == 0 {
            return Err(WatchtowerError::Store(format!(
                "session {} is not persisted",
                session.hash
            )));
        }
        Ok(())
    }

    /// Remove an event from a session's reference sets.
    pub async fn detach_event(&self, session: &Record, event: &Record) -> Result<()> {
        self.ensure_session(session)?;
        self.ensure_event(event)?;

        let matched = self
            .store()
            .update_one(
                doc! { "hash": &session.hash },
                doc! { "$pull": {
                    "direct_refs": &event.hash,
                    "transitive_refs": &event.hash,
                } },
            )
            .await?;
        if matched == 0 {
            return Err(WatchtowerError::Store(format!(
                "session {} is not persisted",
                session.hash
            )));
        }
        Ok(())
    }

    /// Explicit deletion. The document stays in the store so the hash is
    /// not silently reusable, but reads skip it; re-materializing the same
    /// content revives it.
    pub async fn delete(&self, record: &Record) -> Result<()> {
        let stamp = DateTime::now();
        let matched = self
            .store()
            .update_one(
                doc! { "hash": &record.hash },
                doc! { "$set": {
                    "meta.is_deleted": true,
                    "meta.deleted_at": stamp,
                    "meta.updated_at": stamp,
                } },
            )
            .await?;
        if matched == 0 {
            return Err(WatchtowerError::Store(format!(
                "record {} is not persisted",
                record.hash
            )));
        }

        debug!(record = %record.hash, "record deleted");
        Ok(())
    }

    fn ensure_child(&self, parent: &Record, child: &Record) -> Result<()> {
        if parent.direct_refs.contains(&child.hash) {
            Ok(())
        } else {
            Err(WatchtowerError::NotAChild {
                parent: parent.hash.clone(),
                child: child.hash.clone(),
            })
        }
    }

    fn ensure_event(&self, record: &Record) -> Result<()> {
        if record.kind == RecordKind::Event {
            Ok(())
        } else {
            Err(WatchtowerError::Malformed(format!(
                "record {} is not an event",
                record.hash
            )))
        }
    }

    fn ensure_session(&self, record: &Record) -> Result<()> {
        if record.kind == RecordKind::Session {
            Ok(())
        } else {
            Err(WatchtowerError::Malformed(format!(
                "record {} is not a session",
                record.hash
            )))
        }
    }

    /// The edited parent's child list: every surviving direct child
    /// reloaded from the store, plus the addition.
    async fn rebuild_children(
        &self,
        parent: &Record,
        exclude: Option<&str>,
        addition: Option<&Record>,
    ) -> Result<Vec<Record>> {
        let mut children = Vec::with_capacity(parent.direct_refs.len() + 1);
        for hash in &parent.direct_refs {
            if exclude == Some(hash.as_str()) {
                continue;
            }
            let child = self.materializer.fetch(hash).await?.ok_or_else(|| {
                WatchtowerError::Store(format!(
                    "child {hash} of {} is missing from the store",
                    parent.hash
                ))
            })?;
            children.push(child);
        }
        if let Some(addition) = addition {
            children.push(addition.clone());
        }
        Ok(children)
    }

    /// Route the synthesized payload back through the construction engine,
    /// carrying event identity mirrors and classification across the edit.
    async fn rematerialize(
        &self,
        parent: &Record,
        payload: Document,
        children: &[Record],
    ) -> Result<Record> {
        match parent.kind {
            RecordKind::Event => {
                let mut record = self.materializer.assemble(
                    RecordKind::Event,
                    &parent.sub_type,
                    Bson::Document(payload),
                    children,
                )?;
                record.orgid = parent.orgid.clone();
                record.timestamp = parent.timestamp;
                // An edit is not a category transition; context tags that
                // no longer resolve to descendants are dropped
                record.category = parent.category;
                record.benign_refs = parent
                    .benign_refs
                    .intersection(&record.transitive_refs)
                    .cloned()
                    .collect();
                record.malicious_refs = parent
                    .malicious_refs
                    .intersection(&record.transitive_refs)
                    .cloned()
                    .collect();
                self.materializer.commit(record, children).await
            }
            _ => {
                self.materializer
                    .materialize(
                        parent.kind,
                        &parent.sub_type,
                        Bson::Document(payload),
                        children,
                    )
                    .await
            }
        }
    }
}

/// The parent's payload document, cloned for synthesis.
fn composite_payload(parent: &Record) -> Result<Document> {
    parent.payload.as_document().cloned().ok_or_else(|| {
        WatchtowerError::Malformed(format!(
            "record {} has no composite payload",
            parent.hash
        ))
    })
}

/// The mapping inside the payload that holds the denormalized children.
fn children_slot(kind: RecordKind, payload: &mut Document) -> Result<&mut Document> {
    if matches!(kind, RecordKind::Attribute | RecordKind::Raw) {
        return Err(WatchtowerError::Malformed(format!(
            "{kind} records hold no children"
        )));
    }
    match record::children_map_key(kind) {
        None => Ok(payload),
        Some(key) => payload.get_document_mut(key).map_err(|_| {
            WatchtowerError::Malformed(format!("{kind} payload missing its {key} mapping"))
        }),
    }
}

/// Drop the child's denormalized value from its `sub_type` bucket,
/// comparing by canonical form.
fn remove_denormalized(slot: &mut Document, child: &Record, parent_hash: &str) -> Result<()> {
    let target = canonicalize(&child.denormalized_value())?;

    let values = match slot.get_array_mut(&child.sub_type) {
        Ok(values) => values,
        Err(_) => {
            return Err(WatchtowerError::NotAChild {
                parent: parent_hash.to_string(),
                child: child.hash.clone(),
            })
        }
    };

    let mut position = None;
    for (index, value) in values.iter().enumerate() {
        if canonicalize(value)? == target {
            position = Some(index);
            break;
        }
    }

    match position {
        Some(index) => {
            values.remove(index);
            if values.is_empty() {
                slot.remove(&child.sub_type);
            }
            Ok(())
        }
        None => Err(WatchtowerError::NotAChild {
            parent: parent_hash.to_string(),
            child: child.hash.clone(),
        }),
    }
}

/// Append the child's denormalized value to its `sub_type` bucket.
fn insert_denormalized(slot: &mut Document, child: &Record) {
    match slot.get_mut(&child.sub_type) {
        Some(Bson::Array(values)) => values.push(child.denormalized_value()),
        _ => {
            slot.insert(
                child.sub_type.clone(),
                Bson::Array(vec![child.denormalized_value()]),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn editor() -> (Materializer, Editor) {
        let materializer = Materializer::new(Arc::new(MemoryStore::new()));
        (materializer.clone(), Editor::new(materializer))
    }

    #[tokio::test]
    async fn test_replace_is_copy_on_write() {
        let (mat, editor) = editor();

        let old_ip = mat.attribute("ip", Bson::from("10.0.0.1")).await.unwrap();
        let domain = mat
            .attribute("domain", Bson::from("example.com"))
            .await
            .unwrap();
        let node = mat.object("node", &[old_ip.clone(), domain.clone()]).await.unwrap();

        let new_ip = mat.attribute("ip", Bson::from("10.0.0.2")).await.unwrap();
        let edited = editor.replace(&node, &old_ip, &new_ip).await.unwrap();

        assert_ne!(edited.hash, node.hash);
        assert!(edited.direct_refs.contains(&new_ip.hash));
        assert!(!edited.direct_refs.contains(&old_ip.hash));
        assert!(edited.direct_refs.contains(&domain.hash));

        // The original is left untouched and fetchable
        let original = mat.fetch(&node.hash).await.unwrap().unwrap();
        assert_eq!(canonicalize(&original.payload).unwrap(), canonicalize(&node.payload).unwrap());
        assert!(original.direct_refs.contains(&old_ip.hash));
    }

    #[tokio::test]
    async fn test_replace_requires_membership() {
        let (mat, editor) = editor();

        let ip = mat.attribute("ip", Bson::from("10.0.0.1")).await.unwrap();
        let node = mat.object("node", &[ip.clone()]).await.unwrap();
        let stranger = mat.attribute("ip", Bson::from("10.9.9.9")).await.unwrap();
        let replacement = mat.attribute("ip", Bson::from("10.0.0.2")).await.unwrap();

        let err = editor.replace(&node, &stranger, &replacement).await.unwrap_err();
        assert!(matches!(err, WatchtowerError::NotAChild { .. }));
    }

    #[tokio::test]
    async fn test_ancestors_are_not_rewritten() {
        let (mat, editor) = editor();

        let ip = mat.attribute("ip", Bson::from("10.0.0.1")).await.unwrap();
        let node = mat.object("node", &[ip.clone()]).await.unwrap();
        let wrapper = mat.object("infrastructure", &[node.clone()]).await.unwrap();

        let new_ip = mat.attribute("ip", Bson::from("10.0.0.2")).await.unwrap();
        let edited_node = editor.replace(&node, &ip, &new_ip).await.unwrap();
        assert_ne!(edited_node.hash, node.hash);

        // The wrapper still points at the original node; rewriting it is
        // the caller's next bottom-up step
        let stored_wrapper = mat.fetch(&wrapper.hash).await.unwrap().unwrap();
        assert!(stored_wrapper.direct_refs.contains(&node.hash));
        assert!(!stored_wrapper.direct_refs.contains(&edited_node.hash));
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let (mat, editor) = editor();

        let ip = mat.attribute("ip", Bson::from("10.0.0.1")).await.unwrap();
        let node = mat.object("node", &[ip.clone()]).await.unwrap();

        let domain = mat
            .attribute("domain", Bson::from("example.com"))
            .await
            .unwrap();
        let grown = editor.add(&node, &domain).await.unwrap();
        assert_eq!(grown.direct_refs.len(), 2);
        assert_ne!(grown.hash, node.hash);

        let shrunk = editor.remove(&grown, &domain).await.unwrap();
        // Removing what was added reconstructs the original identity
        assert_eq!(shrunk.hash, node.hash);
    }

    #[tokio::test]
    async fn test_remove_last_child_fails() {
        let (mat, editor) = editor();

        let ip = mat.attribute("ip", Bson::from("10.0.0.1")).await.unwrap();
        let node = mat.object("node", &[ip.clone()]).await.unwrap();

        let err = editor.remove(&node, &ip).await.unwrap_err();
        assert!(matches!(err, WatchtowerError::EmptyChildren));
    }

    #[tokio::test]
    async fn test_event_edit_carries_identity_and_classification() {
        let (mat, editor) = editor();

        let ip = mat.attribute("ip", Bson::from("10.0.0.1")).await.unwrap();
        let event = mat.event("sighting", "org-1", 1000, &[ip.clone()]).await.unwrap();
        editor.set_category(&event, Category::Malicious).await.unwrap();
        editor.set_context(&event, &ip, Category::Malicious).await.unwrap();
        let event = mat.fetch(&event.hash).await.unwrap().unwrap();

        let domain = mat
            .attribute("domain", Bson::from("evil.example"))
            .await
            .unwrap();
        let edited = editor.add(&event, &domain).await.unwrap();

        assert_ne!(edited.hash, event.hash);
        assert_eq!(edited.orgid.as_deref(), Some("org-1"));
        assert_eq!(edited.timestamp, Some(1000));
        assert_eq!(edited.category, Some(Category::Malicious));
        // The surviving descendant keeps its context tag
        assert!(edited.malicious_refs.contains(&ip.hash));
    }

    #[tokio::test]
    async fn test_set_category_updates_in_place() {
        let (mat, editor) = editor();

        let ip = mat.attribute("ip", Bson::from("10.0.0.1")).await.unwrap();
        let event = mat.event("sighting", "org-1", 1000, &[ip]).await.unwrap();

        editor.set_category(&event, Category::Benign).await.unwrap();

        let stored = mat.fetch(&event.hash).await.unwrap().unwrap();
        assert_eq!(stored.category, Some(Category::Benign));
        assert_eq!(stored.hash, event.hash);
    }

    #[tokio::test]
    async fn test_set_context_moves_between_classes() {
        let (mat, editor) = editor();

        let ip = mat.attribute("ip", Bson::from("10.0.0.1")).await.unwrap();
        let event = mat.event("sighting", "org-1", 1000, &[ip.clone()]).await.unwrap();

        editor.set_context(&event, &ip, Category::Benign).await.unwrap();
        let stored = mat.fetch(&event.hash).await.unwrap().unwrap();
        assert!(stored.benign_refs.contains(&ip.hash));

        editor.set_context(&event, &ip, Category::Malicious).await.unwrap();
        let stored = mat.fetch(&event.hash).await.unwrap().unwrap();
        assert!(stored.malicious_refs.contains(&ip.hash));
        assert!(!stored.benign_refs.contains(&ip.hash));

        editor.set_context(&event, &ip, Category::Unknown).await.unwrap();
        let stored = mat.fetch(&event.hash).await.unwrap().unwrap();
        assert!(stored.benign_refs.is_empty());
        assert!(stored.malicious_refs.is_empty());
    }

    #[tokio::test]
    async fn test_set_context_requires_descendant() {
        let (mat, editor) = editor();

        let ip = mat.attribute("ip", Bson::from("10.0.0.1")).await.unwrap();
        let event = mat.event("sighting", "org-1", 1000, &[ip]).await.unwrap();
        let stranger = mat.attribute("ip", Bson::from("10.9.9.9")).await.unwrap();

        let err = editor
            .set_context(&event, &stranger, Category::Malicious)
            .await
            .unwrap_err();
        assert!(matches!(err, WatchtowerError::NotAChild { .. }));
    }

    #[tokio::test]
    async fn test_session_attach_and_detach() {
        let (mat, editor) = editor();

        let ja3 = mat.attribute("ja3", Bson::from("abc123")).await.unwrap();
        let identifier = mat.object("tls-client", &[ja3]).await.unwrap();
        let session = mat.session("beacon", &[identifier]).await.unwrap();

        let ip = mat.attribute("ip", Bson::from("10.0.0.1")).await.unwrap();
        let event = mat.event("sighting", "org-1", 1000, &[ip]).await.unwrap();

        editor.attach_event(&session, &event).await.unwrap();
        let stored = mat.fetch(&session.hash).await.unwrap().unwrap();
        assert_eq!(stored.hash, session.hash);
        assert!(stored.transitive_refs.contains(&event.hash));
        assert!(stored.refs_consistent());

        // The event itself is untouched by attachment
        let stored_event = mat.fetch(&event.hash).await.unwrap().unwrap();
        assert!(!stored_event.transitive_refs.contains(&session.hash));

        editor.detach_event(&session, &event).await.unwrap();
        let stored = mat.fetch(&session.hash).await.unwrap().unwrap();
        assert!(!stored.transitive_refs.contains(&event.hash));
    }

    #[tokio::test]
    async fn test_delete_hides_and_rematerialize_revives() {
        let (mat, editor) = editor();

        let ip = mat.attribute("ip", Bson::from("10.0.0.1")).await.unwrap();
        editor.delete(&ip).await.unwrap();
        assert!(mat.fetch(&ip.hash).await.unwrap().is_none());

        let revived = mat.attribute("ip", Bson::from("10.0.0.1")).await.unwrap();
        assert_eq!(revived.hash, ip.hash);
        assert!(!revived.meta.is_deleted);
        assert!(mat.fetch(&ip.hash).await.unwrap().is_some());
    }
}
