//! Identity directory: users, orgs, and ACL membership
//!
//! Users and orgs are ordinary objects in the record graph. A user
//! aggregates email / password-hash / name attributes, an org aggregates
//! name attributes, member users, and an admin sub-object. The directory
//! layers lookup keys and the org's ACL bookkeeping on top. Credential
//! handling itself (hashing, tokens) lives outside this crate; the
//! password hash arrives here as an opaque string.

use bson::{doc, Bson};
use tracing::debug;

use crate::engine::Materializer;
use crate::record::{Record, RecordKind};
use crate::types::{Result, WatchtowerError};

/// Sub-type tag for user objects
pub const USER_SUB_TYPE: &str = "user";
/// Sub-type tag for org objects
pub const ORG_SUB_TYPE: &str = "org";

/// Constructs and resolves identity records.
#[derive(Clone)]
pub struct Directory {
    materializer: Materializer,
}

impl Directory {
    pub fn new(materializer: Materializer) -> Self {
        Self { materializer }
    }

    /// Aggregate a user object from its credential attributes.
    pub async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        name: &str,
    ) -> Result<Record> {
        let email_attr = self
            .materializer
            .attribute("email", Bson::from(email))
            .await?;
        let password_attr = self
            .materializer
            .attribute("password-hash", Bson::from(password_hash))
            .await?;
        let name_attr = self.materializer.attribute("name", Bson::from(name)).await?;

        let user = self
            .materializer
            .object(USER_SUB_TYPE, &[email_attr, password_attr, name_attr])
            .await?;
        debug!(user = %user.hash, "user materialized");
        Ok(user)
    }

    /// Aggregate an org object and seed its ACL from admin ∪ member.
    ///
    /// Re-creating an org that already exists returns it with its current
    /// ACL: seeding only happens the first time, so grants and revocations
    /// are never clobbered by reconstruction.
    pub async fn create_org(
        &self,
        name: &str,
        admins: &[Record],
        members: &[Record],
    ) -> Result<Record> {
        for principal in admins.iter().chain(members) {
            ensure_user(principal)?;
        }

        let name_attr = self.materializer.attribute("name", Bson::from(name)).await?;
        let admin_object = self.materializer.object("admin", admins).await?;

        let mut children = vec![name_attr, admin_object];
        children.extend(members.iter().cloned());
        let org = self.materializer.object(ORG_SUB_TYPE, &children).await?;

        let admin_refs: Vec<String> = admins.iter().map(|a| a.hash.clone()).collect();
        let member_refs: Vec<String> = members.iter().map(|m| m.hash.clone()).collect();
        let mut acl = admin_refs.clone();
        for member in &member_refs {
            if !acl.contains(member) {
                acl.push(member.clone());
            }
        }
        let principals = acl.len();

        // Seed only an org that has never carried an ACL
        let seeded = self
            .materializer
            .store()
            .update_one(
                doc! { "hash": &org.hash, "acl": { "$exists": false } },
                doc! { "$set": {
                    "admin_refs": admin_refs,
                    "member_refs": member_refs,
                    "acl": acl,
                } },
            )
            .await?;
        if seeded == 1 {
            debug!(org = %org.hash, principals, "org ACL seeded");
        }

        self.materializer
            .fetch(&org.hash)
            .await?
            .ok_or_else(|| WatchtowerError::Store(format!("org {} vanished after creation", org.hash)))
    }

    /// Look a user up by record hash or email.
    pub async fn find_user(&self, key: &str) -> Result<Option<Record>> {
        let filter = doc! {
            "kind": RecordKind::Object.as_str(),
            "sub_type": USER_SUB_TYPE,
            "$or": [ { "hash": key }, { "payload.email": key } ],
        };
        match self.materializer.store().find_one(filter, None).await? {
            Some(document) => Ok(Some(Record::decode(document)?)),
            None => Ok(None),
        }
    }

    /// Look an org up by record hash or name.
    pub async fn find_org(&self, key: &str) -> Result<Option<Record>> {
        let filter = doc! {
            "kind": RecordKind::Object.as_str(),
            "sub_type": ORG_SUB_TYPE,
            "$or": [ { "hash": key }, { "payload.name": key } ],
        };
        match self.materializer.store().find_one(filter, None).await? {
            Some(document) => Ok(Some(Record::decode(document)?)),
            None => Ok(None),
        }
    }

    /// Authorize a user to read the org's events.
    pub async fn grant(&self, org: &Record, user: &Record) -> Result<()> {
        ensure_org(org)?;
        ensure_user(user)?;

        let matched = self
            .materializer
            .store()
            .update_one(
                doc! { "hash": &org.hash },
                doc! { "$addToSet": { "acl": &user.hash } },
            )
            .await?;
        if matched == 0 {
            return Err(WatchtowerError::Store(format!(
                "org {} is not persisted",
                org.hash
            )));
        }

        debug!(org = %org.hash, user = %user.hash, "ACL grant");
        Ok(())
    }

    /// Withdraw a user's read authorization. Takes effect on the next
    /// query: authorization is re-derived per call, never cached.
    pub async fn revoke(&self, org: &Record, user: &Record) -> Result<()> {
        ensure_org(org)?;
        ensure_user(user)?;

        let matched = self
            .materializer
            .store()
            .update_one(
                doc! { "hash": &org.hash },
                doc! { "$pull": { "acl": &user.hash } },
            )
            .await?;
        if matched == 0 {
            return Err(WatchtowerError::Store(format!(
                "org {} is not persisted",
                org.hash
            )));
        }

        debug!(org = %org.hash, user = %user.hash, "ACL revoke");
        Ok(())
    }
}

fn ensure_user(record: &Record) -> Result<()> {
    if record.kind == RecordKind::Object && record.sub_type == USER_SUB_TYPE {
        Ok(())
    } else {
        Err(WatchtowerError::Malformed(format!(
            "record {} is not a user",
            record.hash
        )))
    }
}

fn ensure_org(record: &Record) -> Result<()> {
    if record.kind == RecordKind::Object && record.sub_type == ORG_SUB_TYPE {
        Ok(())
    } else {
        Err(WatchtowerError::Malformed(format!(
            "record {} is not an org",
            record.hash
        )))
    }
}
