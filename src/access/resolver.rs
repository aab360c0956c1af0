//! Authorization resolution
//!
//! Derives the set of orgs a principal may read. The derivation runs
//! against the store on every call: revocation must be visible on the
//! very next query, so nothing here is memoized.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bson::doc;

use crate::db::GraphStore;
use crate::identity::ORG_SUB_TYPE;
use crate::record::RecordKind;
use crate::types::Result;

/// Extension point for non-ACL membership (groups, rules). Results are
/// unioned with direct ACL membership, never substituted for it.
#[async_trait]
pub trait MembershipRule: Send + Sync {
    async fn allowed_orgs(&self, principal_hash: &str) -> Result<BTreeSet<String>>;
}

/// Resolves a principal hash to the orgs whose ACL lists it.
#[derive(Clone)]
pub struct OrgResolver {
    store: Arc<dyn GraphStore>,
    rules: Vec<Arc<dyn MembershipRule>>,
}

impl OrgResolver {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            rules: Vec::new(),
        }
    }

    /// Union an additional membership source into every resolution.
    pub fn with_rule(mut self, rule: Arc<dyn MembershipRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// The org hashes this principal may currently read.
    pub async fn allowed_orgs(&self, principal_hash: &str) -> Result<BTreeSet<String>> {
        let filter = doc! {
            "kind": RecordKind::Object.as_str(),
            "sub_type": ORG_SUB_TYPE,
            "acl": principal_hash,
        };
        let orgs = self.store.find(filter, Some(doc! { "hash": 1 })).await?;

        let mut allowed: BTreeSet<String> = orgs
            .iter()
            .filter_map(|org| org.get_str("hash").ok().map(String::from))
            .collect();

        for rule in &self.rules {
            allowed.extend(rule.allowed_orgs(principal_hash).await?);
        }

        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::engine::Materializer;
    use crate::identity::Directory;

    struct StaticRule(BTreeSet<String>);

    #[async_trait]
    impl MembershipRule for StaticRule {
        async fn allowed_orgs(&self, _principal_hash: &str) -> Result<BTreeSet<String>> {
            Ok(self.0.clone())
        }
    }

    async fn fixture() -> (Arc<MemoryStore>, Directory) {
        let store = Arc::new(MemoryStore::new());
        let directory = Directory::new(Materializer::new(store.clone()));
        (store, directory)
    }

    #[tokio::test]
    async fn test_direct_acl_membership() {
        let (store, directory) = fixture().await;
        let resolver = OrgResolver::new(store);

        let u1 = directory.create_user("u1@example.com", "phc", "U1").await.unwrap();
        let u2 = directory.create_user("u2@example.com", "phc", "U2").await.unwrap();
        let org = directory.create_org("acme", &[u1.clone()], &[u2.clone()]).await.unwrap();

        assert!(resolver.allowed_orgs(&u1.hash).await.unwrap().contains(&org.hash));
        assert!(resolver.allowed_orgs(&u2.hash).await.unwrap().contains(&org.hash));
        assert!(resolver.allowed_orgs("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_revocation_is_visible_immediately() {
        let (store, directory) = fixture().await;
        let resolver = OrgResolver::new(store);

        let u1 = directory.create_user("u1@example.com", "phc", "U1").await.unwrap();
        let u2 = directory.create_user("u2@example.com", "phc", "U2").await.unwrap();
        let org = directory.create_org("acme", &[u1], &[u2.clone()]).await.unwrap();

        assert!(resolver.allowed_orgs(&u2.hash).await.unwrap().contains(&org.hash));

        directory.revoke(&org, &u2).await.unwrap();
        assert!(!resolver.allowed_orgs(&u2.hash).await.unwrap().contains(&org.hash));
    }

    #[tokio::test]
    async fn test_rules_union_with_direct_membership() {
        let (store, directory) = fixture().await;

        let u1 = directory.create_user("u1@example.com", "phc", "U1").await.unwrap();
        let org = directory.create_org("acme", &[u1.clone()], &[]).await.unwrap();

        let extra: BTreeSet<String> = ["group-org".to_string()].into_iter().collect();
        let resolver = OrgResolver::new(store).with_rule(Arc::new(StaticRule(extra)));

        let allowed = resolver.allowed_orgs(&u1.hash).await.unwrap();
        assert!(allowed.contains(&org.hash));
        assert!(allowed.contains("group-org"));
    }
}
