//! Access-scoped query gateway
//!
//! The single chokepoint for event reads: every find / find-one / count
//! issued through here is rewritten so a principal only sees events owned
//! by orgs whose ACL lists them. The gateway wraps the store's capability
//! surface rather than extending a store type, so nothing downstream can
//! reach event data without passing through the rewrite.
//!
//! An event query that already constrains `orgid` is rejected outright:
//! merging a caller-supplied org filter with the derived one would let
//! construction order decide which filter wins.

use std::sync::Arc;

use bson::{doc, Bson, Document};
use tracing::debug;

use crate::access::OrgResolver;
use crate::db::GraphStore;
use crate::identity::Directory;
use crate::record::RecordKind;
use crate::types::{Result, WatchtowerError};

/// Org-scoped read access to the record graph.
#[derive(Clone)]
pub struct ScopedGateway {
    store: Arc<dyn GraphStore>,
    directory: Directory,
    resolver: OrgResolver,
}

impl ScopedGateway {
    pub fn new(store: Arc<dyn GraphStore>, directory: Directory, resolver: OrgResolver) -> Self {
        Self {
            store,
            directory,
            resolver,
        }
    }

    /// Find all records the principal may see under this filter.
    pub async fn find(
        &self,
        principal: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Vec<Document>> {
        let scoped = self.scope(principal, filter).await?;
        self.store.find(scoped, projection).await
    }

    /// Find one record the principal may see under this filter.
    pub async fn find_one(
        &self,
        principal: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Option<Document>> {
        let scoped = self.scope(principal, filter).await?;
        self.store.find_one(scoped, projection).await
    }

    /// Count records the principal may see under this filter.
    pub async fn count(&self, principal: &str, filter: Document) -> Result<u64> {
        let scoped = self.scope(principal, filter).await?;
        self.store.count(scoped).await
    }

    /// Validate the principal and conjoin the org-membership restriction
    /// onto event-selecting filters.
    ///
    /// Authorization is resolved fresh inside every call: a revocation
    /// committed before this query is always honored, and an authorized
    /// principal with no grants gets an ordinary empty result, the same
    /// shape "no matching data" has.
    async fn scope(&self, principal: &str, filter: Document) -> Result<Document> {
        let user = self
            .directory
            .find_user(principal)
            .await?
            .ok_or_else(|| WatchtowerError::InvalidPrincipal(principal.to_string()))?;

        if !selects_events(&filter) {
            return Ok(filter);
        }
        if constrains_orgid(&filter) {
            return Err(WatchtowerError::ConflictingFilter);
        }

        let allowed = self.resolver.allowed_orgs(&user.hash).await?;
        debug!(principal = %user.hash, orgs = allowed.len(), "scoping event query");

        let mut scoped = filter;
        scoped.insert(
            "orgid",
            doc! { "$in": allowed.into_iter().collect::<Vec<String>>() },
        );
        Ok(scoped)
    }
}

/// Whether the filter selects event-kind records.
fn selects_events(filter: &Document) -> bool {
    matches!(
        filter.get("kind"),
        Some(Bson::String(kind)) if kind == RecordKind::Event.as_str()
    )
}

/// Whether any clause anywhere in the filter constrains `orgid`.
fn constrains_orgid(filter: &Document) -> bool {
    filter.iter().any(|(key, value)| {
        if key == "orgid" || key.starts_with("orgid.") {
            return true;
        }
        match value {
            Bson::Document(inner) => constrains_orgid(inner),
            Bson::Array(items) => items
                .iter()
                .any(|item| item.as_document().map(constrains_orgid).unwrap_or(false)),
            _ => false,
        }
    })
}
