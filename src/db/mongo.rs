//! MongoDB-backed graph store
//!
//! One collection holds the whole record graph. A unique index on `hash`
//! gives `insert_one` its insert-if-absent semantics: a racing duplicate
//! surfaces as a duplicate-key write error and is reported as
//! `DuplicateHash`, never as a second document.

use bson::{doc, Document};
use futures_util::StreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};
use tracing::{error, info};

use crate::config::StoreArgs;
use crate::db::store::{GraphStore, InsertOutcome};
use crate::db::live_guard;
use crate::types::{Result, WatchtowerError};

const DUPLICATE_KEY: i32 = 11000;

/// MongoDB adapter for the record graph
#[derive(Clone)]
pub struct MongoStore {
    records: Collection<Document>,
}

impl MongoStore {
    /// Connect, verify reachability, and apply the graph indexes.
    pub async fn connect(args: &StoreArgs) -> Result<Self> {
        info!("Connecting to MongoDB at {}", args.mongodb_uri);

        // Bounded server selection so an unreachable store fails fast
        let timeout_uri = if args.mongodb_uri.contains('?') {
            format!(
                "{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000",
                args.mongodb_uri
            )
        } else {
            format!(
                "{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000",
                args.mongodb_uri
            )
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| WatchtowerError::Store(format!("Failed to connect to MongoDB: {e}")))?;

        client
            .database(&args.mongodb_db)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| WatchtowerError::Store(format!("MongoDB ping failed: {e}")))?;

        let records = client
            .database(&args.mongodb_db)
            .collection::<Document>(&args.records_collection);

        let store = Self { records };
        store.apply_indexes().await?;

        info!(
            "Connected to MongoDB database '{}', collection '{}'",
            args.mongodb_db, args.records_collection
        );

        Ok(store)
    }

    async fn apply_indexes(&self) -> Result<()> {
        let indices = vec![
            // Content-address identity; backs insert-if-absent
            IndexModel::builder()
                .keys(doc! { "hash": 1 })
                .options(
                    IndexOptions::builder()
                        .unique(true)
                        .name("hash_unique".to_string())
                        .build(),
                )
                .build(),
            IndexModel::builder()
                .keys(doc! { "kind": 1, "sub_type": 1 })
                .build(),
            // Event org scoping
            IndexModel::builder().keys(doc! { "orgid": 1 }).build(),
            // Related-record lookups
            IndexModel::builder()
                .keys(doc! { "transitive_refs": 1 })
                .build(),
            // ACL resolution
            IndexModel::builder().keys(doc! { "acl": 1 }).build(),
        ];

        self.records
            .create_indexes(indices)
            .await
            .map_err(|e| WatchtowerError::Store(format!("Failed to create indexes: {e}")))?;

        Ok(())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref write)) if write.code == DUPLICATE_KEY
    )
}

#[async_trait::async_trait]
impl GraphStore for MongoStore {
    async fn find(
        &self,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Vec<Document>> {
        let mut action = self.records.find(live_guard(filter));
        if let Some(projection) = projection {
            action = action.projection(projection);
        }

        let cursor = action
            .await
            .map_err(|e| WatchtowerError::Store(format!("Find failed: {e}")))?;

        let results: Vec<Document> = cursor
            .filter_map(|doc| async {
                match doc {
                    Ok(d) => Some(d),
                    Err(e) => {
                        error!("Error reading document: {}", e);
                        None
                    }
                }
            })
            .collect()
            .await;

        Ok(results)
    }

    async fn find_one(
        &self,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Option<Document>> {
        let mut action = self.records.find_one(live_guard(filter));
        if let Some(projection) = projection {
            action = action.projection(projection);
        }

        action
            .await
            .map_err(|e| WatchtowerError::Store(format!("Find failed: {e}")))
    }

    async fn insert_one(&self, document: Document) -> Result<InsertOutcome> {
        match self.records.insert_one(document).await {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_duplicate_key(&e) => Ok(InsertOutcome::DuplicateHash),
            Err(e) => Err(WatchtowerError::Store(format!("Insert failed: {e}"))),
        }
    }

    async fn update_one(&self, filter: Document, update: Document) -> Result<u64> {
        let result = self
            .records
            .update_one(filter, update)
            .await
            .map_err(|e| WatchtowerError::Store(format!("Update failed: {e}")))?;

        Ok(result.matched_count)
    }

    async fn update_many(&self, filter: Document, update: Document) -> Result<u64> {
        let result = self
            .records
            .update_many(filter, update)
            .await
            .map_err(|e| WatchtowerError::Store(format!("Update failed: {e}")))?;

        Ok(result.matched_count)
    }

    async fn count(&self, filter: Document) -> Result<u64> {
        self.records
            .count_documents(live_guard(filter))
            .await
            .map_err(|e| WatchtowerError::Store(format!("Count failed: {e}")))
    }

    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        let cursor = self
            .records
            .aggregate(pipeline)
            .await
            .map_err(|e| WatchtowerError::Store(format!("Aggregate failed: {e}")))?;

        let results: Vec<Document> = cursor
            .filter_map(|doc| async {
                match doc {
                    Ok(d) => Some(d),
                    Err(e) => {
                        error!("Error reading document: {}", e);
                        None
                    }
                }
            })
            .collect()
            .await;

        Ok(results)
    }
}
