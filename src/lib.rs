//! Watchtower: content-addressed threat-intelligence graph
//!
//! Threat facts (indicators, composite objects, events, sessions, raw
//! captures) live in one graph of immutable records, each addressed by
//! the SHA-256 of its canonical content and deduplicated on write. Edits
//! are copy-on-write reconstructions; reads for multiple tenants flow
//! through a gateway that scopes every event query to the orgs the
//! caller's ACL membership allows.
//!
//! ## Layers
//!
//! - **canonical**: order-independent payload encoding and content hashing
//! - **record**: the tagged entity family in its flattened store form
//! - **db**: the `GraphStore` capability trait with MongoDB and in-memory
//!   adapters
//! - **engine**: dedup/construction (`Materializer`) and copy-on-write
//!   editing (`Editor`)
//! - **identity**: users and orgs as graph objects, plus ACL bookkeeping
//! - **access**: per-call authorization resolution and the scoped query
//!   gateway

pub mod access;
pub mod canonical;
pub mod config;
pub mod db;
pub mod engine;
pub mod identity;
pub mod record;
pub mod types;

pub use access::{MembershipRule, OrgResolver, ScopedGateway};
pub use config::StoreArgs;
pub use db::{GraphStore, InsertOutcome, MemoryStore, MongoStore};
pub use engine::{Editor, Materializer};
pub use identity::Directory;
pub use record::{Category, Record, RecordKind, RecordMeta, RECORD_COLLECTION};
pub use types::{Result, WatchtowerError};
