//! Mutable bookkeeping attached to every persisted record
//!
//! These fields sit outside the content hash: they may change after
//! persistence without re-addressing the record.

use bson::DateTime;
use serde::{Deserialize, Serialize};

/// Creation, update, and soft-deletion bookkeeping.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RecordMeta {
    /// Whether the record has been explicitly deleted. Deleted records stay
    /// in the store so their hash cannot be silently reused, but reads skip
    /// them.
    #[serde(default)]
    pub is_deleted: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime>,
}

impl RecordMeta {
    /// Bookkeeping for a record persisted right now.
    pub fn now() -> Self {
        let stamp = DateTime::now();
        Self {
            is_deleted: false,
            deleted_at: None,
            updated_at: Some(stamp),
            created_at: Some(stamp),
        }
    }
}
