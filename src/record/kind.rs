//! Record kind tags

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Result, WatchtowerError};

/// The five entity kinds of the record graph.
///
/// A record's kind is fixed at construction and participates in its
/// content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Leaf fact holding a single scalar value
    Attribute,
    /// Composite of attributes and nested objects
    Object,
    /// Org-owned observation with category and context tags
    Event,
    /// Grouping of events keyed by identifier objects
    Session,
    /// Verbatim externally-ingested document
    Raw,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Attribute => "attribute",
            RecordKind::Object => "object",
            RecordKind::Event => "event",
            RecordKind::Session => "session",
            RecordKind::Raw => "raw",
        }
    }

    /// Decode a kind tag. Unrecognized tags are a typed failure so callers
    /// can tell a bad document apart from a store problem.
    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "attribute" => Ok(RecordKind::Attribute),
            "object" => Ok(RecordKind::Object),
            "event" => Ok(RecordKind::Event),
            "session" => Ok(RecordKind::Session),
            "raw" => Ok(RecordKind::Raw),
            other => Err(WatchtowerError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
