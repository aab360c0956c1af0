//! Error types for watchtower
//!
//! Contract violations (unsupported payloads, bad edits, pre-scoped
//! queries, unresolvable principals) are detected locally and surfaced as
//! typed variants; store availability problems are carried through
//! unretried in `Store`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchtowerError {
    /// A payload value outside the supported scalar/map/list family.
    #[error("Unsupported payload type: {0}")]
    UnsupportedType(&'static str),

    /// Object construction (or an edit reducing an Object) with no children.
    #[error("Object records require at least one child")]
    EmptyChildren,

    /// An edit named a record that is not among the parent's direct children.
    #[error("Record {child} is not a child of {parent}")]
    NotAChild { parent: String, child: String },

    /// An event query already constrained `orgid`; the gateway refuses to
    /// merge caller-supplied org filters with derived ones.
    #[error("Event query already constrains orgid; remove the filter and let the gateway scope it")]
    ConflictingFilter,

    /// The principal could not be resolved to a known user.
    #[error("Principal could not be resolved to a user: {0}")]
    InvalidPrincipal(String),

    /// A stored document carried a kind tag this build does not recognize.
    #[error("Unknown record kind: {0}")]
    UnknownKind(String),

    /// A stored document failed structural validation for its kind.
    #[error("Malformed record document: {0}")]
    Malformed(String),

    /// The graph store could not be reached or rejected an operation.
    #[error("Store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, WatchtowerError>;
