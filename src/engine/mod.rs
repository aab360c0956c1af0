//! Record construction and editing
//!
//! `Materializer` reconciles new records with the store (dedup by content
//! hash); `Editor` layers copy-on-write edits and relation bookkeeping on
//! top of it.

mod edit;
mod materialize;

pub use edit::Editor;
pub use materialize::Materializer;
