//! Reserved metadata keys embedded in documents and compare-exchange values.

/// Key of the metadata object inside a document.
pub const METADATA: &str = "@metadata";
/// Document id.
pub const ID: &str = "@id";
/// Collection the document belongs to.
pub const COLLECTION: &str = "@collection";
/// Server-issued change vector.
pub const CHANGE_VECTOR: &str = "@change-vector";
/// Last modification timestamp.
pub const LAST_MODIFIED: &str = "@last-modified";
/// Expiration time; a string timestamp when present.
pub const EXPIRES: &str = "@expires";
/// Envelope key wrapping a compare-exchange value.
pub const COMPARE_EXCHANGE_OBJECT: &str = "Object";
