//! Entity trait.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// An entity that can be stored in a session.
///
/// Entities serialize to a JSON object. The collection name can be
/// overridden through [`DocumentConventions`](crate::DocumentConventions).
pub trait Document: Serialize + DeserializeOwned {
    /// Default collection name.
    const COLLECTION: &'static str;
}
