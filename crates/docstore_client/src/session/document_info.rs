//! Side table entry for one tracked document.

use crate::error::{ClientError, ClientResult};
use docstore_protocol::metadata;
use serde_json::{Map, Value};

/// How the change vector is chosen when a document is saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyCheckMode {
    /// Follow the conventions' optimistic-concurrency setting.
    Auto,
    /// Always send the change vector (empty for new documents).
    Forced,
    /// Never send a change vector.
    Disabled,
}

/// Keys the server owns; never sent back in a Put.
const SERVER_METADATA: [&str; 3] = [
    metadata::ID,
    metadata::CHANGE_VECTOR,
    metadata::LAST_MODIFIED,
];

#[derive(Debug, Clone)]
pub(crate) struct DocumentInfo {
    pub(crate) id: String,
    pub(crate) change_vector: Option<String>,
    pub(crate) concurrency_check: ConcurrencyCheckMode,
    pub(crate) ignore_changes: bool,
    /// Set when a deleted document is stored again, so a Put goes out
    /// even if the contents match the persisted snapshot.
    pub(crate) force_put: bool,
    pub(crate) metadata: Map<String, Value>,
    pub(crate) entity: Value,
    pub(crate) persisted: Option<(Value, Map<String, Value>)>,
}

impl DocumentInfo {
    pub(crate) fn new_entity(
        id: String,
        collection: String,
        entity: Value,
        change_vector: Option<String>,
        concurrency_check: ConcurrencyCheckMode,
    ) -> Self {
        let mut meta = Map::new();
        meta.insert(metadata::COLLECTION.into(), Value::String(collection));
        Self {
            id,
            change_vector,
            concurrency_check,
            ignore_changes: false,
            force_put: false,
            metadata: meta,
            entity,
            persisted: None,
        }
    }

    /// Builds an entry from a document returned by the server.
    pub(crate) fn from_server(id: &str, document: Value) -> ClientResult<Self> {
        let Value::Object(mut body) = document else {
            return Err(ClientError::Protocol(format!(
                "document '{id}' is not a JSON object"
            )));
        };
        let mut meta = match body.remove(metadata::METADATA) {
            Some(Value::Object(meta)) => meta,
            _ => Map::new(),
        };
        let change_vector = meta
            .get(metadata::CHANGE_VECTOR)
            .and_then(Value::as_str)
            .map(str::to_string);
        for key in SERVER_METADATA {
            meta.remove(key);
        }

        let entity = Value::Object(body);
        Ok(Self {
            id: id.to_string(),
            change_vector,
            concurrency_check: ConcurrencyCheckMode::Auto,
            ignore_changes: false,
            force_put: false,
            metadata: meta.clone(),
            entity: entity.clone(),
            persisted: Some((entity, meta)),
        })
    }

    pub(crate) fn collection(&self) -> Option<&str> {
        self.metadata.get(metadata::COLLECTION).and_then(Value::as_str)
    }

    pub(crate) fn is_new(&self) -> bool {
        self.persisted.is_none()
    }

    /// Dirty check by value against the last persisted snapshot.
    pub(crate) fn is_dirty(&self) -> bool {
        if self.force_put {
            return true;
        }
        match &self.persisted {
            None => true,
            Some((entity, meta)) => *entity != self.entity || *meta != self.metadata,
        }
    }

    pub(crate) fn mark_persisted(&mut self, change_vector: Option<String>) {
        if change_vector.is_some() {
            self.change_vector = change_vector;
        }
        self.persisted = Some((self.entity.clone(), self.metadata.clone()));
        self.force_put = false;
    }

    pub(crate) fn is_server_metadata(key: &str) -> bool {
        SERVER_METADATA.contains(&key)
    }
}
