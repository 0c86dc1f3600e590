//! Change notifications pushed by the server to subscribed clients.

use crate::messages::OperationState;
use serde::{Deserialize, Serialize};

/// Type of a document change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentChangeType {
    /// Document was stored.
    Put,
    /// Document was deleted.
    Delete,
    /// Document entered a conflict.
    Conflict,
}

/// A change to one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    /// Type of change.
    #[serde(rename = "Type")]
    pub change_type: DocumentChangeType,
    /// Document id.
    #[serde(rename = "Id")]
    pub id: String,
    /// Collection of the document.
    #[serde(rename = "CollectionName", default)]
    pub collection: Option<String>,
    /// Change vector after the change.
    #[serde(rename = "ChangeVector", default)]
    pub change_vector: Option<String>,
}

impl DocumentChange {
    /// Creates a Put notification.
    pub fn put(id: impl Into<String>) -> Self {
        Self {
            change_type: DocumentChangeType::Put,
            id: id.into(),
            collection: None,
            change_vector: None,
        }
    }

    /// Creates a Delete notification.
    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            change_type: DocumentChangeType::Delete,
            ..Self::put(id)
        }
    }
}

/// Type of an index change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexChangeType {
    /// An indexing batch finished.
    BatchCompleted,
    /// Index was created.
    IndexAdded,
    /// Index was removed.
    IndexRemoved,
    /// Index was paused.
    IndexPaused,
    /// Index was renamed.
    Renamed,
    /// Index entered an error state.
    IndexMarkedAsErrored,
}

/// A change to one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexChange {
    /// Type of change.
    #[serde(rename = "Type")]
    pub change_type: IndexChangeType,
    /// Index name.
    #[serde(rename = "Name")]
    pub name: String,
}

/// Progress of an asynchronous operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatusChange {
    /// Operation id.
    #[serde(rename = "OperationId")]
    pub operation_id: i64,
    /// Latest state.
    #[serde(rename = "State")]
    pub state: OperationState,
}

/// Any notification a subscription can deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeNotification {
    /// Document change.
    Document(DocumentChange),
    /// Index change.
    Index(IndexChange),
    /// Operation progress.
    OperationStatus(OperationStatusChange),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::OperationStatus;
    use serde_json::json;

    #[test]
    fn document_change_parses() {
        let change: DocumentChange = serde_json::from_value(json!({
            "Type": "Delete",
            "Id": "users/1",
            "CollectionName": "Users"
        }))
        .unwrap();
        assert_eq!(change.change_type, DocumentChangeType::Delete);
        assert_eq!(change.collection.as_deref(), Some("Users"));
        assert_eq!(change.change_vector, None);
    }

    #[test]
    fn operation_change_parses() {
        let change: OperationStatusChange = serde_json::from_value(json!({
            "OperationId": 4,
            "State": {"Status": "Completed"}
        }))
        .unwrap();
        assert_eq!(change.state.status, OperationStatus::Completed);
    }
}
