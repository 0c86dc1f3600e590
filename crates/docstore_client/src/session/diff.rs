//! Field-level differences between a tracked entity and its persisted snapshot.

use docstore_protocol::metadata;
use serde_json::{Map, Value};

/// Kind of change reported by [`what_changed`](super::DocumentSession::what_changed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// Document will be deleted.
    DocumentDeleted,
    /// Document was never saved.
    DocumentAdded,
    /// Existing field has a new value.
    FieldChanged,
    /// Field was added.
    NewField,
    /// Field was removed.
    RemovedField,
}

/// One change to one document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChangeDetail {
    /// Kind of change.
    pub change: ChangeType,
    /// Dotted path of the field; empty for whole-document changes.
    pub field_path: String,
    /// Previous value.
    pub old_value: Option<Value>,
    /// New value.
    pub new_value: Option<Value>,
}

impl DocumentChangeDetail {
    pub(crate) fn document(change: ChangeType) -> Self {
        Self {
            change,
            field_path: String::new(),
            old_value: None,
            new_value: None,
        }
    }
}

pub(crate) fn diff_documents(old: &Value, new: &Value) -> Vec<DocumentChangeDetail> {
    let mut changes = Vec::new();
    diff_at("", old, new, &mut changes);
    changes
}

/// Compares metadata maps; paths are rooted at `@metadata`.
pub(crate) fn diff_metadata(
    old: &Map<String, Value>,
    new: &Map<String, Value>,
) -> Vec<DocumentChangeDetail> {
    let mut changes = Vec::new();
    diff_at(
        metadata::METADATA,
        &Value::Object(old.clone()),
        &Value::Object(new.clone()),
        &mut changes,
    );
    changes
}

fn join(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

fn diff_at(path: &str, old: &Value, new: &Value, changes: &mut Vec<DocumentChangeDetail>) {
    match (old, new) {
        (Value::Object(old_fields), Value::Object(new_fields)) => {
            for (name, old_value) in old_fields {
                let field_path = join(path, name);
                match new_fields.get(name) {
                    Some(new_value) => diff_at(&field_path, old_value, new_value, changes),
                    None => changes.push(DocumentChangeDetail {
                        change: ChangeType::RemovedField,
                        field_path,
                        old_value: Some(old_value.clone()),
                        new_value: None,
                    }),
                }
            }
            for (name, new_value) in new_fields {
                if !old_fields.contains_key(name) {
                    changes.push(DocumentChangeDetail {
                        change: ChangeType::NewField,
                        field_path: join(path, name),
                        old_value: None,
                        new_value: Some(new_value.clone()),
                    });
                }
            }
        }
        _ if old != new => changes.push(DocumentChangeDetail {
            change: ChangeType::FieldChanged,
            field_path: path.to_string(),
            old_value: Some(old.clone()),
            new_value: Some(new.clone()),
        }),
        _ => {}
    }
}
