//! Command data: the mutations a batch applies server-side.

use crate::error::{ProtocolError, ProtocolResult};
use crate::metadata;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Kind of a batch command.
///
/// The serde names are the wire tags the server expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    /// Store a whole document.
    #[serde(rename = "PUT")]
    Put,
    /// Apply a server-side patch script.
    #[serde(rename = "PATCH")]
    Patch,
    /// Delete a document.
    #[serde(rename = "DELETE")]
    Delete,
    /// Store an attachment on a document.
    #[serde(rename = "AttachmentPUT")]
    AttachmentPut,
    /// Delete an attachment from a document.
    #[serde(rename = "AttachmentDELETE")]
    AttachmentDelete,
    /// Create or update a compare-exchange value.
    #[serde(rename = "CompareExchangePUT")]
    CompareExchangePut,
    /// Delete a compare-exchange value.
    #[serde(rename = "CompareExchangeDELETE")]
    CompareExchangeDelete,
}

impl CommandType {
    /// Returns the wire tag for this command type.
    pub fn wire_tag(&self) -> &'static str {
        match self {
            CommandType::Put => "PUT",
            CommandType::Patch => "PATCH",
            CommandType::Delete => "DELETE",
            CommandType::AttachmentPut => "AttachmentPUT",
            CommandType::AttachmentDelete => "AttachmentDELETE",
            CommandType::CompareExchangePut => "CompareExchangePUT",
            CommandType::CompareExchangeDelete => "CompareExchangeDELETE",
        }
    }

    /// Returns true for attachment sub-resource commands.
    pub fn is_attachment(&self) -> bool {
        matches!(self, CommandType::AttachmentPut | CommandType::AttachmentDelete)
    }

    /// Returns true for compare-exchange commands.
    pub fn is_compare_exchange(&self) -> bool {
        matches!(
            self,
            CommandType::CompareExchangePut | CommandType::CompareExchangeDelete
        )
    }
}

/// Predicate over command types used to look up deferred commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandMatcher {
    /// Matches exactly one command type.
    Exact(CommandType),
    /// Matches every command type.
    AnyCommand,
    /// Matches every command type except attachment commands.
    NotAttachment,
}

impl CommandMatcher {
    /// Returns true if `command_type` satisfies this matcher.
    pub fn matches(&self, command_type: CommandType) -> bool {
        match self {
            CommandMatcher::Exact(expected) => *expected == command_type,
            CommandMatcher::AnyCommand => true,
            CommandMatcher::NotAttachment => !command_type.is_attachment(),
        }
    }
}

impl From<CommandType> for CommandMatcher {
    fn from(command_type: CommandType) -> Self {
        CommandMatcher::Exact(command_type)
    }
}

/// Composite key identifying a deferred command: `(id, type, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdTypeAndName {
    id: String,
    command_type: CommandType,
    name: Option<String>,
}

impl IdTypeAndName {
    /// Creates a new key.
    pub fn new(id: impl Into<String>, command_type: CommandType, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            command_type,
            name,
        }
    }

    /// Returns the document id (or compare-exchange key).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the command type.
    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    /// Returns the sub-resource name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns true if this key targets `id` with a type accepted by `matcher`.
    pub fn matches(&self, id: &str, matcher: CommandMatcher) -> bool {
        self.id == id && matcher.matches(self.command_type)
    }
}

/// A patch script with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRequest {
    /// Script source.
    #[serde(rename = "Script")]
    pub script: String,
    /// Named script parameters.
    #[serde(rename = "Values", default, skip_serializing_if = "Map::is_empty")]
    pub values: Map<String, Value>,
}

impl PatchRequest {
    /// Creates a patch with no parameters.
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            values: Map::new(),
        }
    }

    /// Adds a named parameter.
    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    fn to_json(&self) -> Value {
        let mut json = Map::new();
        json.insert("Script".into(), Value::String(self.script.clone()));
        if !self.values.is_empty() {
            json.insert("Values".into(), Value::Object(self.values.clone()));
        }
        Value::Object(json)
    }
}

/// Type-specific part of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    /// Full document, `@metadata` embedded.
    Put {
        /// Document body.
        document: Value,
    },
    /// Patch script.
    Patch {
        /// Patch applied when the document exists.
        patch: PatchRequest,
        /// Patch applied when the document is missing.
        patch_if_missing: Option<PatchRequest>,
    },
    /// Document deletion.
    Delete,
    /// Attachment upload descriptor.
    AttachmentPut {
        /// MIME type of the attachment.
        content_type: Option<String>,
    },
    /// Attachment deletion.
    AttachmentDelete,
    /// Compare-exchange create/update.
    CompareExchangePut {
        /// Expected index (0 for a new key).
        index: i64,
        /// New value.
        value: Value,
        /// Optional metadata stored next to the value.
        metadata: Option<Map<String, Value>>,
    },
    /// Compare-exchange deletion.
    CompareExchangeDelete {
        /// Expected index.
        index: i64,
    },
}

impl CommandPayload {
    /// Returns the command type for this payload.
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandPayload::Put { .. } => CommandType::Put,
            CommandPayload::Patch { .. } => CommandType::Patch,
            CommandPayload::Delete => CommandType::Delete,
            CommandPayload::AttachmentPut { .. } => CommandType::AttachmentPut,
            CommandPayload::AttachmentDelete => CommandType::AttachmentDelete,
            CommandPayload::CompareExchangePut { .. } => CommandType::CompareExchangePut,
            CommandPayload::CompareExchangeDelete { .. } => CommandType::CompareExchangeDelete,
        }
    }
}

/// One mutation to apply server-side.
///
/// Fields are immutable once built; the wire form is a pure function of them.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandData {
    id: String,
    name: Option<String>,
    change_vector: Option<String>,
    payload: CommandPayload,
}

impl CommandData {
    fn build(
        id: String,
        name: Option<String>,
        change_vector: Option<String>,
        payload: CommandPayload,
    ) -> ProtocolResult<Self> {
        let command_type = payload.command_type();
        if id.is_empty() {
            return Err(ProtocolError::EmptyId {
                command: command_type.wire_tag(),
            });
        }
        if command_type.is_attachment() && name.as_deref().map_or(true, str::is_empty) {
            return Err(ProtocolError::invalid_field(
                "Name",
                "attachment commands require a name",
            ));
        }
        Ok(Self {
            id,
            name,
            change_vector,
            payload,
        })
    }

    /// Creates a Put command. `metadata` is embedded under `@metadata`.
    pub fn put(
        id: impl Into<String>,
        change_vector: Option<String>,
        document: Value,
        metadata: Map<String, Value>,
    ) -> ProtocolResult<Self> {
        let Value::Object(mut body) = document else {
            return Err(ProtocolError::invalid_field(
                "Document",
                "expected a JSON object",
            ));
        };
        let mut merged = match body.remove(metadata::METADATA) {
            Some(Value::Object(existing)) => existing,
            _ => Map::new(),
        };
        merged.extend(metadata);
        if !merged.is_empty() {
            body.insert(metadata::METADATA.into(), Value::Object(merged));
        }
        Self::build(
            id.into(),
            None,
            change_vector,
            CommandPayload::Put {
                document: Value::Object(body),
            },
        )
    }

    /// Creates a Delete command.
    pub fn delete(id: impl Into<String>, change_vector: Option<String>) -> ProtocolResult<Self> {
        Self::build(id.into(), None, change_vector, CommandPayload::Delete)
    }

    /// Creates a Patch command.
    pub fn patch(
        id: impl Into<String>,
        change_vector: Option<String>,
        patch: PatchRequest,
        patch_if_missing: Option<PatchRequest>,
    ) -> ProtocolResult<Self> {
        Self::build(
            id.into(),
            None,
            change_vector,
            CommandPayload::Patch {
                patch,
                patch_if_missing,
            },
        )
    }

    /// Creates an attachment Put descriptor.
    pub fn attachment_put(
        id: impl Into<String>,
        name: impl Into<String>,
        content_type: Option<String>,
        change_vector: Option<String>,
    ) -> ProtocolResult<Self> {
        Self::build(
            id.into(),
            Some(name.into()),
            change_vector,
            CommandPayload::AttachmentPut { content_type },
        )
    }

    /// Creates an attachment Delete command.
    pub fn attachment_delete(
        id: impl Into<String>,
        name: impl Into<String>,
        change_vector: Option<String>,
    ) -> ProtocolResult<Self> {
        Self::build(
            id.into(),
            Some(name.into()),
            change_vector,
            CommandPayload::AttachmentDelete,
        )
    }

    /// Creates a compare-exchange Put at the expected `index`.
    pub fn compare_exchange_put(
        key: impl Into<String>,
        index: i64,
        value: Value,
        metadata: Option<Map<String, Value>>,
    ) -> ProtocolResult<Self> {
        Self::build(
            key.into(),
            None,
            None,
            CommandPayload::CompareExchangePut {
                index,
                value,
                metadata,
            },
        )
    }

    /// Creates a compare-exchange Delete at the expected `index`.
    pub fn compare_exchange_delete(key: impl Into<String>, index: i64) -> ProtocolResult<Self> {
        Self::build(
            key.into(),
            None,
            None,
            CommandPayload::CompareExchangeDelete { index },
        )
    }

    /// Returns a copy of this command carrying `change_vector`.
    #[must_use]
    pub fn with_change_vector(mut self, change_vector: Option<String>) -> Self {
        self.change_vector = change_vector;
        self
    }

    /// Returns the document id (or compare-exchange key).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the sub-resource name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the expected change vector.
    pub fn change_vector(&self) -> Option<&str> {
        self.change_vector.as_deref()
    }

    /// Returns the command type.
    pub fn command_type(&self) -> CommandType {
        self.payload.command_type()
    }

    /// Returns the type-specific payload.
    pub fn payload(&self) -> &CommandPayload {
        &self.payload
    }

    /// Returns the `(id, type, name)` key of this command.
    pub fn key(&self) -> IdTypeAndName {
        IdTypeAndName::new(self.id.clone(), self.command_type(), self.name.clone())
    }

    /// Builds the JSON wire object.
    pub fn to_json(&self) -> Value {
        let mut json = Map::new();
        json.insert("Id".into(), Value::String(self.id.clone()));
        json.insert(
            "Type".into(),
            Value::String(self.command_type().wire_tag().into()),
        );
        if let Some(change_vector) = &self.change_vector {
            json.insert("ChangeVector".into(), Value::String(change_vector.clone()));
        }
        if let Some(name) = &self.name {
            json.insert("Name".into(), Value::String(name.clone()));
        }

        match &self.payload {
            CommandPayload::Put { document } => {
                json.insert("Document".into(), document.clone());
            }
            CommandPayload::Patch {
                patch,
                patch_if_missing,
            } => {
                json.insert("Patch".into(), patch.to_json());
                if let Some(if_missing) = patch_if_missing {
                    json.insert("PatchIfMissing".into(), if_missing.to_json());
                }
            }
            CommandPayload::AttachmentPut { content_type } => {
                if let Some(content_type) = content_type {
                    json.insert("ContentType".into(), Value::String(content_type.clone()));
                }
            }
            CommandPayload::CompareExchangePut {
                index,
                value,
                metadata,
            } => {
                json.insert("Index".into(), Value::from(*index));
                let mut document = Map::new();
                document.insert(metadata::COMPARE_EXCHANGE_OBJECT.into(), value.clone());
                if let Some(metadata) = metadata {
                    document.insert(metadata::METADATA.into(), Value::Object(metadata.clone()));
                }
                json.insert("Document".into(), Value::Object(document));
            }
            CommandPayload::CompareExchangeDelete { index } => {
                json.insert("Index".into(), Value::from(*index));
            }
            CommandPayload::Delete | CommandPayload::AttachmentDelete => {}
        }

        Value::Object(json)
    }
}

impl Serialize for CommandData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn put_wire_shape() {
        let mut meta = Map::new();
        meta.insert("@collection".into(), json!("Orders"));
        let cmd = CommandData::put("orders/1", Some("A:1".into()), json!({"total": 5}), meta)
            .unwrap();

        assert_eq!(
            cmd.to_json(),
            json!({
                "Id": "orders/1",
                "Type": "PUT",
                "ChangeVector": "A:1",
                "Document": {"total": 5, "@metadata": {"@collection": "Orders"}}
            })
        );
    }

    #[test]
    fn change_vector_omitted_when_absent() {
        let cmd = CommandData::delete("orders/1", None).unwrap();
        assert_eq!(cmd.to_json(), json!({"Id": "orders/1", "Type": "DELETE"}));
    }

    #[test]
    fn compare_exchange_wire_shape() {
        let put = CommandData::compare_exchange_put("users/1/lock", 0, json!({"owner": "A"}), None)
            .unwrap();
        assert_eq!(
            put.to_json(),
            json!({
                "Id": "users/1/lock",
                "Type": "CompareExchangePUT",
                "Index": 0,
                "Document": {"Object": {"owner": "A"}}
            })
        );

        let delete = CommandData::compare_exchange_delete("users/1/lock", 7).unwrap();
        assert_eq!(
            delete.to_json(),
            json!({"Id": "users/1/lock", "Type": "CompareExchangeDELETE", "Index": 7})
        );
    }

    #[test]
    fn patch_wire_shape() {
        let patch = PatchRequest::new("this.count += args.n").with_value("n", json!(2));
        let cmd = CommandData::patch("counters/1", None, patch, None).unwrap();
        assert_eq!(
            cmd.to_json(),
            json!({
                "Id": "counters/1",
                "Type": "PATCH",
                "Patch": {"Script": "this.count += args.n", "Values": {"n": 2}}
            })
        );
    }

    #[test]
    fn empty_id_rejected() {
        let err = CommandData::delete("", None).unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyId { command: "DELETE" }));
        assert!(CommandData::compare_exchange_delete("", 1).is_err());
    }

    #[test]
    fn attachment_requires_name() {
        assert!(CommandData::attachment_delete("users/1", "", None).is_err());
        let cmd = CommandData::attachment_put("users/1", "photo", Some("image/png".into()), None)
            .unwrap();
        assert_eq!(cmd.name(), Some("photo"));
        assert_eq!(cmd.to_json()["ContentType"], json!("image/png"));
    }

    #[test]
    fn put_requires_object() {
        assert!(CommandData::put("a/1", None, json!(3), Map::new()).is_err());
    }

    #[test]
    fn matcher_predicate() {
        assert!(CommandMatcher::AnyCommand.matches(CommandType::AttachmentPut));
        assert!(CommandMatcher::NotAttachment.matches(CommandType::Put));
        assert!(CommandMatcher::NotAttachment.matches(CommandType::Patch));
        assert!(!CommandMatcher::NotAttachment.matches(CommandType::AttachmentDelete));
        assert!(CommandMatcher::from(CommandType::Delete).matches(CommandType::Delete));
        assert!(!CommandMatcher::from(CommandType::Delete).matches(CommandType::Put));
    }

    #[test]
    fn id_type_and_name_is_structural() {
        let mut map = HashMap::new();
        map.insert(
            IdTypeAndName::new("users/1", CommandType::AttachmentDelete, Some("photo".into())),
            1,
        );
        map.insert(IdTypeAndName::new("users/1", CommandType::Put, None), 2);

        let lookup = IdTypeAndName::new("users/1", CommandType::AttachmentDelete, Some("photo".into()));
        assert_eq!(map.get(&lookup), Some(&1));
        assert_eq!(map.len(), 2);
        assert!(lookup.matches("users/1", CommandMatcher::AnyCommand));
        assert!(!lookup.matches("users/1", CommandMatcher::NotAttachment));
    }

    #[test]
    fn type_tags_round_trip_through_serde() {
        let tag = serde_json::to_value(CommandType::CompareExchangeDelete).unwrap();
        assert_eq!(tag, json!("CompareExchangeDELETE"));
        let parsed: CommandType = serde_json::from_value(json!("AttachmentPUT")).unwrap();
        assert_eq!(parsed, CommandType::AttachmentPut);
    }

    const ALL_TYPES: [CommandType; 7] = [
        CommandType::Put,
        CommandType::Patch,
        CommandType::Delete,
        CommandType::AttachmentPut,
        CommandType::AttachmentDelete,
        CommandType::CompareExchangePut,
        CommandType::CompareExchangeDelete,
    ];

    proptest! {
        #[test]
        fn serde_tag_is_the_wire_tag(command_type in prop::sample::select(ALL_TYPES.to_vec())) {
            let tag = serde_json::to_value(command_type).unwrap();
            prop_assert_eq!(&tag, &json!(command_type.wire_tag()));
            let parsed: CommandType = serde_json::from_value(tag).unwrap();
            prop_assert_eq!(parsed, command_type);
        }

        #[test]
        fn matchers_agree_with_type_predicates(
            command_type in prop::sample::select(ALL_TYPES.to_vec()),
            other in prop::sample::select(ALL_TYPES.to_vec()),
        ) {
            prop_assert!(CommandMatcher::AnyCommand.matches(command_type));
            prop_assert_eq!(
                CommandMatcher::NotAttachment.matches(command_type),
                !command_type.is_attachment()
            );
            prop_assert_eq!(
                CommandMatcher::from(command_type).matches(other),
                command_type == other
            );
        }
    }

    #[test]
    fn unknown_wire_tag_is_rejected() {
        assert!(serde_json::from_value::<CommandType>(json!("put")).is_err());
    }
}
