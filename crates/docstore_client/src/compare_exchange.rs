//! Per-session tracking of compare-exchange values.

use crate::error::{ClientError, ClientResult};
use docstore_protocol::{metadata, CommandData, CompareExchangeValue};
use serde_json::{Map, Value};

/// Lifecycle state of a tracked compare-exchange key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareExchangeState {
    /// In sync with the server.
    None,
    /// Creation proposed, not yet confirmed.
    Created,
    /// Deletion proposed, not yet confirmed.
    Deleted,
    /// Confirmed absent on the server.
    Missing,
}

/// Tracks one compare-exchange key for the lifetime of a session.
///
/// The value is only sent when it differs from the last server-confirmed
/// contents, so touching a key without changing it produces no command.
#[derive(Debug, Clone)]
pub struct CompareExchangeSessionValue {
    key: String,
    index: i64,
    original_value: Option<CompareExchangeValue>,
    value: Option<CompareExchangeValue>,
    state: CompareExchangeState,
}

impl CompareExchangeSessionValue {
    /// Creates an empty tracker.
    pub fn new(key: impl Into<String>, index: i64, state: CompareExchangeState) -> Self {
        Self {
            key: key.into(),
            index,
            original_value: None,
            value: None,
            state,
        }
    }

    /// Tracks a value loaded from the server.
    pub fn from_value(value: CompareExchangeValue) -> Self {
        let state = if value.exists() {
            CompareExchangeState::None
        } else {
            CompareExchangeState::Missing
        };
        Self {
            key: value.key.clone(),
            index: value.index,
            original_value: value.exists().then_some(value),
            value: None,
            state,
        }
    }

    /// Tracks a key the server reported as absent.
    pub fn missing(key: impl Into<String>) -> Self {
        Self::new(key, -1, CompareExchangeState::Missing)
    }

    /// Returns the key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the last known server index.
    pub fn index(&self) -> i64 {
        self.index
    }

    /// Returns the current state.
    pub fn state(&self) -> CompareExchangeState {
        self.state
    }

    /// Returns the last server-confirmed contents.
    pub fn original_value(&self) -> Option<&CompareExchangeValue> {
        self.original_value.as_ref()
    }

    /// Returns the session's view of the value, `None` when missing or deleted.
    ///
    /// The first access copies the server-confirmed contents into a local,
    /// mutable value.
    pub fn value_mut(&mut self) -> Option<&mut CompareExchangeValue> {
        match self.state {
            CompareExchangeState::None | CompareExchangeState::Created => {
                if self.value.is_none() {
                    let materialized = match &self.original_value {
                        Some(original) => CompareExchangeValue {
                            index: self.index,
                            ..original.clone()
                        },
                        None => CompareExchangeValue {
                            key: self.key.clone(),
                            index: self.index,
                            value: None,
                            metadata: None,
                        },
                    };
                    self.value = Some(materialized);
                }
                self.value.as_mut()
            }
            CompareExchangeState::Deleted | CompareExchangeState::Missing => None,
        }
    }

    /// Proposes a new value for a key that is absent or untouched.
    pub fn create(&mut self, item: Value) -> ClientResult<&mut CompareExchangeValue> {
        match self.state {
            CompareExchangeState::Created => {
                return Err(ClientError::illegal_state(format!(
                    "compare exchange value with key '{}' was already stored",
                    self.key
                )))
            }
            CompareExchangeState::Deleted => {
                return Err(ClientError::illegal_state(format!(
                    "compare exchange value with key '{}' was already deleted",
                    self.key
                )))
            }
            CompareExchangeState::None | CompareExchangeState::Missing => {}
        }
        if self.value.is_some() {
            return Err(ClientError::illegal_state(format!(
                "compare exchange value with key '{}' is already tracked",
                self.key
            )));
        }

        self.index = 0;
        self.state = CompareExchangeState::Created;
        Ok(self.value.insert(CompareExchangeValue::new(self.key.clone(), 0, item)))
    }

    /// Proposes deletion at the expected `index`.
    pub fn delete(&mut self, index: i64) -> ClientResult<()> {
        if self.state == CompareExchangeState::Deleted {
            return Err(ClientError::illegal_state(format!(
                "compare exchange value with key '{}' was already deleted",
                self.key
            )));
        }
        self.index = index;
        self.state = CompareExchangeState::Deleted;
        Ok(())
    }

    /// Builds the command for the pending change, if any.
    ///
    /// A Put records the sent contents as the new original, so calling this
    /// again without further changes returns `None`.
    pub fn get_command(&mut self) -> ClientResult<Option<CommandData>> {
        match self.state {
            CompareExchangeState::None | CompareExchangeState::Created => {
                let Some(value) = &self.value else {
                    return Ok(None);
                };
                let unchanged = match &self.original_value {
                    Some(original) => {
                        original.value == value.value && original.metadata == value.metadata
                    }
                    None => value.value.is_none() && value.metadata.is_none(),
                };
                if unchanged {
                    return Ok(None);
                }
                validate_metadata_for_put(&self.key, value.metadata.as_ref())?;

                let command = CommandData::compare_exchange_put(
                    self.key.clone(),
                    self.index,
                    value.value.clone().unwrap_or(Value::Null),
                    value.metadata.clone(),
                )?;
                self.original_value = Some(CompareExchangeValue {
                    key: self.key.clone(),
                    index: self.index,
                    value: value.value.clone(),
                    metadata: value.metadata.clone(),
                });
                Ok(Some(command))
            }
            CompareExchangeState::Deleted => Ok(Some(CommandData::compare_exchange_delete(
                self.key.clone(),
                self.index,
            )?)),
            CompareExchangeState::Missing => Ok(None),
        }
    }

    /// Applies the index confirmed by the server after a save.
    pub fn update_state(&mut self, index: i64) {
        self.index = index;
        self.state = state_for_index(index);
        if let Some(original) = &mut self.original_value {
            original.index = index;
        }
        if let Some(value) = &mut self.value {
            value.index = index;
        }
    }

    /// Reconciles with a value fetched from the server.
    ///
    /// Record values are merged field by field into the local value, server
    /// fields winning; any other shape replaces the local value.
    pub fn update_value(&mut self, server: CompareExchangeValue) {
        self.index = server.index;
        self.state = state_for_index(server.index);

        if !server.exists() {
            self.original_value = None;
            self.value = None;
            return;
        }

        if let Some(local) = &mut self.value {
            local.index = server.index;
            local.metadata = server.metadata.clone();
            let merged = match (local.value.as_mut(), server.value.as_ref()) {
                (Some(Value::Object(local_fields)), Some(Value::Object(server_fields))) => {
                    for (name, field) in server_fields {
                        local_fields.insert(name.clone(), field.clone());
                    }
                    true
                }
                _ => false,
            };
            if !merged {
                local.value = server.value.clone();
            }
        }
        self.original_value = Some(server);
    }
}

fn state_for_index(index: i64) -> CompareExchangeState {
    if index >= 0 {
        CompareExchangeState::None
    } else {
        CompareExchangeState::Missing
    }
}

/// `@expires`, when present, must be a string timestamp.
fn validate_metadata_for_put(key: &str, meta: Option<&Map<String, Value>>) -> ClientResult<()> {
    match meta.and_then(|meta| meta.get(metadata::EXPIRES)) {
        None | Some(Value::String(_)) => Ok(()),
        Some(Value::Null) => Err(ClientError::illegal_state(format!(
            "the value of {} metadata for compare exchange '{key}' is null",
            metadata::EXPIRES
        ))),
        Some(_) => Err(ClientError::illegal_state(format!(
            "the value of {} metadata for compare exchange '{key}' is not valid; use a date string",
            metadata::EXPIRES
        ))),
    }
}
