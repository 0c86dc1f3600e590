//! Compare-exchange values and their wire envelopes.

use crate::error::{ProtocolError, ProtocolResult};
use crate::metadata;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A distributed atomic key/value pair at a specific server index.
///
/// A negative `index` means the key does not exist on the server.
#[derive(Debug, Clone, PartialEq)]
pub struct CompareExchangeValue {
    /// Unique key.
    pub key: String,
    /// Server-assigned version.
    pub index: i64,
    /// Stored value, `None` when missing.
    pub value: Option<Value>,
    /// Metadata stored next to the value.
    pub metadata: Option<Map<String, Value>>,
}

impl CompareExchangeValue {
    /// Creates a value at `index`.
    pub fn new(key: impl Into<String>, index: i64, value: Value) -> Self {
        Self {
            key: key.into(),
            index,
            value: Some(value),
            metadata: None,
        }
    }

    /// Creates the marker for a key the server reported as absent.
    pub fn missing(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            index: -1,
            value: None,
            metadata: None,
        }
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Returns true when the server holds this key.
    pub fn exists(&self) -> bool {
        self.index >= 0
    }

    /// Deserializes the value as `T`.
    pub fn value_as<T: DeserializeOwned>(&self) -> ProtocolResult<Option<T>> {
        self.value
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(ProtocolError::from)
    }

    /// Replaces the value with a serialized `T`.
    pub fn set_value<T: Serialize>(&mut self, value: &T) -> ProtocolResult<()> {
        self.value = Some(serde_json::to_value(value)?);
        Ok(())
    }

    /// Returns a mutable handle on the metadata, creating it if needed.
    pub fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        self.metadata.get_or_insert_with(Map::new)
    }
}

/// One entry in a compare-exchange GET response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareExchangeResultItem {
    /// Key.
    #[serde(rename = "Key")]
    pub key: String,
    /// Server index.
    #[serde(rename = "Index")]
    pub index: i64,
    /// `{"Object": value, "@metadata": {...}}` envelope.
    #[serde(rename = "Value", default)]
    pub value: Option<Value>,
}

impl CompareExchangeResultItem {
    /// Wraps a value into its wire envelope.
    pub fn from_value(value: &CompareExchangeValue) -> Self {
        let envelope = value.value.as_ref().map(|inner| {
            let mut envelope = Map::new();
            envelope.insert(metadata::COMPARE_EXCHANGE_OBJECT.into(), inner.clone());
            if let Some(meta) = &value.metadata {
                envelope.insert(metadata::METADATA.into(), Value::Object(meta.clone()));
            }
            Value::Object(envelope)
        });
        Self {
            key: value.key.clone(),
            index: value.index,
            value: envelope,
        }
    }

    /// Unwraps the envelope.
    pub fn into_value(self) -> ProtocolResult<CompareExchangeValue> {
        let (value, metadata) = match self.value {
            None | Some(Value::Null) => (None, None),
            Some(Value::Object(mut envelope)) => {
                let metadata = match envelope.remove(metadata::METADATA) {
                    Some(Value::Object(meta)) => Some(meta),
                    Some(Value::Null) | None => None,
                    Some(_) => {
                        return Err(ProtocolError::invalid_field(
                            metadata::METADATA,
                            format!("metadata of '{}' must be an object", self.key),
                        ))
                    }
                };
                (envelope.remove(metadata::COMPARE_EXCHANGE_OBJECT), metadata)
            }
            Some(_) => {
                return Err(ProtocolError::invalid_field(
                    "Value",
                    format!("value of '{}' must be an object envelope", self.key),
                ))
            }
        };
        Ok(CompareExchangeValue {
            key: self.key,
            index: self.index,
            value,
            metadata,
        })
    }
}

/// Response of a compare-exchange GET.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetCompareExchangeValuesResponse {
    /// Found values.
    #[serde(rename = "Results", default)]
    pub results: Vec<CompareExchangeResultItem>,
}

impl GetCompareExchangeValuesResponse {
    /// Parses all items into values.
    pub fn into_values(self) -> ProtocolResult<Vec<CompareExchangeValue>> {
        self.results
            .into_iter()
            .map(CompareExchangeResultItem::into_value)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_unwraps_value_and_metadata() {
        let item: CompareExchangeResultItem = serde_json::from_value(json!({
            "Key": "users/1/lock",
            "Index": 12,
            "Value": {"Object": {"owner": "A"}, "@metadata": {"ttl": 5}}
        }))
        .unwrap();

        let value = item.into_value().unwrap();
        assert_eq!(value.index, 12);
        assert_eq!(value.value, Some(json!({"owner": "A"})));
        assert_eq!(value.metadata.unwrap()["ttl"], json!(5));
    }

    #[test]
    fn primitive_values_survive_envelope() {
        let original = CompareExchangeValue::new("counter", 3, json!(41));
        let item = CompareExchangeResultItem::from_value(&original);
        assert_eq!(item.value, Some(json!({"Object": 41})));
        assert_eq!(item.into_value().unwrap(), original);
    }

    #[test]
    fn non_object_envelope_rejected() {
        let item = CompareExchangeResultItem {
            key: "k".into(),
            index: 1,
            value: Some(json!("raw")),
        };
        assert!(item.into_value().is_err());
    }

    #[test]
    fn missing_marker() {
        let missing = CompareExchangeValue::missing("k");
        assert!(!missing.exists());
        assert_eq!(missing.value_as::<String>().unwrap(), None);
    }

    #[test]
    fn typed_access() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Lock {
            owner: String,
        }
        let mut value = CompareExchangeValue::new("lock", 0, json!({"owner": "A"}));
        let lock: Lock = value.value_as().unwrap().unwrap();
        assert_eq!(lock.owner, "A");

        value.set_value(&Lock { owner: "B".into() }).unwrap();
        assert_eq!(value.value, Some(json!({"owner": "B"})));
    }
}
