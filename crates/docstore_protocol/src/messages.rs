//! Request and response messages exchanged with the server.

use crate::command::{CommandData, CommandType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transaction mode of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionMode {
    /// Applied on a single node.
    #[default]
    SingleNode,
    /// Applied through cluster consensus; required for compare-exchange commands.
    ClusterWide,
}

impl TransactionMode {
    fn is_single_node(&self) -> bool {
        *self == TransactionMode::SingleNode
    }
}

/// An ordered batch of commands applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchRequest {
    /// Commands in execution order.
    #[serde(rename = "Commands")]
    pub commands: Vec<CommandData>,
    /// Transaction mode.
    #[serde(
        rename = "TransactionMode",
        skip_serializing_if = "TransactionMode::is_single_node"
    )]
    pub transaction_mode: TransactionMode,
}

impl BatchRequest {
    /// Creates a single-node batch.
    pub fn new(commands: Vec<CommandData>) -> Self {
        Self {
            commands,
            transaction_mode: TransactionMode::SingleNode,
        }
    }

    /// Sets the transaction mode.
    pub fn with_transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }

    /// Returns true if the batch has no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Result of one batch command, positionally matching the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResultItem {
    /// Command type that produced this result.
    #[serde(rename = "Type")]
    pub command_type: CommandType,
    /// Document id.
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// New change vector.
    #[serde(
        rename = "@change-vector",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub change_vector: Option<String>,
    /// Collection of the stored document.
    #[serde(rename = "@collection", default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Compare-exchange key.
    #[serde(rename = "Key", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// New compare-exchange index.
    #[serde(rename = "Index", default, skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
    /// Whether a delete removed something.
    #[serde(rename = "Deleted", default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

impl BatchResultItem {
    /// Creates an empty result for `command_type`.
    pub fn new(command_type: CommandType) -> Self {
        Self {
            command_type,
            id: None,
            change_vector: None,
            collection: None,
            key: None,
            index: None,
            deleted: None,
        }
    }
}

/// Response to a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    /// One result per command.
    #[serde(rename = "Results", default)]
    pub results: Vec<BatchResultItem>,
}

/// Response to a document GET. Missing ids come back as `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetDocumentsResponse {
    /// Documents in request order, `@metadata` embedded.
    #[serde(rename = "Results", default)]
    pub results: Vec<Option<Value>>,
}

/// Request for the next HiLo range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextHiLoRequest {
    /// Range tag (usually the collection prefix).
    pub tag: String,
    /// Size of the previous range.
    pub last_batch_size: i64,
    /// When the previous range was issued.
    pub last_range_at: Option<String>,
    /// Separator between prefix and number.
    pub identity_parts_separator: char,
    /// Upper bound of the previous range.
    pub last_max: i64,
}

/// A leased HiLo range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiLoResult {
    /// Id prefix, e.g. `users/`.
    #[serde(rename = "Prefix")]
    pub prefix: String,
    /// First id of the range.
    #[serde(rename = "Low")]
    pub low: i64,
    /// Last id of the range.
    #[serde(rename = "High")]
    pub high: i64,
    /// Size of this range.
    #[serde(rename = "LastSize")]
    pub last_size: i64,
    /// Tag of the issuing server node.
    #[serde(rename = "ServerTag")]
    pub server_tag: String,
    /// When the range was issued.
    #[serde(rename = "LastRangeAt", default)]
    pub last_range_at: Option<String>,
}

/// Returns the unused tail of a HiLo range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiLoReturnRequest {
    /// Range tag.
    pub tag: String,
    /// Last id handed out.
    pub last: i64,
    /// Upper bound of the range.
    pub end: i64,
}

/// Status of an asynchronous server operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Still running.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Failed.
    Faulted,
    /// Cancelled before completion.
    Cancelled,
}

impl OperationStatus {
    /// Returns true once the operation can no longer change state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::InProgress)
    }
}

/// Polled state of an asynchronous server operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationState {
    /// Current status.
    #[serde(rename = "Status")]
    pub status: OperationStatus,
    /// Result or error payload.
    #[serde(rename = "Result", default)]
    pub result: Option<Value>,
}

impl OperationState {
    /// Creates a state without a result.
    pub fn new(status: OperationStatus) -> Self {
        Self {
            status,
            result: None,
        }
    }

    /// Attaches a result payload.
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Extracts the failure message of a faulted operation.
    pub fn failure_message(&self) -> String {
        self.result
            .as_ref()
            .and_then(|result| result.get("Message").or_else(|| result.get("Error")))
            .and_then(Value::as_str)
            .unwrap_or("operation faulted")
            .to_string()
    }
}

/// Error body returned by the server on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerErrorBody {
    /// Exception type name, e.g. `ConcurrencyException`.
    #[serde(rename = "Type")]
    pub error_type: String,
    /// Human-readable message.
    #[serde(rename = "Message")]
    pub message: String,
    /// Ids involved in a concurrency conflict.
    #[serde(rename = "Ids", default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
}
