//! # Docstore Protocol
//!
//! Wire types and the command model shared by the docstore client and
//! its test server.
//!
//! This crate provides:
//! - `CommandData` mutation descriptors and their JSON wire form
//! - `CommandType` / `CommandMatcher` for deferred-command lookups
//! - `IdTypeAndName` composite keys
//! - Batch, HiLo, compare-exchange and operation-state messages
//! - Change notification payloads
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod command;
mod compare_exchange;
mod error;
mod messages;
pub mod metadata;

pub use change_feed::{
    ChangeNotification, DocumentChange, DocumentChangeType, IndexChange, IndexChangeType,
    OperationStatusChange,
};
pub use command::{
    CommandData, CommandMatcher, CommandPayload, CommandType, IdTypeAndName, PatchRequest,
};
pub use compare_exchange::{
    CompareExchangeResultItem, CompareExchangeValue, GetCompareExchangeValuesResponse,
};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    BatchRequest, BatchResponse, BatchResultItem, GetDocumentsResponse, HiLoResult,
    HiLoReturnRequest, NextHiLoRequest, OperationState, OperationStatus, ServerErrorBody,
    TransactionMode,
};
