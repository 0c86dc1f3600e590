//! # Docstore Client
//!
//! Client-side core of a document database.
//!
//! This crate provides:
//! - `DocumentSession`: unit of work with dirty tracking and one atomic save
//! - Deferred commands and compare-exchange (cluster-wide) tracking
//! - `HttpCache`: generation-stamped response cache with conditional GETs
//! - HiLo document id generation per collection and per database
//! - `DatabaseConnectionState`: reference-counted change subscriptions
//! - `Operation` polling with cooperative cancellation
//! - `HttpRequestExecutor` over a pluggable `HttpClient`
//!
//! ## Save order
//!
//! A save sends deletes, then puts, then compare-exchange commands, then
//! deferred commands, all in one batch. A failed save leaves the session
//! untouched.
//!
//! ## Threading
//!
//! The store, caches, id generators and connection states are shared
//! across threads. Sessions are owned by one caller at a time.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cancellation;
mod changes;
mod compare_exchange;
mod config;
mod document;
mod error;
mod executor;
mod hilo;
mod http;
mod http_cache;
mod operation;
mod session;
mod store;

pub use cancellation::CancellationToken;
pub use changes::{
    evict_items_from_cache_on_changes, CacheEvictionSubscription, ChangeKind,
    DatabaseConnectionState, SubscriptionHandle,
};
pub use compare_exchange::{CompareExchangeSessionValue, CompareExchangeState};
pub use config::{
    CollectionNameHook, DocumentConventions, DocumentIdHook, PrefixHook, RetryConfig,
    SessionOptions,
};
pub use document::Document;
pub use error::{ClientError, ClientResult};
pub use executor::{ExecutorRegistry, MockExecutor, RequestExecutor, SessionInfo};
pub use hilo::{
    DocumentIdGenerator, HiLoIdGenerator, MultiDatabaseHiLoIdGenerator, MultiTypeHiLoIdGenerator,
};
pub use http::{HttpClient, HttpRequest, HttpRequestExecutor, HttpResponse, Method, SESSION_ID_HEADER};
pub use http_cache::{CacheLookup, CachePolicy, HttpCache, ReleaseCacheItem, NOT_FOUND_CHANGE_VECTOR};
pub use operation::Operation;
pub use session::{
    ChangeType, ClusterTransactionOperations, ConcurrencyCheckMode, DocumentChangeDetail,
    DocumentSession, SaveChangesData, SaveChangesResult,
};
pub use store::DocumentStore;

pub use docstore_protocol as protocol;
