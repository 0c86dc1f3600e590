//! Request executor abstraction.
//!
//! The session never talks HTTP itself; every server call goes through a
//! [`RequestExecutor`]. Implementations must apply a batch atomically and
//! report conflicts as [`ClientError::Concurrency`].

use crate::error::{ClientError, ClientResult};
use dashmap::DashMap;
use docstore_protocol::{
    metadata, BatchRequest, BatchResponse, BatchResultItem, CommandPayload, CompareExchangeResultItem,
    CompareExchangeValue, GetCompareExchangeValuesResponse, GetDocumentsResponse, HiLoResult,
    HiLoReturnRequest, NextHiLoRequest, OperationState,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Identifies the session issuing a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique session id.
    pub session_id: Uuid,
    /// Database the session targets.
    pub database: String,
}

/// Executes server commands for one database.
pub trait RequestExecutor: Send + Sync {
    /// Returns the database this executor targets.
    fn database(&self) -> &str;

    /// Applies a batch atomically.
    fn batch(
        &self,
        request: &BatchRequest,
        session: Option<&SessionInfo>,
    ) -> ClientResult<BatchResponse>;

    /// Loads documents by id.
    fn get_documents(
        &self,
        ids: &[String],
        session: Option<&SessionInfo>,
    ) -> ClientResult<GetDocumentsResponse>;

    /// Loads compare-exchange values by key.
    fn get_compare_exchange_values(
        &self,
        keys: &[String],
        session: Option<&SessionInfo>,
    ) -> ClientResult<GetCompareExchangeValuesResponse>;

    /// Leases the next HiLo range.
    fn next_hilo(&self, request: &NextHiLoRequest) -> ClientResult<HiLoResult>;

    /// Returns the unused part of a HiLo range.
    fn return_hilo(&self, request: &HiLoReturnRequest) -> ClientResult<()>;

    /// Polls an asynchronous operation.
    fn get_operation_state(&self, id: i64) -> ClientResult<OperationState>;
}

type ExecutorFactory = Box<dyn Fn(&str) -> ClientResult<Arc<dyn RequestExecutor>> + Send + Sync>;

/// Lazily created executors, one per database.
pub struct ExecutorRegistry {
    default_database: String,
    executors: DashMap<String, Arc<dyn RequestExecutor>>,
    factory: ExecutorFactory,
}

impl ExecutorRegistry {
    /// Creates a registry that builds executors with `factory`.
    pub fn new(
        default_database: impl Into<String>,
        factory: impl Fn(&str) -> ClientResult<Arc<dyn RequestExecutor>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            default_database: default_database.into(),
            executors: DashMap::new(),
            factory: Box::new(factory),
        }
    }

    /// Creates a registry serving one executor for every database.
    pub fn single(executor: Arc<dyn RequestExecutor>) -> Self {
        let database = executor.database().to_string();
        Self::new(database, move |_| Ok(Arc::clone(&executor)))
    }

    /// Returns the default database name.
    pub fn default_database(&self) -> &str {
        &self.default_database
    }

    /// Resolves an empty name to the default database.
    pub fn resolve<'a>(&'a self, database: &'a str) -> &'a str {
        if database.is_empty() {
            &self.default_database
        } else {
            database
        }
    }

    /// Returns the executor for `database`, creating it on first use.
    pub fn for_database(&self, database: &str) -> ClientResult<Arc<dyn RequestExecutor>> {
        let database = self.resolve(database);
        if let Some(existing) = self.executors.get(database) {
            return Ok(Arc::clone(existing.value()));
        }
        let created = (self.factory)(database)?;
        let entry = self
            .executors
            .entry(database.to_string())
            .or_insert(created);
        Ok(Arc::clone(entry.value()))
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("default_database", &self.default_database)
            .field("executors", &self.executors.len())
            .finish_non_exhaustive()
    }
}

/// A scripted executor for unit tests.
///
/// Batches always succeed unless a failure was queued with
/// [`MockExecutor::fail_next_batch`]; every request is recorded.
#[derive(Debug)]
pub struct MockExecutor {
    database: String,
    counter: AtomicI64,
    hilo_range_size: i64,
    numbered_server_tags: bool,
    batches: Mutex<Vec<BatchRequest>>,
    batch_failure: Mutex<Option<ClientError>>,
    documents: Mutex<HashMap<String, Value>>,
    compare_exchange: Mutex<HashMap<String, CompareExchangeValue>>,
    hilo_requests: Mutex<Vec<NextHiLoRequest>>,
    hilo_returns: Mutex<Vec<HiLoReturnRequest>>,
    hilo_highs: Mutex<HashMap<String, i64>>,
    operation_states: Mutex<VecDeque<OperationState>>,
    reads: AtomicI64,
}

impl MockExecutor {
    /// Creates a mock for `database`.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            counter: AtomicI64::new(0),
            hilo_range_size: 32,
            numbered_server_tags: false,
            batches: Mutex::new(Vec::new()),
            batch_failure: Mutex::new(None),
            documents: Mutex::new(HashMap::new()),
            compare_exchange: Mutex::new(HashMap::new()),
            hilo_requests: Mutex::new(Vec::new()),
            hilo_returns: Mutex::new(Vec::new()),
            hilo_highs: Mutex::new(HashMap::new()),
            operation_states: Mutex::new(VecDeque::new()),
            reads: AtomicI64::new(0),
        }
    }

    /// Sets the size of leased HiLo ranges.
    pub fn with_hilo_range_size(mut self, size: i64) -> Self {
        self.hilo_range_size = size;
        self
    }

    /// Tags the n-th leased range of a tag with server tag `N{n}` instead of `A`.
    pub fn with_numbered_server_tags(mut self) -> Self {
        self.numbered_server_tags = true;
        self
    }

    /// Makes the next batch fail with `error`.
    pub fn fail_next_batch(&self, error: ClientError) {
        *self.batch_failure.lock() = Some(error);
    }

    /// Seeds a stored document.
    pub fn insert_document(&self, id: impl Into<String>, document: Value) {
        self.documents.lock().insert(id.into(), document);
    }

    /// Seeds a compare-exchange value.
    pub fn insert_compare_exchange(&self, value: CompareExchangeValue) {
        self.compare_exchange.lock().insert(value.key.clone(), value);
    }

    /// Queues operation states returned by successive polls.
    pub fn push_operation_state(&self, state: OperationState) {
        self.operation_states.lock().push_back(state);
    }

    /// Returns every batch received so far.
    pub fn batches(&self) -> Vec<BatchRequest> {
        self.batches.lock().clone()
    }

    /// Returns every HiLo range request.
    pub fn hilo_requests(&self) -> Vec<NextHiLoRequest> {
        self.hilo_requests.lock().clone()
    }

    /// Returns every returned HiLo range.
    pub fn hilo_returns(&self) -> Vec<HiLoReturnRequest> {
        self.hilo_returns.lock().clone()
    }

    /// Returns the number of document and compare-exchange reads.
    pub fn read_count(&self) -> i64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn next_version(&self) -> i64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl RequestExecutor for MockExecutor {
    fn database(&self) -> &str {
        &self.database
    }

    fn batch(
        &self,
        request: &BatchRequest,
        _session: Option<&SessionInfo>,
    ) -> ClientResult<BatchResponse> {
        self.batches.lock().push(request.clone());
        if let Some(error) = self.batch_failure.lock().take() {
            return Err(error);
        }

        let mut results = Vec::with_capacity(request.commands.len());
        for command in &request.commands {
            let version = self.next_version();
            let mut item = BatchResultItem::new(command.command_type());
            match command.payload() {
                CommandPayload::Put { document } => {
                    let change_vector = format!("A:{version}-mock");
                    item.id = Some(command.id().to_string());
                    item.change_vector = Some(change_vector);
                    item.collection = document
                        .get(metadata::METADATA)
                        .and_then(|meta| meta.get(metadata::COLLECTION))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    self.documents
                        .lock()
                        .insert(command.id().to_string(), document.clone());
                }
                CommandPayload::Delete => {
                    item.id = Some(command.id().to_string());
                    item.deleted = Some(self.documents.lock().remove(command.id()).is_some());
                }
                CommandPayload::CompareExchangePut {
                    value, metadata, ..
                } => {
                    item.key = Some(command.id().to_string());
                    item.index = Some(version);
                    let mut stored = CompareExchangeValue::new(command.id(), version, value.clone());
                    stored.metadata = metadata.clone();
                    self.compare_exchange
                        .lock()
                        .insert(command.id().to_string(), stored);
                }
                CommandPayload::CompareExchangeDelete { .. } => {
                    item.key = Some(command.id().to_string());
                    item.index = Some(version);
                    self.compare_exchange.lock().remove(command.id());
                }
                CommandPayload::Patch { .. }
                | CommandPayload::AttachmentPut { .. }
                | CommandPayload::AttachmentDelete => {
                    item.id = Some(command.id().to_string());
                    item.change_vector = Some(format!("A:{version}-mock"));
                }
            }
            results.push(item);
        }
        Ok(BatchResponse { results })
    }

    fn get_documents(
        &self,
        ids: &[String],
        _session: Option<&SessionInfo>,
    ) -> ClientResult<GetDocumentsResponse> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let documents = self.documents.lock();
        Ok(GetDocumentsResponse {
            results: ids.iter().map(|id| documents.get(id).cloned()).collect(),
        })
    }

    fn get_compare_exchange_values(
        &self,
        keys: &[String],
        _session: Option<&SessionInfo>,
    ) -> ClientResult<GetCompareExchangeValuesResponse> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let values = self.compare_exchange.lock();
        Ok(GetCompareExchangeValuesResponse {
            results: keys
                .iter()
                .filter_map(|key| values.get(key))
                .map(CompareExchangeResultItem::from_value)
                .collect(),
        })
    }

    fn next_hilo(&self, request: &NextHiLoRequest) -> ClientResult<HiLoResult> {
        self.hilo_requests.lock().push(request.clone());
        let mut highs = self.hilo_highs.lock();
        let high = highs.entry(request.tag.clone()).or_insert(0);
        let low = *high + 1;
        *high += self.hilo_range_size;
        let server_tag = if self.numbered_server_tags {
            format!("N{}", *high / self.hilo_range_size.max(1))
        } else {
            "A".into()
        };
        Ok(HiLoResult {
            prefix: format!("{}{}", request.tag, request.identity_parts_separator),
            low,
            high: *high,
            last_size: self.hilo_range_size,
            server_tag,
            last_range_at: None,
        })
    }

    fn return_hilo(&self, request: &HiLoReturnRequest) -> ClientResult<()> {
        self.hilo_returns.lock().push(request.clone());
        Ok(())
    }

    fn get_operation_state(&self, id: i64) -> ClientResult<OperationState> {
        let mut states = self.operation_states.lock();
        let state = if states.len() > 1 {
            states.pop_front()
        } else {
            states.front().cloned()
        };
        state.ok_or_else(|| ClientError::Protocol(format!("no mock state for operation {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docstore_protocol::CommandData;
    use serde_json::json;

    #[test]
    fn registry_creates_once_per_database() {
        let created = Arc::new(AtomicI64::new(0));
        let counter = Arc::clone(&created);
        let registry = ExecutorRegistry::new("main", move |db| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockExecutor::new(db)) as Arc<dyn RequestExecutor>)
        });

        let a = registry.for_database("").unwrap();
        let b = registry.for_database("main").unwrap();
        let c = registry.for_database("archive").unwrap();

        assert_eq!(a.database(), "main");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(c.database(), "archive");
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn mock_records_batches_and_fails_once() {
        let mock = MockExecutor::new("db");
        let batch = BatchRequest::new(vec![CommandData::put(
            "a/1",
            None,
            json!({"x": 1}),
            serde_json::Map::new(),
        )
        .unwrap()]);

        mock.fail_next_batch(ClientError::concurrency("stale", vec!["a/1".into()]));
        assert!(mock.batch(&batch, None).unwrap_err().is_concurrency());

        let response = mock.batch(&batch, None).unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].id.as_deref(), Some("a/1"));
        assert_eq!(mock.batches().len(), 2);
    }

    #[test]
    fn mock_hilo_ranges_are_consecutive() {
        let mock = MockExecutor::new("db").with_hilo_range_size(10);
        let request = NextHiLoRequest {
            tag: "users".into(),
            last_batch_size: 0,
            last_range_at: None,
            identity_parts_separator: '/',
            last_max: 0,
        };
        let first = mock.next_hilo(&request).unwrap();
        let second = mock.next_hilo(&request).unwrap();
        assert_eq!((first.low, first.high), (1, 10));
        assert_eq!((second.low, second.high), (11, 20));
        assert_eq!(first.prefix, "users/");
    }
}
