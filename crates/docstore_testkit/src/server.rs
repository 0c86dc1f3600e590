//! In-memory document server.
//!
//! Implements [`RequestExecutor`] directly so sessions can run against it
//! without a network. Batches are validated in full before anything is
//! committed, so a concurrency violation leaves the server unchanged.

use docstore_client::{
    ClientError, ClientResult, DatabaseConnectionState, RequestExecutor, SessionInfo,
};
use docstore_protocol::{
    metadata, BatchRequest, BatchResponse, BatchResultItem, ChangeNotification, CommandData,
    CommandPayload, CompareExchangeResultItem, CompareExchangeValue, DocumentChange,
    GetCompareExchangeValuesResponse, GetDocumentsResponse, HiLoResult, HiLoReturnRequest,
    NextHiLoRequest, OperationState, PatchRequest,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Default size of leased HiLo ranges.
pub const DEFAULT_HILO_RANGE_SIZE: i64 = 32;

/// Server tag appended to generated ids.
pub const SERVER_TAG: &str = "A";

#[derive(Debug, Clone)]
struct StoredDocument {
    id: String,
    body: Map<String, Value>,
    metadata: Map<String, Value>,
    change_vector: String,
    attachments: Vec<String>,
}

impl StoredDocument {
    fn to_json(&self) -> Value {
        let mut meta = self.metadata.clone();
        meta.insert(metadata::ID.into(), Value::String(self.id.clone()));
        meta.insert(
            metadata::CHANGE_VECTOR.into(),
            Value::String(self.change_vector.clone()),
        );
        if !self.attachments.is_empty() {
            meta.insert(
                "@attachments".into(),
                Value::Array(self.attachments.iter().cloned().map(Value::String).collect()),
            );
        }
        let mut body = self.body.clone();
        body.insert(metadata::METADATA.into(), Value::Object(meta));
        Value::Object(body)
    }

    fn collection(&self) -> Option<String> {
        self.metadata
            .get(metadata::COLLECTION)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Default)]
struct ServerState {
    etag: i64,
    /// Keyed by lowercased id.
    documents: HashMap<String, StoredDocument>,
    compare_exchange: HashMap<String, CompareExchangeValue>,
}

/// Request counters.
#[derive(Debug, Default)]
pub struct RequestCounters {
    /// Batches received, failed ones included.
    pub batches: AtomicU64,
    /// Document loads.
    pub document_reads: AtomicU64,
    /// Compare-exchange loads.
    pub compare_exchange_reads: AtomicU64,
    /// HiLo range leases.
    pub hilo_leases: AtomicU64,
    /// Operation state polls.
    pub operation_polls: AtomicU64,
}

impl RequestCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads a counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// In-memory server for one database.
pub struct InMemoryServer {
    database: String,
    hilo_range_size: i64,
    state: Mutex<ServerState>,
    hilo_highs: Mutex<HashMap<String, i64>>,
    hilo_returns: Mutex<Vec<HiLoReturnRequest>>,
    operations: Mutex<HashMap<i64, VecDeque<OperationState>>>,
    next_operation: AtomicI64,
    subscribers: Mutex<Vec<Arc<DatabaseConnectionState>>>,
    sessions: Mutex<HashSet<String>>,
    counters: RequestCounters,
}

impl InMemoryServer {
    /// Creates an empty server for `database`.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            hilo_range_size: DEFAULT_HILO_RANGE_SIZE,
            state: Mutex::new(ServerState::default()),
            hilo_highs: Mutex::new(HashMap::new()),
            hilo_returns: Mutex::new(Vec::new()),
            operations: Mutex::new(HashMap::new()),
            next_operation: AtomicI64::new(1),
            subscribers: Mutex::new(Vec::new()),
            sessions: Mutex::new(HashSet::new()),
            counters: RequestCounters::default(),
        }
    }

    /// Sets the size of leased HiLo ranges.
    pub fn with_hilo_range_size(mut self, size: i64) -> Self {
        self.hilo_range_size = size;
        self
    }

    /// Returns the request counters.
    pub fn counters(&self) -> &RequestCounters {
        &self.counters
    }

    /// Returns the number of stored documents.
    pub fn document_count(&self) -> usize {
        self.state.lock().documents.len()
    }

    /// Returns a stored document with its `@metadata`.
    pub fn document(&self, id: &str) -> Option<Value> {
        self.state
            .lock()
            .documents
            .get(&id.to_lowercase())
            .map(StoredDocument::to_json)
    }

    /// Returns the change vector of a stored document.
    pub fn change_vector(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .documents
            .get(&id.to_lowercase())
            .map(|document| document.change_vector.clone())
    }

    /// Returns a stored compare-exchange value.
    pub fn compare_exchange(&self, key: &str) -> Option<CompareExchangeValue> {
        self.state.lock().compare_exchange.get(key).cloned()
    }

    /// Writes a document as another client would and returns its change vector.
    pub fn put_document(&self, id: &str, collection: &str, body: Value) -> String {
        let change_vector = {
            let mut state = self.state.lock();
            let mut meta = Map::new();
            meta.insert(metadata::COLLECTION.into(), Value::String(collection.into()));
            let body = match body {
                Value::Object(body) => body,
                other => {
                    let mut wrapped = Map::new();
                    wrapped.insert("Value".into(), other);
                    wrapped
                }
            };
            let change_vector = self.next_change_vector(&mut state);
            state.documents.insert(
                id.to_lowercase(),
                StoredDocument {
                    id: id.to_string(),
                    body,
                    metadata: meta,
                    change_vector: change_vector.clone(),
                    attachments: Vec::new(),
                },
            );
            change_vector
        };
        self.notify(vec![DocumentChange {
            collection: Some(collection.to_string()),
            change_vector: Some(change_vector.clone()),
            ..DocumentChange::put(id)
        }]);
        change_vector
    }

    /// Writes a compare-exchange value as another client would; returns its index.
    pub fn put_compare_exchange(&self, key: &str, value: Value) -> i64 {
        let mut state = self.state.lock();
        state.etag += 1;
        let index = state.etag;
        state
            .compare_exchange
            .insert(key.to_string(), CompareExchangeValue::new(key, index, value));
        index
    }

    /// Queues the states successive polls of a new operation will see.
    ///
    /// The last state repeats once the queue drains.
    pub fn schedule_operation(&self, states: impl IntoIterator<Item = OperationState>) -> i64 {
        let id = self.next_operation.fetch_add(1, Ordering::SeqCst);
        self.operations
            .lock()
            .insert(id, states.into_iter().collect());
        id
    }

    /// Returns every HiLo range returned by clients.
    pub fn hilo_returns(&self) -> Vec<HiLoReturnRequest> {
        self.hilo_returns.lock().clone()
    }

    /// Returns the number of distinct session ids seen.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Forwards document change notifications to `state`.
    pub fn subscribe(&self, state: Arc<DatabaseConnectionState>) {
        state.connected();
        self.subscribers.lock().push(state);
    }

    fn notify(&self, changes: Vec<DocumentChange>) {
        let subscribers = self.subscribers.lock().clone();
        for change in changes {
            let notification = ChangeNotification::Document(change);
            for subscriber in &subscribers {
                subscriber.send(&notification);
            }
        }
    }

    fn record_session(&self, session: Option<&SessionInfo>) {
        if let Some(session) = session {
            self.sessions.lock().insert(session.session_id.to_string());
        }
    }

    fn next_change_vector(&self, state: &mut ServerState) -> String {
        state.etag += 1;
        format!("{SERVER_TAG}:{}-{}", state.etag, self.database)
    }

    /// Applies one command to `state`, collecting conflicting ids.
    fn apply(
        &self,
        state: &mut ServerState,
        command: &CommandData,
        conflicts: &mut Vec<String>,
        changes: &mut Vec<DocumentChange>,
    ) -> ClientResult<BatchResultItem> {
        let mut item = BatchResultItem::new(command.command_type());
        let key = command.id().to_lowercase();

        match command.payload() {
            CommandPayload::Put { document } => {
                let existing = state.documents.get(&key);
                if !change_vector_matches(command.change_vector(), existing) {
                    conflicts.push(command.id().to_string());
                    return Ok(item);
                }
                let Value::Object(mut body) = document.clone() else {
                    return Err(ClientError::ServerError(format!(
                        "document '{}' is not an object",
                        command.id()
                    )));
                };
                let mut meta = match body.remove(metadata::METADATA) {
                    Some(Value::Object(meta)) => meta,
                    _ => Map::new(),
                };
                for reserved in [metadata::ID, metadata::CHANGE_VECTOR, metadata::LAST_MODIFIED] {
                    meta.remove(reserved);
                }
                let attachments = existing
                    .map(|document| document.attachments.clone())
                    .unwrap_or_default();
                let change_vector = self.next_change_vector(state);
                let stored = StoredDocument {
                    id: command.id().to_string(),
                    body,
                    metadata: meta,
                    change_vector: change_vector.clone(),
                    attachments,
                };
                item.id = Some(stored.id.clone());
                item.collection = stored.collection();
                item.change_vector = Some(change_vector.clone());
                changes.push(DocumentChange {
                    collection: stored.collection(),
                    change_vector: Some(change_vector),
                    ..DocumentChange::put(command.id())
                });
                state.documents.insert(key, stored);
            }
            CommandPayload::Delete => {
                let existing = state.documents.get(&key);
                if existing.is_some() && !change_vector_matches(command.change_vector(), existing) {
                    conflicts.push(command.id().to_string());
                    return Ok(item);
                }
                item.id = Some(command.id().to_string());
                item.deleted = Some(state.documents.remove(&key).is_some());
                if item.deleted == Some(true) {
                    changes.push(DocumentChange::delete(command.id()));
                }
            }
            CommandPayload::Patch {
                patch,
                patch_if_missing,
            } => {
                let existing = state.documents.get(&key);
                if existing.is_some() && !change_vector_matches(command.change_vector(), existing)
                {
                    conflicts.push(command.id().to_string());
                    return Ok(item);
                }
                item.id = Some(command.id().to_string());
                let change_vector = self.next_change_vector(state);
                if let Some(document) = state.documents.get_mut(&key) {
                    apply_patch(&mut document.body, patch);
                    document.change_vector = change_vector.clone();
                } else {
                    let Some(if_missing) = patch_if_missing else {
                        return Ok(item);
                    };
                    let mut body = Map::new();
                    apply_patch(&mut body, if_missing);
                    state.documents.insert(
                        key,
                        StoredDocument {
                            id: command.id().to_string(),
                            body,
                            metadata: Map::new(),
                            change_vector: change_vector.clone(),
                            attachments: Vec::new(),
                        },
                    );
                }
                item.change_vector = Some(change_vector);
                changes.push(DocumentChange::put(command.id()));
            }
            CommandPayload::AttachmentPut { .. } | CommandPayload::AttachmentDelete => {
                let change_vector = self.next_change_vector(state);
                let Some(document) = state.documents.get_mut(&key) else {
                    return Err(ClientError::ServerError(format!(
                        "document '{}' does not exist",
                        command.id()
                    )));
                };
                let name = command.name().unwrap_or_default().to_string();
                document.attachments.retain(|existing| *existing != name);
                if matches!(command.payload(), CommandPayload::AttachmentPut { .. }) {
                    document.attachments.push(name);
                }
                document.change_vector = change_vector.clone();
                item.id = Some(command.id().to_string());
                item.change_vector = Some(change_vector);
            }
            CommandPayload::CompareExchangePut {
                index,
                value,
                metadata: value_metadata,
            } => {
                let current = state
                    .compare_exchange
                    .get(command.id())
                    .map_or(0, |existing| existing.index);
                item.key = Some(command.id().to_string());
                if current != *index {
                    conflicts.push(command.id().to_string());
                    return Ok(item);
                }
                state.etag += 1;
                let new_index = state.etag;
                let mut stored = CompareExchangeValue::new(command.id(), new_index, value.clone());
                stored.metadata = value_metadata.clone();
                state
                    .compare_exchange
                    .insert(command.id().to_string(), stored);
                item.index = Some(new_index);
            }
            CommandPayload::CompareExchangeDelete { index } => {
                item.key = Some(command.id().to_string());
                match state.compare_exchange.get(command.id()) {
                    Some(existing) if existing.index == *index => {
                        state.compare_exchange.remove(command.id());
                        state.etag += 1;
                        item.index = Some(state.etag);
                        item.deleted = Some(true);
                    }
                    _ => conflicts.push(command.id().to_string()),
                }
            }
        }
        Ok(item)
    }
}

/// `None` skips the check; `""` requires absence; anything else must match.
fn change_vector_matches(expected: Option<&str>, existing: Option<&StoredDocument>) -> bool {
    match (expected, existing) {
        (None, _) => true,
        (Some(""), existing) => existing.is_none(),
        (Some(_), None) => false,
        (Some(expected), Some(document)) => document.change_vector == expected,
    }
}

/// Patches assign each named value to the field of the same name.
fn apply_patch(body: &mut Map<String, Value>, patch: &PatchRequest) {
    trace!(script = %patch.script, "applying patch");
    for (name, value) in &patch.values {
        body.insert(name.clone(), value.clone());
    }
}

impl RequestExecutor for InMemoryServer {
    fn database(&self) -> &str {
        &self.database
    }

    fn batch(
        &self,
        request: &BatchRequest,
        session: Option<&SessionInfo>,
    ) -> ClientResult<BatchResponse> {
        RequestCounters::bump(&self.counters.batches);
        self.record_session(session);

        let mut changes = Vec::new();
        let results = {
            let mut state = self.state.lock();
            let mut staged = state.clone();
            let mut conflicts = Vec::new();
            let mut results = Vec::with_capacity(request.commands.len());
            for command in &request.commands {
                results.push(self.apply(&mut staged, command, &mut conflicts, &mut changes)?);
            }
            if !conflicts.is_empty() {
                debug!(?conflicts, "batch rejected");
                return Err(ClientError::concurrency(
                    "optimistic concurrency violation",
                    conflicts,
                ));
            }
            *state = staged;
            results
        };
        debug!(commands = results.len(), mode = ?request.transaction_mode, "batch committed");
        self.notify(changes);
        Ok(BatchResponse { results })
    }

    fn get_documents(
        &self,
        ids: &[String],
        session: Option<&SessionInfo>,
    ) -> ClientResult<GetDocumentsResponse> {
        RequestCounters::bump(&self.counters.document_reads);
        self.record_session(session);
        let state = self.state.lock();
        Ok(GetDocumentsResponse {
            results: ids
                .iter()
                .map(|id| {
                    state
                        .documents
                        .get(&id.to_lowercase())
                        .map(StoredDocument::to_json)
                })
                .collect(),
        })
    }

    fn get_compare_exchange_values(
        &self,
        keys: &[String],
        session: Option<&SessionInfo>,
    ) -> ClientResult<GetCompareExchangeValuesResponse> {
        RequestCounters::bump(&self.counters.compare_exchange_reads);
        self.record_session(session);
        let state = self.state.lock();
        Ok(GetCompareExchangeValuesResponse {
            results: keys
                .iter()
                .filter_map(|key| state.compare_exchange.get(key))
                .map(CompareExchangeResultItem::from_value)
                .collect(),
        })
    }

    fn next_hilo(&self, request: &NextHiLoRequest) -> ClientResult<HiLoResult> {
        RequestCounters::bump(&self.counters.hilo_leases);
        let mut highs = self.hilo_highs.lock();
        let high = highs.entry(request.tag.clone()).or_insert(0);
        let low = *high + 1;
        *high += self.hilo_range_size;
        trace!(tag = %request.tag, low, high = *high, "leasing hilo range");
        Ok(HiLoResult {
            prefix: format!("{}{}", request.tag, request.identity_parts_separator),
            low,
            high: *high,
            last_size: self.hilo_range_size,
            server_tag: SERVER_TAG.into(),
            last_range_at: None,
        })
    }

    fn return_hilo(&self, request: &HiLoReturnRequest) -> ClientResult<()> {
        self.hilo_returns.lock().push(request.clone());
        let mut highs = self.hilo_highs.lock();
        if let Some(high) = highs.get_mut(&request.tag) {
            if *high == request.end && request.last < request.end {
                *high = request.last;
            }
        }
        Ok(())
    }

    fn get_operation_state(&self, id: i64) -> ClientResult<OperationState> {
        RequestCounters::bump(&self.counters.operation_polls);
        let mut operations = self.operations.lock();
        let Some(states) = operations.get_mut(&id) else {
            return Err(ClientError::ServerError(format!("operation {id} not found")));
        };
        let state = if states.len() > 1 {
            states.pop_front()
        } else {
            states.front().cloned()
        };
        state.ok_or_else(|| ClientError::ServerError(format!("operation {id} has no state")))
    }
}

impl std::fmt::Debug for InMemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryServer")
            .field("database", &self.database)
            .field("documents", &self.document_count())
            .finish_non_exhaustive()
    }
}
