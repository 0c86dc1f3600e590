//! Unit-of-work session.
//!
//! A [`DocumentSession`] tracks loaded and stored entities, deletions,
//! explicitly deferred commands and compare-exchange values. Nothing is sent
//! to the server until [`DocumentSession::save_changes`], which turns the
//! accumulated state into one atomic batch:
//!
//! 1. Deletes, in the order they were requested.
//! 2. Puts for new or modified entities, in tracking order.
//! 3. Compare-exchange commands, in key first-touch order.
//! 4. Deferred commands, in the order they were deferred.
//!
//! An explicitly deferred command for an id suppresses the Delete (any
//! deferred command) or Put (any non-attachment deferred command) the session
//! would have generated for that id.
//!
//! If the batch fails, the session is left exactly as it was before the call.

mod cluster;
mod diff;
mod document_info;
mod save_changes;

pub use cluster::ClusterTransactionOperations;
pub use diff::{ChangeType, DocumentChangeDetail};
pub use document_info::ConcurrencyCheckMode;
pub use save_changes::{SaveChangesData, SaveChangesResult};

use crate::cancellation::CancellationToken;
use crate::compare_exchange::CompareExchangeSessionValue;
use crate::config::DocumentConventions;
use crate::document::Document;
use crate::error::{ClientError, ClientResult};
use crate::executor::{RequestExecutor, SessionInfo};
use crate::hilo::DocumentIdGenerator;
use docstore_protocol::{
    CommandData, CommandMatcher, IdTypeAndName, TransactionMode,
};
use document_info::DocumentInfo;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

/// A pending deletion.
#[derive(Debug, Clone, Default)]
struct DeletedEntity {
    /// Change vector the caller required, if any.
    expected_change_vector: Option<String>,
}

/// Unit of work over one database.
///
/// Not `Sync`: a session belongs to one logical task at a time.
pub struct DocumentSession {
    id: Uuid,
    database: String,
    executor: Arc<dyn RequestExecutor>,
    conventions: Arc<DocumentConventions>,
    id_generator: Option<Arc<dyn DocumentIdGenerator>>,
    transaction_mode: TransactionMode,
    cancellation: Option<CancellationToken>,
    number_of_requests: u32,
    documents: IndexMap<String, DocumentInfo>,
    deleted: IndexMap<String, DeletedEntity>,
    known_missing: HashSet<String>,
    deferred: IndexMap<IdTypeAndName, CommandData>,
    compare_exchange: IndexMap<String, CompareExchangeSessionValue>,
}

impl DocumentSession {
    /// Creates a session over `executor`.
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        conventions: Arc<DocumentConventions>,
        transaction_mode: TransactionMode,
    ) -> Self {
        let database = executor.database().to_string();
        let id = Uuid::new_v4();
        debug!(session = %id, database = %database, ?transaction_mode, "session opened");
        Self {
            id,
            database,
            executor,
            conventions,
            id_generator: None,
            transaction_mode,
            cancellation: None,
            number_of_requests: 0,
            documents: IndexMap::new(),
            deleted: IndexMap::new(),
            known_missing: HashSet::new(),
            deferred: IndexMap::new(),
            compare_exchange: IndexMap::new(),
        }
    }

    /// Sets the generator used for entities stored without an id.
    pub fn with_id_generator(mut self, generator: Arc<dyn DocumentIdGenerator>) -> Self {
        self.id_generator = Some(generator);
        self
    }

    /// Attaches a cancellation token checked before every server call.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Returns the session id sent with every request.
    pub fn session_id(&self) -> Uuid {
        self.id
    }

    /// Returns the target database.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns the transaction mode.
    pub fn transaction_mode(&self) -> TransactionMode {
        self.transaction_mode
    }

    /// Returns the conventions in effect.
    pub fn conventions(&self) -> &DocumentConventions {
        &self.conventions
    }

    /// Returns how many server calls this session has made.
    pub fn number_of_requests(&self) -> u32 {
        self.number_of_requests
    }


    /// Loads an entity, serving tracked entities from the session.
    ///
    /// Returns `None` for ids deleted in this session or known to be
    /// missing on the server.
    pub fn load<T: Document>(&mut self, id: &str) -> ClientResult<Option<T>> {
        if id.is_empty() {
            return Err(ClientError::IllegalArgument("id cannot be empty".into()));
        }
        if self.deleted.contains_key(id) {
            return Ok(None);
        }
        if let Some(info) = self.documents.get(id) {
            return Ok(Some(serde_json::from_value(info.entity.clone())?));
        }
        if self.is_known_missing(id) {
            return Ok(None);
        }

        let mut loaded = self.fetch_documents(&[id.to_string()])?;
        match loaded.pop() {
            Some(Some(entity)) => Ok(Some(serde_json::from_value(entity)?)),
            _ => Ok(None),
        }
    }

    /// Loads several entities, fetching all untracked ids in one request.
    pub fn load_many<T: Document>(
        &mut self,
        ids: &[&str],
    ) -> ClientResult<IndexMap<String, Option<T>>> {
        if ids.iter().any(|id| id.is_empty()) {
            return Err(ClientError::IllegalArgument("id cannot be empty".into()));
        }
        let to_fetch: Vec<String> = ids
            .iter()
            .filter(|id| {
                !self.deleted.contains_key(**id)
                    && !self.documents.contains_key(**id)
                    && !self.is_known_missing(id)
            })
            .map(|id| id.to_string())
            .collect::<indexmap::IndexSet<_>>()
            .into_iter()
            .collect();
        if !to_fetch.is_empty() {
            self.fetch_documents(&to_fetch)?;
        }

        let mut results = IndexMap::with_capacity(ids.len());
        for id in ids {
            let entity = match self.documents.get(*id) {
                Some(info) if !self.deleted.contains_key(*id) => {
                    Some(serde_json::from_value(info.entity.clone())?)
                }
                _ => None,
            };
            results.insert(id.to_string(), entity);
        }
        Ok(results)
    }

    fn fetch_documents(&mut self, ids: &[String]) -> ClientResult<Vec<Option<Value>>> {
        self.before_request()?;
        let response = self
            .executor
            .get_documents(ids, Some(&self.session_info()))?;
        if response.results.len() != ids.len() {
            return Err(ClientError::Protocol(format!(
                "expected {} documents, got {}",
                ids.len(),
                response.results.len()
            )));
        }

        let mut entities = Vec::with_capacity(ids.len());
        for (id, document) in ids.iter().zip(response.results) {
            match document {
                None => {
                    trace!(id = %id, "document missing on server");
                    self.known_missing.insert(id.to_lowercase());
                    entities.push(None);
                }
                Some(document) => {
                    let info = DocumentInfo::from_server(id, document)?;
                    entities.push(Some(info.entity.clone()));
                    self.documents.insert(id.clone(), info);
                }
            }
        }
        Ok(entities)
    }

    fn is_known_missing(&self, id: &str) -> bool {
        self.known_missing.contains(&id.to_lowercase())
    }


    /// Stores a new entity under a generated id and returns the id.
    ///
    /// The Put is sent with an empty change vector so the server rejects
    /// it if the id is already taken.
    pub fn store<T: Document>(&mut self, entity: &T) -> ClientResult<String> {
        let collection = self.collection_for::<T>();
        let id = self.generate_id(&collection)?;
        self.store_internal(
            id.clone(),
            collection,
            serde_json::to_value(entity)?,
            None,
            ConcurrencyCheckMode::Forced,
        )?;
        Ok(id)
    }

    /// Stores an entity under `id`. An empty id generates one.
    pub fn store_with_id<T: Document>(&mut self, entity: &T, id: &str) -> ClientResult<String> {
        if id.is_empty() {
            return self.store(entity);
        }
        let collection = self.collection_for::<T>();
        self.store_internal(
            id.to_string(),
            collection,
            serde_json::to_value(entity)?,
            None,
            ConcurrencyCheckMode::Auto,
        )?;
        Ok(id.to_string())
    }

    /// Stores an entity under `id` with an explicit concurrency check.
    ///
    /// `Some(cv)` forces the server to match `cv`; `None` disables the
    /// check for this entity.
    pub fn store_with_change_vector<T: Document>(
        &mut self,
        entity: &T,
        change_vector: Option<String>,
        id: &str,
    ) -> ClientResult<String> {
        let collection = self.collection_for::<T>();
        let id = if id.is_empty() {
            self.generate_id(&collection)?
        } else {
            id.to_string()
        };
        let mode = if change_vector.is_some() {
            ConcurrencyCheckMode::Forced
        } else {
            ConcurrencyCheckMode::Disabled
        };
        self.store_internal(
            id.clone(),
            collection,
            serde_json::to_value(entity)?,
            change_vector,
            mode,
        )?;
        Ok(id)
    }

    fn store_internal(
        &mut self,
        id: String,
        collection: String,
        entity: Value,
        change_vector: Option<String>,
        mode: ConcurrencyCheckMode,
    ) -> ClientResult<()> {
        if !entity.is_object() {
            return Err(ClientError::IllegalArgument(format!(
                "entity '{id}' must serialize to a JSON object"
            )));
        }
        let was_deleted = self.deleted.shift_remove(&id).is_some();
        self.known_missing.remove(&id.to_lowercase());

        match self.documents.get_mut(&id) {
            Some(info) => {
                info.entity = entity;
                info.concurrency_check = mode;
                if change_vector.is_some() {
                    info.change_vector = change_vector;
                }
                info.force_put |= was_deleted;
            }
            None => {
                trace!(id = %id, collection = %collection, "tracking new entity");
                let info =
                    DocumentInfo::new_entity(id.clone(), collection, entity, change_vector, mode);
                self.documents.insert(id, info);
            }
        }
        Ok(())
    }

    /// Applies `update` to a tracked or loadable entity.
    ///
    /// Returns `false` when the entity does not exist.
    pub fn update<T, F>(&mut self, id: &str, update: F) -> ClientResult<bool>
    where
        T: Document,
        F: FnOnce(&mut T),
    {
        let Some(mut entity) = self.load::<T>(id)? else {
            return Ok(false);
        };
        update(&mut entity);
        let value = serde_json::to_value(&entity)?;
        match self.documents.get_mut(id) {
            Some(info) => info.entity = value,
            None => return Err(ClientError::illegal_state(format!("'{id}' is not tracked"))),
        }
        Ok(true)
    }

    fn collection_for<T: Document>(&self) -> String {
        let type_name = std::any::type_name::<T>();
        self.conventions.collection_name(type_name, T::COLLECTION)
    }

    fn generate_id(&mut self, collection: &str) -> ClientResult<String> {
        if let Some(id) = self.conventions.custom_document_id(&self.database, collection) {
            return Ok(id);
        }
        match &self.id_generator {
            Some(generator) => generator.generate_document_id(&self.database, collection),
            None => Err(ClientError::illegal_state(
                "no document id generator is configured for this session",
            )),
        }
    }


    /// Marks `id` for deletion.
    ///
    /// Untracked ids are deleted blindly. With optimistic concurrency on,
    /// tracked ids carry their last-seen change vector.
    pub fn delete(&mut self, id: &str) -> ClientResult<()> {
        self.delete_internal(id, None)
    }

    /// Marks `id` for deletion, requiring the server copy to match `change_vector`.
    pub fn delete_with_change_vector(&mut self, id: &str, change_vector: &str) -> ClientResult<()> {
        self.delete_internal(id, Some(change_vector.to_string()))
    }

    fn delete_internal(&mut self, id: &str, expected: Option<String>) -> ClientResult<()> {
        if id.is_empty() {
            return Err(ClientError::IllegalArgument("id cannot be empty".into()));
        }
        trace!(id = %id, "marking for deletion");
        let entry = self.deleted.entry(id.to_string()).or_default();
        if expected.is_some() {
            entry.expected_change_vector = expected;
        }
        Ok(())
    }

    /// Returns `true` if `id` is marked for deletion.
    pub fn is_deleted(&self, id: &str) -> bool {
        self.deleted.contains_key(id)
    }

    /// Returns `true` if `id` is tracked and not marked for deletion.
    pub fn is_loaded(&self, id: &str) -> bool {
        self.documents.contains_key(id) && !self.deleted.contains_key(id)
    }


    /// Queues raw commands to run after the session's own commands.
    ///
    /// A later command with the same `(id, type, name)` replaces an earlier one.
    pub fn defer(&mut self, commands: impl IntoIterator<Item = CommandData>) {
        for command in commands {
            trace!(id = %command.id(), kind = command.command_type().wire_tag(), "deferring command");
            self.deferred.insert(command.key(), command);
        }
    }

    /// Returns the deferred command matching `id` and `matcher`, if any.
    ///
    /// The most recently deferred match wins.
    pub fn deferred_command(&self, id: &str, matcher: CommandMatcher) -> Option<&CommandData> {
        self.deferred
            .iter()
            .rev()
            .find(|(key, _)| key.matches(id, matcher))
            .map(|(_, command)| command)
    }

    /// Returns the number of deferred commands.
    pub fn number_of_deferred_commands(&self) -> usize {
        self.deferred.len()
    }

    fn has_deferred(&self, id: &str, matcher: CommandMatcher) -> bool {
        self.deferred.keys().any(|key| key.matches(id, matcher))
    }


    /// Stops tracking `id`; pending changes to it are dropped.
    pub fn evict(&mut self, id: &str) {
        self.documents.shift_remove(id);
        self.deleted.shift_remove(id);
        self.known_missing.remove(&id.to_lowercase());
    }

    /// Drops all tracked state, deferred commands included.
    pub fn clear(&mut self) {
        self.documents.clear();
        self.deleted.clear();
        self.known_missing.clear();
        self.deferred.clear();
        self.compare_exchange.clear();
    }

    /// Excludes `id` from change detection until it is evicted.
    pub fn ignore_changes_for(&mut self, id: &str) -> ClientResult<()> {
        match self.documents.get_mut(id) {
            Some(info) => {
                info.ignore_changes = true;
                Ok(())
            }
            None => Err(ClientError::illegal_state(format!("'{id}' is not tracked"))),
        }
    }

    /// Returns the number of tracked entities.
    pub fn number_of_tracked_entities(&self) -> usize {
        self.documents.len()
    }

    /// Returns the last known change vector of a tracked entity.
    pub fn change_vector_for(&self, id: &str) -> Option<&str> {
        self.documents
            .get(id)
            .and_then(|info| info.change_vector.as_deref())
    }

    /// Returns the metadata of a tracked entity.
    pub fn metadata_for(&self, id: &str) -> Option<&Map<String, Value>> {
        self.documents.get(id).map(|info| &info.metadata)
    }

    /// Sets one metadata entry on a tracked entity.
    ///
    /// Server-owned keys (`@id`, `@change-vector`, `@last-modified`) are rejected.
    pub fn set_metadata(&mut self, id: &str, key: &str, value: Value) -> ClientResult<()> {
        if DocumentInfo::is_server_metadata(key) {
            return Err(ClientError::IllegalArgument(format!(
                "metadata key '{key}' is reserved"
            )));
        }
        match self.documents.get_mut(id) {
            Some(info) => {
                info.metadata.insert(key.to_string(), value);
                Ok(())
            }
            None => Err(ClientError::illegal_state(format!("'{id}' is not tracked"))),
        }
    }

    /// Returns `true` if a save would send any command.
    pub fn has_changes(&self) -> bool {
        if !self.deleted.is_empty() || !self.deferred.is_empty() {
            return true;
        }
        if self
            .documents
            .values()
            .any(|info| !info.ignore_changes && info.is_dirty())
        {
            return true;
        }
        self.compare_exchange.values().any(|value| {
            let mut pending = value.clone();
            matches!(pending.get_command(), Ok(Some(_)) | Err(_))
        })
    }

    /// Returns `true` if the tracked entity `id` has unsaved changes.
    pub fn has_changed(&self, id: &str) -> bool {
        self.deleted.contains_key(id)
            || self
                .documents
                .get(id)
                .is_some_and(|info| !info.ignore_changes && info.is_dirty())
    }

    /// Describes every pending change, keyed by document id.
    pub fn what_changed(&self) -> IndexMap<String, Vec<DocumentChangeDetail>> {
        let mut changes = IndexMap::new();
        for id in self.deleted.keys() {
            changes.insert(
                id.clone(),
                vec![DocumentChangeDetail::document(ChangeType::DocumentDeleted)],
            );
        }
        for (id, info) in &self.documents {
            if info.ignore_changes || self.deleted.contains_key(id) || !info.is_dirty() {
                continue;
            }
            let details = match &info.persisted {
                Some((entity, meta)) if !info.force_put => {
                    let mut details = diff::diff_documents(entity, &info.entity);
                    details.extend(diff::diff_metadata(meta, &info.metadata));
                    details
                }
                // New, or stored again after a delete.
                _ => vec![DocumentChangeDetail::document(ChangeType::DocumentAdded)],
            };
            if !details.is_empty() {
                changes.insert(id.clone(), details);
            }
        }
        changes
    }


    /// Returns the compare-exchange operations of this session.
    ///
    /// Fails unless the session was opened in cluster-wide mode.
    pub fn cluster_transaction(&mut self) -> ClientResult<ClusterTransactionOperations<'_>> {
        if self.transaction_mode != TransactionMode::ClusterWide {
            return Err(ClientError::illegal_state(
                "compare-exchange operations require a cluster-wide session",
            ));
        }
        Ok(ClusterTransactionOperations::new(self))
    }


    pub(crate) fn session_info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            database: self.database.clone(),
        }
    }

    /// Checks cancellation and the per-session request budget.
    pub(crate) fn before_request(&mut self) -> ClientResult<()> {
        if let Some(token) = &self.cancellation {
            token.check_cancelled()?;
        }
        self.number_of_requests += 1;
        let max = self.conventions.max_number_of_requests_per_session;
        if self.number_of_requests > max {
            return Err(ClientError::illegal_state(format!(
                "the maximum number of requests ({max}) allowed for this session has been reached"
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentSession")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("transaction_mode", &self.transaction_mode)
            .field("documents", &self.documents.len())
            .field("deleted", &self.deleted.len())
            .field("deferred", &self.deferred.len())
            .field("compare_exchange", &self.compare_exchange.len())
            .field("number_of_requests", &self.number_of_requests)
            .finish()
    }
}
