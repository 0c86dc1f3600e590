//! Document store: the long-lived entry point that opens sessions.

use crate::config::{DocumentConventions, SessionOptions};
use crate::error::{ClientError, ClientResult};
use crate::executor::{ExecutorRegistry, RequestExecutor};
use crate::hilo::{DocumentIdGenerator, MultiDatabaseHiLoIdGenerator};
use crate::operation::Operation;
use crate::session::DocumentSession;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Owns conventions, per-database executors and id generation.
///
/// Thread-safe; share it behind an `Arc` and open one session per unit of
/// work.
pub struct DocumentStore {
    conventions: Arc<DocumentConventions>,
    registry: Arc<ExecutorRegistry>,
    hilo: Arc<MultiDatabaseHiLoIdGenerator>,
    closed: AtomicBool,
}

impl DocumentStore {
    /// Creates a store over `registry`.
    pub fn new(registry: ExecutorRegistry, conventions: DocumentConventions) -> Self {
        let conventions = Arc::new(conventions);
        let registry = Arc::new(registry);
        let hilo = Arc::new(MultiDatabaseHiLoIdGenerator::new(
            Arc::clone(&registry),
            Arc::clone(&conventions),
        ));
        info!(database = %registry.default_database(), "document store initialized");
        Self {
            conventions,
            registry,
            hilo,
            closed: AtomicBool::new(false),
        }
    }

    /// Creates a store over a single executor with default conventions.
    pub fn with_executor(executor: Arc<dyn RequestExecutor>) -> Self {
        Self::new(ExecutorRegistry::single(executor), DocumentConventions::default())
    }

    /// Returns the conventions.
    pub fn conventions(&self) -> &DocumentConventions {
        &self.conventions
    }

    /// Returns the default database.
    pub fn database(&self) -> &str {
        self.registry.default_database()
    }

    /// Returns the executor for `database` (empty for the default).
    pub fn executor_for(&self, database: &str) -> ClientResult<Arc<dyn RequestExecutor>> {
        self.ensure_open()?;
        self.registry.for_database(database)
    }

    /// Opens a single-node session on the default database.
    pub fn open_session(&self) -> ClientResult<DocumentSession> {
        self.open_session_with(SessionOptions::default())
    }

    /// Opens a session with explicit options.
    pub fn open_session_with(&self, options: SessionOptions) -> ClientResult<DocumentSession> {
        self.ensure_open()?;
        let database = options.database.as_deref().unwrap_or_default();
        let executor = self.registry.for_database(database)?;
        let id_generator: Arc<dyn DocumentIdGenerator> = self.hilo.clone();
        Ok(DocumentSession::new(
            executor,
            Arc::clone(&self.conventions),
            options.transaction_mode,
        )
        .with_id_generator(id_generator))
    }

    /// Generates a document id the way a session would.
    pub fn generate_document_id(&self, database: &str, collection: &str) -> ClientResult<String> {
        self.ensure_open()?;
        let database = self.registry.resolve(database).to_string();
        if let Some(id) = self.conventions.custom_document_id(&database, collection) {
            return Ok(id);
        }
        self.hilo.generate_document_id(&database, collection)
    }

    /// Returns a handle on the server operation `id` in `database`.
    pub fn operation(&self, database: &str, id: i64) -> ClientResult<Operation> {
        let executor = self.executor_for(database)?;
        Ok(Operation::new(executor, id).with_poll_interval(self.conventions.operation_poll_interval))
    }

    /// Returns unused HiLo ranges and rejects further use.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) -> ClientResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("returning unused hilo ranges");
        self.hilo.return_unused_range()?;
        info!("document store closed");
        Ok(())
    }

    /// Returns `true` once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }
}

impl fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentStore")
            .field("database", &self.registry.default_database())
            .field("conventions", &self.conventions)
            .field("closed", &self.is_closed())
            .finish()
    }
}
