//! Test fixtures: entities, stores and tracing setup.

use crate::server::InMemoryServer;
use docstore_client::{Document, DocumentConventions, DocumentStore, ExecutorRegistry, RequestExecutor};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

/// Database name used by [`test_store`].
pub const TEST_DATABASE: &str = "testdb";

/// A user entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: String,
    /// Age in years.
    pub age: u32,
}

impl Document for User {
    const COLLECTION: &'static str = "Users";
}

impl User {
    /// Creates a user.
    pub fn new(name: &str, age: u32) -> Self {
        Self {
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            age,
        }
    }
}

/// An order line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    /// Product id.
    pub product: String,
    /// Quantity.
    pub quantity: u32,
}

/// An order entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Id of the ordering company.
    pub company: String,
    /// Order lines.
    pub lines: Vec<OrderLine>,
    /// Total in cents.
    pub total: i64,
}

impl Document for Order {
    const COLLECTION: &'static str = "Orders";
}

impl Order {
    /// A small order with one line.
    pub fn sample() -> Self {
        Self {
            company: "companies/1-A".into(),
            lines: vec![OrderLine {
                product: "products/1-A".into(),
                quantity: 2,
            }],
            total: 2_000,
        }
    }
}

static TRACING: Once = Once::new();

/// Installs a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Creates a server and a store over it with default conventions.
pub fn test_store() -> (Arc<InMemoryServer>, DocumentStore) {
    test_store_with(DocumentConventions::default())
}

/// Creates a server and a store over it with `conventions`.
pub fn test_store_with(conventions: DocumentConventions) -> (Arc<InMemoryServer>, DocumentStore) {
    init_tracing();
    let server = Arc::new(InMemoryServer::new(TEST_DATABASE));
    let executor: Arc<dyn RequestExecutor> = server.clone();
    let store = DocumentStore::new(ExecutorRegistry::single(executor), conventions);
    (server, store)
}

/// Creates one server per database name, all reachable from one store.
///
/// The first name is the default database.
pub fn multi_database_store(
    databases: &[&str],
) -> (Vec<Arc<InMemoryServer>>, DocumentStore) {
    init_tracing();
    let servers: Vec<Arc<InMemoryServer>> = databases
        .iter()
        .map(|name| Arc::new(InMemoryServer::new(*name)))
        .collect();
    let lookup = servers.clone();
    let default = databases.first().copied().unwrap_or(TEST_DATABASE);
    let registry = ExecutorRegistry::new(default, move |database| {
        lookup
            .iter()
            .find(|server| server.database() == database)
            .map(|server| {
                let executor: Arc<dyn RequestExecutor> = server.clone();
                executor
            })
            .ok_or_else(|| {
                docstore_client::ClientError::IllegalArgument(format!(
                    "unknown database '{database}'"
                ))
            })
    });
    (servers, DocumentStore::new(registry, DocumentConventions::default()))
}
