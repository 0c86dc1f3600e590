//! HiLo document id generation.
//!
//! A generator leases an integer range `[low, high]` from the server and hands
//! out ids from it locally. When the range runs out exactly one caller fetches
//! the next one while the others wait on the generator lock. On shutdown the
//! unused tail is returned so the server can reissue it.

use crate::config::DocumentConventions;
use crate::error::ClientResult;
use crate::executor::{ExecutorRegistry, RequestExecutor};
use dashmap::DashMap;
use docstore_protocol::{HiLoReturnRequest, NextHiLoRequest};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Produces document ids for new entities.
pub trait DocumentIdGenerator: Send + Sync {
    /// Returns a fresh id for an entity of `collection` in `database`.
    fn generate_document_id(&self, database: &str, collection: &str) -> ClientResult<String>;
}

/// A leased range together with the id decoration it was leased with.
#[derive(Debug)]
struct RangeValue {
    min: i64,
    max: i64,
    current: AtomicI64,
    prefix: String,
    server_tag: String,
}

impl RangeValue {
    fn new(min: i64, max: i64, prefix: String, server_tag: String) -> Self {
        Self {
            min,
            max,
            current: AtomicI64::new(min - 1),
            prefix,
            server_tag,
        }
    }

    fn empty() -> Self {
        Self::new(1, 0, String::new(), String::new())
    }

    fn document_id(&self, id: i64) -> String {
        if self.server_tag.is_empty() {
            format!("{}{}", self.prefix, id)
        } else {
            format!("{}{}-{}", self.prefix, id, self.server_tag)
        }
    }
}

#[derive(Debug, Default)]
struct LeaseState {
    last_batch_size: i64,
    last_range_at: Option<String>,
}

/// HiLo generator for one tag in one database.
pub struct HiLoIdGenerator {
    tag: String,
    separator: char,
    executor: Arc<dyn RequestExecutor>,
    range: RwLock<Arc<RangeValue>>,
    lease: Mutex<LeaseState>,
    fetches: AtomicU64,
}

impl HiLoIdGenerator {
    /// Creates a generator; the first id triggers a range fetch.
    pub fn new(tag: impl Into<String>, executor: Arc<dyn RequestExecutor>, separator: char) -> Self {
        Self {
            tag: tag.into(),
            separator,
            executor,
            range: RwLock::new(Arc::new(RangeValue::empty())),
            lease: Mutex::new(LeaseState::default()),
            fetches: AtomicU64::new(0),
        }
    }

    /// Returns the tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns the next id, fetching a new range when the current one is exhausted.
    pub fn next_id(&self) -> ClientResult<i64> {
        self.next_in_range().map(|(id, _)| id)
    }

    /// Returns the next full document id: `{prefix}{id}-{server_tag}`.
    ///
    /// Prefix and server tag come from the range the id was taken from.
    pub fn generate_document_id(&self) -> ClientResult<String> {
        let (id, range) = self.next_in_range()?;
        Ok(range.document_id(id))
    }

    fn next_in_range(&self) -> ClientResult<(i64, Arc<RangeValue>)> {
        loop {
            let range = Arc::clone(&self.range.read());
            let id = range.current.fetch_add(1, Ordering::SeqCst) + 1;
            if id <= range.max {
                return Ok((id, range));
            }

            let mut lease = self.lease.lock();
            if !Arc::ptr_eq(&range, &self.range.read()) {
                // Another caller already replaced the range.
                continue;
            }
            self.fetch_next_range(&mut lease, &range)?;
        }
    }

    /// Returns the unused tail of the current range to the server.
    pub fn return_unused_range(&self) -> ClientResult<()> {
        let range = Arc::clone(&self.range.read());
        if range.max < range.min {
            return Ok(());
        }
        let last = range.current.load(Ordering::SeqCst).min(range.max);
        debug!(tag = %self.tag, last, end = range.max, "returning unused hilo range");
        self.executor.return_hilo(&HiLoReturnRequest {
            tag: self.tag.clone(),
            last,
            end: range.max,
        })
    }

    /// Returns the bounds of the current range.
    pub fn range_bounds(&self) -> (i64, i64) {
        let range = self.range.read();
        (range.min, range.max)
    }

    /// Number of ranges fetched so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn fetch_next_range(&self, lease: &mut LeaseState, previous: &RangeValue) -> ClientResult<()> {
        let request = NextHiLoRequest {
            tag: self.tag.clone(),
            last_batch_size: lease.last_batch_size,
            last_range_at: lease.last_range_at.clone(),
            identity_parts_separator: self.separator,
            last_max: previous.max,
        };
        let result = self.executor.next_hilo(&request)?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        debug!(tag = %self.tag, low = result.low, high = result.high, "leased hilo range");

        lease.last_batch_size = result.last_size;
        lease.last_range_at = result.last_range_at;
        *self.range.write() = Arc::new(RangeValue::new(
            result.low,
            result.high,
            result.prefix,
            result.server_tag,
        ));
        Ok(())
    }
}

impl fmt::Debug for HiLoIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HiLoIdGenerator")
            .field("tag", &self.tag)
            .field("range", &self.range_bounds())
            .field("fetches", &self.fetch_count())
            .finish_non_exhaustive()
    }
}

/// One HiLo generator per tag, for a single database.
pub struct MultiTypeHiLoIdGenerator {
    executor: Arc<dyn RequestExecutor>,
    conventions: Arc<DocumentConventions>,
    generators: DashMap<String, Arc<HiLoIdGenerator>>,
}

impl MultiTypeHiLoIdGenerator {
    /// Creates an empty per-tag registry.
    pub fn new(executor: Arc<dyn RequestExecutor>, conventions: Arc<DocumentConventions>) -> Self {
        Self {
            executor,
            conventions,
            generators: DashMap::new(),
        }
    }

    /// Returns the generator for `tag`, creating it on first use.
    pub fn generator(&self, tag: &str) -> Arc<HiLoIdGenerator> {
        if let Some(existing) = self.generators.get(tag) {
            return Arc::clone(existing.value());
        }
        let entry = self.generators.entry(tag.to_string()).or_insert_with(|| {
            Arc::new(HiLoIdGenerator::new(
                tag,
                Arc::clone(&self.executor),
                self.conventions.identity_parts_separator,
            ))
        });
        Arc::clone(entry.value())
    }

    /// Generates an id for an entity of `collection`.
    pub fn generate_document_id(&self, collection: &str) -> ClientResult<String> {
        let tag = self.conventions.transform_collection_name_to_prefix(collection);
        self.generator(&tag).generate_document_id()
    }

    /// Returns the unused ranges of every tag.
    pub fn return_unused_range(&self) -> ClientResult<()> {
        let generators: Vec<_> = self
            .generators
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for generator in generators {
            generator.return_unused_range()?;
        }
        Ok(())
    }
}

impl fmt::Debug for MultiTypeHiLoIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiTypeHiLoIdGenerator")
            .field("database", &self.executor.database())
            .field("tags", &self.generators.len())
            .finish_non_exhaustive()
    }
}

/// Lazily created per-database HiLo generators.
pub struct MultiDatabaseHiLoIdGenerator {
    registry: Arc<ExecutorRegistry>,
    conventions: Arc<DocumentConventions>,
    generators: DashMap<String, Arc<MultiTypeHiLoIdGenerator>>,
}

impl MultiDatabaseHiLoIdGenerator {
    /// Creates a generator resolving executors through `registry`.
    pub fn new(registry: Arc<ExecutorRegistry>, conventions: Arc<DocumentConventions>) -> Self {
        Self {
            registry,
            conventions,
            generators: DashMap::new(),
        }
    }

    /// Returns the generator for `database`; an empty name means the default database.
    pub fn for_database(&self, database: &str) -> ClientResult<Arc<MultiTypeHiLoIdGenerator>> {
        let database = self.registry.resolve(database);
        if let Some(existing) = self.generators.get(database) {
            return Ok(Arc::clone(existing.value()));
        }
        let executor = self.registry.for_database(database)?;
        let entry = self
            .generators
            .entry(database.to_string())
            .or_insert_with(|| {
                Arc::new(MultiTypeHiLoIdGenerator::new(
                    executor,
                    Arc::clone(&self.conventions),
                ))
            });
        Ok(Arc::clone(entry.value()))
    }

    /// Returns the unused ranges of every database.
    pub fn return_unused_range(&self) -> ClientResult<()> {
        let generators: Vec<_> = self
            .generators
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for generator in generators {
            generator.return_unused_range()?;
        }
        Ok(())
    }
}

impl DocumentIdGenerator for MultiDatabaseHiLoIdGenerator {
    fn generate_document_id(&self, database: &str, collection: &str) -> ClientResult<String> {
        self.for_database(database)?.generate_document_id(collection)
    }
}

impl fmt::Debug for MultiDatabaseHiLoIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiDatabaseHiLoIdGenerator")
            .field("databases", &self.generators.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;
    use std::collections::HashSet;

    fn generator(size: i64) -> (Arc<MockExecutor>, HiLoIdGenerator) {
        let mock = Arc::new(MockExecutor::new("db").with_hilo_range_size(size));
        let generator = HiLoIdGenerator::new("users", mock.clone(), '/');
        (mock, generator)
    }

    #[test]
    fn fetches_exactly_when_range_is_exhausted() {
        let (mock, generator) = generator(100);

        for expected in 1..=100 {
            assert_eq!(generator.next_id().unwrap(), expected);
        }
        assert_eq!(generator.fetch_count(), 1);

        assert_eq!(generator.next_id().unwrap(), 101);
        assert_eq!(generator.fetch_count(), 2);
        assert_eq!(generator.range_bounds(), (101, 200));

        let requests = mock.hilo_requests();
        assert_eq!(requests[1].last_max, 100);
        assert_eq!(requests[1].last_batch_size, 100);
    }

    #[test]
    fn document_id_format() {
        let (_, generator) = generator(10);
        assert_eq!(generator.generate_document_id().unwrap(), "users/1-A");
        assert_eq!(generator.generate_document_id().unwrap(), "users/2-A");
    }

    #[test]
    fn document_ids_carry_the_tag_of_their_own_range() {
        let mock = Arc::new(
            MockExecutor::new("db")
                .with_hilo_range_size(1)
                .with_numbered_server_tags(),
        );
        let generator = Arc::new(HiLoIdGenerator::new("users", mock, '/'));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let generator = Arc::clone(&generator);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| generator.generate_document_id().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for worker in workers {
            for id in worker.join().unwrap() {
                let (number, tag) = id
                    .trim_start_matches("users/")
                    .split_once('-')
                    .unwrap();
                assert_eq!(tag, format!("N{number}"), "mismatched tag in {id}");
                assert!(seen.insert(id.clone()), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 100);
        assert_eq!(generator.fetch_count(), 100);
    }

    #[test]
    fn returns_unused_tail() {
        let (mock, generator) = generator(10);
        generator.return_unused_range().unwrap();
        assert!(mock.hilo_returns().is_empty());

        generator.next_id().unwrap();
        generator.next_id().unwrap();
        generator.return_unused_range().unwrap();

        let returns = mock.hilo_returns();
        assert_eq!(returns.len(), 1);
        assert_eq!(returns[0].last, 2);
        assert_eq!(returns[0].end, 10);
    }

    #[test]
    fn concurrent_ids_are_unique() {
        let (_, generator) = generator(7);
        let generator = Arc::new(generator);
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let generator = Arc::clone(&generator);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| generator.next_id().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for worker in workers {
            for id in worker.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 400);
    }

    #[test]
    fn multi_type_uses_collection_prefix() {
        let mock = Arc::new(MockExecutor::new("db"));
        let multi = MultiTypeHiLoIdGenerator::new(mock.clone(), Arc::new(DocumentConventions::new()));

        assert_eq!(multi.generate_document_id("Users").unwrap(), "users/1-A");
        assert_eq!(multi.generate_document_id("Orders").unwrap(), "orders/1-A");
        assert_eq!(multi.generate_document_id("Users").unwrap(), "users/2-A");
        assert!(Arc::ptr_eq(&multi.generator("users"), &multi.generator("users")));

        multi.return_unused_range().unwrap();
        assert_eq!(mock.hilo_returns().len(), 2);
    }

    #[test]
    fn multi_database_is_lazy_and_cached() {
        let registry = Arc::new(ExecutorRegistry::new("main", |db| {
            Ok(Arc::new(MockExecutor::new(db)) as Arc<dyn RequestExecutor>)
        }));
        let multi = MultiDatabaseHiLoIdGenerator::new(registry, Arc::new(DocumentConventions::new()));

        let default = multi.for_database("").unwrap();
        let named = multi.for_database("main").unwrap();
        assert!(Arc::ptr_eq(&default, &named));

        assert_eq!(multi.generate_document_id("archive", "Users").unwrap(), "users/1-A");
        assert_eq!(multi.generate_document_id("", "Users").unwrap(), "users/1-A");
        assert_eq!(multi.generate_document_id("main", "Users").unwrap(), "users/2-A");
    }
}
