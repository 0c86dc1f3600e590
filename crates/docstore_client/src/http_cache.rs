//! Generation-tagged HTTP response cache.
//!
//! Entries are keyed by request URL and carry the payload, the change vector
//! returned by the server and a snapshot of the cache generation taken at
//! insertion. Bumping the generation marks every existing entry as possibly
//! stale without evicting it; the entry stays usable as a revalidation
//! candidate for a conditional GET.
//!
//! Memory is unbounded by default. [`CachePolicy::MaxWeight`] enables LRU
//! eviction by total payload weight.

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Change vector recorded for URLs that answered 404.
pub const NOT_FOUND_CHANGE_VECTOR: &str = "404 response";

/// Fixed per-entry overhead added to the payload length.
const ITEM_OVERHEAD: usize = 20;

/// Eviction policy of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Never evict.
    #[default]
    Unbounded,
    /// Evict least-recently-used entries while the total weight exceeds the limit.
    MaxWeight(usize),
}

#[derive(Debug)]
struct HttpCacheItem {
    change_vector: String,
    payload: Option<Bytes>,
    generation: u64,
    last_server_update: Mutex<Instant>,
}

impl HttpCacheItem {
    fn weight(&self) -> usize {
        self.payload.as_ref().map_or(0, Bytes::len) + ITEM_OVERHEAD
    }
}

struct Entries {
    items: LruCache<String, Arc<HttpCacheItem>>,
    weight: usize,
}

/// Shared HTTP response cache.
pub struct HttpCache {
    generation: Arc<AtomicU64>,
    entries: Mutex<Entries>,
    policy: CachePolicy,
}

/// Result of [`HttpCache::get`].
#[derive(Debug)]
pub struct CacheLookup {
    /// Scoped handle on the entry.
    pub handle: ReleaseCacheItem,
    /// Cached change vector, `None` on a miss.
    pub change_vector: Option<String>,
    /// Cached payload, `None` on a miss or a cached 404.
    pub payload: Option<Bytes>,
}

/// Scoped handle on a cache entry.
///
/// Dropping the handle releases it. On a miss every method is a no-op.
#[derive(Debug)]
pub struct ReleaseCacheItem {
    item: Option<Arc<HttpCacheItem>>,
    generation: Arc<AtomicU64>,
}

impl ReleaseCacheItem {
    /// Returns true if the lookup hit an entry.
    pub fn is_hit(&self) -> bool {
        self.item.is_some()
    }

    /// Records a successful revalidation; the payload is unchanged.
    pub fn not_modified(&self) {
        if let Some(item) = &self.item {
            *item.last_server_update.lock() = Instant::now();
        }
    }

    /// Time since the server last confirmed the entry.
    pub fn age(&self) -> Duration {
        self.item
            .as_ref()
            .map_or(Duration::MAX, |item| item.last_server_update.lock().elapsed())
    }

    /// True when the entry predates the cache's current generation.
    pub fn might_have_been_modified(&self) -> bool {
        self.item
            .as_ref()
            .is_some_and(|item| item.generation != self.generation.load(Ordering::Acquire))
    }

    /// Releases the handle.
    pub fn release(self) {}
}

impl HttpCache {
    /// Creates an unbounded cache.
    pub fn new() -> Self {
        Self::with_policy(CachePolicy::Unbounded)
    }

    /// Creates a cache with the given eviction policy.
    pub fn with_policy(policy: CachePolicy) -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
            entries: Mutex::new(Entries {
                items: LruCache::unbounded(),
                weight: 0,
            }),
            policy,
        }
    }

    /// Stores a response for `url`.
    pub fn set(&self, url: impl Into<String>, change_vector: impl Into<String>, payload: Bytes) {
        self.insert(url.into(), change_vector.into(), Some(payload));
    }

    /// Records that `url` answered 404.
    pub fn set_not_found(&self, url: impl Into<String>) {
        self.insert(url.into(), NOT_FOUND_CHANGE_VECTOR.to_string(), None);
    }

    /// Looks up `url`.
    pub fn get(&self, url: &str) -> CacheLookup {
        let item = self.entries.lock().items.get(url).cloned();
        let change_vector = item.as_ref().map(|item| item.change_vector.clone());
        let payload = item.as_ref().and_then(|item| item.payload.clone());
        CacheLookup {
            handle: ReleaseCacheItem {
                item,
                generation: Arc::clone(&self.generation),
            },
            change_vector,
            payload,
        }
    }

    /// Returns the live generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Marks every existing entry as possibly modified.
    pub fn bump_generation(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(generation, "http cache generation bumped");
        generation
    }

    /// Bumps the generation and discards every entry.
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.items.clear();
        entries.weight = 0;
        debug!("http cache cleared");
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().items.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of entry weights.
    pub fn total_weight(&self) -> usize {
        self.entries.lock().weight
    }

    fn insert(&self, url: String, change_vector: String, payload: Option<Bytes>) {
        let item = Arc::new(HttpCacheItem {
            change_vector,
            payload,
            generation: self.generation(),
            last_server_update: Mutex::new(Instant::now()),
        });

        let mut entries = self.entries.lock();
        entries.weight += item.weight();
        if let Some(replaced) = entries.items.put(url, item) {
            entries.weight -= replaced.weight();
        }

        if let CachePolicy::MaxWeight(max) = self.policy {
            while entries.weight > max {
                let Some((evicted_url, evicted)) = entries.items.pop_lru() else {
                    break;
                };
                entries.weight -= evicted.weight();
                debug!(url = %evicted_url, "http cache entry evicted");
            }
        }
    }
}

impl Default for HttpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HttpCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("HttpCache")
            .field("generation", &self.generation())
            .field("len", &entries.items.len())
            .field("weight", &entries.weight)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn set_then_get() {
        let cache = HttpCache::new();
        cache.set("/docs?id=a", "A:1", Bytes::from_static(b"{}"));

        let lookup = cache.get("/docs?id=a");
        assert!(lookup.handle.is_hit());
        assert_eq!(lookup.change_vector.as_deref(), Some("A:1"));
        assert_eq!(lookup.payload, Some(Bytes::from_static(b"{}")));
        assert!(!lookup.handle.might_have_been_modified());
    }

    #[test]
    fn miss_returns_empty_values() {
        let cache = HttpCache::new();
        let lookup = cache.get("/nothing");
        assert!(!lookup.handle.is_hit());
        assert_eq!(lookup.change_vector, None);
        assert_eq!(lookup.payload, None);
        assert_eq!(lookup.handle.age(), Duration::MAX);
        assert!(!lookup.handle.might_have_been_modified());
        lookup.handle.not_modified();
        lookup.handle.release();
    }

    #[test]
    fn not_found_uses_sentinel() {
        let cache = HttpCache::new();
        cache.set_not_found("/docs?id=missing");
        let lookup = cache.get("/docs?id=missing");
        assert_eq!(lookup.change_vector.as_deref(), Some(NOT_FOUND_CHANGE_VECTOR));
        assert_eq!(lookup.payload, None);
    }

    #[test]
    fn generation_bump_marks_existing_entries() {
        let cache = HttpCache::new();
        cache.set("/old", "A:1", Bytes::from_static(b"old"));
        cache.bump_generation();
        cache.set("/new", "A:2", Bytes::from_static(b"new"));

        let old = cache.get("/old");
        assert!(old.handle.might_have_been_modified());
        assert_eq!(old.payload, Some(Bytes::from_static(b"old")));
        assert!(!cache.get("/new").handle.might_have_been_modified());
    }

    #[test]
    fn handle_sees_bump_after_lookup() {
        let cache = HttpCache::new();
        cache.set("/a", "A:1", Bytes::from_static(b"a"));
        let lookup = cache.get("/a");
        cache.bump_generation();
        assert!(lookup.handle.might_have_been_modified());
    }

    #[test]
    fn invalidate_all_discards_entries() {
        let cache = HttpCache::new();
        cache.set("/a", "A:1", Bytes::from_static(b"a"));
        let before = cache.generation();
        cache.invalidate_all();
        assert!(cache.is_empty());
        assert_eq!(cache.total_weight(), 0);
        assert_eq!(cache.generation(), before + 1);
    }

    #[test]
    fn not_modified_refreshes_age() {
        let cache = HttpCache::new();
        cache.set("/a", "A:1", Bytes::from_static(b"a"));
        let lookup = cache.get("/a");
        std::thread::sleep(Duration::from_millis(5));
        let aged = lookup.handle.age();
        lookup.handle.not_modified();
        assert!(lookup.handle.age() < aged);
    }

    #[test]
    fn weight_policy_evicts_least_recently_used() {
        // Each entry weighs 10 + 20.
        let cache = HttpCache::with_policy(CachePolicy::MaxWeight(60));
        cache.set("/a", "1", Bytes::from(vec![0u8; 10]));
        cache.set("/b", "2", Bytes::from(vec![0u8; 10]));
        assert_eq!(cache.total_weight(), 60);

        // Touch /a so /b becomes the eviction candidate.
        let _ = cache.get("/a");
        cache.set("/c", "3", Bytes::from(vec![0u8; 10]));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("/a").handle.is_hit());
        assert!(!cache.get("/b").handle.is_hit());
        assert!(cache.get("/c").handle.is_hit());
        assert_eq!(cache.total_weight(), 60);
    }

    #[test]
    fn replacing_entry_adjusts_weight() {
        let cache = HttpCache::new();
        cache.set("/a", "1", Bytes::from(vec![0u8; 100]));
        cache.set("/a", "2", Bytes::from(vec![0u8; 5]));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_weight(), 25);
    }

    proptest! {
        #[test]
        fn get_returns_last_set(writes in prop::collection::vec((0u8..4, any::<Vec<u8>>()), 1..40)) {
            let cache = HttpCache::new();
            let mut expected = std::collections::HashMap::new();
            for (i, (url, payload)) in writes.iter().enumerate() {
                let url = format!("/docs/{url}");
                let cv = format!("A:{i}");
                cache.set(url.clone(), cv.clone(), Bytes::from(payload.clone()));
                expected.insert(url, (cv, payload.clone()));
            }
            for (url, (cv, payload)) in expected {
                let lookup = cache.get(&url);
                prop_assert_eq!(lookup.change_vector, Some(cv));
                prop_assert_eq!(lookup.payload, Some(Bytes::from(payload)));
            }
        }
    }
}
