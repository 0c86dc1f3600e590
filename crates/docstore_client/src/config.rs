//! Conventions and session configuration.

use docstore_protocol::TransactionMode;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Maps an entity type name to a collection name.
pub type CollectionNameHook = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Produces a document id for `(database, collection)`; `None` defers to HiLo.
pub type DocumentIdHook = Arc<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;

/// Maps a collection name to the prefix used for generated ids.
pub type PrefixHook = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Client-wide conventions shared by every session of a store.
#[derive(Clone)]
pub struct DocumentConventions {
    /// Maximum server calls one session may make.
    pub max_number_of_requests_per_session: u32,
    /// Whether Put/Delete carry the last-seen change vector.
    pub use_optimistic_concurrency: bool,
    /// Separator between id prefix and number.
    pub identity_parts_separator: char,
    /// Most ids sent in one document GET; larger loads are split.
    pub max_ids_to_catch: usize,
    /// Timeout handed to the HTTP client.
    pub request_timeout: Duration,
    /// Retry policy of the HTTP executor.
    pub retry: RetryConfig,
    /// Delay between operation-state polls.
    pub operation_poll_interval: Duration,
    find_collection_name: Option<CollectionNameHook>,
    generate_document_id: Option<DocumentIdHook>,
    transform_collection_name_to_prefix: Option<PrefixHook>,
}

impl DocumentConventions {
    /// Creates conventions with default values.
    pub fn new() -> Self {
        Self {
            max_number_of_requests_per_session: 32,
            use_optimistic_concurrency: false,
            identity_parts_separator: '/',
            max_ids_to_catch: 32,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            operation_poll_interval: Duration::from_millis(500),
            find_collection_name: None,
            generate_document_id: None,
            transform_collection_name_to_prefix: None,
        }
    }

    /// Sets the per-session request limit.
    pub fn with_max_number_of_requests_per_session(mut self, max: u32) -> Self {
        self.max_number_of_requests_per_session = max;
        self
    }

    /// Enables or disables optimistic concurrency.
    pub fn with_optimistic_concurrency(mut self, enabled: bool) -> Self {
        self.use_optimistic_concurrency = enabled;
        self
    }

    /// Sets the identity parts separator.
    pub fn with_identity_parts_separator(mut self, separator: char) -> Self {
        self.identity_parts_separator = separator;
        self
    }

    /// Sets how many ids one document GET may carry. Zero is raised to one.
    pub fn with_max_ids_to_catch(mut self, max: usize) -> Self {
        self.max_ids_to_catch = max.max(1);
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the operation poll interval.
    pub fn with_operation_poll_interval(mut self, interval: Duration) -> Self {
        self.operation_poll_interval = interval;
        self
    }

    /// Installs a collection-naming hook.
    pub fn with_find_collection_name(
        mut self,
        hook: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.find_collection_name = Some(Arc::new(hook));
        self
    }

    /// Installs a custom id generator.
    pub fn with_document_id_generator(
        mut self,
        hook: impl Fn(&str, &str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.generate_document_id = Some(Arc::new(hook));
        self
    }

    /// Installs a collection-to-prefix transform.
    pub fn with_collection_prefix_transform(
        mut self,
        hook: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.transform_collection_name_to_prefix = Some(Arc::new(hook));
        self
    }

    /// Resolves the collection name of an entity type.
    pub fn collection_name(&self, type_name: &str, default_collection: &str) -> String {
        self.find_collection_name
            .as_ref()
            .and_then(|hook| hook(short_type_name(type_name)))
            .unwrap_or_else(|| default_collection.to_string())
    }

    /// Runs the custom id hook, if any.
    pub fn custom_document_id(&self, database: &str, collection: &str) -> Option<String> {
        self.generate_document_id
            .as_ref()
            .and_then(|hook| hook(database, collection))
    }

    /// Returns the id prefix for `collection`.
    ///
    /// Single-word names are lower-cased; names with more than one upper-case
    /// letter are kept as-is.
    pub fn transform_collection_name_to_prefix(&self, collection: &str) -> String {
        if let Some(hook) = &self.transform_collection_name_to_prefix {
            return hook(collection);
        }
        let upper = collection.chars().filter(|c| c.is_uppercase()).count();
        if upper <= 1 {
            collection.to_lowercase()
        } else {
            collection.to_string()
        }
    }
}

impl Default for DocumentConventions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DocumentConventions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentConventions")
            .field(
                "max_number_of_requests_per_session",
                &self.max_number_of_requests_per_session,
            )
            .field("use_optimistic_concurrency", &self.use_optimistic_concurrency)
            .field("identity_parts_separator", &self.identity_parts_separator)
            .field("max_ids_to_catch", &self.max_ids_to_catch)
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn short_type_name(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base)
}

/// Per-session options.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Target database; `None` uses the store default.
    pub database: Option<String>,
    /// Transaction mode of saved batches.
    pub transaction_mode: TransactionMode,
}

impl SessionOptions {
    /// Creates default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets `database`.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Sets the transaction mode.
    pub fn with_transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }
}

/// Configuration for retry behavior of the HTTP executor.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier. Values below one or not finite become one.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.0
        };
        self
    }

    /// Calculates the delay before attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        // The public field can bypass the builder clamp.
        Duration::try_from_secs_f64(delay)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
