//! Subscription bookkeeping for server push notifications.
//!
//! A [`DatabaseConnectionState`] is shared by every observer of one
//! subscription. Observers call [`inc`](DatabaseConnectionState::inc) when
//! they attach and [`dec`](DatabaseConnectionState::dec) when they detach;
//! the disconnect callback runs exactly once, when the count reaches zero.

use crate::http_cache::HttpCache;
use docstore_protocol::{
    ChangeNotification, DocumentChange, DocumentChangeType, IndexChange, IndexChangeType,
    OperationStatusChange,
};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type DocumentCallback = Arc<dyn Fn(&DocumentChange) + Send + Sync>;
type IndexCallback = Arc<dyn Fn(&IndexChange) + Send + Sync>;
type OperationCallback = Arc<dyn Fn(&OperationStatusChange) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Kind of callback a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Document notifications.
    Document,
    /// Index notifications.
    Index,
    /// Operation-status notifications.
    OperationStatus,
    /// Subscription errors.
    Error,
}

/// Identifies one registered callback. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    kind: ChangeKind,
    id: u64,
}

impl SubscriptionHandle {
    /// Returns the callback kind.
    pub fn kind(&self) -> ChangeKind {
        self.kind
    }
}

/// Registered callbacks per kind, in registration order. Removal drops the
/// entry, so each list holds only live registrations.
#[derive(Default)]
struct Callbacks {
    document: Vec<(u64, DocumentCallback)>,
    index: Vec<(u64, IndexCallback)>,
    operation: Vec<(u64, OperationCallback)>,
    error: Vec<(u64, ErrorCallback)>,
}

impl Callbacks {
    fn len(&self) -> usize {
        self.document.len() + self.index.len() + self.operation.len() + self.error.len()
    }
}

fn live<T: Clone>(entries: &[(u64, T)]) -> Vec<T> {
    entries.iter().map(|(_, callback)| callback.clone()).collect()
}

fn remove_entry<T>(entries: &mut Vec<(u64, T)>, id: u64) {
    entries.retain(|(entry, _)| *entry != id);
}

/// Reference-counted state of one change subscription.
pub struct DatabaseConnectionState {
    references: AtomicI64,
    on_connect: Option<Box<dyn Fn() + Send + Sync>>,
    on_disconnect: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    disconnected_tx: Mutex<Option<oneshot::Sender<()>>>,
    disconnected_rx: Mutex<Option<oneshot::Receiver<()>>>,
    callbacks: RwLock<Callbacks>,
    next_handle: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl DatabaseConnectionState {
    /// Creates a state that runs `on_disconnect` when the last observer leaves.
    pub fn new(on_disconnect: impl FnOnce() + Send + 'static) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            references: AtomicI64::new(0),
            on_connect: None,
            on_disconnect: Mutex::new(Some(Box::new(on_disconnect))),
            disconnected_tx: Mutex::new(Some(tx)),
            disconnected_rx: Mutex::new(Some(rx)),
            callbacks: RwLock::new(Callbacks::default()),
            next_handle: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Sets the callback run by [`connected`](Self::connected).
    pub fn with_on_connect(mut self, on_connect: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Box::new(on_connect));
        self
    }

    /// Signals that the underlying connection (re)connected.
    pub fn connected(&self) {
        if let Some(on_connect) = &self.on_connect {
            on_connect();
        }
    }

    /// Adds an observer; returns the new count.
    pub fn inc(&self) -> i64 {
        self.references.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Removes an observer; returns the new count.
    pub fn dec(&self) -> i64 {
        let remaining = self.references.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.disconnect();
        } else if remaining < 0 {
            warn!(remaining, "connection state decremented below zero");
        }
        remaining
    }

    /// Current number of observers.
    pub fn references(&self) -> i64 {
        self.references.load(Ordering::Acquire)
    }

    /// Returns true once the disconnect callback has run.
    pub fn is_disconnected(&self) -> bool {
        self.on_disconnect.lock().is_none()
    }

    /// Takes the one-shot disconnect signal. Only the first caller gets it.
    pub fn disconnected(&self) -> Option<oneshot::Receiver<()>> {
        self.disconnected_rx.lock().take()
    }

    fn disconnect(&self) {
        let Some(on_disconnect) = self.on_disconnect.lock().take() else {
            return;
        };
        debug!("last observer left, disconnecting");
        on_disconnect();
        if let Some(tx) = self.disconnected_tx.lock().take() {
            // Receiver may already be gone.
            let _ = tx.send(());
        }
    }

    /// Registers a document-change callback.
    pub fn add_on_document_change(
        &self,
        callback: impl Fn(&DocumentChange) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let callback: DocumentCallback = Arc::new(callback);
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.callbacks.write().document.push((id, callback));
        SubscriptionHandle {
            kind: ChangeKind::Document,
            id,
        }
    }

    /// Registers an index-change callback.
    pub fn add_on_index_change(
        &self,
        callback: impl Fn(&IndexChange) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let callback: IndexCallback = Arc::new(callback);
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.callbacks.write().index.push((id, callback));
        SubscriptionHandle {
            kind: ChangeKind::Index,
            id,
        }
    }

    /// Registers an operation-status callback.
    pub fn add_on_operation_status_change(
        &self,
        callback: impl Fn(&OperationStatusChange) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let callback: OperationCallback = Arc::new(callback);
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.callbacks.write().operation.push((id, callback));
        SubscriptionHandle {
            kind: ChangeKind::OperationStatus,
            id,
        }
    }

    /// Registers an error callback.
    pub fn add_on_error(
        &self,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let callback: ErrorCallback = Arc::new(callback);
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.callbacks.write().error.push((id, callback));
        SubscriptionHandle {
            kind: ChangeKind::Error,
            id,
        }
    }

    /// Removes a callback. Other handles stay valid; removing twice is a no-op.
    pub fn remove(&self, handle: SubscriptionHandle) {
        let mut callbacks = self.callbacks.write();
        let id = handle.id;
        match handle.kind {
            ChangeKind::Document => remove_entry(&mut callbacks.document, id),
            ChangeKind::Index => remove_entry(&mut callbacks.index, id),
            ChangeKind::OperationStatus => remove_entry(&mut callbacks.operation, id),
            ChangeKind::Error => remove_entry(&mut callbacks.error, id),
        }
    }

    /// Number of registered callbacks of every kind.
    pub fn callback_count(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Dispatches a notification to the callbacks of its kind, in registration order.
    pub fn send(&self, notification: &ChangeNotification) {
        // Callbacks run outside the lock so they may (un)register.
        match notification {
            ChangeNotification::Document(change) => {
                let targets = live(&self.callbacks.read().document);
                targets.iter().for_each(|callback| callback(change));
            }
            ChangeNotification::Index(change) => {
                let targets = live(&self.callbacks.read().index);
                targets.iter().for_each(|callback| callback(change));
            }
            ChangeNotification::OperationStatus(change) => {
                let targets = live(&self.callbacks.read().operation);
                targets.iter().for_each(|callback| callback(change));
            }
        }
    }

    /// Records a subscription error and notifies the error callbacks.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(error = %message, "change subscription error");
        *self.last_error.lock() = Some(message.clone());
        let targets = live(&self.callbacks.read().error);
        targets.iter().for_each(|callback| callback(&message));
    }

    /// Returns the last recorded error.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl fmt::Debug for DatabaseConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConnectionState")
            .field("references", &self.references())
            .field("disconnected", &self.is_disconnected())
            .field("last_error", &self.last_error())
            .finish_non_exhaustive()
    }
}

/// Keeps cache eviction attached to a subscription; detaches on drop.
#[derive(Debug)]
pub struct CacheEvictionSubscription {
    state: Arc<DatabaseConnectionState>,
    handles: [SubscriptionHandle; 2],
}

impl Drop for CacheEvictionSubscription {
    fn drop(&mut self) {
        for handle in self.handles {
            self.state.remove(handle);
        }
        self.state.dec();
    }
}

/// Bumps the cache generation whenever documents or index results change.
///
/// Document Put/Delete and index BatchCompleted/IndexRemoved notifications
/// make cached query and load responses suspect.
pub fn evict_items_from_cache_on_changes(
    state: &Arc<DatabaseConnectionState>,
    cache: Arc<HttpCache>,
) -> CacheEvictionSubscription {
    let document_cache = Arc::clone(&cache);
    let document = state.add_on_document_change(move |change| {
        if matches!(
            change.change_type,
            DocumentChangeType::Put | DocumentChangeType::Delete
        ) {
            document_cache.bump_generation();
        }
    });
    let index = state.add_on_index_change(move |change| {
        if matches!(
            change.change_type,
            IndexChangeType::BatchCompleted | IndexChangeType::IndexRemoved
        ) {
            cache.bump_generation();
        }
    });
    state.inc();
    CacheEvictionSubscription {
        state: Arc::clone(state),
        handles: [document, index],
    }
}
