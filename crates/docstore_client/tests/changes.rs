//! Change subscriptions, cache eviction and operation polling.

use bytes::Bytes;
use docstore_client::protocol::{OperationState, OperationStatus};
use docstore_client::{
    evict_items_from_cache_on_changes, CancellationToken, ClientError, DatabaseConnectionState,
    HttpCache,
};
use docstore_testkit::prelude::*;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn counting_state() -> (Arc<DatabaseConnectionState>, Arc<AtomicUsize>) {
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnects);
    let state = Arc::new(DatabaseConnectionState::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    (state, disconnects)
}

#[test]
fn saved_documents_bump_the_cache_generation() {
    let (server, store) = test_store();
    let (state, _) = counting_state();
    server.subscribe(Arc::clone(&state));

    let cache = Arc::new(HttpCache::new());
    cache.set("/docs?id=users/1", "A:1-testdb", Bytes::from_static(b"{}"));
    let _subscription = evict_items_from_cache_on_changes(&state, Arc::clone(&cache));
    let before = cache.generation();

    let mut session = store.open_session().unwrap();
    session.store_with_id(&User::new("Ann", 30), "users/1").unwrap();
    session.save_changes().unwrap();

    assert!(cache.generation() > before);
    assert!(cache.get("/docs?id=users/1").handle.might_have_been_modified());
}

#[test]
fn document_callbacks_see_each_saved_id() {
    let (server, store) = test_store();
    let (state, _) = counting_state();
    server.subscribe(Arc::clone(&state));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    state.add_on_document_change(move |change| sink.lock().push(change.id.clone()));

    let mut session = store.open_session().unwrap();
    session.store_with_id(&User::new("Ann", 30), "users/1").unwrap();
    session.store_with_id(&User::new("Bob", 40), "users/2").unwrap();
    session.save_changes().unwrap();

    assert_eq!(*seen.lock(), vec!["users/1".to_string(), "users/2".to_string()]);
}

#[test]
fn failed_batches_notify_nobody() {
    let (server, store) = test_store();
    server.put_document("users/1", "Users", json!({"name": "Ann"}));
    let (state, _) = counting_state();
    server.subscribe(Arc::clone(&state));

    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    state.add_on_document_change(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut session = store.open_session().unwrap();
    session
        .store_with_change_vector(&User::new("Ann", 30), Some("A:999-testdb".into()), "users/1")
        .unwrap();
    assert!(session.save_changes().unwrap_err().is_concurrency());
    assert_eq!(notified.load(Ordering::SeqCst), 0);
}

#[test]
fn dropping_the_last_subscription_disconnects_once() {
    let (state, disconnects) = counting_state();
    let mut signal = state.disconnected().unwrap();
    let cache = Arc::new(HttpCache::new());

    let first = evict_items_from_cache_on_changes(&state, Arc::clone(&cache));
    let second = evict_items_from_cache_on_changes(&state, Arc::clone(&cache));
    assert_eq!(state.references(), 2);

    drop(first);
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    assert!(signal.try_recv().is_err());

    drop(second);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert!(state.is_disconnected());
    assert!(signal.try_recv().is_ok());

    state.inc();
    state.dec();
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn detached_eviction_leaves_the_cache_alone() {
    let (server, store) = test_store();
    let (state, _) = counting_state();
    server.subscribe(Arc::clone(&state));
    // Keeps the state alive after the eviction subscription leaves.
    state.inc();

    let cache = Arc::new(HttpCache::new());
    drop(evict_items_from_cache_on_changes(&state, Arc::clone(&cache)));
    let before = cache.generation();

    let mut session = store.open_session().unwrap();
    session.store_with_id(&User::new("Ann", 30), "users/1").unwrap();
    session.save_changes().unwrap();
    assert_eq!(cache.generation(), before);
}

#[test]
fn operation_completes_with_its_result() {
    let (server, store) = test_store();
    let id = server.schedule_operation([
        OperationState::new(OperationStatus::InProgress),
        OperationState::new(OperationStatus::InProgress),
        OperationState::new(OperationStatus::Completed).with_result(json!({"Total": 42})),
    ]);

    let operation = store
        .operation("", id)
        .unwrap()
        .with_poll_interval(Duration::from_millis(1));
    let result = operation
        .wait_for_completion(&CancellationToken::new())
        .unwrap();
    assert_eq!(result, json!({"Total": 42}));
    assert_eq!(RequestCounters::get(&server.counters().operation_polls), 3);
}

#[test]
fn faulted_operation_reports_its_message() {
    let (server, store) = test_store();
    let id = server.schedule_operation([
        OperationState::new(OperationStatus::InProgress),
        OperationState::new(OperationStatus::Faulted)
            .with_result(json!({"Message": "index is corrupted"})),
    ]);

    let operation = store
        .operation("", id)
        .unwrap()
        .with_poll_interval(Duration::from_millis(1));
    match operation.wait_for_completion(&CancellationToken::new()) {
        Err(ClientError::OperationFaulted { id: faulted, message }) => {
            assert_eq!(faulted, id);
            assert_eq!(message, "index is corrupted");
        }
        other => panic!("expected a faulted operation, got {other:?}"),
    }
}

#[test]
fn cancelled_wait_stops_polling() {
    let (server, store) = test_store();
    let id = server.schedule_operation([OperationState::new(OperationStatus::InProgress)]);

    let token = CancellationToken::new();
    token.cancel();
    let operation = store.operation("", id).unwrap();
    assert!(matches!(
        operation.wait_for_completion(&token),
        Err(ClientError::Cancelled)
    ));
    assert_eq!(RequestCounters::get(&server.counters().operation_polls), 0);
}

#[test]
fn server_cancelled_operation_is_reported_as_cancelled() {
    let (server, store) = test_store();
    let id = server.schedule_operation([OperationState::new(OperationStatus::Cancelled)]);
    let operation = store.operation("", id).unwrap();
    assert!(matches!(
        operation.wait_for_completion(&CancellationToken::new()),
        Err(ClientError::Cancelled)
    ));
}

#[test]
fn closed_store_hands_out_no_operations() {
    let (server, store) = test_store();
    let id = server.schedule_operation([OperationState::new(OperationStatus::Completed)]);
    store.close().unwrap();
    assert!(matches!(store.operation("", id), Err(ClientError::Closed)));
}
