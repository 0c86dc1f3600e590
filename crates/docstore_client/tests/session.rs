//! Session behaviour against the in-memory server.

use docstore_client::protocol::{CommandData, CommandType, PatchRequest};
use docstore_client::{
    CancellationToken, ChangeType, ClientError, DocumentConventions, SessionOptions,
};
use docstore_testkit::prelude::*;
use serde_json::json;

fn seed_user(server: &InMemoryServer, id: &str, user: &User) -> String {
    server.put_document(id, "Users", serde_json::to_value(user).unwrap())
}

#[test]
fn stored_entity_round_trips() {
    let (server, store) = test_store();
    let alice = User::new("Alice", 30);

    let mut session = store.open_session().unwrap();
    session.store_with_id(&alice, "users/alice").unwrap();
    let result = session.save_changes().unwrap();
    assert_eq!(result.commands.len(), 1);
    assert_eq!(session.number_of_requests(), 1);
    assert_eq!(server.document_count(), 1);

    let mut other = store.open_session().unwrap();
    let loaded: User = other.load("users/alice").unwrap().unwrap();
    assert_eq!(loaded, alice);
    let metadata = other.metadata_for("users/alice").unwrap();
    assert_eq!(metadata["@collection"], json!("Users"));
}

#[test]
fn modified_entity_saves_exactly_one_put() {
    let (server, store) = test_store();
    seed_user(&server, "users/1", &User::new("Bob", 40));

    let mut session = store.open_session().unwrap();
    assert!(session
        .update::<User, _>("users/1", |user| user.age = 41)
        .unwrap());

    let data = session.prepare_for_save_changes().unwrap();
    assert_eq!(data.commands().len(), 1);
    assert_eq!(data.commands()[0].command_type(), CommandType::Put);
    assert_eq!(data.commands()[0].id(), "users/1");

    session.save_changes().unwrap();
    assert!(!session.has_changes());
    assert!(session.save_changes().unwrap().is_empty());

    let stored = server.document("users/1").unwrap();
    assert_eq!(stored["age"], json!(41));
}

#[test]
fn unchanged_load_sends_nothing() {
    let (server, store) = test_store();
    seed_user(&server, "users/1", &User::new("Carol", 22));

    let mut session = store.open_session().unwrap();
    let _: Option<User> = session.load("users/1").unwrap();
    assert!(session.save_changes().unwrap().is_empty());
    assert_eq!(RequestCounters::get(&server.counters().batches), 0);
}

#[test]
fn concurrency_violation_leaves_session_intact() {
    let (server, store) =
        test_store_with(DocumentConventions::new().with_optimistic_concurrency(true));
    let original = seed_user(&server, "users/1", &User::new("Dan", 50));

    let mut session = store.open_session().unwrap();
    session
        .update::<User, _>("users/1", |user| user.age = 51)
        .unwrap();
    session.store_with_id(&User::new("Eve", 20), "users/2").unwrap();

    seed_user(&server, "users/1", &User::new("Dan", 99));

    let error = session.save_changes().unwrap_err();
    match &error {
        ClientError::Concurrency { ids, .. } => assert_eq!(ids, &vec!["users/1".to_string()]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(session.has_changed("users/1"));
    assert!(session.has_changed("users/2"));
    assert_eq!(session.change_vector_for("users/1"), Some(original.as_str()));
    assert!(server.document("users/2").is_none());

    session.evict("users/1");
    session
        .update::<User, _>("users/1", |user| user.age = 100)
        .unwrap();
    session.save_changes().unwrap();
    assert_eq!(server.document("users/1").unwrap()["age"], json!(100));
    assert!(server.document("users/2").is_some());
}

#[test]
fn delete_then_store_sends_only_put() {
    let (server, store) = test_store();
    let frank = User::new("Frank", 33);
    seed_user(&server, "users/1", &frank);

    let mut session = store.open_session().unwrap();
    let _: Option<User> = session.load("users/1").unwrap();
    session.delete("users/1").unwrap();
    assert!(session.is_deleted("users/1"));
    assert!(session.load::<User>("users/1").unwrap().is_none());

    session.store_with_id(&frank, "users/1").unwrap();
    let data = session.prepare_for_save_changes().unwrap();
    let types: Vec<_> = data.commands().iter().map(|c| c.command_type()).collect();
    assert_eq!(types, vec![CommandType::Put]);
}

#[test]
fn store_then_delete_sends_only_delete() {
    let (server, store) = test_store();
    let mut session = store.open_session().unwrap();
    session.store_with_id(&User::new("Gus", 60), "users/9").unwrap();
    session.delete("users/9").unwrap();

    let data = session.prepare_for_save_changes().unwrap();
    let types: Vec<_> = data.commands().iter().map(|c| c.command_type()).collect();
    assert_eq!(types, vec![CommandType::Delete]);

    session.save_changes().unwrap();
    assert_eq!(server.document_count(), 0);
    assert!(!session.is_loaded("users/9"));
}

#[test]
fn missing_documents_are_remembered() {
    let (server, store) = test_store();
    let mut session = store.open_session().unwrap();

    assert!(session.load::<User>("users/404").unwrap().is_none());
    assert!(session.load::<User>("USERS/404").unwrap().is_none());
    assert_eq!(RequestCounters::get(&server.counters().document_reads), 1);
}

#[test]
fn load_many_fetches_untracked_ids_in_one_request() {
    let (server, store) = test_store();
    seed_user(&server, "users/1", &User::new("Hal", 1));
    seed_user(&server, "users/2", &User::new("Ida", 2));

    let mut session = store.open_session().unwrap();
    let _: Option<User> = session.load("users/1").unwrap();
    let users = session
        .load_many::<User>(&["users/1", "users/2", "users/3"])
        .unwrap();

    assert_eq!(users.len(), 3);
    assert_eq!(users["users/2"].as_ref().unwrap().name, "Ida");
    assert!(users["users/3"].is_none());
    assert_eq!(RequestCounters::get(&server.counters().document_reads), 2);
}

#[test]
fn request_budget_is_enforced() {
    let (_, store) =
        test_store_with(DocumentConventions::new().with_max_number_of_requests_per_session(2));
    let mut session = store.open_session().unwrap();

    session.load::<User>("users/1").unwrap();
    session.load::<User>("users/2").unwrap();
    let error = session.load::<User>("users/3").unwrap_err();
    assert!(matches!(error, ClientError::IllegalState { .. }));
}

#[test]
fn generated_ids_use_hilo_and_server_tag() {
    let (server, store) = test_store();
    let mut session = store.open_session().unwrap();

    let first = session.store(&User::new("Jo", 5)).unwrap();
    let second = session.store(&User::new("Kim", 6)).unwrap();
    let order = session.store(&Order::sample()).unwrap();
    assert_eq!(first, "users/1-A");
    assert_eq!(second, "users/2-A");
    assert_eq!(order, "orders/1-A");

    session.save_changes().unwrap();
    assert_eq!(server.document_count(), 3);
    assert_eq!(RequestCounters::get(&server.counters().hilo_leases), 2);
}

#[test]
fn generated_id_put_requires_the_id_to_be_free() {
    let (server, store) = test_store();
    server.put_document("users/1-A", "Users", json!({"name": "squatter"}));

    let mut session = store.open_session().unwrap();
    let id = session.store(&User::new("Lee", 7)).unwrap();
    assert_eq!(id, "users/1-A");
    let error = session.save_changes().unwrap_err();
    assert!(error.is_concurrency());
}

#[test]
fn explicit_change_vector_is_checked() {
    let (server, store) = test_store();
    let current = seed_user(&server, "users/1", &User::new("Max", 10));

    let mut session = store.open_session().unwrap();
    session
        .store_with_change_vector(&User::new("Max", 11), Some("A:0-stale".into()), "users/1")
        .unwrap();
    assert!(session.save_changes().unwrap_err().is_concurrency());

    let mut session = store.open_session().unwrap();
    session
        .store_with_change_vector(&User::new("Max", 12), Some(current), "users/1")
        .unwrap();
    session.save_changes().unwrap();
    assert_eq!(server.document("users/1").unwrap()["age"], json!(12));
}

#[test]
fn delete_with_stale_change_vector_fails() {
    let (server, store) = test_store();
    seed_user(&server, "users/1", &User::new("Ned", 10));

    let mut session = store.open_session().unwrap();
    session
        .delete_with_change_vector("users/1", "A:0-stale")
        .unwrap();
    assert!(session.save_changes().unwrap_err().is_concurrency());
    assert!(session.is_deleted("users/1"));
    assert_eq!(server.document_count(), 1);
}

#[test]
fn deferred_patch_runs_after_session_commands() {
    let (server, store) = test_store();
    seed_user(&server, "users/1", &User::new("Oli", 10));

    let mut session = store.open_session().unwrap();
    session.store_with_id(&User::new("Pia", 3), "users/2").unwrap();
    session.defer([CommandData::patch(
        "users/1",
        None,
        PatchRequest::new("this.age = args.age").with_value("age", json!(11)),
        None,
    )
    .unwrap()]);
    assert!(session
        .deferred_command("users/1", CommandType::Patch.into())
        .is_some());

    let result = session.save_changes().unwrap();
    let types: Vec<_> = result.commands.iter().map(|c| c.command_type()).collect();
    assert_eq!(types, vec![CommandType::Put, CommandType::Patch]);
    assert_eq!(server.document("users/1").unwrap()["age"], json!(11));
    assert_eq!(session.number_of_deferred_commands(), 0);
}

#[test]
fn deferred_attachment_keeps_generated_put() {
    let (server, store) = test_store();
    let mut session = store.open_session().unwrap();
    session.store_with_id(&User::new("Quinn", 3), "users/3").unwrap();
    session.defer([CommandData::attachment_put("users/3", "avatar.png", Some("image/png".into()), None).unwrap()]);

    session.save_changes().unwrap();
    let stored = server.document("users/3").unwrap();
    assert_eq!(stored["@metadata"]["@attachments"], json!(["avatar.png"]));
}

#[test]
fn what_changed_reports_field_level_changes() {
    let (server, store) = test_store();
    seed_user(&server, "users/1", &User::new("Ray", 10));

    let mut session = store.open_session().unwrap();
    session
        .update::<User, _>("users/1", |user| user.age = 11)
        .unwrap();
    session.store_with_id(&User::new("Sue", 1), "users/2").unwrap();
    session.delete("users/3").unwrap();

    let changes = session.what_changed();
    assert_eq!(changes["users/1"].len(), 1);
    assert_eq!(changes["users/1"][0].change, ChangeType::FieldChanged);
    assert_eq!(changes["users/1"][0].field_path, "age");
    assert_eq!(changes["users/2"][0].change, ChangeType::DocumentAdded);
    assert_eq!(changes["users/3"][0].change, ChangeType::DocumentDeleted);
}

#[test]
fn ignored_entities_are_not_saved() {
    let (server, store) = test_store();
    seed_user(&server, "users/1", &User::new("Tom", 10));

    let mut session = store.open_session().unwrap();
    session
        .update::<User, _>("users/1", |user| user.age = 11)
        .unwrap();
    session.ignore_changes_for("users/1").unwrap();
    assert!(!session.has_changes());
    assert!(session.save_changes().unwrap().is_empty());
}

#[test]
fn metadata_changes_trigger_put() {
    let (server, store) = test_store();
    seed_user(&server, "users/1", &User::new("Uma", 10));

    let mut session = store.open_session().unwrap();
    let _: Option<User> = session.load("users/1").unwrap();
    session
        .set_metadata("users/1", "reviewed", json!(true))
        .unwrap();
    assert!(session
        .set_metadata("users/1", "@change-vector", json!("x"))
        .is_err());
    session.save_changes().unwrap();

    assert_eq!(server.document("users/1").unwrap()["@metadata"]["reviewed"], json!(true));
}

#[test]
fn what_changed_reports_metadata_and_restored_documents() {
    let (server, store) = test_store();
    let ray = User::new("Ray", 10);
    seed_user(&server, "users/1", &ray);
    seed_user(&server, "users/2", &User::new("Sam", 20));

    let mut session = store.open_session().unwrap();
    let _: Option<User> = session.load("users/1").unwrap();
    let _: Option<User> = session.load("users/2").unwrap();
    session
        .set_metadata("users/1", "reviewed", json!(true))
        .unwrap();
    session.delete("users/2").unwrap();
    session.store_with_id(&User::new("Sam", 20), "users/2").unwrap();

    let changes = session.what_changed();
    assert_eq!(changes["users/1"].len(), 1);
    assert_eq!(changes["users/1"][0].change, ChangeType::NewField);
    assert_eq!(changes["users/1"][0].field_path, "@metadata.reviewed");
    assert_eq!(changes["users/2"].len(), 1);
    assert_eq!(changes["users/2"][0].change, ChangeType::DocumentAdded);

    let data = session.prepare_for_save_changes().unwrap();
    let types: Vec<_> = data.commands().iter().map(|c| c.command_type()).collect();
    assert_eq!(types, vec![CommandType::Put, CommandType::Put]);
}

#[test]
fn cancelled_session_sends_nothing() {
    let (server, store) = test_store();
    let token = CancellationToken::new();
    let mut session = store.open_session().unwrap().with_cancellation(token.clone());
    session.store_with_id(&User::new("Vic", 1), "users/1").unwrap();

    token.cancel();
    assert!(matches!(session.save_changes(), Err(ClientError::Cancelled)));
    assert!(matches!(session.load::<User>("users/2"), Err(ClientError::Cancelled)));
    assert_eq!(RequestCounters::get(&server.counters().batches), 0);
    assert!(session.has_changes());
}

#[test]
fn session_id_is_sent_with_requests() {
    let (server, store) = test_store();
    let mut first = store.open_session().unwrap();
    let mut second = store.open_session().unwrap();
    assert_ne!(first.session_id(), second.session_id());

    first.load::<User>("users/1").unwrap();
    second.load::<User>("users/1").unwrap();
    assert_eq!(server.session_count(), 2);
}

#[test]
fn sessions_target_their_database() {
    let (servers, store) = multi_database_store(&["east", "west"]);

    let mut east = store.open_session().unwrap();
    let east_id = east.store(&User::new("Wes", 1)).unwrap();
    east.save_changes().unwrap();

    let mut west = store
        .open_session_with(SessionOptions::new().with_database("west"))
        .unwrap();
    let west_id = west.store(&User::new("Xan", 2)).unwrap();
    west.save_changes().unwrap();

    assert_eq!(east_id, "users/1-A");
    assert_eq!(west_id, "users/1-A");
    assert_eq!(servers[0].document_count(), 1);
    assert_eq!(servers[1].document_count(), 1);
    assert!(store
        .open_session_with(SessionOptions::new().with_database("north"))
        .is_err());
}

#[test]
fn closing_the_store_returns_unused_ranges() {
    let (server, store) = test_store();
    let mut session = store.open_session().unwrap();
    session.store(&User::new("Yan", 1)).unwrap();
    session.save_changes().unwrap();

    store.close().unwrap();
    let returns = server.hilo_returns();
    assert_eq!(returns.len(), 1);
    assert_eq!(returns[0].tag, "users");
    assert_eq!(returns[0].last, 1);
    assert_eq!(returns[0].end, DEFAULT_HILO_RANGE_SIZE);
    assert!(matches!(store.open_session(), Err(ClientError::Closed)));
}
