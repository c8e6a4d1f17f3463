//! End-to-end scenarios against the in-memory authority.

use canopy_core::{AbortReason, DatabaseError, EventType, QueryParams, QuerySpec, RepoConfig};
use canopy_testkit::prelude::*;
use canopy_value::Path;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn at(path: &str) -> QuerySpec {
    QuerySpec::default_at(Path::parse(path))
}

fn increment(value: Value) -> Option<Value> {
    Some(json!(value.as_i64().unwrap_or(0) + 1))
}

#[test]
fn transaction_gives_up_after_retry_bound() {
    init_logging();
    let server = TestServer::with_data(json!({"foo": 0}));
    server.set_always_stale(true);
    let repo = server.connect();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut done = repo
        .start_transaction(
            &Path::parse("foo"),
            move |value| {
                counter.fetch_add(1, Ordering::SeqCst);
                increment(value)
            },
            true,
        )
        .unwrap();
    server.deliver(&repo);

    assert_eq!(calls.load(Ordering::SeqCst), 25);
    assert_eq!(
        done.try_recv().unwrap().unwrap_err(),
        DatabaseError::TransactionAborted(AbortReason::MaxRetry)
    );
    assert_eq!(repo.pending_transactions(), 0);
    assert_eq!(repo.pending_writes(), 0);
    assert_eq!(server.data(&Path::parse("foo")), json!(0));
}

#[test]
fn retry_bound_follows_config() {
    let server = TestServer::with_data(json!({"foo": 0}));
    server.set_always_stale(true);
    let repo = server.connect_with(RepoConfig::default().with_max_transaction_retries(3));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut done = repo
        .start_transaction(
            &Path::parse("foo"),
            move |value| {
                counter.fetch_add(1, Ordering::SeqCst);
                increment(value)
            },
            true,
        )
        .unwrap();
    server.deliver(&repo);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(done.try_recv().unwrap().is_err());
}

#[test]
fn stale_transaction_reruns_with_fresh_data() {
    let server = TestServer::with_data(json!({"counter": 5}));
    let repo = server.connect();
    let inputs = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = inputs.clone();
    let mut done = repo
        .start_transaction(
            &Path::parse("counter"),
            move |value| {
                seen.lock().push(value.clone());
                increment(value)
            },
            true,
        )
        .unwrap();
    server.deliver(&repo);

    assert_eq!(*inputs.lock(), vec![Value::Null, json!(5)]);
    let outcome = done.try_recv().unwrap().unwrap();
    assert!(outcome.committed);
    assert_eq!(outcome.snapshot.val(), json!(6));
    assert_eq!(server.data(&Path::parse("counter")), json!(6));
    assert_eq!(repo.stats().transactions_committed, 1);
}

#[test]
fn transaction_returning_none_reports_uncommitted() {
    let server = TestServer::with_data(json!({"name": "ada"}));
    let repo = server.connect();
    let mut done = repo
        .start_transaction(
            &Path::parse("name"),
            |value| match value {
                Value::Null => Some(json!("grace")),
                _ => None,
            },
            true,
        )
        .unwrap();
    server.deliver(&repo);

    let outcome = done.try_recv().unwrap().unwrap();
    assert!(!outcome.committed);
    assert_eq!(outcome.snapshot.val(), json!("ada"));
    assert_eq!(server.data(&Path::parse("name")), json!("ada"));
    assert_eq!(repo.get_value(&at("name")).map(|s| s.val()), None);
}

#[test]
fn set_aborts_waiting_child_transaction() {
    let server = TestServer::with_data(json!({"foo": {"a": 1}}));
    let repo = server.connect();
    let recorder = Recorder::new();
    repo.add_event_callback(&at("foo"), recorder.values());
    server.deliver(&repo);

    let mut parent = repo
        .start_transaction(
            &Path::parse("foo"),
            |mut value| {
                value.as_object_mut()?.insert("x".into(), json!(1));
                Some(value)
            },
            true,
        )
        .unwrap();
    let mut child = repo
        .start_transaction(&Path::parse("foo/a"), increment, true)
        .unwrap();
    assert_eq!(repo.pending_transactions(), 2);

    repo.set(&Path::parse("foo"), &json!({"a": 2, "b": 3}))
        .unwrap();
    assert_eq!(
        child.try_recv().unwrap().unwrap_err(),
        DatabaseError::TransactionAborted(AbortReason::Set)
    );

    server.deliver(&repo);
    assert!(parent.try_recv().unwrap().unwrap().committed);
    assert_eq!(server.data(&Path::parse("foo")), json!({"a": 2, "b": 3}));
    assert_eq!(recorder.last_value(), Some(json!({"a": 2, "b": 3})));
    assert_eq!(repo.pending_transactions(), 0);
}

#[test]
fn set_aborts_sent_transaction_once_answered() {
    let server = TestServer::with_data(json!({"foo": 1}));
    let repo = server.connect();
    let recorder = Recorder::new();
    repo.add_event_callback(&at("foo"), recorder.values());
    server.deliver(&repo);
    server.set_data(&Path::parse("foo"), &json!(5));

    let mut done = repo
        .start_transaction(&Path::parse("foo"), increment, true)
        .unwrap();
    assert_eq!(recorder.last_value(), Some(json!(2)));
    repo.set(&Path::parse("foo"), &json!(10)).unwrap();
    assert!(done.try_recv().is_err());

    server.deliver(&repo);
    assert_eq!(
        done.try_recv().unwrap().unwrap_err(),
        DatabaseError::TransactionAborted(AbortReason::Set)
    );
    assert_eq!(server.data(&Path::parse("foo")), json!(10));
    assert_eq!(recorder.last_value(), Some(json!(10)));
}

#[test]
fn hidden_transaction_surfaces_only_committed_value() {
    let server = TestServer::with_data(json!({"c": 1}));
    let repo = server.connect();
    let recorder = Recorder::new();
    repo.add_event_callback(&at("c"), recorder.values());
    server.deliver(&repo);

    let mut done = repo
        .start_transaction(&Path::parse("c"), increment, false)
        .unwrap();
    assert_eq!(recorder.len(), 1);
    server.deliver(&repo);

    assert!(done.try_recv().unwrap().unwrap().committed);
    let values: Vec<Value> = recorder.take().into_iter().map(|e| e.value).collect();
    assert_eq!(values, vec![json!(1), json!(2)]);
}

#[test]
fn windowed_query_slides_on_insert() {
    let server = TestServer::with_data(json!({"items": {"a": 1, "b": 2, "c": 3}}));
    let repo = server.connect();
    let query = QuerySpec::new(Path::parse("items"), QueryParams::new().limit_to_last(2));
    let recorder = Recorder::new();
    repo.add_event_callback(
        &query,
        recorder.children(&[EventType::ChildAdded, EventType::ChildRemoved]),
    );
    server.deliver(&repo);
    assert_eq!(
        recorder.take_described(),
        vec!["child_added:b", "child_added:c"]
    );

    repo.set(&Path::parse("items/d"), &json!(4)).unwrap();
    assert_eq!(
        recorder.take_described(),
        vec!["child_added:d", "child_removed:b"]
    );

    server.deliver(&repo);
    assert!(recorder.is_empty());
    let snapshot = repo.get_value(&query).unwrap();
    assert_eq!(snapshot.val(), json!({"c": 3, "d": 4}));
}

#[test]
fn rejected_update_is_reverted() {
    let server = TestServer::with_data(json!({"u": {"a": 1}}));
    let repo = server.connect();
    let recorder = Recorder::new();
    repo.add_event_callback(&at("u"), recorder.values());
    server.deliver(&repo);
    server.reject_writes(Some("permission_denied"));

    let mut values = Map::new();
    values.insert("b".into(), json!(2));
    let mut done = repo.update(&Path::parse("u"), &values).unwrap();
    assert_eq!(recorder.last_value(), Some(json!({"a": 1, "b": 2})));

    server.deliver(&repo);
    assert_eq!(recorder.last_value(), Some(json!({"a": 1})));
    assert_eq!(
        done.try_recv().unwrap().unwrap_err(),
        DatabaseError::server("permission_denied", None)
    );
}

#[test]
fn accepted_update_reaches_server() {
    let server = TestServer::with_data(json!({"u": {"a": 1, "b": 1}}));
    let repo = server.connect();
    let mut values = Map::new();
    values.insert("b".into(), json!(2));
    values.insert("c/d".into(), json!(3));
    let mut done = repo.update(&Path::parse("u"), &values).unwrap();
    server.deliver(&repo);
    assert_eq!(done.try_recv().unwrap(), Ok(()));
    assert_eq!(
        server.data(&Path::parse("u")),
        json!({"a": 1, "b": 2, "c": {"d": 3}})
    );
}

#[test]
fn on_disconnect_write_applies_locally_on_disconnect() {
    let server = TestServer::with_data(json!({"presence": "online"}));
    let repo = server.connect();
    let recorder = Recorder::new();
    repo.add_event_callback(&at("presence"), recorder.values());
    let mut scheduled = repo
        .on_disconnect_set(&Path::parse("presence"), &json!("offline"))
        .unwrap();
    server.deliver(&repo);
    assert_eq!(scheduled.try_recv().unwrap(), Ok(()));
    assert_eq!(recorder.last_value(), Some(json!("online")));

    server.disconnect(&repo);
    assert_eq!(recorder.last_value(), Some(json!("offline")));
    assert_eq!(server.data(&Path::parse("presence")), json!("offline"));
}

#[test]
fn cancelled_on_disconnect_write_is_not_applied() {
    let server = TestServer::with_data(json!({"presence": "online"}));
    let repo = server.connect();
    let recorder = Recorder::new();
    repo.add_event_callback(&at("presence"), recorder.values());
    repo.on_disconnect_set(&Path::parse("presence"), &json!("offline"))
        .unwrap();
    server.deliver(&repo);
    let mut cancelled = repo
        .on_disconnect_cancel(&Path::parse("presence"))
        .unwrap();
    server.deliver(&repo);
    assert_eq!(cancelled.try_recv().unwrap(), Ok(()));

    server.disconnect(&repo);
    assert_eq!(recorder.last_value(), Some(json!("online")));
    assert_eq!(server.data(&Path::parse("presence")), json!("online"));
}

#[test]
fn server_timestamp_resolves_locally_and_remotely() {
    let server = TestServer::new();
    let repo = server.connect();
    let recorder = Recorder::new();
    repo.add_event_callback(&at("t"), recorder.values());
    server.deliver(&repo);

    repo.set(&Path::parse("t"), &json!({".sv": "timestamp"}))
        .unwrap();
    let local = recorder.last_value().and_then(|v| v.as_f64()).unwrap();
    assert!(local > 0.0);

    server.deliver(&repo);
    assert!(server.data(&Path::parse("t")).as_f64().unwrap() > 0.0);
}

#[test]
fn connection_state_is_reported_under_info() {
    let server = TestServer::new();
    let repo = server.connect();
    let recorder = Recorder::new();
    repo.add_event_callback(&at(".info/connected"), recorder.values());
    repo.on_connect_status(true);
    server.disconnect(&repo);
    let values: Vec<Value> = recorder.take().into_iter().map(|e| e.value).collect();
    assert_eq!(values, vec![json!(false), json!(true), json!(false)]);
    assert!(server.calls().is_empty());
}

#[test]
fn pushed_change_reruns_local_transaction() {
    let server = TestServer::with_data(json!({"n": 1}));
    let repo = server.connect();
    repo.add_event_callback(&at("n"), Recorder::new().values());
    server.deliver(&repo);

    let mut done = repo
        .start_transaction(&Path::parse("n"), increment, true)
        .unwrap();
    server.push_change(&repo, &Path::parse("n"), &json!(10));
    server.deliver(&repo);

    let outcome = done.try_recv().unwrap().unwrap();
    assert!(outcome.committed);
    assert_eq!(outcome.snapshot.val(), json!(11));
    assert_eq!(server.data(&Path::parse("n")), json!(11));
}

#[test]
fn direct_set_aborts_queued_transaction_with_set_reason() {
    let server = TestServer::with_data(json!({"foo": {"a": 1, "b": 2}}));
    let repo = server.connect();
    let recorder = Recorder::new();
    repo.add_event_callback(&at("foo"), recorder.values());
    server.deliver(&repo);

    let mut first = repo
        .start_transaction(&Path::parse("foo/a"), Some, true)
        .unwrap();
    let mut queued = repo
        .start_transaction(&Path::parse("foo/a"), |_| Some(json!(42)), true)
        .unwrap();
    assert_eq!(recorder.last_value(), Some(json!({"a": 42, "b": 2})));

    repo.set(&Path::parse("foo"), &json!({"a": 2, "b": 3}))
        .unwrap();
    assert_eq!(
        queued.try_recv().unwrap().unwrap_err(),
        DatabaseError::TransactionAborted(AbortReason::Set)
    );
    assert_eq!(recorder.last_value(), Some(json!({"a": 2, "b": 3})));

    server.deliver(&repo);
    assert!(first.try_recv().unwrap().is_ok());
    assert_eq!(server.data(&Path::parse("foo")), json!({"a": 2, "b": 3}));
    assert_eq!(
        repo.get_value(&at("foo")).map(|s| s.val()),
        Some(json!({"a": 2, "b": 3}))
    );
    assert_eq!(repo.pending_transactions(), 0);
}

#[test]
fn update_aborts_queued_transaction_below_it() {
    let server = TestServer::with_data(json!({"foo": {"a": 1, "b": 1}}));
    let repo = server.connect();
    let recorder = Recorder::new();
    repo.add_event_callback(&at("foo"), recorder.values());
    server.deliver(&repo);

    let mut outer = repo
        .start_transaction(&Path::parse("foo"), Some, true)
        .unwrap();
    let mut inner = repo
        .start_transaction(&Path::parse("foo/a"), increment, true)
        .unwrap();
    assert_eq!(recorder.last_value(), Some(json!({"a": 2, "b": 1})));

    let mut values = Map::new();
    values.insert("a".into(), json!(5));
    repo.update(&Path::parse("foo"), &values).unwrap();
    assert_eq!(
        inner.try_recv().unwrap().unwrap_err(),
        DatabaseError::TransactionAborted(AbortReason::Update)
    );
    assert_eq!(recorder.last_value(), Some(json!({"a": 5, "b": 1})));

    server.deliver(&repo);
    assert!(outer.try_recv().unwrap().is_ok());
    assert_eq!(server.data(&Path::parse("foo")), json!({"a": 5, "b": 1}));
    assert_eq!(recorder.last_value(), Some(json!({"a": 5, "b": 1})));
}

#[test]
fn disconnect_write_aborts_queued_transaction() {
    let server = TestServer::with_data(json!({"foo": {"a": 1}}));
    let repo = server.connect();
    let recorder = Recorder::new();
    repo.add_event_callback(&at("foo"), recorder.values());
    repo.on_disconnect_set(&Path::parse("foo/a"), &json!("gone"))
        .unwrap();
    server.deliver(&repo);

    let _outer = repo
        .start_transaction(&Path::parse("foo"), Some, true)
        .unwrap();
    let mut inner = repo
        .start_transaction(&Path::parse("foo/a"), increment, true)
        .unwrap();
    assert_eq!(recorder.last_value(), Some(json!({"a": 2})));

    server.disconnect(&repo);
    assert_eq!(
        inner.try_recv().unwrap().unwrap_err(),
        DatabaseError::TransactionAborted(AbortReason::Disconnect)
    );
    assert_eq!(recorder.last_value(), Some(json!({"a": 1})));
    assert_eq!(server.data(&Path::parse("foo/a")), json!("gone"));
}

#[test]
fn rerun_producing_invalid_data_aborts() {
    let server = TestServer::with_data(json!({"n": 1}));
    let repo = server.connect();
    let recorder = Recorder::new();
    repo.add_event_callback(&at("n"), recorder.values());
    server.deliver(&repo);
    server.set_data(&Path::parse("n"), &json!(5));

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut done = repo
        .start_transaction(
            &Path::parse("n"),
            move |_| match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Some(json!(2)),
                _ => Some(json!({"bad.key": 1})),
            },
            true,
        )
        .unwrap();
    assert_eq!(recorder.last_value(), Some(json!(2)));

    server.deliver(&repo);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(matches!(
        done.try_recv().unwrap(),
        Err(DatabaseError::TransactionAborted(AbortReason::InvalidData(_)))
    ));
    assert_eq!(recorder.last_value(), Some(json!(1)));
    assert_eq!(server.data(&Path::parse("n")), json!(5));
    assert_eq!(repo.pending_transactions(), 0);
}
