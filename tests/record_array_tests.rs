/// Record array tests
///
/// Tests for live arrays: tick-boundary membership updates, per-tick
/// coalescing, stable ordering, synchronous seeding and removal on unload.
/// Run with: cargo test --test record_array_tests
mod common;

use common::{ScriptedAdapter, store_with};
use recordstore::{Record, RecordArrayKind, RecordRef, Store};
use serde_json::json;
use std::sync::Arc;

fn size(record: &Record) -> i64 {
    record.get("size").and_then(|v| v.as_i64()).unwrap_or(0)
}

fn store() -> Store {
    store_with(Arc::new(ScriptedAdapter::new()), &["widget", "gadget"])
}

fn client_ids(records: impl IntoIterator<Item = RecordRef>) -> Vec<u64> {
    records.into_iter().map(|r| r.client_id().0).collect()
}

#[test]
fn test_membership_changes_at_tick_boundary() {
    let store = store();
    let large = store.filter("widget", |r| size(r) > 10).unwrap();
    assert_eq!(large.kind(), RecordArrayKind::Filtered);
    assert!(large.is_loaded());

    let widget = store.push("widget", json!({"id": 1, "size": 20})).unwrap();
    assert!(!large.contains(&widget));
    store.run_tick().unwrap();
    assert!(large.contains(&widget));

    store.set_attribute(&widget, "size", json!(5)).unwrap();
    assert!(large.contains(&widget));
    store.run_tick().unwrap();
    assert!(!large.contains(&widget));
}

#[test]
fn test_changes_within_a_tick_are_evaluated_once() {
    let store = store();
    let large = store.filter("widget", |r| size(r) > 10).unwrap();
    let widget = store.push("widget", json!({"id": 1, "size": 1})).unwrap();

    for value in [5, 50, 15] {
        store.set_attribute(&widget, "size", json!(value)).unwrap();
    }
    store.record_did_change(&widget).unwrap();
    assert!(store.has_pending_work().unwrap());

    let report = store.run_tick().unwrap();
    assert_eq!(report.records_changed, 1);
    assert!(large.contains(&widget));
    assert!(!store.has_pending_work().unwrap());
}

#[test]
fn test_members_keep_their_position() {
    let store = store();
    let large = store.filter("widget", |r| size(r) > 10).unwrap();
    let records = store
        .push_many(
            "widget",
            vec![
                json!({"id": 1, "size": 11}),
                json!({"id": 2, "size": 12}),
                json!({"id": 3, "size": 13}),
            ],
        )
        .unwrap();
    store.run_tick().unwrap();
    let (a, b, c) = (records[0].clone(), records[1].clone(), records[2].clone());
    assert_eq!(
        client_ids(large.content()),
        client_ids([a.clone(), b.clone(), c.clone()])
    );

    // still matching: no move
    store.set_attribute(&a, "size", json!(99)).unwrap();
    store.run_tick().unwrap();
    assert_eq!(
        client_ids(large.content()),
        client_ids([a.clone(), b.clone(), c.clone()])
    );

    // leaving and re-entering appends
    store.set_attribute(&b, "size", json!(0)).unwrap();
    store.run_tick().unwrap();
    store.set_attribute(&b, "size", json!(30)).unwrap();
    store.run_tick().unwrap();
    assert_eq!(client_ids(large.content()), client_ids([a, c, b]));
}

#[test]
fn test_new_filter_is_seeded_synchronously() {
    let store = store();
    store
        .push_many(
            "widget",
            vec![json!({"id": 1, "size": 20}), json!({"id": 2, "size": 2})],
        )
        .unwrap();
    store.record_for_id("widget", 3).unwrap();

    let large = store.filter("widget", |r| size(r) > 10).unwrap();
    assert_eq!(large.len(), 1);

    // empty shells are never members of the all array
    let all = store.all("widget").unwrap();
    assert_eq!(all.kind(), RecordArrayKind::All);
    assert_eq!(all.len(), 2);
}

#[test]
fn test_arrays_are_scoped_to_their_type() {
    let store = store();
    let widgets = store.all("widget").unwrap();
    let gadget = store.push("gadget", json!({"id": 1})).unwrap();
    store.run_tick().unwrap();

    assert!(!widgets.contains(&gadget));
    assert_eq!(store.all("gadget").unwrap().len(), 1);
}

#[tokio::test]
async fn test_unload_removes_from_every_array_at_once() {
    let store = store();
    let all = store.all("widget").unwrap();
    let large = store.filter("widget", |r| size(r) > 10).unwrap();
    let widget = store.push("widget", json!({"id": 1, "size": 20})).unwrap();
    let other = store.push("widget", json!({"id": 2, "size": 30})).unwrap();
    store.run_tick().unwrap();

    let many = store.find_many_by_ids("widget", [1, 2], None).unwrap();
    assert!(many.is_loaded());
    assert_eq!((all.len(), large.len(), many.len()), (2, 2, 2));

    store.unload_record(&widget).unwrap();
    assert!(!all.contains(&widget));
    assert!(!large.contains(&widget));
    assert!(!many.contains(&widget));
    assert!(many.contains(&other));
}

#[tokio::test]
async fn test_unloading_the_last_pending_member_completes_the_array() {
    let adapter = Arc::new(ScriptedAdapter::gated());
    let store = store_with(adapter.clone(), &["widget"]);
    store.push("widget", json!({"id": 1})).unwrap();

    let many = store.find_many_by_ids("widget", [1, 2], None).unwrap();
    assert!(!many.is_loaded());

    let pending = store.get_by_id("widget", 2).unwrap().unwrap();
    store.unload_record(&pending).unwrap();
    assert!(many.is_loaded());
    assert_eq!(many.len(), 1);
    assert_eq!(many.load_notifications(), 1);
}
