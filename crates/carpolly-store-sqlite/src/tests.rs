//! Integration tests for `SqliteStore` against an in-memory database.

use std::{sync::Arc, time::Duration};

use carpolly_core::{
  document::{
    CollectionPath, DocPath, FieldValue, Fields, SetMode, Snapshot, WatchTarget,
  },
  store::{DocumentStore, StoreError},
};
use tokio::sync::mpsc;

use crate::{Error, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn pollies() -> CollectionPath { CollectionPath::root("pollies").unwrap() }

fn polly(id: &str) -> DocPath { pollies().doc(id).unwrap() }

fn drivers(polly_id: &str) -> CollectionPath {
  polly(polly_id).collection("drivers").unwrap()
}

fn fields(pairs: &[(&str, FieldValue)]) -> Fields {
  pairs
    .iter()
    .map(|(k, v)| ((*k).to_owned(), v.clone()))
    .collect()
}

// ─── Documents ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn set_and_get_document() {
  let s = store().await;
  let path = polly("p1");

  s.set_document(
    path.clone(),
    fields(&[("description", "Friday ride".into())]),
    SetMode::Replace,
  )
  .await
  .unwrap();

  let doc = s.get_document(path.clone()).await.unwrap().unwrap();
  assert_eq!(doc.path, path);
  assert_eq!(doc.id(), "p1");
  assert_eq!(doc.get("description"), Some(&FieldValue::from("Friday ride")));
  assert_eq!(doc.create_time, doc.update_time);
}

#[tokio::test]
async fn get_missing_document_returns_none() {
  let s = store().await;
  assert!(s.get_document(polly("nope")).await.unwrap().is_none());
}

#[tokio::test]
async fn replace_drops_unlisted_fields_and_merge_keeps_them() {
  let s = store().await;
  let path = polly("p1");
  let initial = fields(&[("a", 1i64.into()), ("b", 2i64.into())]);

  s.set_document(path.clone(), initial.clone(), SetMode::Replace)
    .await
    .unwrap();
  s.set_document(path.clone(), fields(&[("b", 3i64.into())]), SetMode::Merge)
    .await
    .unwrap();
  let doc = s.get_document(path.clone()).await.unwrap().unwrap();
  assert_eq!(doc.get("a"), Some(&FieldValue::Integer(1)));
  assert_eq!(doc.get("b"), Some(&FieldValue::Integer(3)));

  s.set_document(path.clone(), fields(&[("c", 4i64.into())]), SetMode::Replace)
    .await
    .unwrap();
  let doc = s.get_document(path).await.unwrap().unwrap();
  assert_eq!(doc.fields, fields(&[("c", 4i64.into())]));
}

#[tokio::test]
async fn overwrite_keeps_create_time() {
  let s = store().await;
  let path = polly("p1");

  s.set_document(path.clone(), fields(&[("a", 1i64.into())]), SetMode::Replace)
    .await
    .unwrap();
  let first = s.get_document(path.clone()).await.unwrap().unwrap();

  tokio::time::sleep(Duration::from_millis(5)).await;
  s.update_document(path.clone(), fields(&[("a", 2i64.into())]))
    .await
    .unwrap();
  let second = s.get_document(path).await.unwrap().unwrap();

  assert_eq!(second.create_time, first.create_time);
  assert!(second.update_time > first.update_time);
}

#[tokio::test]
async fn update_missing_document_is_not_found() {
  let s = store().await;
  let err = s
    .update_document(polly("ghost"), fields(&[("a", 1i64.into())]))
    .await
    .unwrap_err();

  assert!(matches!(err, Error::DocumentNotFound(_)));
  assert!(err.is_not_found());
  // nothing was created
  assert!(s.get_document(polly("ghost")).await.unwrap().is_none());
}

#[tokio::test]
async fn server_timestamps_are_resolved_on_write() {
  let s = store().await;
  let path = polly("p1");

  s.set_document(
    path.clone(),
    fields(&[("created", FieldValue::server_timestamp())]),
    SetMode::Replace,
  )
  .await
  .unwrap();

  let doc = s.get_document(path).await.unwrap().unwrap();
  match doc.get("created") {
    Some(FieldValue::Timestamp(at)) => assert_eq!(*at, doc.create_time),
    other => panic!("expected resolved timestamp, got {other:?}"),
  }
}

#[tokio::test]
async fn delete_leaves_subcollections_untouched() {
  let s = store().await;
  s.set_document(polly("p1"), Fields::new(), SetMode::Replace)
    .await
    .unwrap();
  let driver_id = s.add_child(drivers("p1"), Fields::new()).await.unwrap();

  s.delete_document(polly("p1")).await.unwrap();
  // deleting again is fine
  s.delete_document(polly("p1")).await.unwrap();

  assert!(s.get_document(polly("p1")).await.unwrap().is_none());
  let orphans = s.list_children(drivers("p1")).await.unwrap();
  assert_eq!(orphans.len(), 1);
  assert_eq!(orphans[0].id(), driver_id);
}

// ─── Collections ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn children_list_in_creation_order() {
  let s = store().await;
  let mut ids = Vec::new();
  for n in 0..5i64 {
    ids.push(
      s.add_child(drivers("p1"), fields(&[("n", n.into())]))
        .await
        .unwrap(),
    );
  }

  // rewriting the first child does not move it
  let first = drivers("p1").doc(&ids[0]).unwrap();
  s.update_document(first, fields(&[("n", 9i64.into())]))
    .await
    .unwrap();

  let listed: Vec<String> = s
    .list_children(drivers("p1"))
    .await
    .unwrap()
    .iter()
    .map(|d| d.id().to_owned())
    .collect();
  assert_eq!(listed, ids);
}

#[tokio::test]
async fn list_children_excludes_grandchildren() {
  let s = store().await;
  let driver_id = s.add_child(drivers("p1"), Fields::new()).await.unwrap();
  let consumers = drivers("p1")
    .doc(&driver_id)
    .unwrap()
    .collection("consumers")
    .unwrap();
  s.add_child(consumers.clone(), Fields::new()).await.unwrap();

  assert_eq!(s.list_children(drivers("p1")).await.unwrap().len(), 1);
  assert_eq!(s.list_children(consumers).await.unwrap().len(), 1);
  assert!(s.list_children(drivers("other")).await.unwrap().is_empty());
}

#[tokio::test]
async fn added_child_ids_are_unique() {
  let s = store().await;
  let a = s.add_child(drivers("p1"), Fields::new()).await.unwrap();
  let b = s.add_child(drivers("p1"), Fields::new()).await.unwrap();
  assert_ne!(a, b);
  assert!(carpolly_core::validate::validate_uuid(&a).is_ok());
}

// ─── Change-streams ──────────────────────────────────────────────────────────

async fn watch(
  s: &SqliteStore,
  target: WatchTarget,
) -> (carpolly_core::store::Subscription, mpsc::UnboundedReceiver<Snapshot>) {
  let (tx, rx) = mpsc::unbounded_channel();
  let sub = s
    .subscribe(
      target,
      Arc::new(move |snapshot: Snapshot| {
        let _ = tx.send(snapshot);
      }),
      Arc::new(|e: Error| panic!("unexpected stream error: {e}")),
    )
    .await
    .unwrap();
  (sub, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Snapshot>) -> Snapshot {
  tokio::time::timeout(Duration::from_secs(2), rx.recv())
    .await
    .expect("snapshot within timeout")
    .expect("stream still open")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Snapshot>) {
  let got = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
  // a closed stream is quiet too
  assert!(!matches!(got, Ok(Some(_))), "unexpected snapshot: {got:?}");
}

#[tokio::test]
async fn subscribe_delivers_no_initial_snapshot() {
  let s = store().await;
  s.set_document(polly("p1"), Fields::new(), SetMode::Replace)
    .await
    .unwrap();

  let (_sub, mut rx) = watch(&s, WatchTarget::Document(polly("p1"))).await;
  assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn document_stream_sees_writes_and_deletes() {
  let s = store().await;
  let (_sub, mut rx) = watch(&s, WatchTarget::Document(polly("p1"))).await;

  s.set_document(polly("p1"), fields(&[("a", 1i64.into())]), SetMode::Replace)
    .await
    .unwrap();
  match next(&mut rx).await {
    Snapshot::Document(Some(doc)) => {
      assert_eq!(doc.get("a"), Some(&FieldValue::Integer(1)))
    }
    other => panic!("unexpected snapshot {other:?}"),
  }

  s.delete_document(polly("p1")).await.unwrap();
  assert_eq!(next(&mut rx).await, Snapshot::Document(None));

  // other documents are invisible
  s.set_document(polly("p2"), Fields::new(), SetMode::Replace)
    .await
    .unwrap();
  assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn collection_stream_ignores_grandchildren() {
  let s = store().await;
  let (_sub, mut rx) = watch(&s, WatchTarget::Collection(drivers("p1"))).await;

  let driver_id = s.add_child(drivers("p1"), Fields::new()).await.unwrap();
  match next(&mut rx).await {
    Snapshot::Collection(docs) => {
      assert_eq!(docs.len(), 1);
      assert_eq!(docs[0].id(), driver_id);
    }
    other => panic!("unexpected snapshot {other:?}"),
  }

  let consumers = drivers("p1")
    .doc(&driver_id)
    .unwrap()
    .collection("consumers")
    .unwrap();
  s.add_child(consumers, Fields::new()).await.unwrap();
  // the parent document itself is not part of the collection either
  s.set_document(polly("p1"), Fields::new(), SetMode::Replace)
    .await
    .unwrap();
  assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn failed_update_publishes_nothing() {
  let s = store().await;
  let (_sub, mut rx) = watch(&s, WatchTarget::Document(polly("p1"))).await;

  assert!(s.update_document(polly("p1"), Fields::new()).await.is_err());
  s.delete_document(polly("p1")).await.unwrap();
  assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn dispose_stops_delivery_and_releases_stream() {
  let s = store().await;
  assert_eq!(s.live_subscriptions(), 0);

  let (sub, mut rx) = watch(&s, WatchTarget::Collection(drivers("p1"))).await;
  let (other, _other_rx) = watch(&s, WatchTarget::Document(polly("p1"))).await;
  assert_eq!(s.live_subscriptions(), 2);

  sub.dispose();
  sub.dispose();
  assert_eq!(s.live_subscriptions(), 1);

  s.add_child(drivers("p1"), Fields::new()).await.unwrap();
  assert_quiet(&mut rx).await;

  drop(other);
  assert_eq!(s.live_subscriptions(), 0);
}
