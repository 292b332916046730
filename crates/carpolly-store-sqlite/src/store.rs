//! [`SqliteStore`], the SQLite implementation of [`DocumentStore`].

use std::{
  path::Path,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
};

use carpolly_core::{
  document::{
    CollectionPath, DocPath, Document, Fields, SetMode, Snapshot, WatchTarget,
  },
  store::{ChangeHandler, DocumentStore, ErrorHandler, Subscription},
};
use chrono::Utc;
use rusqlite::OptionalExtension as _;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{RawDocument, encode_dt, resolve_server_timestamps},
  schema::SCHEMA,
};

/// Capacity of the in-process change feed. A subscriber that falls further
/// behind than this re-reads its target instead of replaying every change.
const CHANGE_FEED_CAPACITY: usize = 1024;

const SELECT_COLUMNS: &str =
  "SELECT path, fields_json, create_time, update_time FROM documents";

/// How [`SqliteStore::write`] combines new fields with an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
  Replace,
  Merge,
  /// Merge, but leave absent documents absent.
  MergeExisting,
}

impl From<SetMode> for WriteMode {
  fn from(mode: SetMode) -> Self {
    match mode {
      SetMode::Replace => Self::Replace,
      SetMode::Merge => Self::Merge,
    }
  }
}

fn other(e: impl std::error::Error + Send + Sync + 'static) -> tokio_rusqlite::Error {
  tokio_rusqlite::Error::Other(Box::new(e))
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Carpolly document store backed by a single SQLite file.
///
/// Cloning is cheap. Clones share the connection, the change feed and the
/// live-subscription counter.
#[derive(Clone)]
pub struct SqliteStore {
  conn:    tokio_rusqlite::Connection,
  changes: broadcast::Sender<DocPath>,
  live:    Arc<AtomicUsize>,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::from_connection(conn).await
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::from_connection(conn).await
  }

  async fn from_connection(conn: tokio_rusqlite::Connection) -> Result<Self> {
    let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
    let store = Self {
      conn,
      changes,
      live: Arc::new(AtomicUsize::new(0)),
    };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Number of change-streams opened and not yet disposed.
  pub fn live_subscriptions(&self) -> usize { self.live.load(Ordering::SeqCst) }

  fn publish(&self, path: DocPath) {
    // no receivers is not an error
    let _ = self.changes.send(path);
  }

  /// Apply one write atomically. Returns `false` if `mode` is
  /// [`WriteMode::MergeExisting`] and the document does not exist.
  async fn write(
    &self,
    path: DocPath,
    fields: Fields,
    mode: WriteMode,
  ) -> Result<bool> {
    let now = Utc::now();
    let fields = resolve_server_timestamps(fields, now);
    let now_str = encode_dt(now);
    let path_str = path.as_str().to_owned();
    let parent_str = path.parent().as_str().to_owned();

    let written = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
          .query_row(
            "SELECT fields_json FROM documents WHERE path = ?1",
            rusqlite::params![path_str],
            |r| r.get(0),
          )
          .optional()?;

        let merged = match (mode, existing) {
          (WriteMode::MergeExisting, None) => return Ok(false),
          (WriteMode::Replace, _) | (WriteMode::Merge, None) => fields,
          (_, Some(json)) => {
            let mut current: Fields = serde_json::from_str(&json).map_err(other)?;
            current.extend(fields);
            current
          }
        };
        let json = serde_json::to_string(&merged).map_err(other)?;

        tx.execute(
          "INSERT INTO documents
             (path, parent, fields_json, create_time, update_time)
           VALUES (?1, ?2, ?3, ?4, ?4)
           ON CONFLICT(path) DO UPDATE SET
             fields_json = excluded.fields_json,
             update_time = excluded.update_time",
          rusqlite::params![path_str, parent_str, json, now_str],
        )?;
        tx.commit()?;
        Ok(true)
      })
      .await?;

    if written {
      self.publish(path);
    }
    Ok(written)
  }

  /// Read the current state of `target`.
  async fn snapshot(&self, target: &WatchTarget) -> Result<Snapshot> {
    Ok(match target {
      WatchTarget::Document(path) => {
        Snapshot::Document(self.get_document(path.clone()).await?)
      }
      WatchTarget::Collection(path) => {
        Snapshot::Collection(self.list_children(path.clone()).await?)
      }
    })
  }
}

// ─── DocumentStore impl ──────────────────────────────────────────────────────

impl DocumentStore for SqliteStore {
  type Error = Error;

  async fn get_document(&self, path: DocPath) -> Result<Option<Document>> {
    let path_str = path.as_str().to_owned();

    let raw: Option<RawDocument> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("{SELECT_COLUMNS} WHERE path = ?1"),
              rusqlite::params![path_str],
              RawDocument::from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawDocument::into_document).transpose()
  }

  async fn set_document(
    &self,
    path: DocPath,
    fields: Fields,
    mode: SetMode,
  ) -> Result<()> {
    self.write(path, fields, mode.into()).await?;
    Ok(())
  }

  async fn update_document(&self, path: DocPath, fields: Fields) -> Result<()> {
    let path_str = path.to_string();
    if self.write(path, fields, WriteMode::MergeExisting).await? {
      Ok(())
    } else {
      Err(Error::DocumentNotFound(path_str))
    }
  }

  async fn delete_document(&self, path: DocPath) -> Result<()> {
    let path_str = path.as_str().to_owned();

    let deleted = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "DELETE FROM documents WHERE path = ?1",
          rusqlite::params![path_str],
        )?)
      })
      .await?;

    if deleted > 0 {
      self.publish(path);
    }
    Ok(())
  }

  async fn list_children(
    &self,
    collection: CollectionPath,
  ) -> Result<Vec<Document>> {
    let parent_str = collection.as_str().to_owned();

    let raws: Vec<RawDocument> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn
          .prepare(&format!("{SELECT_COLUMNS} WHERE parent = ?1 ORDER BY seq"))?;
        let rows = stmt
          .query_map(rusqlite::params![parent_str], RawDocument::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawDocument::into_document).collect()
  }

  async fn add_child(
    &self,
    collection: CollectionPath,
    fields: Fields,
  ) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let path = collection.doc(&id)?;
    self.write(path, fields, WriteMode::Replace).await?;
    Ok(id)
  }

  async fn subscribe(
    &self,
    target: WatchTarget,
    on_change: ChangeHandler,
    on_error: ErrorHandler<Error>,
  ) -> Result<Subscription> {
    // Attach to the feed before returning so no later write is missed.
    let mut changes = self.changes.subscribe();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let store = self.clone();

    self.live.fetch_add(1, Ordering::SeqCst);
    debug!(%target, "change-stream opened");

    tokio::spawn(async move {
      loop {
        let received = tokio::select! {
          biased;
          _ = &mut stop_rx => break,
          received = changes.recv() => received,
        };

        match received {
          Ok(changed) if !target.is_affected_by(&changed) => continue,
          Ok(_) => {}
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(%target, skipped, "change-stream lagged; re-reading target");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }

        match store.snapshot(&target).await {
          Ok(snapshot) => {
            // disposed while reading
            if !matches!(
              stop_rx.try_recv(),
              Err(oneshot::error::TryRecvError::Empty)
            ) {
              break;
            }
            on_change(snapshot);
          }
          Err(e) => {
            error!(%target, error = %e, "change-stream read failed");
            on_error(e);
            break;
          }
        }
      }
      debug!(%target, "change-stream closed");
    });

    let live = self.live.clone();
    Ok(Subscription::new(move || {
      let _ = stop_tx.send(());
      live.fetch_sub(1, Ordering::SeqCst);
    }))
  }
}
