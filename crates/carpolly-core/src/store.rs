//! The `DocumentStore` trait and the change-stream handle it hands out.
//!
//! The trait captures the capability set of a hosted hierarchical document
//! database: CRUD on documents, ordered enumeration of a collection, child
//! creation with a store-assigned id, and change-subscriptions. Higher layers
//! (`carpolly-sync`) depend on this abstraction, not on any concrete backend.

use std::{
  fmt,
  future::Future,
  sync::{Arc, Mutex, PoisonError},
};

use crate::document::{
  CollectionPath, DocPath, Document, Fields, SetMode, Snapshot, WatchTarget,
};

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Error bound for store backends.
pub trait StoreError: std::error::Error + Send + Sync + 'static {
  /// Whether the failure means the addressed document does not exist.
  fn is_not_found(&self) -> bool;
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// Invoked with the target's fresh state after every relevant change.
pub type ChangeHandler = Arc<dyn Fn(Snapshot) + Send + Sync>;

/// Invoked once when a change-stream fails; the stream emits nothing after.
pub type ErrorHandler<E> = Arc<dyn Fn(E) + Send + Sync>;

// ─── Subscription ────────────────────────────────────────────────────────────

type Release = Box<dyn FnOnce() + Send>;

/// Disposal handle for a change-stream.
///
/// Disposing is idempotent: only the first call runs the release action.
/// Dropping the handle disposes it.
pub struct Subscription {
  release: Mutex<Option<Release>>,
}

impl Subscription {
  pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
    Self { release: Mutex::new(Some(Box::new(release))) }
  }

  /// Release the underlying stream. Later calls are no-ops.
  pub fn dispose(&self) {
    let release = self
      .release
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(release) = release {
      release();
    }
  }

  pub fn is_disposed(&self) -> bool {
    self
      .release
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .is_none()
  }
}

impl Drop for Subscription {
  fn drop(&mut self) { self.dispose(); }
}

impl fmt::Debug for Subscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("disposed", &self.is_disposed())
      .finish()
  }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a hierarchical document store backend.
///
/// Field values of [`crate::document::FieldValue::ServerTimestamp`] are
/// resolved by the store when a write is applied. Identifiers are path
/// segments only.
///
/// All methods return `Send` futures so the trait can be used in multi-threaded
/// async runtimes.
pub trait DocumentStore: Send + Sync + 'static {
  type Error: StoreError;

  /// Read one document. Returns `None` if it does not exist.
  fn get_document(
    &self,
    path: DocPath,
  ) -> impl Future<Output = Result<Option<Document>, Self::Error>> + Send + '_;

  /// Write a document, replacing or merging per `mode`. Creates it if absent.
  fn set_document(
    &self,
    path: DocPath,
    fields: Fields,
    mode: SetMode,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Merge `fields` into an existing document.
  ///
  /// Fails with an error whose [`StoreError::is_not_found`] is `true` when
  /// the document does not exist.
  fn update_document(
    &self,
    path: DocPath,
    fields: Fields,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Remove exactly one document. Sub-collections are left untouched.
  /// Deleting an absent document is not an error.
  fn delete_document(
    &self,
    path: DocPath,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// All documents directly inside `collection`, in creation order.
  fn list_children(
    &self,
    collection: CollectionPath,
  ) -> impl Future<Output = Result<Vec<Document>, Self::Error>> + Send + '_;

  /// Create a document with a store-assigned id and return that id.
  fn add_child(
    &self,
    collection: CollectionPath,
    fields: Fields,
  ) -> impl Future<Output = Result<String, Self::Error>> + Send + '_;

  /// Open a change-stream on `target`.
  ///
  /// `on_change` fires with the target's fresh state after every write that
  /// is visible through the target and was applied after this call returned.
  /// No initial snapshot is delivered. If reading the target fails,
  /// `on_error` fires once and the stream goes quiet.
  fn subscribe(
    &self,
    target: WatchTarget,
    on_change: ChangeHandler,
    on_error: ErrorHandler<Self::Error>,
  ) -> impl Future<Output = Result<Subscription, Self::Error>> + Send + '_;
}
