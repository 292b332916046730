//! The subscription reconciler.
//!
//! One [`Reconciler`] keeps a registry of watched pollies. Each watch owns a
//! stream on the drivers collection, a stream on the waiting list, and one
//! stream per driver on that driver's consumers. Every stream event is queued
//! to a single pump task per watch, which re-reads the whole polly and hands
//! the fresh aggregate to every listener. Snapshots are never patched
//! incrementally, so a callback always sees a self-consistent polly.
//!
//! Any number of listeners may share a watch. A new listener gets one
//! immediate snapshot of its own; the watch and all of its streams are
//! released when the last listener is disposed.

use std::{
  collections::{HashMap, HashSet},
  fmt,
  sync::{
    Arc, Mutex, MutexGuard, PoisonError, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
};

use carpolly_core::{
  document::{Document, Snapshot, WatchTarget},
  model::Polly,
  store::{ChangeHandler, DocumentStore, ErrorHandler, Subscription},
  validate::{Field, ValidationErrors, validate_uuid},
};
use tokio::{
  sync::mpsc::{self, error::TrySendError},
  task::JoinHandle,
};
use tracing::{debug, error, trace};

use crate::{Result, assemble::assemble_from, error::store_err, paths};

/// Receives the reassembled polly, or `None` while its root document is
/// absent. Never receives errors.
pub type PollyCallback = Arc<dyn Fn(Option<Polly>) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Watch state ─────────────────────────────────────────────────────────────

#[derive(Debug)]
enum WatchEvent {
  Drivers,
  WaitingList,
  Consumers { driver_id: String },
  /// Deliver an initial snapshot to one newly added listener.
  Join(u64),
}

struct Listener {
  id:       u64,
  callback: PollyCallback,
  active:   Arc<AtomicBool>,
}

/// Shared state behind one watched polly.
struct Watch {
  polly_id:         String,
  listeners:        Mutex<Vec<Listener>>,
  /// Drivers collection and waiting list.
  top_streams:      Mutex<Vec<Subscription>>,
  /// Keyed by driver id.
  consumer_streams: Mutex<HashMap<String, Subscription>>,
  events:           mpsc::Sender<WatchEvent>,
  pump:             Mutex<Option<JoinHandle<()>>>,
  /// A change event was dropped on a full queue.
  stale:            AtomicBool,
  closed:           AtomicBool,
}

impl Watch {
  /// Queue an event from a stream handler. A full queue drops the event
  /// and marks the watch stale, so whichever queued event the pump takes
  /// next is refreshed for every listener.
  fn notify(&self, event: WatchEvent) {
    let Err(TrySendError::Full(event)) = self.events.try_send(event) else {
      return;
    };
    self.stale.store(true, Ordering::SeqCst);
    // The pump may have emptied the queue before the flag was set.
    if let Err(e) = self.events.try_send(event) {
      trace!(polly_id = %self.polly_id, error = %e, "watch event not queued");
    }
  }

  fn stream_count(&self) -> usize {
    lock(&self.top_streams).len() + lock(&self.consumer_streams).len()
  }

  /// Release every stream and stop the pump.
  fn teardown(&self) {
    self.closed.store(true, Ordering::SeqCst);
    let top = std::mem::take(&mut *lock(&self.top_streams));
    let nested = std::mem::take(&mut *lock(&self.consumer_streams));
    for stream in top.iter().chain(nested.values()) {
      stream.dispose();
    }
    if let Some(pump) = lock(&self.pump).take() {
      pump.abort();
    }
    debug!(
      polly_id = %self.polly_id,
      streams = top.len() + nested.len(),
      "watch torn down"
    );
  }

  /// Hand `polly` to every active listener, or only to `only`.
  fn deliver(&self, only: Option<u64>, polly: Option<Polly>) {
    let targets: Vec<(PollyCallback, Arc<AtomicBool>)> = lock(&self.listeners)
      .iter()
      .filter(|l| only.is_none_or(|id| l.id == id))
      .map(|l| (l.callback.clone(), l.active.clone()))
      .collect();

    for (callback, active) in targets {
      if active.load(Ordering::SeqCst) {
        callback(polly.clone());
      }
    }
  }
}

// ─── Reconciler ──────────────────────────────────────────────────────────────

struct Inner<S> {
  store:         Arc<S>,
  watches:       Mutex<HashMap<String, Arc<Watch>>>,
  event_buffer:  usize,
  next_listener: AtomicU64,
}

/// Fans the change-streams of each watched polly into one callback per
/// listener. Cloning shares the registry.
pub struct Reconciler<S> {
  inner: Arc<Inner<S>>,
}

impl<S> Clone for Reconciler<S> {
  fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}

impl<S: DocumentStore> Reconciler<S> {
  /// `event_buffer` bounds each watch's queue of pending refreshes.
  pub fn new(store: Arc<S>, event_buffer: usize) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        watches: Mutex::new(HashMap::new()),
        event_buffer: event_buffer.max(1),
        next_listener: AtomicU64::new(0),
      }),
    }
  }

  /// Start delivering live snapshots of `polly_id` to `callback`.
  ///
  /// The callback fires once with the current state shortly after
  /// registration (`None` if the polly does not exist), then after every
  /// change to a driver, a driver's consumers, or the waiting list. Stream
  /// failures are logged and the failed stream goes quiet; the callback never
  /// sees an error.
  pub async fn subscribe(
    &self,
    polly_id: &str,
    callback: impl Fn(Option<Polly>) + Send + Sync + 'static,
  ) -> Result<PollySubscription> {
    validate_uuid(polly_id)
      .map_err(|message| ValidationErrors::single(Field::Id, message))?;

    let listener_id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
    let active = Arc::new(AtomicBool::new(true));
    let mut listener = Some(Listener {
      id:       listener_id,
      callback: Arc::new(callback),
      active:   active.clone(),
    });

    let events = loop {
      if let Some(events) = self.join_existing(polly_id, &mut listener) {
        break events;
      }

      let (watch, rx) = self.open_watch(polly_id).await?;
      if self.install(&watch, &mut listener, rx) {
        break watch.events.clone();
      }
      // Lost a race with another subscriber; join theirs instead.
      watch.teardown();
    };
    if events.send(WatchEvent::Join(listener_id)).await.is_err() {
      debug!(polly_id, "watch closed before initial snapshot");
    }

    debug!(polly_id, listener_id, "listener registered");
    let inner = Arc::downgrade(&self.inner);
    let owned_id = polly_id.to_owned();
    Ok(PollySubscription {
      polly_id: owned_id.clone(),
      handle:   Subscription::new(move || {
        active.store(false, Ordering::SeqCst);
        leave(&inner, &owned_id, listener_id);
      }),
    })
  }

  /// Add the listener to a live watch, if one exists. Returns the watch's
  /// event queue.
  fn join_existing(
    &self,
    polly_id: &str,
    listener: &mut Option<Listener>,
  ) -> Option<mpsc::Sender<WatchEvent>> {
    let watches = lock(&self.inner.watches);
    let watch = watches.get(polly_id)?;
    lock(&watch.listeners).extend(listener.take());
    Some(watch.events.clone())
  }

  /// Register a freshly opened watch with the listener and start its pump.
  /// Returns `false`, leaving the listener in place, if another watch for the
  /// same polly was registered first.
  fn install(
    &self,
    watch: &Arc<Watch>,
    listener: &mut Option<Listener>,
    rx: mpsc::Receiver<WatchEvent>,
  ) -> bool {
    let mut watches = lock(&self.inner.watches);
    if watches.contains_key(&watch.polly_id) {
      return false;
    }
    lock(&watch.listeners).extend(listener.take());
    let pump = tokio::spawn(pump(self.inner.store.clone(), watch.clone(), rx));
    *lock(&watch.pump) = Some(pump);
    watches.insert(watch.polly_id.clone(), watch.clone());
    true
  }

  /// Open the top-level streams of a new, not yet registered watch.
  async fn open_watch(
    &self,
    polly_id: &str,
  ) -> Result<(Arc<Watch>, mpsc::Receiver<WatchEvent>)> {
    let (tx, rx) = mpsc::channel(self.inner.event_buffer);
    let watch = Arc::new(Watch {
      polly_id:         polly_id.to_owned(),
      listeners:        Mutex::new(Vec::new()),
      top_streams:      Mutex::new(Vec::new()),
      consumer_streams: Mutex::new(HashMap::new()),
      events:           tx,
      pump:             Mutex::new(None),
      stale:            AtomicBool::new(false),
      closed:           AtomicBool::new(false),
    });

    let drivers = open_stream(
      self.inner.store.as_ref(),
      &watch,
      WatchTarget::Collection(paths::drivers(polly_id)?),
      || WatchEvent::Drivers,
    )
    .await?;
    lock(&watch.top_streams).push(drivers);

    let waiting = open_stream(
      self.inner.store.as_ref(),
      &watch,
      WatchTarget::Collection(paths::waiting_list(polly_id)?),
      || WatchEvent::WaitingList,
    )
    .await?;
    lock(&watch.top_streams).push(waiting);

    debug!(polly_id, "watch opened");
    Ok((watch, rx))
  }

  // ── Diagnostics ───────────────────────────────────────────────────────────

  fn watch(&self, polly_id: &str) -> Option<Arc<Watch>> {
    lock(&self.inner.watches).get(polly_id).cloned()
  }

  /// Number of pollies currently watched.
  pub fn watch_count(&self) -> usize { lock(&self.inner.watches).len() }

  /// Underlying change-streams held open for `polly_id`.
  pub fn stream_count(&self, polly_id: &str) -> usize {
    self.watch(polly_id).map_or(0, |w| w.stream_count())
  }

  /// Driver ids with an open consumer stream, sorted.
  pub fn watched_drivers(&self, polly_id: &str) -> Vec<String> {
    let mut ids: Vec<String> = self
      .watch(polly_id)
      .map(|w| lock(&w.consumer_streams).keys().cloned().collect())
      .unwrap_or_default();
    ids.sort();
    ids
  }

  pub fn listener_count(&self, polly_id: &str) -> usize {
    self.watch(polly_id).map_or(0, |w| lock(&w.listeners).len())
  }
}

impl<S> Drop for Inner<S> {
  fn drop(&mut self) {
    let watches = self.watches.get_mut().unwrap_or_else(PoisonError::into_inner);
    for (_, watch) in watches.drain() {
      watch.teardown();
    }
  }
}

impl<S> fmt::Debug for Reconciler<S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Reconciler")
      .field("watches", &lock(&self.inner.watches).len())
      .finish()
  }
}

/// Remove a listener, tearing its watch down if it was the last one.
fn leave<S>(inner: &Weak<Inner<S>>, polly_id: &str, listener_id: u64) {
  let Some(inner) = inner.upgrade() else {
    return;
  };
  let finished = {
    let mut watches = lock(&inner.watches);
    let Some(watch) = watches.get(polly_id) else {
      return;
    };
    let mut listeners = lock(&watch.listeners);
    listeners.retain(|l| l.id != listener_id);
    let empty = listeners.is_empty();
    drop(listeners);
    if empty { watches.remove(polly_id) } else { None }
  };

  debug!(polly_id, listener_id, "listener disposed");
  if let Some(watch) = finished {
    watch.teardown();
  }
}

// ─── Streams ─────────────────────────────────────────────────────────────────

async fn open_stream<S: DocumentStore>(
  store: &S,
  watch: &Arc<Watch>,
  target: WatchTarget,
  event: impl Fn() -> WatchEvent + Send + Sync + 'static,
) -> Result<Subscription> {
  let queue = Arc::downgrade(watch);
  let on_change: ChangeHandler = Arc::new(move |_: Snapshot| {
    if let Some(watch) = queue.upgrade() {
      watch.notify(event());
    }
  });

  let polly_id = watch.polly_id.clone();
  let described = target.to_string();
  let on_error: ErrorHandler<S::Error> = Arc::new(move |e: S::Error| {
    error!(
      polly_id = %polly_id,
      target = %described,
      error = %e,
      "change-stream failed"
    );
  });

  store
    .subscribe(target, on_change, on_error)
    .await
    .map_err(store_err)
}

/// Match the per-driver consumer streams to the current driver list:
/// dispose streams of drivers that are gone and open streams for new ones.
///
/// New streams are opened before their consumers are read, so no consumer
/// write can fall between the read and the stream.
async fn sync_consumer_streams<S: DocumentStore>(
  store: &S,
  watch: &Arc<Watch>,
  drivers: &[Document],
) -> Result<()> {
  let current: HashSet<&str> = drivers.iter().map(Document::id).collect();

  let missing: Vec<String> = {
    let mut streams = lock(&watch.consumer_streams);
    streams.retain(|driver_id, stream| {
      let keep = current.contains(driver_id.as_str());
      if !keep {
        debug!(
          polly_id = %watch.polly_id,
          %driver_id,
          "consumer stream released"
        );
        stream.dispose();
      }
      keep
    });
    current
      .iter()
      .filter(|id| !streams.contains_key(**id))
      .map(|id| (*id).to_owned())
      .collect()
  };

  for driver_id in missing {
    let target = WatchTarget::Collection(paths::driver_consumers(
      &watch.polly_id,
      &driver_id,
    )?);
    let event_driver = driver_id.clone();
    let stream = open_stream(store, watch, target, move || {
      WatchEvent::Consumers { driver_id: event_driver.clone() }
    })
    .await?;

    let mut streams = lock(&watch.consumer_streams);
    if watch.closed.load(Ordering::SeqCst) {
      stream.dispose();
      return Ok(());
    }
    debug!(polly_id = %watch.polly_id, %driver_id, "consumer stream opened");
    streams.entry(driver_id).or_insert(stream);
  }
  Ok(())
}

// ─── Pump ────────────────────────────────────────────────────────────────────

/// Re-read the whole polly, keeping the nested streams in step with the
/// drivers found.
async fn refresh<S: DocumentStore>(
  store: &S,
  watch: &Arc<Watch>,
) -> Result<Option<Polly>> {
  let polly_id = watch.polly_id.as_str();
  let root = store
    .get_document(paths::polly(polly_id)?)
    .await
    .map_err(store_err)?;
  let Some(root) = root else {
    sync_consumer_streams(store, watch, &[]).await?;
    return Ok(None);
  };

  let drivers = store
    .list_children(paths::drivers(polly_id)?)
    .await
    .map_err(store_err)?;
  sync_consumer_streams(store, watch, &drivers).await?;

  assemble_from(store, polly_id, &root, &drivers).await.map(Some)
}

async fn pump<S: DocumentStore>(
  store: Arc<S>,
  watch: Arc<Watch>,
  mut events: mpsc::Receiver<WatchEvent>,
) {
  while let Some(event) = events.recv().await {
    // Cleared before the read, so the refresh sees the dropped change.
    let stale = watch.stale.swap(false, Ordering::SeqCst);
    let only = match event {
      WatchEvent::Join(listener_id) if !stale => Some(listener_id),
      WatchEvent::Join(listener_id) => {
        trace!(polly_id = %watch.polly_id, listener_id, "join refresh widened");
        None
      }
      WatchEvent::Consumers { driver_id } => {
        trace!(polly_id = %watch.polly_id, %driver_id, "consumers changed");
        None
      }
      WatchEvent::Drivers | WatchEvent::WaitingList => {
        trace!(polly_id = %watch.polly_id, ?event, "collection changed");
        None
      }
    };

    match refresh(store.as_ref(), &watch).await {
      Ok(polly) => {
        if watch.closed.load(Ordering::SeqCst) {
          break;
        }
        watch.deliver(only, polly);
      }
      Err(e) => {
        error!(polly_id = %watch.polly_id, error = %e, "polly refresh failed");
      }
    }
  }
}

// ─── Handle ──────────────────────────────────────────────────────────────────

/// Disposal handle returned by [`Reconciler::subscribe`].
///
/// Disposing is idempotent and also happens on drop. Once `dispose` returns
/// the callback is not started again.
#[derive(Debug)]
pub struct PollySubscription {
  polly_id: String,
  handle:   Subscription,
}

impl PollySubscription {
  pub fn polly_id(&self) -> &str { &self.polly_id }

  pub fn dispose(&self) { self.handle.dispose(); }

  pub fn is_disposed(&self) -> bool { self.handle.is_disposed() }
}
