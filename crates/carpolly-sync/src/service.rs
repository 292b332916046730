//! The mutation service.
//!
//! Every operation validates its input before touching the store, writes the
//! sanitised text, and then bumps the polly's `updatedAt`. Multi-step
//! operations are sequential and not transactional: a failure partway
//! through leaves the earlier steps in place.

use std::sync::Arc;

use carpolly_core::{
  document::{DocPath, Document, SetMode},
  model::{
    ConsumerPatch, ConsumerSlot, DriverPatch, NewConsumer, NewDriver, NewPolly,
    Nested, Polly, PollyPatch,
  },
  rate_limit::RateLimiter,
  store::DocumentStore,
  validate::{
    self, Field, ValidationErrors, sanitize_text, validate_consumer_form,
    validate_consumer_patch, validate_driver_form, validate_driver_patch,
    validate_polly_description,
  },
};
use carpolly_store_sqlite::SqliteStore;
use tracing::{debug, info, warn};

use crate::{
  ClientConfig, Error, Result,
  assemble::load_polly,
  error::store_err,
  mapper, paths,
  reconciler::{PollySubscription, Reconciler},
};

// ─── Validation helpers ──────────────────────────────────────────────────────

fn check_polly_id(polly_id: &str) -> Result<()> {
  validate::validate_uuid(polly_id)
    .map_err(|message| ValidationErrors::single(Field::Id, message).into())
}

/// Sanitised comments; blank comments are dropped.
fn clean_comments(comments: Option<&str>) -> Option<String> {
  comments.map(sanitize_text).filter(|c| !c.is_empty())
}

fn prepare_consumer(
  consumer: &NewConsumer,
) -> Result<NewConsumer, ValidationErrors> {
  validate_consumer_form(&consumer.name, consumer.comments.as_deref())?;
  Ok(NewConsumer {
    name:     sanitize_text(&consumer.name),
    comments: clean_comments(consumer.comments.as_deref()),
  })
}

fn prepare_consumers(
  consumers: &Nested<NewConsumer>,
) -> Result<Vec<NewConsumer>, ValidationErrors> {
  consumers.items().iter().map(prepare_consumer).collect()
}

fn prepare_driver(driver: &NewDriver) -> Result<NewDriver, ValidationErrors> {
  let mut errors = ValidationErrors::new();
  if let Err(e) = validate_driver_form(
    &driver.name,
    &driver.description,
    i64::from(driver.spots),
  ) {
    errors.extend(e);
  }
  let consumers = match prepare_consumers(&driver.consumers) {
    Ok(consumers) => consumers,
    Err(e) => {
      errors.extend(e);
      Vec::new()
    }
  };
  if driver.consumers.len() > driver.spots as usize {
    errors.insert(
      Field::Spots,
      format!(
        "Spots cannot be lower than the number of passengers ({})",
        driver.consumers.len()
      ),
    );
  }
  errors.into_result()?;

  Ok(NewDriver {
    name:        sanitize_text(&driver.name),
    description: sanitize_text(&driver.description),
    spots:       driver.spots,
    consumers:   consumers.into(),
  })
}

fn driver_full() -> Error {
  ValidationErrors::single(Field::Spots, "This driver has no available spots")
    .into()
}

// ─── Service ─────────────────────────────────────────────────────────────────

/// Create, update and delete operations across the polly hierarchy, plus
/// live subscriptions through the owned [`Reconciler`].
pub struct PollyService<S> {
  store:      Arc<S>,
  limiter:    Option<RateLimiter>,
  reconciler: Reconciler<S>,
}

impl<S: DocumentStore> PollyService<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self::with_config(store, &ClientConfig::default())
  }

  pub fn with_config(store: Arc<S>, config: &ClientConfig) -> Self {
    Self {
      reconciler: Reconciler::new(
        store.clone(),
        config.subscription.event_buffer,
      ),
      limiter: config.rate_limit.limiter(),
      store,
    }
  }

  pub fn store(&self) -> &Arc<S> { &self.store }

  pub fn reconciler(&self) -> &Reconciler<S> { &self.reconciler }

  fn limit(&self, operation: &'static str) -> Result<()> {
    match &self.limiter {
      Some(limiter) if !limiter.check(operation) => {
        warn!(operation, "rate limit exceeded");
        Err(Error::RateLimited { operation })
      }
      _ => Ok(()),
    }
  }

  /// Bump the polly's modification timestamp.
  async fn touch(&self, polly_id: &str) -> Result<()> {
    self
      .store
      .update_document(paths::polly(polly_id)?, mapper::touch_fields())
      .await
      .map_err(store_err)
  }

  async fn require_polly(&self, polly_id: &str) -> Result<Document> {
    self
      .store
      .get_document(paths::polly(polly_id)?)
      .await
      .map_err(store_err)?
      .ok_or_else(|| Error::NotFound(format!("polly {polly_id}")))
  }

  async fn require_driver(
    &self,
    polly_id: &str,
    driver_id: &str,
  ) -> Result<Document> {
    self
      .store
      .get_document(paths::driver(polly_id, driver_id)?)
      .await
      .map_err(store_err)?
      .ok_or_else(|| Error::NotFound(format!("driver {driver_id}")))
  }

  /// Whether the driver document has a seat left for one more consumer.
  async fn driver_has_room(
    &self,
    polly_id: &str,
    driver_doc: &Document,
  ) -> Result<bool> {
    let assigned = self
      .store
      .list_children(paths::driver_consumers(polly_id, driver_doc.id())?)
      .await
      .map_err(store_err)?
      .len();
    let spots = mapper::driver_from_document(driver_doc, Vec::new())?.spots;
    Ok(assigned < spots as usize)
  }

  /// Write an already-validated driver and its inline consumers.
  async fn insert_driver(
    &self,
    polly_id: &str,
    driver: &NewDriver,
  ) -> Result<String> {
    let driver_id = self
      .store
      .add_child(
        paths::drivers(polly_id)?,
        mapper::driver_fields_for_create(driver),
      )
      .await
      .map_err(store_err)?;

    for consumer in driver.consumers.items() {
      self
        .store
        .add_child(
          paths::driver_consumers(polly_id, &driver_id)?,
          mapper::consumer_fields(consumer),
        )
        .await
        .map_err(store_err)?;
    }

    debug!(polly_id, %driver_id, "driver written");
    Ok(driver_id)
  }

  // ── Polly ─────────────────────────────────────────────────────────────────

  /// Create a polly under the caller-chosen `polly_id`, then its inline
  /// drivers and waiting list in the given order. Fails on `id` if a polly
  /// with that id already exists.
  pub async fn create_polly(
    &self,
    polly_id: &str,
    polly: NewPolly,
  ) -> Result<()> {
    check_polly_id(polly_id)?;

    let mut errors = ValidationErrors::new();
    errors.check(
      Field::Description,
      validate_polly_description(&polly.description),
    );
    let mut drivers = Vec::with_capacity(polly.drivers.len());
    for driver in polly.drivers.items() {
      match prepare_driver(driver) {
        Ok(driver) => drivers.push(driver),
        Err(e) => errors.extend(e),
      }
    }
    let waiting_list = prepare_consumers(&polly.waiting_list)
      .unwrap_or_else(|e| {
        errors.extend(e);
        Vec::new()
      });
    errors.into_result()?;
    self.limit("create_polly")?;

    // Checked and written in two steps; the store has no create-only write.
    let root = paths::polly(polly_id)?;
    let existing = self
      .store
      .get_document(root.clone())
      .await
      .map_err(store_err)?;
    if existing.is_some() {
      return Err(
        ValidationErrors::single(Field::Id, "A polly with this id already exists")
          .into(),
      );
    }

    let description = sanitize_text(&polly.description);
    self
      .store
      .set_document(
        root,
        mapper::polly_fields_for_create(&description),
        SetMode::Replace,
      )
      .await
      .map_err(store_err)?;

    for driver in &drivers {
      self.insert_driver(polly_id, driver).await?;
    }
    for consumer in &waiting_list {
      self
        .store
        .add_child(
          paths::waiting_list(polly_id)?,
          mapper::consumer_fields(consumer),
        )
        .await
        .map_err(store_err)?;
    }
    if !drivers.is_empty() || !waiting_list.is_empty() {
      self.touch(polly_id).await?;
    }

    info!(polly_id, drivers = drivers.len(), "polly created");
    Ok(())
  }

  /// One-shot read of the full aggregate.
  pub async fn get_polly(&self, polly_id: &str) -> Result<Polly> {
    check_polly_id(polly_id)?;
    load_polly(self.store.as_ref(), polly_id)
      .await?
      .ok_or_else(|| Error::NotFound(format!("polly {polly_id}")))
  }

  /// Merge the supplied scalar fields into the root and bump `updatedAt`,
  /// even when the patch is empty.
  pub async fn update_polly(
    &self,
    polly_id: &str,
    patch: PollyPatch,
  ) -> Result<()> {
    check_polly_id(polly_id)?;
    if let Some(description) = &patch.description {
      validate_polly_description(description)
        .map_err(|m| ValidationErrors::single(Field::Description, m))?;
    }

    let patch = PollyPatch {
      description: patch.description.as_deref().map(sanitize_text),
    };
    self
      .store
      .update_document(
        paths::polly(polly_id)?,
        mapper::polly_patch_fields(&patch),
      )
      .await
      .map_err(store_err)?;

    debug!(polly_id, "polly updated");
    Ok(())
  }

  /// Live view of one polly. See [`Reconciler::subscribe`].
  pub async fn subscribe_to_polly(
    &self,
    polly_id: &str,
    callback: impl Fn(Option<Polly>) + Send + Sync + 'static,
  ) -> Result<PollySubscription> {
    self.reconciler.subscribe(polly_id, callback).await
  }

  // ── Drivers ───────────────────────────────────────────────────────────────

  /// Add a driver (and any inline consumers). Returns the new driver id.
  pub async fn create_driver(
    &self,
    polly_id: &str,
    driver: NewDriver,
  ) -> Result<String> {
    check_polly_id(polly_id)?;
    let driver = prepare_driver(&driver)?;
    self.limit("create_driver")?;
    self.require_polly(polly_id).await?;

    let driver_id = self.insert_driver(polly_id, &driver).await?;
    self.touch(polly_id).await?;
    Ok(driver_id)
  }

  /// Merge the supplied fields, then bump the driver's `lastUpdated` in a
  /// separate write so watchers always see a change.
  ///
  /// `current_consumers` is the number of passengers the caller sees
  /// assigned; `spots` may not drop below it.
  pub async fn update_driver(
    &self,
    polly_id: &str,
    driver_id: &str,
    patch: DriverPatch,
    current_consumers: usize,
  ) -> Result<()> {
    check_polly_id(polly_id)?;
    let path = paths::driver(polly_id, driver_id)?;
    validate_driver_patch(
      patch.name.as_deref(),
      patch.description.as_deref(),
      patch.spots.map(i64::from),
      current_consumers,
    )?;

    let patch = DriverPatch {
      name:        patch.name.as_deref().map(sanitize_text),
      description: patch.description.as_deref().map(sanitize_text),
      spots:       patch.spots,
    };
    self
      .store
      .update_document(path.clone(), mapper::driver_patch_fields(&patch))
      .await
      .map_err(store_err)?;
    self
      .store
      .update_document(path, mapper::driver_touch_fields())
      .await
      .map_err(store_err)?;
    self.touch(polly_id).await?;

    debug!(polly_id, driver_id, "driver updated");
    Ok(())
  }

  /// Remove the driver document only. Its consumers stay behind in the store;
  /// use [`Self::delete_driver_cascade`] to remove them too.
  pub async fn delete_driver(
    &self,
    polly_id: &str,
    driver_id: &str,
  ) -> Result<()> {
    check_polly_id(polly_id)?;
    let orphans = self
      .store
      .list_children(paths::driver_consumers(polly_id, driver_id)?)
      .await
      .map_err(store_err)?
      .len();
    if orphans > 0 {
      warn!(
        polly_id,
        driver_id, orphans, "deleting driver leaves consumer documents behind"
      );
    }

    self
      .store
      .delete_document(paths::driver(polly_id, driver_id)?)
      .await
      .map_err(store_err)?;
    self.touch(polly_id).await
  }

  /// Delete every consumer of the driver, then the driver itself. Returns the
  /// number of consumers removed.
  ///
  /// Stops at the first failure with [`Error::PartialCascade`], reporting how
  /// many consumers were already removed.
  pub async fn delete_driver_cascade(
    &self,
    polly_id: &str,
    driver_id: &str,
  ) -> Result<usize> {
    check_polly_id(polly_id)?;
    let consumers = self
      .store
      .list_children(paths::driver_consumers(polly_id, driver_id)?)
      .await
      .map_err(store_err)?;
    let total = consumers.len();

    let partial = |deleted: usize, source: Error| Error::PartialCascade {
      driver_id: driver_id.to_owned(),
      deleted,
      remaining: total - deleted,
      source: Box::new(source),
    };

    for (deleted, consumer) in consumers.iter().enumerate() {
      if let Err(e) = self.store.delete_document(consumer.path.clone()).await {
        return Err(partial(deleted, store_err(e)));
      }
    }
    if let Err(e) = self
      .store
      .delete_document(paths::driver(polly_id, driver_id)?)
      .await
    {
      return Err(partial(total, store_err(e)));
    }
    self.touch(polly_id).await?;

    info!(
      polly_id,
      driver_id,
      consumers = total,
      "driver deleted with consumers"
    );
    Ok(total)
  }

  // ── Consumers ─────────────────────────────────────────────────────────────

  /// Assign a new passenger to a driver. Fails on `spots` if the driver is
  /// already full. Returns the new consumer id.
  pub async fn create_consumer(
    &self,
    polly_id: &str,
    driver_id: &str,
    consumer: NewConsumer,
  ) -> Result<String> {
    check_polly_id(polly_id)?;
    let collection = paths::driver_consumers(polly_id, driver_id)?;
    let consumer = prepare_consumer(&consumer)?;
    self.limit("create_consumer")?;

    let driver = self.require_driver(polly_id, driver_id).await?;
    if !self.driver_has_room(polly_id, &driver).await? {
      return Err(driver_full());
    }

    let consumer_id = self
      .store
      .add_child(collection, mapper::consumer_fields(&consumer))
      .await
      .map_err(store_err)?;
    self.touch(polly_id).await?;
    Ok(consumer_id)
  }

  pub async fn update_consumer(
    &self,
    polly_id: &str,
    driver_id: &str,
    consumer_id: &str,
    patch: ConsumerPatch,
  ) -> Result<()> {
    check_polly_id(polly_id)?;
    let path = paths::driver_consumer(polly_id, driver_id, consumer_id)?;
    self.patch_consumer(polly_id, path, patch).await
  }

  pub async fn delete_consumer(
    &self,
    polly_id: &str,
    driver_id: &str,
    consumer_id: &str,
  ) -> Result<()> {
    check_polly_id(polly_id)?;
    let path = paths::driver_consumer(polly_id, driver_id, consumer_id)?;
    self.store.delete_document(path).await.map_err(store_err)?;
    self.touch(polly_id).await
  }

  /// Add a passenger to the waiting list. Returns the new consumer id.
  pub async fn create_waiting_list_consumer(
    &self,
    polly_id: &str,
    consumer: NewConsumer,
  ) -> Result<String> {
    check_polly_id(polly_id)?;
    let consumer = prepare_consumer(&consumer)?;
    self.limit("create_waiting_list_consumer")?;
    self.require_polly(polly_id).await?;

    let consumer_id = self
      .store
      .add_child(
        paths::waiting_list(polly_id)?,
        mapper::consumer_fields(&consumer),
      )
      .await
      .map_err(store_err)?;
    self.touch(polly_id).await?;
    Ok(consumer_id)
  }

  pub async fn update_waiting_list_consumer(
    &self,
    polly_id: &str,
    consumer_id: &str,
    patch: ConsumerPatch,
  ) -> Result<()> {
    check_polly_id(polly_id)?;
    let path = paths::waiting_list_consumer(polly_id, consumer_id)?;
    self.patch_consumer(polly_id, path, patch).await
  }

  pub async fn delete_waiting_list_consumer(
    &self,
    polly_id: &str,
    consumer_id: &str,
  ) -> Result<()> {
    check_polly_id(polly_id)?;
    let path = paths::waiting_list_consumer(polly_id, consumer_id)?;
    self.store.delete_document(path).await.map_err(store_err)?;
    self.touch(polly_id).await
  }

  async fn patch_consumer(
    &self,
    polly_id: &str,
    path: DocPath,
    patch: ConsumerPatch,
  ) -> Result<()> {
    validate_consumer_patch(
      patch.name.as_deref(),
      patch.comments.as_ref().and_then(Option::as_deref),
    )?;

    let patch = ConsumerPatch {
      name:     patch.name.as_deref().map(sanitize_text),
      comments: patch
        .comments
        .as_ref()
        .map(|comments| clean_comments(comments.as_deref())),
    };
    self
      .store
      .update_document(path, mapper::consumer_patch_fields(&patch))
      .await
      .map_err(store_err)?;
    self.touch(polly_id).await
  }

  /// Move a consumer between the waiting list and a driver, or between two
  /// drivers. Returns the consumer's new id.
  ///
  /// There is no atomic move: the consumer is created under `to` and then
  /// deleted from `from`. If the delete fails the consumer exists in both
  /// places and [`Error::PartialMove`] is returned.
  pub async fn move_consumer(
    &self,
    polly_id: &str,
    consumer_id: &str,
    from: ConsumerSlot,
    to: ConsumerSlot,
  ) -> Result<String> {
    check_polly_id(polly_id)?;
    let source_path =
      paths::slot_consumers(polly_id, &from)?.doc(consumer_id)?;
    let source = self
      .store
      .get_document(source_path.clone())
      .await
      .map_err(store_err)?
      .ok_or_else(|| Error::NotFound(format!("consumer {consumer_id}")))?;
    // reject documents that would not map back to a consumer
    mapper::consumer_from_document(&source)?;
    if from == to {
      return Ok(consumer_id.to_owned());
    }

    if let ConsumerSlot::Driver(driver_id) = &to {
      let driver = self.require_driver(polly_id, driver_id).await?;
      if !self.driver_has_room(polly_id, &driver).await? {
        return Err(driver_full());
      }
    }

    let new_id = self
      .store
      .add_child(paths::slot_consumers(polly_id, &to)?, source.fields)
      .await
      .map_err(store_err)?;
    if let Err(e) = self.store.delete_document(source_path).await {
      return Err(Error::PartialMove {
        consumer_id: consumer_id.to_owned(),
        new_id,
        source: Box::new(store_err(e)),
      });
    }
    self.touch(polly_id).await?;

    debug!(polly_id, consumer_id, %new_id, "consumer moved");
    Ok(new_id)
  }
}

// ─── Local store ─────────────────────────────────────────────────────────────

impl PollyService<SqliteStore> {
  /// A service over the SQLite file named by `store_path`, or over an
  /// in-memory store when the config names none.
  pub async fn open(config: &ClientConfig) -> Result<Self> {
    let store = match config.resolved_store_path() {
      Some(path) => {
        info!(path = %path.display(), "opening store");
        SqliteStore::open(&path).await
      }
      None => {
        info!("opening in-memory store");
        SqliteStore::open_in_memory().await
      }
    }
    .map_err(store_err)?;
    Ok(Self::with_config(Arc::new(store), config))
  }
}
