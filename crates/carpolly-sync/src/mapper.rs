//! Entity mapper: flat documents to the nested domain model and back.
//!
//! Everything here is pure. Identifiers never appear in written field maps;
//! on read, the document id becomes the entity id. Writes carry the
//! server-timestamp sentinel wherever the store should stamp the time.

use carpolly_core::{
  Error, Result,
  document::{Document, FieldValue, Fields},
  model::{
    Consumer, ConsumerPatch, Driver, DriverPatch, NewConsumer, NewDriver, Polly,
    PollyPatch,
  },
};
use chrono::{DateTime, Utc};

pub const DESCRIPTION: &str = "description";
pub const CREATED: &str = "created";
pub const UPDATED_AT: &str = "updatedAt";
pub const NAME: &str = "name";
pub const SPOTS: &str = "spots";
pub const LAST_UPDATED: &str = "lastUpdated";
pub const COMMENTS: &str = "comments";

fn put(fields: &mut Fields, name: &str, value: impl Into<FieldValue>) {
  fields.insert(name.to_owned(), value.into());
}

// ─── Write side ──────────────────────────────────────────────────────────────

/// Root document of a new polly. Both timestamps are stamped by the store.
pub fn polly_fields_for_create(description: &str) -> Fields {
  let mut fields = Fields::new();
  put(&mut fields, DESCRIPTION, description);
  put(&mut fields, CREATED, FieldValue::server_timestamp());
  put(&mut fields, UPDATED_AT, FieldValue::server_timestamp());
  fields
}

/// Scalar fields of a polly update. Always bumps `updatedAt`.
pub fn polly_patch_fields(patch: &PollyPatch) -> Fields {
  let mut fields = touch_fields();
  if let Some(description) = &patch.description {
    put(&mut fields, DESCRIPTION, description.as_str());
  }
  fields
}

/// Bump the polly's modification timestamp.
pub fn touch_fields() -> Fields {
  let mut fields = Fields::new();
  put(&mut fields, UPDATED_AT, FieldValue::server_timestamp());
  fields
}

/// A new driver document. Inline consumers are written separately.
pub fn driver_fields_for_create(driver: &NewDriver) -> Fields {
  let mut fields = Fields::new();
  put(&mut fields, NAME, driver.name.as_str());
  put(&mut fields, DESCRIPTION, driver.description.as_str());
  put(&mut fields, SPOTS, driver.spots);
  put(&mut fields, LAST_UPDATED, FieldValue::server_timestamp());
  fields
}

pub fn driver_patch_fields(patch: &DriverPatch) -> Fields {
  let mut fields = Fields::new();
  if let Some(name) = &patch.name {
    put(&mut fields, NAME, name.as_str());
  }
  if let Some(description) = &patch.description {
    put(&mut fields, DESCRIPTION, description.as_str());
  }
  if let Some(spots) = patch.spots {
    put(&mut fields, SPOTS, spots);
  }
  fields
}

/// Bump a driver's `lastUpdated`.
pub fn driver_touch_fields() -> Fields {
  let mut fields = Fields::new();
  put(&mut fields, LAST_UPDATED, FieldValue::server_timestamp());
  fields
}

pub fn consumer_fields(consumer: &NewConsumer) -> Fields {
  let mut fields = Fields::new();
  put(&mut fields, NAME, consumer.name.as_str());
  if let Some(comments) = &consumer.comments {
    put(&mut fields, COMMENTS, comments.as_str());
  }
  fields
}

pub fn consumer_patch_fields(patch: &ConsumerPatch) -> Fields {
  let mut fields = Fields::new();
  if let Some(name) = &patch.name {
    put(&mut fields, NAME, name.as_str());
  }
  match &patch.comments {
    Some(Some(comments)) => put(&mut fields, COMMENTS, comments.as_str()),
    Some(None) => put(&mut fields, COMMENTS, FieldValue::Null),
    None => {}
  }
  fields
}

// ─── Read side ───────────────────────────────────────────────────────────────

fn required<'a>(
  doc: &'a Document,
  field: &'static str,
) -> Result<&'a FieldValue> {
  doc.get(field).ok_or_else(|| Error::MissingField {
    path: doc.path.to_string(),
    field,
  })
}

fn wrong_type(
  doc: &Document,
  field: &'static str,
  expected: &'static str,
) -> Error {
  Error::FieldType { path: doc.path.to_string(), field, expected }
}

fn required_str(doc: &Document, field: &'static str) -> Result<String> {
  required(doc, field)?
    .as_str()
    .map(str::to_owned)
    .ok_or_else(|| wrong_type(doc, field, "string"))
}

fn optional_str(doc: &Document, field: &'static str) -> Result<Option<String>> {
  match doc.get(field) {
    None | Some(FieldValue::Null) => Ok(None),
    Some(FieldValue::String(s)) => Ok(Some(s.clone())),
    Some(_) => Err(wrong_type(doc, field, "string")),
  }
}

/// A stored timestamp. A missing field or a sentinel the store never
/// resolved falls back to the store's own clock reading.
fn timestamp(
  doc: &Document,
  field: &'static str,
  fallback: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
  match doc.get(field) {
    None | Some(FieldValue::Null | FieldValue::ServerTimestamp) => Ok(fallback),
    Some(FieldValue::Timestamp(at)) => Ok(*at),
    Some(_) => Err(wrong_type(doc, field, "timestamp")),
  }
}

fn spots(doc: &Document) -> Result<u32> {
  let value = required(doc, SPOTS)?
    .as_integer()
    .ok_or_else(|| wrong_type(doc, SPOTS, "integer"))?;
  u32::try_from(value).map_err(|_| Error::FieldRange {
    path: doc.path.to_string(),
    field: SPOTS,
    value,
  })
}

pub fn consumer_from_document(doc: &Document) -> Result<Consumer> {
  Ok(Consumer {
    id:       doc.id().to_owned(),
    name:     required_str(doc, NAME)?,
    comments: optional_str(doc, COMMENTS)?,
  })
}

pub fn driver_from_document(
  doc: &Document,
  consumers: Vec<Consumer>,
) -> Result<Driver> {
  Ok(Driver {
    id: doc.id().to_owned(),
    name: required_str(doc, NAME)?,
    description: required_str(doc, DESCRIPTION)?,
    spots: spots(doc)?,
    last_updated: timestamp(doc, LAST_UPDATED, doc.update_time)?,
    consumers,
  })
}

pub fn polly_from_parts(
  root: &Document,
  drivers: Vec<Driver>,
  waiting_list: Vec<Consumer>,
) -> Result<Polly> {
  Ok(Polly {
    id: root.id().to_owned(),
    description: required_str(root, DESCRIPTION)?,
    created: timestamp(root, CREATED, root.create_time)?,
    updated_at: timestamp(root, UPDATED_AT, root.update_time)?,
    drivers,
    waiting_list,
  })
}

#[cfg(test)]
mod tests {
  use carpolly_core::document::DocPath;
  use chrono::TimeZone;

  use super::*;

  fn doc(path: &str, fields: Fields) -> Document {
    let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    Document {
      path: DocPath::parse(path).unwrap(),
      fields,
      create_time: at,
      update_time: at,
    }
  }

  #[test]
  fn create_payloads_never_carry_ids() {
    let mut driver = NewDriver::new("Alex", "Meet at lot B", 3);
    driver.consumers = vec![NewConsumer::new("Sam")].into();

    let fields = driver_fields_for_create(&driver);
    assert!(!fields.contains_key("id"));
    assert!(!fields.contains_key("consumers"));
    assert_eq!(fields[SPOTS], FieldValue::Integer(3));
    assert!(fields[LAST_UPDATED].is_server_timestamp());

    let root = polly_fields_for_create("Friday Carpool");
    assert!(root[CREATED].is_server_timestamp());
    assert!(root[UPDATED_AT].is_server_timestamp());
  }

  #[test]
  fn empty_polly_patch_still_bumps_timestamp() {
    let fields = polly_patch_fields(&PollyPatch::default());
    assert_eq!(fields.len(), 1);
    assert!(fields[UPDATED_AT].is_server_timestamp());
  }

  #[test]
  fn consumer_patch_distinguishes_clear_from_untouched() {
    let untouched = consumer_patch_fields(&ConsumerPatch {
      name:     Some("Sam".into()),
      comments: None,
    });
    assert!(!untouched.contains_key(COMMENTS));

    let cleared = consumer_patch_fields(&ConsumerPatch {
      name:     None,
      comments: Some(None),
    });
    assert_eq!(cleared[COMMENTS], FieldValue::Null);
    assert!(!cleared.contains_key(NAME));
  }

  #[test]
  fn reads_merge_document_id() {
    let consumer = consumer_from_document(&doc(
      "pollies/p/consumers/c1",
      consumer_fields(&NewConsumer::new("Sam").with_comments("Big bag")),
    ))
    .unwrap();
    assert_eq!(consumer.id, "c1");
    assert_eq!(consumer.comments.as_deref(), Some("Big bag"));

    let mut fields =
      driver_fields_for_create(&NewDriver::new("Alex", "Lot B", 3));
    let stamped = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
    fields.insert(LAST_UPDATED.into(), stamped.into());
    let driver =
      driver_from_document(&doc("pollies/p/drivers/d1", fields), vec![consumer])
        .unwrap();
    assert_eq!(driver.id, "d1");
    assert_eq!(driver.spots, 3);
    assert_eq!(driver.last_updated, stamped);
    assert_eq!(driver.consumers.len(), 1);
  }

  #[test]
  fn missing_timestamps_fall_back_to_store_clock() {
    let mut fields = Fields::new();
    fields.insert(DESCRIPTION.into(), "Trip".into());
    let root = doc("pollies/p", fields);

    let polly = polly_from_parts(&root, Vec::new(), Vec::new()).unwrap();
    assert_eq!(polly.id, "p");
    assert_eq!(polly.created, root.create_time);
    assert_eq!(polly.updated_at, root.update_time);
  }

  #[test]
  fn unresolved_sentinels_read_as_store_clock() {
    let fields = driver_fields_for_create(&NewDriver::new("Alex", "Lot B", 3));
    assert!(fields[LAST_UPDATED].is_server_timestamp());
    let driver_doc = doc("pollies/p/drivers/d1", fields);

    let first = driver_from_document(&driver_doc, Vec::new()).unwrap();
    let second = driver_from_document(&driver_doc, Vec::new()).unwrap();
    assert_eq!(first.last_updated, driver_doc.update_time);
    assert_eq!(first, second);

    let root = doc("pollies/p", polly_fields_for_create("Trip"));
    let polly = polly_from_parts(&root, Vec::new(), Vec::new()).unwrap();
    assert_eq!(polly.created, root.create_time);
    assert_eq!(polly.updated_at, root.update_time);
  }

  #[test]
  fn malformed_documents_are_mapping_errors() {
    let mut fields = Fields::new();
    fields.insert(NAME.into(), 7i64.into());
    let err = consumer_from_document(&doc("pollies/p/consumers/c", fields))
      .unwrap_err();
    assert!(matches!(err, Error::FieldType { field: NAME, .. }));

    let mut fields =
      driver_fields_for_create(&NewDriver::new("Alex", "Lot B", 1));
    fields.insert(SPOTS.into(), (-1i64).into());
    let err =
      driver_from_document(&doc("pollies/p/drivers/d", fields), Vec::new())
        .unwrap_err();
    assert!(matches!(err, Error::FieldRange { value: -1, .. }));

    let root = doc("pollies/p", Fields::new());
    let err = polly_from_parts(&root, Vec::new(), Vec::new()).unwrap_err();
    assert!(matches!(err, Error::MissingField { field: DESCRIPTION, .. }));
  }
}
