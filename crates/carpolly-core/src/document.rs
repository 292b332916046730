//! The flat document model spoken by a hierarchical document store.
//!
//! A document is a map of named [`FieldValue`]s living at a [`DocPath`].
//! Paths alternate collection and document segments
//! (`pollies/{id}/drivers/{id}`); a [`CollectionPath`] always ends in a
//! collection segment. Identifiers only ever travel as path segments, never as
//! document fields.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ─── Field values ────────────────────────────────────────────────────────────

/// A single document field.
///
/// [`FieldValue::ServerTimestamp`] is a write-time marker: the store replaces
/// it with its own authoritative clock reading when the write is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
  Null,
  Bool(bool),
  Integer(i64),
  String(String),
  Timestamp(DateTime<Utc>),
  ServerTimestamp,
}

impl FieldValue {
  /// The sentinel asking the store to stamp the field at write time.
  pub fn server_timestamp() -> Self { Self::ServerTimestamp }

  pub fn is_server_timestamp(&self) -> bool {
    matches!(self, Self::ServerTimestamp)
  }

  pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Self::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_integer(&self) -> Option<i64> {
    match self {
      Self::Integer(n) => Some(*n),
      _ => None,
    }
  }

  /// A short name for the variant, used in mapping error messages.
  pub fn type_name(&self) -> &'static str {
    match self {
      Self::Null => "null",
      Self::Bool(_) => "bool",
      Self::Integer(_) => "integer",
      Self::String(_) => "string",
      Self::Timestamp(_) => "timestamp",
      Self::ServerTimestamp => "server timestamp",
    }
  }
}

impl From<&str> for FieldValue {
  fn from(s: &str) -> Self { Self::String(s.to_owned()) }
}

impl From<String> for FieldValue {
  fn from(s: String) -> Self { Self::String(s) }
}

impl From<i64> for FieldValue {
  fn from(n: i64) -> Self { Self::Integer(n) }
}

impl From<u32> for FieldValue {
  fn from(n: u32) -> Self { Self::Integer(i64::from(n)) }
}

impl From<bool> for FieldValue {
  fn from(b: bool) -> Self { Self::Bool(b) }
}

impl From<DateTime<Utc>> for FieldValue {
  fn from(dt: DateTime<Utc>) -> Self { Self::Timestamp(dt) }
}

/// The field map of a document, ordered by field name.
pub type Fields = BTreeMap<String, FieldValue>;

// ─── Paths ───────────────────────────────────────────────────────────────────

fn check_segment(segment: &str) -> Result<()> {
  if segment.is_empty() || segment.contains('/') {
    return Err(Error::InvalidSegment(segment.to_owned()));
  }
  Ok(())
}

/// Count the segments of `raw`, rejecting empty ones.
fn split_segments(raw: &str) -> Result<usize> {
  raw.split('/').try_fold(0, |count, segment| {
    check_segment(segment)?;
    Ok(count + 1)
  })
}

/// Path of a collection, e.g. `pollies/abc/drivers`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionPath(String);

impl CollectionPath {
  /// A top-level collection.
  pub fn root(name: &str) -> Result<Self> {
    check_segment(name)?;
    Ok(Self(name.to_owned()))
  }

  /// Parse a slash-separated path with an odd number of segments.
  pub fn parse(raw: &str) -> Result<Self> {
    let segments = split_segments(raw)?;
    if segments % 2 == 0 {
      return Err(Error::InvalidSegment(raw.to_owned()));
    }
    Ok(Self(raw.to_owned()))
  }

  /// The document with id `id` inside this collection.
  pub fn doc(&self, id: &str) -> Result<DocPath> {
    check_segment(id)?;
    Ok(DocPath(format!("{}/{id}", self.0)))
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for CollectionPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Path of a single document, e.g. `pollies/abc/drivers/xyz`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath(String);

impl DocPath {
  /// Parse a slash-separated path with an even number of segments.
  pub fn parse(raw: &str) -> Result<Self> {
    let segments = split_segments(raw)?;
    if segments % 2 != 0 {
      return Err(Error::InvalidSegment(raw.to_owned()));
    }
    Ok(Self(raw.to_owned()))
  }

  /// The last segment: the document's identifier.
  pub fn id(&self) -> &str {
    self.0.rsplit_once('/').map_or(self.0.as_str(), |(_, id)| id)
  }

  /// The collection containing this document.
  pub fn parent(&self) -> CollectionPath {
    CollectionPath(
      self
        .0
        .rsplit_once('/')
        .map_or_else(String::new, |(parent, _)| parent.to_owned()),
    )
  }

  /// A sub-collection nested under this document.
  pub fn collection(&self, name: &str) -> Result<CollectionPath> {
    check_segment(name)?;
    Ok(CollectionPath(format!("{}/{name}", self.0)))
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for DocPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

// ─── Documents ───────────────────────────────────────────────────────────────

/// A document as read back from the store. Server timestamps have been
/// resolved by the time a document is returned.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
  pub path:        DocPath,
  pub fields:      Fields,
  /// Store clock at first creation.
  pub create_time: DateTime<Utc>,
  /// Store clock at the most recent write.
  pub update_time: DateTime<Utc>,
}

impl Document {
  /// The store-assigned (or caller-supplied, for roots) identifier.
  pub fn id(&self) -> &str { self.path.id() }

  pub fn get(&self, field: &str) -> Option<&FieldValue> {
    self.fields.get(field)
  }
}

/// How [`crate::store::DocumentStore::set_document`] treats existing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
  /// Overwrite the document entirely.
  Replace,
  /// Only overwrite the supplied fields; create the document if absent.
  Merge,
}

// ─── Change-streams ──────────────────────────────────────────────────────────

/// What a change-stream is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchTarget {
  Document(DocPath),
  Collection(CollectionPath),
}

impl WatchTarget {
  /// Whether a write to `changed` is visible through this target. Writes to
  /// documents in nested sub-collections are not.
  pub fn is_affected_by(&self, changed: &DocPath) -> bool {
    match self {
      Self::Document(path) => path == changed,
      Self::Collection(collection) => &changed.parent() == collection,
    }
  }
}

impl fmt::Display for WatchTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Document(path) => write!(f, "document {path}"),
      Self::Collection(path) => write!(f, "collection {path}"),
    }
  }
}

/// The state of a [`WatchTarget`] after a change.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
  Document(Option<Document>),
  /// Children in creation order.
  Collection(Vec<Document>),
}
