//! Error types for `carpolly-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid path segment: {0:?}")]
  InvalidSegment(String),

  #[error("document {path} is missing field {field:?}")]
  MissingField { path: String, field: &'static str },

  #[error("document {path} field {field:?} is not a {expected}")]
  FieldType {
    path:     String,
    field:    &'static str,
    expected: &'static str,
  },

  #[error("document {path} field {field:?} is out of range: {value}")]
  FieldRange {
    path:  String,
    field: &'static str,
    value: i64,
  },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
