//! Error type for `carpolly-store-sqlite`.

use carpolly_core::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] carpolly_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// `update_document` addressed a document that does not exist.
  #[error("document not found: {0}")]
  DocumentNotFound(String),
}

impl StoreError for Error {
  fn is_not_found(&self) -> bool { matches!(self, Self::DocumentNotFound(_)) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
