//! Caller-facing error type for `carpolly-sync`.

use carpolly_core::{store::StoreError, validate::ValidationErrors};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// A field failed the validation gate. Nothing was written.
  #[error("validation failed: {0}")]
  Validation(#[from] ValidationErrors),

  /// A one-shot read or an update addressed a document that does not exist.
  #[error("not found: {0}")]
  NotFound(String),

  #[error("rate limit exceeded for {operation}")]
  RateLimited { operation: &'static str },

  /// The document store rejected a read or write.
  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  /// A stored document did not have the expected shape.
  #[error("mapping error: {0}")]
  Mapping(#[from] carpolly_core::Error),

  #[error("configuration error: {0}")]
  Config(#[from] config::ConfigError),

  /// A cascading driver delete stopped partway through.
  #[error(
    "cascade delete of driver {driver_id} stopped after {deleted} consumers \
     ({remaining} remain): {source}"
  )]
  PartialCascade {
    driver_id: String,
    deleted:   usize,
    remaining: usize,
    #[source]
    source:    Box<Error>,
  },

  /// A consumer move created the new document but could not remove the old
  /// one; the consumer now exists in both places.
  #[error("consumer {consumer_id} was copied to {new_id} but not removed: {source}")]
  PartialMove {
    consumer_id: String,
    new_id:      String,
    #[source]
    source:      Box<Error>,
  },
}

/// Coarse failure category, for rendering field messages versus retry
/// prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Validation,
  NotFound,
  RateLimited,
  Store,
  Mapping,
  Config,
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Validation(_) => ErrorKind::Validation,
      Self::Mapping(carpolly_core::Error::InvalidSegment(_)) => {
        ErrorKind::Validation
      }
      Self::NotFound(_) => ErrorKind::NotFound,
      Self::RateLimited { .. } => ErrorKind::RateLimited,
      Self::Store(_) | Self::PartialCascade { .. } | Self::PartialMove { .. } => {
        ErrorKind::Store
      }
      Self::Mapping(_) => ErrorKind::Mapping,
      Self::Config(_) => ErrorKind::Config,
    }
  }

  /// The per-field messages, if this is a validation failure.
  pub fn validation_errors(&self) -> Option<&ValidationErrors> {
    match self {
      Self::Validation(errors) => Some(errors),
      _ => None,
    }
  }
}

/// Convert a backend error, surfacing "document absent" as [`Error::NotFound`].
pub(crate) fn store_err<E: StoreError>(e: E) -> Error {
  if e.is_not_found() {
    Error::NotFound(e.to_string())
  } else {
    Error::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
