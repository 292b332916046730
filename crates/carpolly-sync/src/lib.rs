//! The Carpolly client core.
//!
//! [`PollyService`] validates and writes mutations across the polly, driver
//! and consumer documents. [`Reconciler`] fans the change-streams of one polly
//! into a single callback that always receives the fully reassembled
//! aggregate. Both are generic over [`carpolly_core::store::DocumentStore`].

pub mod assemble;
pub mod config;
pub mod error;
pub mod mapper;
pub mod paths;
pub mod reconciler;
pub mod service;

pub use config::ClientConfig;
pub use error::{Error, ErrorKind, Result};
pub use reconciler::{PollyCallback, PollySubscription, Reconciler};
pub use service::PollyService;
