//! SQLite backend for the Carpolly document store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Change-streams are fed from a
//! [`tokio::sync::broadcast`] channel that every successful write publishes
//! to.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
