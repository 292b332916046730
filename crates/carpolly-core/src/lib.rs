//! Core types and trait definitions for the Carpolly sync core.
//!
//! This crate has no database or runtime dependencies. It holds the nested
//! domain model (polly, drivers, consumers), the flat document model the
//! hosted store speaks, the [`store::DocumentStore`] abstraction, and the
//! validation gate every mutation passes through.

// Backends implement `DocumentStore` with plain `async fn`.
#![allow(async_fn_in_trait)]

pub mod document;
pub mod error;
pub mod model;
pub mod rate_limit;
pub mod store;
pub mod validate;

pub use error::{Error, Result};
