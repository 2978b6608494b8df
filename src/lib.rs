//! Product image post-processing worker
//!
//! Consumes image processing tasks published when a product is created,
//! downloads each product image, shrinks and re-encodes it, publishes the
//! result to object storage and writes the public URLs back to the catalog.

pub mod app;
pub mod catalog;
pub mod cdn;
pub mod consumer;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod image;
pub mod models;
pub mod queue;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
