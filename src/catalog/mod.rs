//! Catalog write-back
//!
//! The only catalog operation the worker needs: store the processed image
//! URLs on the owning product.

pub mod mock;
pub mod postgres;

pub use mock::MockCatalog;
pub use postgres::PgCatalog;

use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Replace the product's compressed image list. Fails with
    /// `ProductNotFound` or a retryable `Store` error.
    async fn update_product_images(&self, product_id: u64, compressed_urls: &[String])
        -> Result<()>;
}
