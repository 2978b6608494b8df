use super::CatalogService;
use crate::{Error, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

const UPDATE_PRODUCT_IMAGES: &str = "UPDATE products \
     SET compressed_product_images = $1, processed_at = now(), updated_at = now() \
     WHERE id = $2 AND deleted_at IS NULL";

pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| Error::Store(format!("Failed to connect to catalog database: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogService for PgCatalog {
    async fn update_product_images(
        &self,
        product_id: u64,
        compressed_urls: &[String],
    ) -> Result<()> {
        let id = i64::try_from(product_id)
            .map_err(|_| Error::ProductNotFound(product_id))?;

        let result = sqlx::query(UPDATE_PRODUCT_IMAGES)
            .bind(compressed_urls.to_vec())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("updating product {}: {}", product_id, e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::ProductNotFound(product_id));
        }
        Ok(())
    }
}
