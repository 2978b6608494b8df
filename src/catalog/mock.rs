use super::CatalogService;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory catalog that records every write. Products are implicitly
/// present unless marked missing.
#[derive(Clone, Default)]
pub struct MockCatalog {
    images: Arc<Mutex<HashMap<u64, Vec<String>>>>,
    updates: Arc<Mutex<Vec<(u64, Vec<String>)>>>,
    store_failures: Arc<Mutex<usize>>,
    missing: Arc<Mutex<HashSet<u64>>>,
    delay: Option<Duration>,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes with a transient store error.
    pub fn with_store_failures(self, count: usize) -> Self {
        *self.store_failures.lock().unwrap() = count;
        self
    }

    /// Sleep before every write, to simulate a slow database.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_missing_product(self, product_id: u64) -> Self {
        self.missing.lock().unwrap().insert(product_id);
        self
    }

    /// Attempted writes, failed ones included.
    pub fn get_updates(&self) -> Vec<(u64, Vec<String>)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn get_images(&self, product_id: u64) -> Option<Vec<String>> {
        self.images.lock().unwrap().get(&product_id).cloned()
    }
}

#[async_trait]
impl CatalogService for MockCatalog {
    async fn update_product_images(
        &self,
        product_id: u64,
        compressed_urls: &[String],
    ) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.updates
            .lock()
            .unwrap()
            .push((product_id, compressed_urls.to_vec()));

        {
            let mut failures = self.store_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Store(format!(
                    "mock store unavailable updating product {}",
                    product_id
                )));
            }
        }

        if self.missing.lock().unwrap().contains(&product_id) {
            return Err(Error::ProductNotFound(product_id));
        }

        self.images
            .lock()
            .unwrap()
            .insert(product_id, compressed_urls.to_vec());
        Ok(())
    }
}
