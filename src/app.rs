//! Application wiring for the image processing worker.

use crate::catalog::{CatalogService, PgCatalog};
use crate::cdn::{BlobPublisher, CdnClient, CdnService};
use crate::consumer::{Consumer, ConsumerSettings};
use crate::executor::TaskExecutor;
use crate::fetch::{HttpFetcher, ImageFetcher};
use crate::image::{ImageProcessor, TransformSettings};
use crate::models::Config;
use crate::queue::{QueueService, RedisQueue, TaskEnqueuer};
use crate::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Owns the consumer and everything it talks to.
pub struct App {
    queue: Arc<dyn QueueService>,
    consumer: Consumer,
}

/// Injectable service bundle used to construct [`App`] in tests/harnesses.
pub struct AppServices {
    pub queue: Arc<dyn QueueService>,
    pub fetcher: Box<dyn ImageFetcher>,
    pub cdn: Box<dyn CdnService>,
    pub catalog: Box<dyn CatalogService>,
}

impl App {
    /// Build an app from concrete service dependencies.
    ///
    /// This is primarily useful for integration tests and local harnesses that
    /// need to inject mocks.
    pub fn with_services(services: AppServices, config: &Config) -> Self {
        let processor = ImageProcessor::new(TransformSettings {
            max_width: config.image_max_width,
            max_height: config.image_max_height,
            quality: config.image_quality,
        });
        let publisher = BlobPublisher::new(
            services.cdn,
            config.image_key_prefix.clone(),
            config.publish_timeout,
        );
        let executor = TaskExecutor::new(services.fetcher, processor, publisher);
        let consumer = Consumer::new(
            services.queue.clone(),
            executor,
            services.catalog,
            ConsumerSettings::from_config(config),
        );

        Self {
            queue: services.queue,
            consumer,
        }
    }

    /// Connect the production adapters: Redis queue, HTTP fetcher, S3 and
    /// PostgreSQL.
    pub async fn new(config: &Config) -> Result<Self> {
        let queue = RedisQueue::connect(
            &config.redis_url,
            config.worker_id.clone(),
            config.visibility_timeout,
        )
        .await?;
        let fetcher = HttpFetcher::new(config.fetch_timeout)?;
        let cdn = CdnClient::new(
            config.s3_region.clone(),
            config.s3_endpoint.clone(),
            config.s3_bucket.clone(),
            config.cdn_base_url.clone(),
        )
        .await?;
        let catalog = PgCatalog::connect(&config.database_url, config.catalog_timeout).await?;
        info!(
            worker_id = %config.worker_id,
            bucket = %config.s3_bucket,
            "Initialized worker services"
        );

        Ok(Self::with_services(
            AppServices {
                queue: Arc::new(queue),
                fetcher: Box::new(fetcher),
                cdn: Box::new(cdn),
                catalog: Box::new(catalog),
            },
            config,
        ))
    }

    /// Producer handle publishing onto the queue this app consumes.
    pub fn enqueuer(&self) -> TaskEnqueuer {
        TaskEnqueuer::new(
            self.queue.clone(),
            self.consumer.settings().queue_name.clone(),
        )
    }

    /// Consume tasks until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.consumer.run(shutdown).await
    }
}
