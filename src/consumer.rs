//! Queue consumer
//!
//! Pulls deliveries under manual acknowledgement, runs each task through the
//! executor and settles the delivery once the outcome is known. A delivery is
//! acked only after the catalog write-back for a successful task has landed.

use crate::catalog::CatalogService;
use crate::executor::{TaskExecutor, TaskOutcome};
use crate::models::{Config, ImageProcessingTask, DEFAULT_QUEUE_NAME};
use crate::queue::{Delivery, QueueService};
use crate::{Error, Result};
use futures::{future, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acked after a terminal outcome.
    Committed,
    /// Nacked with requeue.
    Retried,
    /// Acked without executing anything.
    Dropped,
    /// Copied to the dead-letter queue, then acked.
    DeadLettered,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue_name: String,
    pub dead_letter_queue: Option<String>,
    pub max_redeliveries: u32,
    pub requeue_delay: Duration,
    pub concurrency: usize,
    pub catalog_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            dead_letter_queue: Some(format!("{}.dead_letter", DEFAULT_QUEUE_NAME)),
            max_redeliveries: 5,
            requeue_delay: Duration::from_secs(1),
            concurrency: 4,
            catalog_timeout: Duration::from_secs(10),
        }
    }
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue_name: config.queue_name.clone(),
            dead_letter_queue: config.dead_letter_queue.clone(),
            max_redeliveries: config.max_redeliveries,
            requeue_delay: config.requeue_delay,
            concurrency: config.worker_concurrency,
            catalog_timeout: config.catalog_timeout,
        }
    }
}

pub struct Consumer {
    queue: Arc<dyn QueueService>,
    executor: TaskExecutor,
    catalog: Box<dyn CatalogService>,
    settings: ConsumerSettings,
}

impl Consumer {
    pub fn new(
        queue: Arc<dyn QueueService>,
        executor: TaskExecutor,
        catalog: Box<dyn CatalogService>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            queue,
            executor,
            catalog,
            settings,
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub async fn declare(&self) -> Result<()> {
        self.queue
            .declare_durable_queue(&self.settings.queue_name)
            .await?;
        if let Some(dead_letter) = &self.settings.dead_letter_queue {
            self.queue.declare_durable_queue(dead_letter).await?;
        }
        Ok(())
    }

    /// Consume until `shutdown` is cancelled. Deliveries already being
    /// processed run to completion; a broken delivery stream is reopened
    /// with exponential backoff.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.declare().await?;
        info!(
            queue = %self.settings.queue_name,
            concurrency = self.settings.concurrency,
            "Consumer started"
        );

        while !shutdown.is_cancelled() {
            let strategy = ExponentialBackoff::from_millis(2)
                .factor(100)
                .max_delay(Duration::from_secs(10))
                .map(jitter);
            let connect = Retry::spawn(strategy, || async {
                self.queue
                    .consume(&self.settings.queue_name)
                    .await
                    .map_err(|e| {
                        warn!(queue = %self.settings.queue_name, error = %e, "Failed to open delivery stream, retrying");
                        e
                    })
            });

            let deliveries = tokio::select! {
                _ = shutdown.cancelled() => break,
                stream = connect => stream?,
            };

            // Stop pulling at the first stream error, but let deliveries
            // already handed out settle before reconnecting.
            let mut stream_error = None;
            deliveries
                .take_until(shutdown.cancelled())
                .take_while(|item| {
                    if let Err(e) = item {
                        stream_error = Some(e.to_string());
                    }
                    future::ready(item.is_ok())
                })
                .filter_map(|item| future::ready(item.ok()))
                .for_each_concurrent(self.settings.concurrency, |delivery| async move {
                    if let Err(e) = self.handle_delivery(&delivery).await {
                        error!(
                            queue = %delivery.queue,
                            error = %e,
                            "Failed to settle delivery; it will be redelivered"
                        );
                    }
                })
                .await;

            if let Some(e) = stream_error {
                warn!(queue = %self.settings.queue_name, error = %e, "Delivery stream failed, reconnecting");
            }
        }

        info!(queue = %self.settings.queue_name, "Consumer stopped");
        Ok(())
    }

    /// Execute one delivery and settle it. An error means the delivery could
    /// not be settled and is left for the queue to redeliver.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<Disposition> {
        let mut task = match ImageProcessingTask::from_message(&delivery.body) {
            Ok(task) => task,
            Err(e) => {
                error!(
                    queue = %delivery.queue,
                    error = %e,
                    "Dropping corrupt task message"
                );
                self.queue.ack(delivery).await?;
                return Ok(Disposition::Dropped);
            }
        };
        let product_id = task.product_id;
        info!(
            product_id,
            redeliveries = delivery.redelivery_count,
            "Received image processing task"
        );

        let outcome = match self.executor.execute(&mut task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(product_id, error = %e, "Task could not be executed, dropping");
                self.queue.ack(delivery).await?;
                return Ok(Disposition::Dropped);
            }
        };

        match outcome {
            TaskOutcome::Succeeded => match self.write_back(&task).await {
                Ok(()) => {
                    self.queue.ack(delivery).await?;
                    info!(product_id, "Task committed");
                    Ok(Disposition::Committed)
                }
                Err(Error::ProductNotFound(_)) => {
                    warn!(product_id, "Product no longer exists, discarding processed images");
                    self.queue.ack(delivery).await?;
                    Ok(Disposition::Committed)
                }
                Err(e) if e.is_retryable() => {
                    warn!(product_id, error = %e, "Catalog update failed");
                    self.retry(delivery, product_id).await
                }
                Err(e) => {
                    error!(product_id, error = %e, "Catalog update failed permanently");
                    self.queue.ack(delivery).await?;
                    Ok(Disposition::Dropped)
                }
            },
            TaskOutcome::Failed { index, error } => {
                error!(
                    product_id,
                    index,
                    error = %error,
                    "Image processing task failed"
                );
                self.queue.ack(delivery).await?;
                Ok(Disposition::Committed)
            }
            TaskOutcome::Retryable { .. } => self.retry(delivery, product_id).await,
        }
    }

    async fn write_back(&self, task: &ImageProcessingTask) -> Result<()> {
        tokio::time::timeout(
            self.settings.catalog_timeout,
            self.catalog
                .update_product_images(task.product_id, &task.compressed_image_urls),
        )
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "updating images for product {} after {:?}",
                task.product_id, self.settings.catalog_timeout
            ))
        })?
    }

    async fn retry(&self, delivery: &Delivery, product_id: u64) -> Result<Disposition> {
        if delivery.redelivery_count >= self.settings.max_redeliveries {
            if let Some(dead_letter) = &self.settings.dead_letter_queue {
                match self.queue.publish(dead_letter, &delivery.body).await {
                    Ok(()) => {
                        self.queue.ack(delivery).await?;
                        error!(
                            product_id,
                            redeliveries = delivery.redelivery_count,
                            dead_letter_queue = %dead_letter,
                            "Redelivery limit reached, task dead-lettered"
                        );
                        return Ok(Disposition::DeadLettered);
                    }
                    Err(e) => {
                        error!(product_id, error = %e, "Failed to dead-letter task, requeueing");
                    }
                }
            }
        }

        if !self.settings.requeue_delay.is_zero() {
            tokio::time::sleep(self.settings.requeue_delay).await;
        }
        self.queue.nack(delivery, true).await?;
        warn!(
            product_id,
            redeliveries = delivery.redelivery_count,
            "Task requeued for retry"
        );
        Ok(Disposition::Retried)
    }
}
