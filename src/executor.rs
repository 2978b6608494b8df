//! Per-task orchestration of fetch, transform and publish.
//!
//! Images are processed strictly in order so results stay index-aligned
//! with their sources. Published objects are never rolled back: a redelivered
//! task republishes under the same keys, overwriting what an earlier attempt
//! left behind.

use crate::cdn::BlobPublisher;
use crate::fetch::ImageFetcher;
use crate::image::ImageProcessor;
use crate::models::{ImageProcessingTask, ProcessedImage};
use crate::{Error, Result};
use tracing::{error, info, warn};

#[derive(Debug)]
pub enum TaskOutcome {
    /// Every image was published; the task is `succeeded`.
    Succeeded,
    /// Image `index` failed permanently; the task is `failed` and the
    /// remaining images were not attempted.
    Failed { index: usize, error: Error },
    /// Image `index` failed transiently; the whole task should be retried.
    Retryable { index: usize, error: Error },
}

pub struct TaskExecutor {
    fetcher: Box<dyn ImageFetcher>,
    processor: ImageProcessor,
    publisher: BlobPublisher,
}

impl TaskExecutor {
    pub fn new(
        fetcher: Box<dyn ImageFetcher>,
        processor: ImageProcessor,
        publisher: BlobPublisher,
    ) -> Self {
        Self {
            fetcher,
            processor,
            publisher,
        }
    }

    async fn process_image(&self, url: &str) -> Result<String> {
        let key = self.publisher.key_for(url)?;
        let fetched = self.fetcher.fetch(url).await?;
        let transformed = self.processor.process(fetched).await?;
        self.publisher
            .publish(&transformed.bytes, &key, transformed.format.content_type())
            .await
    }

    /// Run the task to a terminal status or a retryable stop, mutating it in
    /// place. Errors are reserved for status-transition misuse.
    pub async fn execute(&self, task: &mut ImageProcessingTask) -> Result<TaskOutcome> {
        task.start()?;
        let product_id = task.product_id;
        let total = task.image_urls.len();
        info!(product_id, images = total, "Processing image task");

        for index in 0..total {
            let url = task.image_urls[index].clone();
            let processed = match self.process_image(&url).await {
                Ok(result_url) => ProcessedImage::published(&url, result_url),
                Err(error) => {
                    task.record(index, &ProcessedImage::failed(&url, &error))?;

                    if error.is_retryable() {
                        warn!(product_id, index, url = %url, error = %error, "Image processing failed, task will be retried");
                        return Ok(TaskOutcome::Retryable { index, error });
                    }

                    error!(product_id, index, url = %url, error = %error, "Image processing failed");
                    task.fail(error.to_string())?;
                    return Ok(TaskOutcome::Failed { index, error });
                }
            };

            info!(
                product_id,
                index,
                url = %url,
                result = processed.result_url.as_deref().unwrap_or_default(),
                "Processed image {}/{}",
                index + 1,
                total
            );
            task.record(index, &processed)?;
        }

        task.succeed()?;
        info!(product_id, images = total, "Image task succeeded");
        Ok(TaskOutcome::Succeeded)
    }
}
