use super::QueueService;
use crate::models::ImageProcessingTask;
use crate::Result;
use std::sync::Arc;

/// Producer side used by the catalog-creation flow.
pub struct TaskEnqueuer {
    queue: Arc<dyn QueueService>,
    queue_name: String,
}

impl TaskEnqueuer {
    pub fn new(queue: Arc<dyn QueueService>, queue_name: String) -> Self {
        Self { queue, queue_name }
    }

    /// Publish a pending task for a newly created product. Products without
    /// images need no processing and yield `None`. A publish failure is
    /// returned so the creation request can fail with it.
    pub async fn enqueue(
        &self,
        product_id: u64,
        image_urls: &[String],
    ) -> Result<Option<ImageProcessingTask>> {
        if image_urls.is_empty() {
            tracing::debug!(product_id, "No images to process, skipping enqueue");
            return Ok(None);
        }

        let task = ImageProcessingTask::new(product_id, image_urls.to_vec());
        task.validate()?;

        self.queue
            .publish(&self.queue_name, &task.to_message()?)
            .await
            .map_err(|e| {
                tracing::error!(product_id, error = %e, "Failed to enqueue image processing");
                e
            })?;

        tracing::info!(
            product_id,
            images = image_urls.len(),
            queue = %self.queue_name,
            "Enqueued image processing task"
        );
        Ok(Some(task))
    }
}
