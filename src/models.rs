//! Data models and configuration
//!
//! Defines the image-processing task carried on the queue, the per-image
//! result folded into it, and the worker configuration read from the
//! environment.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    // The catalog service enqueues fresh tasks with an empty status.
    #[default]
    #[serde(alias = "")]
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Status only moves forward. `Processing -> Processing` is allowed so a
    /// redelivered task can restart.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Succeeded)
                | (TaskStatus::Processing, TaskStatus::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Unit of asynchronous work tied to one catalog product.
///
/// `compressed_image_urls` is index-aligned with `image_urls`; a position
/// whose image did not complete holds an empty string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageProcessingTask {
    #[serde(rename = "productID", alias = "ProductID")]
    pub product_id: u64,
    #[serde(
        rename = "imageURLs",
        alias = "ImageURLs",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub image_urls: Vec<String>,
    #[serde(alias = "Status", default)]
    pub status: TaskStatus,
    #[serde(
        rename = "errorMessage",
        alias = "ErrorMessage",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub error_message: Option<String>,
    #[serde(
        rename = "compressedImageURLs",
        alias = "CompressedImageURLs",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub compressed_image_urls: Vec<String>,
    #[serde(
        rename = "processedAt",
        alias = "ProcessedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub processed_at: Option<DateTime<Utc>>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.is_empty()))
}

impl ImageProcessingTask {
    pub fn new(product_id: u64, image_urls: Vec<String>) -> Self {
        Self {
            product_id,
            image_urls,
            status: TaskStatus::Pending,
            error_message: None,
            compressed_image_urls: Vec::new(),
            processed_at: None,
        }
    }

    /// Parse and validate a queue payload. Anything that cannot become a
    /// runnable task is reported as [`Error::MalformedMessage`].
    pub fn from_message(body: &[u8]) -> Result<Self> {
        let task: Self = serde_json::from_slice(body)
            .map_err(|e| Error::MalformedMessage(format!("invalid task payload: {}", e)))?;
        task.validate()?;
        Ok(task)
    }

    pub fn to_message(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image_urls.is_empty() {
            return Err(Error::MalformedMessage(format!(
                "task for product {} has no image URLs",
                self.product_id
            )));
        }
        if let Some(index) = self.image_urls.iter().position(|u| u.trim().is_empty()) {
            return Err(Error::MalformedMessage(format!(
                "task for product {} has a blank image URL at position {}",
                self.product_id, index
            )));
        }
        if self.status.is_terminal() {
            return Err(Error::MalformedMessage(format!(
                "task for product {} arrived already {}",
                self.product_id, self.status
            )));
        }
        Ok(())
    }

    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Enter `processing` with one empty slot per source image.
    pub fn start(&mut self) -> Result<()> {
        self.transition(TaskStatus::Processing)?;
        self.error_message = None;
        self.compressed_image_urls = vec![String::new(); self.image_urls.len()];
        Ok(())
    }

    /// Fold one per-image result into its slot.
    pub fn record(&mut self, index: usize, processed: &ProcessedImage) -> Result<()> {
        let slot = self.compressed_image_urls.get_mut(index).ok_or_else(|| {
            Error::Invariant(format!(
                "result index {} out of range for product {}",
                index, self.product_id
            ))
        })?;
        if let Some(url) = &processed.result_url {
            slot.clone_from(url);
        }
        Ok(())
    }

    pub fn succeed(&mut self) -> Result<()> {
        self.transition(TaskStatus::Succeeded)?;
        self.processed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, message: String) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.error_message = Some(message);
        self.processed_at = Some(Utc::now());
        Ok(())
    }
}

/// Outcome of one fetch, transform and publish cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedImage {
    pub source_url: String,
    pub result_url: Option<String>,
    pub error: Option<String>,
}

impl ProcessedImage {
    pub fn published(source_url: &str, result_url: String) -> Self {
        Self {
            source_url: source_url.to_string(),
            result_url: Some(result_url),
            error: None,
        }
    }

    pub fn failed(source_url: &str, error: &Error) -> Self {
        Self {
            source_url: source_url.to_string(),
            result_url: None,
            error: Some(error.to_string()),
        }
    }
}

// Configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub queue_name: String,
    pub dead_letter_queue: Option<String>,
    pub max_redeliveries: u32,
    pub requeue_delay: Duration,
    pub worker_concurrency: usize,
    pub worker_id: String,
    pub visibility_timeout: Duration,
    pub s3_bucket: String,
    pub s3_region: String,
    pub s3_endpoint: Option<String>,
    pub cdn_base_url: String,
    pub image_key_prefix: String,
    pub image_max_width: u32,
    pub image_max_height: u32,
    pub image_quality: u8,
    pub fetch_timeout: Duration,
    pub publish_timeout: Duration,
    pub catalog_timeout: Duration,
}

pub const DEFAULT_QUEUE_NAME: &str = "image_processing_queue";

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required =
            |key: &str| get(key).ok_or_else(|| Error::Config(format!("{} not set", key)));

        let queue_name = get("QUEUE_NAME").unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string());
        let dead_letter_queue = match lookup("DEAD_LETTER_QUEUE") {
            Some(name) if name.trim().is_empty() => None,
            Some(name) => Some(name),
            None => Some(format!("{}.dead_letter", queue_name)),
        };
        let s3_bucket = required("S3_BUCKET")?;
        let cdn_base_url = get("CDN_BASE_URL")
            .unwrap_or_else(|| format!("https://{}.s3.amazonaws.com", s3_bucket))
            .trim_end_matches('/')
            .to_string();

        let image_quality: u8 = parse_or(&get, "IMAGE_QUALITY", 75)?;
        if !(1..=100).contains(&image_quality) {
            return Err(Error::Config(format!(
                "IMAGE_QUALITY must be between 1 and 100, got {}",
                image_quality
            )));
        }
        let worker_concurrency: usize = parse_or(&get, "WORKER_CONCURRENCY", 4)?;
        if worker_concurrency == 0 {
            return Err(Error::Config(
                "WORKER_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        let image_max_width: u32 = parse_or(&get, "IMAGE_MAX_WIDTH", 800)?;
        let image_max_height: u32 = parse_or(&get, "IMAGE_MAX_HEIGHT", 600)?;
        if image_max_width == 0 || image_max_height == 0 {
            return Err(Error::Config(format!(
                "IMAGE_MAX_WIDTH and IMAGE_MAX_HEIGHT must be at least 1, got {}x{}",
                image_max_width, image_max_height
            )));
        }
        let visibility_secs: u64 = parse_or(&get, "VISIBILITY_TIMEOUT_SECS", 300)?;
        if visibility_secs == 0 {
            return Err(Error::Config(
                "VISIBILITY_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            redis_url: required("REDIS_URL")?,
            queue_name,
            dead_letter_queue,
            max_redeliveries: parse_or(&get, "MAX_REDELIVERIES", 5)?,
            requeue_delay: Duration::from_millis(parse_or(&get, "REQUEUE_DELAY_MS", 1000)?),
            worker_concurrency,
            worker_id: get("WORKER_ID")
                .or_else(|| get("HOSTNAME"))
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            visibility_timeout: Duration::from_secs(visibility_secs),
            s3_bucket,
            s3_region: get("S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            s3_endpoint: get("S3_ENDPOINT"),
            cdn_base_url,
            image_key_prefix: get("IMAGE_KEY_PREFIX").unwrap_or_else(|| "compressed".to_string()),
            image_max_width,
            image_max_height,
            image_quality,
            fetch_timeout: Duration::from_secs(parse_or(&get, "FETCH_TIMEOUT_SECS", 30)?),
            publish_timeout: Duration::from_secs(parse_or(&get, "PUBLISH_TIMEOUT_SECS", 30)?),
            catalog_timeout: Duration::from_secs(parse_or(&get, "CATALOG_TIMEOUT_SECS", 10)?),
        })
    }
}

fn parse_or<T, F>(get: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {} '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_task_wire_format() {
        let task = ImageProcessingTask::new(42, vec!["http://x/a.jpg".to_string()]);
        let json: serde_json::Value = serde_json::from_slice(&task.to_message().unwrap()).unwrap();

        assert_eq!(json["productID"], 42);
        assert_eq!(json["imageURLs"][0], "http://x/a.jpg");
        assert_eq!(json["status"], "pending");
        assert!(json["compressedImageURLs"].as_array().unwrap().is_empty());
        assert!(json.get("errorMessage").is_none());
    }

    #[test]
    fn test_task_accepts_catalog_payload_with_empty_status_and_nulls() {
        let body = br#"{"ProductID":7,"ImageURLs":["http://x/a.png"],"Status":"","ErrorMessage":"","CompressedImageURLs":null,"ProcessedAt":"0001-01-01T00:00:00Z"}"#;
        let task = ImageProcessingTask::from_message(body).unwrap();

        assert_eq!(task.product_id, 7);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.error_message, None);
        assert!(task.compressed_image_urls.is_empty());
    }

    #[test]
    fn test_task_rejects_non_json_and_empty_url_lists() {
        assert!(matches!(
            ImageProcessingTask::from_message(b"not json"),
            Err(Error::MalformedMessage(_))
        ));
        assert!(matches!(
            ImageProcessingTask::from_message(br#"{"productID":1,"imageURLs":[]}"#),
            Err(Error::MalformedMessage(_))
        ));
        assert!(matches!(
            ImageProcessingTask::from_message(br#"{"productID":1,"imageURLs":["  "]}"#),
            Err(Error::MalformedMessage(_))
        ));
        assert!(matches!(
            ImageProcessingTask::from_message(
                br#"{"productID":1,"imageURLs":["http://x/a.jpg"],"status":"succeeded"}"#
            ),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut task = ImageProcessingTask::new(1, vec!["http://x/a.jpg".to_string()]);
        task.start().unwrap();
        task.start().unwrap();
        task.succeed().unwrap();

        assert!(task.processed_at.is_some());
        assert!(matches!(
            task.transition(TaskStatus::Processing),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(task.transition(TaskStatus::Pending).is_err());
        assert!(task.fail("late".to_string()).is_err());
        assert_eq!(task.status, TaskStatus::Succeeded);
    }

    #[test]
    fn test_record_keeps_sentinel_for_failed_images() {
        let mut task = ImageProcessingTask::new(
            1,
            vec!["http://x/a.jpg".to_string(), "http://x/b.jpg".to_string()],
        );
        task.start().unwrap();
        task.record(
            0,
            &ProcessedImage::published("http://x/a.jpg", "https://cdn/a.jpg".to_string()),
        )
        .unwrap();
        task.record(
            1,
            &ProcessedImage::failed("http://x/b.jpg", &Error::Network("reset".to_string())),
        )
        .unwrap();

        assert_eq!(
            task.compressed_image_urls,
            vec!["https://cdn/a.jpg".to_string(), String::new()]
        );
        assert!(task.record(2, &ProcessedImage::published("c", "d".to_string())).is_err());
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("DATABASE_URL", "postgres://localhost/catalog"),
        ("REDIS_URL", "redis://localhost"),
        ("S3_BUCKET", "products"),
    ];

    fn with_required(extra: &[(&'static str, &'static str)]) -> Vec<(&'static str, &'static str)> {
        REQUIRED.iter().chain(extra.iter()).copied().collect()
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_lookup(lookup_from(&REQUIRED)).unwrap();

        assert_eq!(config.queue_name, "image_processing_queue");
        assert_eq!(
            config.dead_letter_queue.as_deref(),
            Some("image_processing_queue.dead_letter")
        );
        assert_eq!(config.cdn_base_url, "https://products.s3.amazonaws.com");
        assert_eq!(config.image_key_prefix, "compressed");
        assert_eq!((config.image_max_width, config.image_max_height), (800, 600));
        assert_eq!(config.image_quality, 75);
        assert_eq!(config.max_redeliveries, 5);
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.visibility_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_config_requires_collaborators() {
        let err = Config::from_lookup(lookup_from(&[("S3_BUCKET", "products")])).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));

        let err = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/catalog"),
            ("REDIS_URL", "  "),
            ("S3_BUCKET", "products"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("REDIS_URL"));
    }

    #[test]
    fn test_config_rejects_bad_numbers() {
        let err = Config::from_lookup(lookup_from(&with_required(&[("IMAGE_QUALITY", "0")])))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err =
            Config::from_lookup(lookup_from(&with_required(&[("MAX_REDELIVERIES", "many")])))
                .unwrap_err();
        assert!(err.to_string().contains("MAX_REDELIVERIES"));
    }

    #[test]
    fn test_config_rejects_zero_image_bounds() {
        for key in ["IMAGE_MAX_WIDTH", "IMAGE_MAX_HEIGHT"] {
            let err = Config::from_lookup(lookup_from(&with_required(&[(key, "0")]))).unwrap_err();
            assert!(matches!(err, Error::Config(_)));
            assert!(err.to_string().contains("at least 1"));
        }
    }

    #[test]
    fn test_config_visibility_timeout() {
        let config =
            Config::from_lookup(lookup_from(&with_required(&[("VISIBILITY_TIMEOUT_SECS", "45")])))
                .unwrap();
        assert_eq!(config.visibility_timeout, Duration::from_secs(45));

        let err =
            Config::from_lookup(lookup_from(&with_required(&[("VISIBILITY_TIMEOUT_SECS", "0")])))
                .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_config_overrides() {
        let config = Config::from_lookup(lookup_from(&with_required(&[
            ("DEAD_LETTER_QUEUE", ""),
            ("CDN_BASE_URL", "https://cdn.example.com/"),
            ("WORKER_ID", "worker-1"),
            ("FETCH_TIMEOUT_SECS", "5"),
        ])))
        .unwrap();

        assert!(config.dead_letter_queue.is_none());
        assert_eq!(config.cdn_base_url, "https://cdn.example.com");
        assert_eq!(config.worker_id, "worker-1");
        assert_eq!(config.fetch_timeout, Duration::from_secs(5));
    }
}
