//! Error handling and custom error types
//!
//! Provides unified error handling across the worker using thiserror. Every
//! variant is classified as retryable or permanent; the queue consumer uses
//! that classification to choose between redelivery and acknowledgement.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported image format '{content_type}' for {url}")]
    UnsupportedFormat { url: String, content_type: String },

    #[error("Failed to decode image from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Source {url} rejected the request with status {status}")]
    FetchRejected { url: String, status: u16 },

    #[error("Invalid source URL: {0}")]
    InvalidSourceUrl(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Object store quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Object store access denied: {0}")]
    AccessDenied(String),

    #[error("Product {0} not found")]
    ProductNotFound(u64),

    #[error("Catalog store error: {0}")]
    Store(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid task status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// Whether redelivering the same work can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Timeout(_)
                | Error::Publish(_)
                | Error::Store(_)
                | Error::Queue(_)
                | Error::Redis(_)
                | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
