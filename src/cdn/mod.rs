//! Object-store integration for publishing processed images
//!
//! Uploads re-encoded images to S3-compatible storage under keys derived
//! from the source URL, so a retried task overwrites its earlier uploads
//! instead of duplicating them.

pub mod client;
pub mod mock;
pub mod publisher;

pub use client::CdnClient;
pub use mock::{CdnFailure, MockCdnClient};
pub use publisher::{derive_key, BlobPublisher};

use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait CdnService: Send + Sync {
    /// Store `data` under `key`, replacing any existing object, and return
    /// its public URL.
    async fn upload_file(&self, key: &str, data: &[u8], content_type: &str) -> Result<String>;
}
