use super::CdnService;
use crate::{Error, Result};
use std::time::Duration;
use url::Url;

/// Object key for a source image: `<prefix>/<basename of the URL path>`.
///
/// The key depends only on the source URL, so republishing after a
/// redelivery overwrites the earlier object.
pub fn derive_key(prefix: &str, source_url: &str) -> Result<String> {
    let parsed = Url::parse(source_url)
        .map_err(|e| Error::InvalidSourceUrl(format!("{}: {}", source_url, e)))?;
    let basename = parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .ok_or_else(|| {
            Error::InvalidSourceUrl(format!("{}: no file name in path", source_url))
        })?;

    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        Ok(basename.to_string())
    } else {
        Ok(format!("{}/{}", prefix, basename))
    }
}

pub struct BlobPublisher {
    cdn: Box<dyn CdnService>,
    key_prefix: String,
    timeout: Duration,
}

impl BlobPublisher {
    pub fn new(cdn: Box<dyn CdnService>, key_prefix: String, timeout: Duration) -> Self {
        Self {
            cdn,
            key_prefix,
            timeout,
        }
    }

    pub fn key_for(&self, source_url: &str) -> Result<String> {
        derive_key(&self.key_prefix, source_url)
    }

    /// Upload under `key` and return the public URL. An upload that outlives
    /// the timeout is reported as [`Error::Timeout`].
    pub async fn publish(&self, bytes: &[u8], key: &str, content_type: &str) -> Result<String> {
        let url = tokio::time::timeout(self.timeout, self.cdn.upload_file(key, bytes, content_type))
            .await
            .map_err(|_| {
                Error::Timeout(format!("uploading {} after {:?}", key, self.timeout))
            })??;

        tracing::debug!(key, url = %url, size = bytes.len(), "Published image");
        Ok(url)
    }
}
