use super::{FetchedImage, ImageFetcher, SupportedFormat};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
enum MockResponse {
    Image {
        bytes: Vec<u8>,
        format: SupportedFormat,
    },
    Unsupported(String),
    NetworkFailure,
}

/// In-memory fetcher keyed by URL. Unknown URLs answer 404.
#[derive(Clone, Default)]
pub struct MockFetcher {
    responses: Arc<Mutex<HashMap<String, MockResponse>>>,
    transient_failures: Arc<Mutex<HashMap<String, usize>>>,
    requested: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(self, url: &str, bytes: Vec<u8>, format: SupportedFormat) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), MockResponse::Image { bytes, format });
        self
    }

    pub fn with_unsupported(self, url: &str, content_type: &str) -> Self {
        self.responses.lock().unwrap().insert(
            url.to_string(),
            MockResponse::Unsupported(content_type.to_string()),
        );
        self
    }

    pub fn with_network_failure(self, url: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), MockResponse::NetworkFailure);
        self
    }

    /// Fail the next `count` fetches of `url` with a network error, then fall
    /// through to the configured response.
    pub fn with_transient_failures(self, url: &str, count: usize) -> Self {
        self.transient_failures
            .lock()
            .unwrap()
            .insert(url.to_string(), count);
        self
    }

    pub fn get_call_count(&self) -> usize {
        self.requested.lock().unwrap().len()
    }

    pub fn get_requested_urls(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage> {
        self.requested.lock().unwrap().push(url.to_string());

        {
            let mut failures = self.transient_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::Network(format!("mock transient failure for {}", url)));
                }
            }
        }

        let response = self.responses.lock().unwrap().get(url).cloned();
        match response {
            Some(MockResponse::Image { bytes, format }) => Ok(FetchedImage {
                url: url.to_string(),
                bytes,
                format,
            }),
            Some(MockResponse::Unsupported(content_type)) => Err(Error::UnsupportedFormat {
                url: url.to_string(),
                content_type,
            }),
            Some(MockResponse::NetworkFailure) => {
                Err(Error::Network(format!("mock network failure for {}", url)))
            }
            None => Err(Error::FetchRejected {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}
