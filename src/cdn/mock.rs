use super::CdnService;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdnFailure {
    Transient,
    QuotaExceeded,
    AccessDenied,
}

impl CdnFailure {
    fn to_error(self, key: &str) -> Error {
        match self {
            CdnFailure::Transient => Error::Publish(format!("mock store unavailable for {}", key)),
            CdnFailure::QuotaExceeded => Error::QuotaExceeded(format!("mock quota for {}", key)),
            CdnFailure::AccessDenied => Error::AccessDenied(format!("mock denied for {}", key)),
        }
    }
}

#[derive(Clone)]
pub struct MockCdnClient {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    base_url: String,
    uploaded_keys: Arc<Mutex<Vec<String>>>,
    failures: Arc<Mutex<Vec<CdnFailure>>>,
    delay: Option<Duration>,
}

impl MockCdnClient {
    pub fn new() -> Self {
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
            base_url: "https://mock-cdn.example.com".to_string(),
            uploaded_keys: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    /// Fail the next `count` uploads with `failure`.
    pub fn with_failures(self, count: usize, failure: CdnFailure) -> Self {
        self.failures
            .lock()
            .unwrap()
            .extend(std::iter::repeat(failure).take(count));
        self
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn get_upload_count(&self) -> usize {
        self.uploaded_keys.lock().unwrap().len()
    }

    /// Keys in upload order, repeats included.
    pub fn get_uploaded_keys(&self) -> Vec<String> {
        self.uploaded_keys.lock().unwrap().clone()
    }

    pub fn get_files(&self) -> HashMap<String, Vec<u8>> {
        self.files.lock().unwrap().clone()
    }
}

impl Default for MockCdnClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CdnService for MockCdnClient {
    async fn upload_file(&self, key: &str, data: &[u8], _content_type: &str) -> Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failure = {
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        };
        if let Some(failure) = failure {
            return Err(failure.to_error(key));
        }

        self.uploaded_keys.lock().unwrap().push(key.to_string());
        self.files
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(format!("{}/{}", self.base_url, key))
    }
}
