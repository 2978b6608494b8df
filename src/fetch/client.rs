use super::{FetchedImage, ImageFetcher, SupportedFormat};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn classify_request_error(url: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("fetching {}: {}", url, e))
    } else if e.is_builder() {
        Error::InvalidSourceUrl(format!("{}: {}", url, e))
    } else {
        Error::Network(format!("fetching {}: {}", url, e))
    }
}

fn classify_status(url: &str, status: StatusCode) -> Error {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Error::Network(format!("{} returned status {}", url, status))
    } else {
        Error::FetchRejected {
            url: url.to_string(),
            status: status.as_u16(),
        }
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage> {
        let parsed =
            Url::parse(url).map_err(|e| Error::InvalidSourceUrl(format!("{}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidSourceUrl(format!(
                "{}: unsupported scheme '{}'",
                url,
                parsed.scheme()
            )));
        }

        tracing::debug!(url, "Fetching source image");

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| classify_request_error(url, e))?;

        if !response.status().is_success() {
            let err = classify_status(url, response.status());
            tracing::warn!(url, status = %response.status(), "Source image request failed");
            return Err(err);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let format = SupportedFormat::from_content_type(&content_type).ok_or_else(|| {
            Error::UnsupportedFormat {
                url: url.to_string(),
                content_type: if content_type.is_empty() {
                    "<missing>".to_string()
                } else {
                    content_type.clone()
                },
            }
        })?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_request_error(url, e))?
            .to_vec();

        tracing::debug!(url, size = bytes.len(), format = ?format, "Fetched source image");

        Ok(FetchedImage {
            url: url.to_string(),
            bytes,
            format,
        })
    }
}
