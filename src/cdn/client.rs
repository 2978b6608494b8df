use super::CdnService;
use crate::{Error, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::{config::Region, Client as S3Client};

pub struct CdnClient {
    client: S3Client,
    bucket: String,
    base_url: String,
}

impl CdnClient {
    /// Credentials come from the default AWS provider chain. A custom
    /// `endpoint` (MinIO, Spaces, ...) switches to path-style addressing.
    pub async fn new(
        region: String,
        endpoint: Option<String>,
        bucket: String,
        base_url: String,
    ) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region));
        if let Some(endpoint) = &endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(endpoint.is_some())
            .build();
        let client = S3Client::from_conf(s3_config);

        Ok(Self {
            client,
            bucket,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn get_public_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}

/// Map an S3 failure onto the pipeline's retry taxonomy.
pub(crate) fn classify_upload_failure(
    key: &str,
    timed_out: bool,
    code: Option<&str>,
    detail: &str,
) -> Error {
    if timed_out {
        return Error::Timeout(format!("uploading {}: {}", key, detail));
    }
    match code {
        Some(
            "AccessDenied" | "AllAccessDisabled" | "InvalidAccessKeyId" | "SignatureDoesNotMatch"
            | "AccountProblem" | "NoSuchBucket",
        ) => Error::AccessDenied(format!("uploading {}: {}", key, detail)),
        Some("QuotaExceeded" | "XMinioStorageFull") => {
            Error::QuotaExceeded(format!("uploading {}: {}", key, detail))
        }
        _ => Error::Publish(format!("Failed to upload {}: {}", key, detail)),
    }
}

#[async_trait]
impl CdnService for CdnClient {
    async fn upload_file(&self, key: &str, data: &[u8], content_type: &str) -> Result<String> {
        let body = ByteStream::from(data.to_vec());

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                let timed_out = matches!(e, SdkError::TimeoutError(_));
                let code = e.as_service_error().and_then(|se| se.code()).map(str::to_string);
                classify_upload_failure(
                    key,
                    timed_out,
                    code.as_deref(),
                    &DisplayErrorContext(&e).to_string(),
                )
            })?;

        Ok(self.get_public_url(key))
    }
}
