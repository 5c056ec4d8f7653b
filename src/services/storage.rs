use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;

use crate::core::config::{S3Settings, Settings};
use crate::resilience::PipelineError;

pub(crate) const S3_SCHEME: &str = "s3://";

#[derive(Debug, Clone)]
pub(crate) struct StorageService {
    client: Client,
    bucket: String,
}

impl StorageService {
    pub(crate) async fn from_settings(settings: &Settings) -> anyhow::Result<Option<Self>> {
        Self::from_s3_settings(settings.s3()).await
    }

    pub(crate) async fn from_s3_settings(s3: &S3Settings) -> anyhow::Result<Option<Self>> {
        if !s3.is_configured() {
            return Ok(None);
        }

        let creds = Credentials::new(
            s3.access_key.clone(),
            s3.secret_key.clone(),
            None,
            None,
            "autograder-static",
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(s3.region.clone()))
            .credentials_provider(creds);
        if !s3.endpoint.is_empty() {
            loader = loader.endpoint_url(s3.endpoint.clone());
        }
        let config = loader.load().await;

        let client = Client::new(&config);

        Ok(Some(Self { client, bucket: s3.bucket.clone() }))
    }

    pub(crate) fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Downloads one object. A missing key is `NotFound`; anything else the
    /// SDK reports is treated as transient.
    pub(crate) async fn fetch_bytes(&self, key: &str) -> Result<Vec<u8>, PipelineError> {
        let output = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => output,
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_no_such_key() {
                    return Err(PipelineError::NotFound(format!("s3://{key}")));
                }
                return Err(PipelineError::Transient(format!(
                    "failed to fetch s3://{key}: {service_error}"
                )));
            }
        };

        let body = output.body.collect().await.map_err(|err| {
            PipelineError::Transient(format!("failed to read s3://{key}: {err}"))
        })?;

        Ok(body.into_bytes().to_vec())
    }
}

/// Object key for an `s3://key` reference, or `None` for local references.
pub(crate) fn s3_key(reference: &str) -> Option<&str> {
    reference.strip_prefix(S3_SCHEME).map(|key| key.trim_start_matches('/'))
}
