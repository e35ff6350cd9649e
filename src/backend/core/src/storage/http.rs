//! Object storage over HTTP.
//!
//! Speaks the minimal bucket protocol shared by S3-compatible gateways:
//! `PUT {endpoint}/{bucket}/{key}` to store and `DELETE` on the same URL to
//! remove, authenticated with a bearer token.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use super::{object_key, validate_key, StorageBackend, StoredObject};
use crate::error::{Result, SitegateError};
use crate::jobs::TenantId;

pub struct HttpObjectStorage {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    token: Option<String>,
}

impl HttpObjectStorage {
    /// Fails when the TLS backend cannot be initialised.
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SitegateError::configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl StorageBackend for HttpObjectStorage {
    async fn write(&self, tenant_id: TenantId, filename: &str, content: &[u8]) -> Result<StoredObject> {
        let key = object_key(tenant_id, filename)?;
        let response = self
            .authorize(self.client.put(self.url(&key)))
            .header(reqwest::header::CONTENT_TYPE, "text/csv")
            .body(content.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SitegateError::storage_write(format!(
                "object store rejected upload with status {}",
                status
            )));
        }

        debug!(path = %key, size = content.len(), "Stored object in object storage");
        Ok(StoredObject {
            path: key,
            size: content.len() as u64,
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_key(path)?;
        let response = self
            .authorize(self.client.delete(self.url(path)))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(SitegateError::storage_delete(format!(
            "object store rejected delete with status {}",
            status
        )))
    }
}
