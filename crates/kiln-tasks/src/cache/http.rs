//! HTTP cache transport: `GET`/`PUT {base}/{key}`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::transport::{CacheTransport, TransportError};
use super::CacheKey;

/// Remote cache reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, key: &CacheKey) -> String {
        format!("{}/{}", self.base_url, key)
    }
}

#[async_trait]
impl CacheTransport for HttpTransport {
    fn name(&self) -> &str {
        "remote"
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, TransportError> {
        let url = self.url(key);
        debug!("Making GET request to {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), TransportError> {
        let url = self.url(key);
        debug!("Making PUT request to {} ({} bytes)", url, bytes.len());
        let response = self
            .client
            .put(&url)
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                url,
            });
        }
        Ok(())
    }
}
