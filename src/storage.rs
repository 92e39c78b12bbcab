//! Remote object storage for finished recordings
//!
//! Enabled by the `has_remote_storage` capability. The clip is PUT to
//! `<storage_url>/<file name>`; a failure never blocks analysis.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Url};

use crate::audio::AudioBlob;
use crate::error::FlowError;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, blob: &AudioBlob) -> Result<(), FlowError>;
}

pub struct HttpObjectStore {
    http: Client,
    base_url: Url,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FlowError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| FlowError::StorageFailed(format!("invalid storage URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(FlowError::StorageFailed(format!(
                "invalid storage URL '{}': not a base URL",
                base_url
            )));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FlowError::StorageFailed(e.to_string()))?;
        Ok(Self { http, base_url })
    }

    pub fn object_url(&self, key: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push(key);
        }
        url
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, blob: &AudioBlob) -> Result<(), FlowError> {
        let url = self.object_url(key);
        log::info!("Uploading {} bytes to {}", blob.len(), url);

        let response = self
            .http
            .put(url)
            .header(header::CONTENT_TYPE, blob.mime_type())
            .body(blob.as_bytes().to_vec())
            .send()
            .await
            .map_err(|e| FlowError::StorageFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FlowError::StorageFailed(format!(
                "storage returned {}",
                status.as_u16()
            )));
        }
        log::info!("Upload complete: {}", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_url_appends_key() {
        let store = HttpObjectStore::new("https://bucket.example.test/recordings/", Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            store.object_url("input_2024-01-01_00-00-00-000").as_str(),
            "https://bucket.example.test/recordings/input_2024-01-01_00-00-00-000"
        );
    }

    #[test]
    fn bad_storage_url_is_storage_failure() {
        assert!(matches!(
            HttpObjectStore::new("::", Duration::from_secs(1)),
            Err(FlowError::StorageFailed(_))
        ));
    }
}
