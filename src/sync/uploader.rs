//! Object store upload of trip files.

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::Result;

/// Uploads one local file under a remote key
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectUploader: Send + Sync {
    async fn put_object(&self, key: &str, local_path: &Path) -> Result<()>;
}

/// `ObjectUploader` over any `object_store` backend
pub struct StoreUploader {
    store: Arc<dyn ObjectStore>,
}

impl StoreUploader {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// S3-compatible bucket from configuration
    ///
    /// # Errors
    ///
    /// Returns `ObjectStore` if the builder rejects the settings
    pub fn s3(config: &StorageConfig) -> Result<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_endpoint(&config.endpoint)
            .with_allow_http(config.endpoint.starts_with("http://"));

        if !config.access_key_id.is_empty() {
            builder = builder
                .with_access_key_id(&config.access_key_id)
                .with_secret_access_key(&config.secret_access_key);
        }

        Ok(Self::new(Arc::new(builder.build()?)))
    }
}

#[async_trait]
impl ObjectUploader for StoreUploader {
    async fn put_object(&self, key: &str, local_path: &Path) -> Result<()> {
        let data = tokio::fs::read(local_path).await?;
        let size = data.len();
        self.store
            .put(&ObjectPath::from(key), PutPayload::from(Bytes::from(data)))
            .await?;
        debug!("Stored {} bytes at {}", size, key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_object_copies_file_contents() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("trip.csv");
        std::fs::write(&file, "DEVICE_TIME\n1\n").unwrap();

        let store = Arc::new(InMemory::new());
        let uploader = StoreUploader::new(store.clone());
        tokio_test::assert_ok!(uploader.put_object("trips/pi-01/trip.csv", &file).await);

        let stored = store
            .get(&ObjectPath::from("trips/pi-01/trip.csv"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&stored[..], b"DEVICE_TIME\n1\n");
    }

    #[tokio::test]
    async fn test_put_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let uploader = StoreUploader::new(Arc::new(InMemory::new()));
        tokio_test::assert_err!(uploader.put_object("k", &dir.path().join("missing.csv")).await);
    }

    #[test]
    fn test_s3_builder_accepts_config() {
        let config = StorageConfig {
            enabled: true,
            bucket: "telemetry".to_string(),
            endpoint: "http://127.0.0.1:9000".to_string(),
            access_key_id: "minio".to_string(),
            secret_access_key: "minio123".to_string(),
            device_id: "pi-01".to_string(),
            ..StorageConfig::default()
        };
        assert!(StoreUploader::s3(&config).is_ok());
    }
}
