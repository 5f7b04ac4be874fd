use std::sync::Arc;

use bytes::Bytes;
use log::info;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use thiserror::Error;

use crate::core::config::{ObjectStoreSettings, Settings};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Store(#[from] object_store::Error),
    #[error("cannot prepare local object store: {0}")]
    Local(#[from] std::io::Error),
    #[error("URL {0} does not belong to this object store")]
    ForeignUrl(String),
}

/// Object storage for analysis artifacts, addressed by key and by public URL
#[derive(Clone)]
pub struct ArtifactStore {
    store: Arc<dyn ObjectStore>,
    public_base: String,
}

impl ArtifactStore {
    pub fn new(store: Arc<dyn ObjectStore>, public_base: impl Into<String>) -> Self {
        Self {
            store,
            public_base: public_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ArtifactError> {
        match &settings.object_store {
            ObjectStoreSettings::Oss {
                access_key_id,
                access_key_secret,
                endpoint,
                bucket,
                region,
            } => {
                let bucket_url = format!("https://{}.{}", bucket, endpoint);
                info!("Storing artifacts in bucket {} at {}", bucket, endpoint);
                let store = AmazonS3Builder::new()
                    .with_access_key_id(access_key_id)
                    .with_secret_access_key(access_key_secret)
                    .with_bucket_name(bucket)
                    .with_region(region)
                    .with_endpoint(&bucket_url)
                    .with_virtual_hosted_style_request(true)
                    .build()?;
                Ok(Self::new(Arc::new(store), bucket_url))
            }
            ObjectStoreSettings::Local { root } => {
                std::fs::create_dir_all(root)?;
                info!("Storing artifacts under {}", root.display());
                let store = LocalFileSystem::new_with_prefix(root)?;
                Ok(Self::new(Arc::new(store), settings.public_url("objects")))
            }
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(object_store::memory::InMemory::new()),
            "https://bucket.example.org",
        )
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, key)
    }

    /// Inverse of `url_for`
    pub fn key_for_url(&self, url: &str) -> Option<String> {
        url.strip_prefix(&self.public_base)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|key| !key.is_empty())
            .map(str::to_string)
    }

    /// Upload and return the public URL
    pub async fn put(&self, key: &str, data: Bytes) -> Result<String, ArtifactError> {
        self.store.put(&ObjectPath::from(key), data.into()).await?;
        Ok(self.url_for(key))
    }

    pub async fn get(&self, key: &str) -> Result<Bytes, ArtifactError> {
        Ok(self.store.get(&ObjectPath::from(key)).await?.bytes().await?)
    }

    pub async fn delete(&self, key: &str) -> Result<(), ArtifactError> {
        self.store.delete(&ObjectPath::from(key)).await?;
        Ok(())
    }

    pub async fn delete_url(&self, url: &str) -> Result<(), ArtifactError> {
        let key = self
            .key_for_url(url)
            .ok_or_else(|| ArtifactError::ForeignUrl(url.to_string()))?;
        self.delete(&key).await
    }
}
