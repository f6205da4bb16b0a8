use crate::{
    config::StorageConfig,
    error::{Result, ServiceError},
};
use async_trait::async_trait;
use object_store::{
    aws::{AmazonS3, AmazonS3Builder},
    path::Path,
    signer::Signer,
    Attribute, Attributes, ObjectStore, PutOptions, PutPayload,
};
use std::time::Duration;
use tracing::info;

/// "Store bytes, get a time-limited URL."
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(&self, object: &str, bytes: Vec<u8>, content_type: &'static str) -> Result<()>;

    async fn presigned_url(&self, object: &str, ttl: Duration) -> Result<String>;
}

/// S3-compatible bucket (MinIO in deployment).
pub struct S3Storage {
    store: AmazonS3,
    bucket: String,
}

impl S3Storage {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let store = AmazonS3Builder::new()
            .with_endpoint(&config.endpoint)
            .with_region(&config.region)
            .with_bucket_name(&config.bucket)
            .with_access_key_id(&config.access_key)
            .with_secret_access_key(&config.secret_key)
            .with_allow_http(config.endpoint.starts_with("http://"))
            .with_virtual_hosted_style_request(false)
            .build()
            .map_err(|err| {
                ServiceError::Config(format!("invalid object storage settings: {err}"))
            })?;

        Ok(Self {
            store,
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put(&self, object: &str, bytes: Vec<u8>, content_type: &'static str) -> Result<()> {
        let size = bytes.len();
        let path = Path::parse(object)
            .map_err(|err| ServiceError::storage("upload", err.to_string()))?;

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.into());
        let options = PutOptions {
            attributes,
            ..Default::default()
        };

        self.store
            .put_opts(&path, PutPayload::from(bytes), options)
            .await
            .map_err(|err| ServiceError::storage("upload", err.to_string()))?;

        info!(bucket = %self.bucket, object, size, "uploaded export");
        Ok(())
    }

    async fn presigned_url(&self, object: &str, ttl: Duration) -> Result<String> {
        let path = Path::parse(object)
            .map_err(|err| ServiceError::storage("presign", err.to_string()))?;
        let url = self
            .store
            .signed_url(http::Method::GET, &path, ttl)
            .await
            .map_err(|err| ServiceError::storage("presign", err.to_string()))?;
        Ok(url.to_string())
    }
}
