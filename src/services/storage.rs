use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Object storage backend used when raw/processed files are kept remotely.
///
/// Objects are streamed; raw archives can be far larger than memory.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stream the object at `key` into `sink`.
    async fn get(
        &self,
        key: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), StorageError>;

    /// Store everything read from `source` under `key`.
    async fn put(
        &self,
        key: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Stream a local file to `key`.
pub async fn upload_file(objects: &dyn ObjectStore, key: &str, path: &Path) -> Result<(), StorageError> {
    let mut file = tokio::fs::File::open(path).await?;
    objects.put(key, &mut file).await
}

/// Stream the object at `key` into a local file, replacing it.
pub async fn download_to_file(
    objects: &dyn ObjectStore,
    key: &str,
    path: &Path,
) -> Result<(), StorageError> {
    let mut file = tokio::fs::File::create(path).await?;
    objects.get(key, &mut file).await?;
    file.flush().await?;
    Ok(())
}

/// S3-compatible bucket client.
pub struct S3Store {
    bucket: Box<Bucket>,
}

impl S3Store {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }
}

fn check_status(key: &str, code: u16) -> Result<(), StorageError> {
    if (200..300).contains(&code) {
        Ok(())
    } else {
        Err(StorageError::Status {
            key: key.to_string(),
            code,
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(
        &self,
        key: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), StorageError> {
        let code = self.bucket.get_object_to_writer(key, sink).await?;
        check_status(key, code)
    }

    async fn put(
        &self,
        key: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), StorageError> {
        let response = self.bucket.put_object_stream(source, key).await?;
        tracing::debug!(key, bytes = response.uploaded_bytes(), "Uploaded object");
        check_status(key, response.status_code())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = self.bucket.delete_object(key).await?;
        check_status(key, response.status_code())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("object {key} returned status {code}")]
    Status { key: String, code: u16 },

    #[error("object {0} not found")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
