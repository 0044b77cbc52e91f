use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::SessionError;

/// Data handed to a blob upload.
pub enum BlobSource {
    Bytes(Bytes),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl BlobSource {
    pub fn reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        BlobSource::Reader(Box::new(reader))
    }

    /// An in-memory source with no bytes counts as missing.
    pub fn is_empty(&self) -> bool {
        matches!(self, BlobSource::Bytes(bytes) if bytes.is_empty())
    }

    /// Drains the source into memory, reading at most `limit` bytes from a stream.
    pub async fn into_bytes(self, limit: u64) -> std::io::Result<Bytes> {
        match self {
            BlobSource::Bytes(bytes) => Ok(bytes),
            BlobSource::Reader(reader) => {
                let mut buf = Vec::new();
                reader.take(limit).read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl From<Bytes> for BlobSource {
    fn from(value: Bytes) -> Self {
        BlobSource::Bytes(value)
    }
}

impl From<Vec<u8>> for BlobSource {
    fn from(value: Vec<u8>) -> Self {
        BlobSource::Bytes(Bytes::from(value))
    }
}

impl From<&'static str> for BlobSource {
    fn from(value: &'static str) -> Self {
        BlobSource::Bytes(Bytes::from_static(value.as_bytes()))
    }
}

impl fmt::Debug for BlobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobSource::Bytes(bytes) => write!(f, "BlobSource::Bytes({} bytes)", bytes.len()),
            BlobSource::Reader(_) => f.write_str("BlobSource::Reader(..)"),
        }
    }
}

/// Validated upload arguments.
#[derive(Debug)]
pub struct UploadRequest {
    pub blob_name: String,
    pub source: BlobSource,
    pub length: u64,
}

impl UploadRequest {
    /// Rejects an empty name, a missing or empty source, and a zero length.
    pub fn new(
        blob_name: impl Into<String>,
        source: Option<BlobSource>,
        length: u64,
    ) -> Result<Self, SessionError> {
        let blob_name = blob_name.into();
        if blob_name.is_empty() {
            return Err(SessionError::InvalidArgument("blob name must not be empty"));
        }
        let source = match source {
            Some(source) if !source.is_empty() => source,
            _ => return Err(SessionError::InvalidArgument("blob source must be provided")),
        };
        if length == 0 {
            return Err(SessionError::InvalidArgument("blob length must be positive"));
        }
        Ok(Self {
            blob_name,
            source,
            length,
        })
    }
}

/// Performs the byte transfer for `upload_to_blob`.
#[async_trait]
pub trait BlobUploader: Send + Sync {
    async fn upload_to_blob(&self, request: UploadRequest) -> anyhow::Result<()>;
}

pub type SharedBlobUploader = Arc<dyn BlobUploader>;
