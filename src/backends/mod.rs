//! Storage backends behind the client.
//!
//! A backend is the opaque RPC surface of an object store: bucket attributes,
//! paged listing, attribute reads, streamed reads and writes, metadata patches
//! and deletes. It knows nothing about the client's generation policy.

pub mod gcs;
pub mod local;

use crate::config::{AppConfig, BackendKind};
use crate::models::{
    bucket::BucketAttrs,
    listing::{ListQuery, ObjectsPage},
    object::{ObjectAttrs, ObjectAttrsUpdate},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{io, pin::Pin, sync::Arc};
use thiserror::Error;
use tokio::io::AsyncRead;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{0}` is not empty")]
    BucketNotEmpty(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`{}", generation_suffix(.generation))]
    ObjectNotFound {
        bucket: String,
        key: String,
        generation: Option<i64>,
    },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid page token")]
    InvalidPageToken,
    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("upload failed: {0}")]
    Upload(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

fn generation_suffix(generation: &Option<i64>) -> String {
    generation
        .map(|generation| format!(" at generation {generation}"))
        .unwrap_or_default()
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        match self {
            BackendError::BucketNotFound(_) | BackendError::ObjectNotFound { .. } => true,
            BackendError::Status { status, .. } => *status == 404,
            _ => false,
        }
    }
}

/// Byte stream of one object generation.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// An open upload session.
///
/// The object only becomes visible once [`finish`](ObjectWriter::finish)
/// succeeds. A session that will not be finished must be
/// [`abort`](ObjectWriter::abort)ed so the backend can release it.
#[async_trait]
pub trait ObjectWriter: Send {
    async fn write(&mut self, chunk: Bytes) -> BackendResult<()>;

    /// Commit the upload, replacing any live object at the same path.
    async fn finish(self: Box<Self>) -> BackendResult<ObjectAttrs>;

    async fn abort(self: Box<Self>);
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn bucket_attrs(&self, bucket: &str) -> BackendResult<BucketAttrs>;

    /// Fetch one page of a listing.
    async fn list_objects(&self, bucket: &str, query: &ListQuery) -> BackendResult<ObjectsPage>;

    /// Attributes of a pinned generation, or of the live object when `generation` is `None`.
    async fn object_attrs(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> BackendResult<ObjectAttrs>;

    async fn open_reader(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> BackendResult<ObjectReader>;

    /// Open an upload session. When `size` is known the backend refuses to
    /// commit a body of any other length.
    async fn open_writer(
        &self,
        bucket: &str,
        key: &str,
        size: Option<u64>,
    ) -> BackendResult<Box<dyn ObjectWriter>>;

    /// Patch metadata of the live object.
    async fn update_object(
        &self,
        bucket: &str,
        key: &str,
        update: &ObjectAttrsUpdate,
    ) -> BackendResult<ObjectAttrs>;

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> BackendResult<()>;
}

impl std::fmt::Debug for dyn StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StorageBackend")
    }
}

/// Build the backend selected by `config`.
pub async fn connect(config: &AppConfig) -> BackendResult<Arc<dyn StorageBackend>> {
    match config.backend {
        BackendKind::Local => {
            let backend = local::LocalBackend::connect(&config.database_url, &config.storage_dir).await?;
            Ok(Arc::new(backend))
        }
        BackendKind::Gcs => {
            let backend = gcs::GcsBackend::new(gcs::GcsConfig {
                endpoint: config.endpoint.clone(),
                user_agent: config.user_agent.clone(),
                access_token: config.access_token.clone(),
            })?;
            Ok(Arc::new(backend))
        }
    }
}
