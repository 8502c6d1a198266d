use crate::backends::BackendError;
use crate::models::resource::{ErrorBody, ErrorResource};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::{
    fmt, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Errors returned by [`StorageClient`](crate::services::storage_client::StorageClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// A generation was pinned, or generations were enumerated, on a bucket
    /// without versioning. Detected before any object call is made.
    #[error("bucket `{bucket}` is not versioned")]
    NotVersioned { bucket: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The object content was committed but the metadata patch failed.
    /// Retrying only the patch completes the upload.
    #[error("object `{path}` in bucket `{bucket}` uploaded but metadata update failed: {source}")]
    MetadataUpdate {
        bucket: String,
        path: String,
        #[source]
        source: BackendError,
    },

    #[error("local file `{}`: {source}", .path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Coarse classification of [`ClientError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotVersioned,
    Backend,
    LocalIo,
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::NotVersioned { .. } => ErrorKind::NotVersioned,
            ClientError::Backend(_) | ClientError::MetadataUpdate { .. } => ErrorKind::Backend,
            ClientError::LocalIo { .. } => ErrorKind::LocalIo,
        }
    }

    pub(crate) fn local_io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| ClientError::LocalIo {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Error returned by the emulator's HTTP handlers, rendered as a
/// Cloud Storage JSON error envelope.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResource {
            error: ErrorBody {
                code: self.status.as_u16(),
                message: self.message,
            },
        });

        (self.status, body).into_response()
    }
}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        let status = match &err {
            BackendError::BucketNotFound(_) | BackendError::ObjectNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            BackendError::BucketAlreadyExists(_) | BackendError::BucketNotEmpty(_) => {
                StatusCode::CONFLICT
            }
            BackendError::InvalidBucketName { .. }
            | BackendError::InvalidObjectKey(_)
            | BackendError::InvalidArgument(_)
            | BackendError::InvalidPageToken => StatusCode::BAD_REQUEST,
            BackendError::Status { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}
