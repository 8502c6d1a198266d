//! Routes of the local Cloud Storage emulator.
//!
//! ## Structure
//! - **Bucket-level endpoints**
//!   - `POST   /storage/v1/b` — create bucket
//!   - `GET    /storage/v1/b/{bucket}` — bucket attributes (versioning flag)
//!   - `DELETE /storage/v1/b/{bucket}` — delete empty bucket
//!   - `GET    /storage/v1/b/{bucket}/o` — list objects (prefix, versions, pageToken, maxResults)
//!
//! - **Object-level endpoints**
//!   - `GET    /storage/v1/b/{bucket}/o/{*object}` — metadata, or content with `alt=media`
//!   - `PATCH  /storage/v1/b/{bucket}/o/{*object}` — update metadata
//!   - `DELETE /storage/v1/b/{bucket}/o/{*object}` — delete live object or one generation
//!   - `POST   /upload/storage/v1/b/{bucket}/o` — media upload
//!
//! Object names arrive percent-encoded as a single segment (`a%2Fb.txt`);
//! the wildcard also accepts them unencoded.

use crate::{
    backends::local::LocalBackend,
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{
            create_bucket, delete_bucket, delete_object, get_bucket, get_object, list_objects,
            patch_object, upload_object,
        },
    },
};
use axum::{
    Router,
    routing::{get, post},
};

pub fn routes() -> Router<LocalBackend> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/storage/v1/b", post(create_bucket))
        .route("/storage/v1/b/{bucket}", get(get_bucket).delete(delete_bucket))
        .route("/storage/v1/b/{bucket}/o", get(list_objects))
        .route(
            "/storage/v1/b/{bucket}/o/{*object}",
            get(get_object).patch(patch_object).delete(delete_object),
        )
        .route("/upload/storage/v1/b/{bucket}/o", post(upload_object))
}
