//! Generation-aware client for Cloud Storage buckets, with a local
//! SQLite-backed store and an emulator serving it over the JSON API.

pub mod backends;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

pub use errors::{ClientError, ClientResult, ErrorKind};
pub use services::storage_client::StorageClient;
