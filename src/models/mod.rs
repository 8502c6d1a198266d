//! Data models for the generation-aware storage client.
//!
//! Bucket and object snapshots map to SQLite rows via `sqlx::FromRow` for the
//! local backend, and to Cloud Storage JSON resources via `serde` for the
//! HTTP backend and the emulator.

pub mod bucket;
pub mod listing;
pub mod object;
pub mod resource;
