//! Represents a bucket as seen by the client: a named container whose only
//! attribute of interest is whether object versioning is switched on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A snapshot of bucket-level attributes.
///
/// Fetched fresh for every operation that needs it; nothing in the client
/// holds on to one across calls.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct BucketAttrs {
    /// Globally unique bucket name.
    pub name: String,

    /// Whether writes keep noncurrent generations around.
    pub versioning_enabled: bool,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,
}
