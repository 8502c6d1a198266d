//! Represents an object (one generation of it) stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Read-only metadata snapshot of a single object generation.
///
/// Mutations never go through this struct; see [`ObjectAttrsUpdate`].
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct ObjectAttrs {
    /// Bucket holding the object.
    pub bucket: String,

    /// Object path within the bucket.
    pub name: String,

    /// Content generation. Every write produces a new, larger value.
    pub generation: i64,

    /// Metadata generation within `generation`, bumped by every update.
    pub metageneration: i64,

    /// Size in bytes.
    pub size: i64,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Cache-Control directive served with the object.
    pub cache_control: Option<String>,

    /// Base64-encoded MD5 digest of the content.
    pub md5_hash: Option<String>,

    /// When this generation was written.
    pub created_at: DateTime<Utc>,

    /// When this generation's metadata last changed.
    pub updated_at: DateTime<Utc>,
}

/// Metadata patch applied after an object has been written.
///
/// `None` leaves the corresponding attribute untouched.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectAttrsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,

    /// Canned ACL name (e.g. `publicRead`), passed through to the backend.
    #[serde(skip)]
    pub predefined_acl: Option<String>,
}

impl ObjectAttrsUpdate {
    /// Build a patch from caller-facing strings, where empty means "not requested".
    pub fn from_requested(content_type: &str, cache_control: &str, predefined_acl: &str) -> Self {
        fn requested(value: &str) -> Option<String> {
            (!value.is_empty()).then(|| value.to_string())
        }

        Self {
            content_type: requested(content_type),
            cache_control: requested(cache_control),
            predefined_acl: requested(predefined_acl),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content_type.is_none() && self.cache_control.is_none() && self.predefined_acl.is_none()
    }
}

/// Convert a caller-facing generation (`0` = latest) into a pin.
pub fn pinned(generation: i64) -> Option<i64> {
    (generation != 0).then_some(generation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_strings_are_not_requested() {
        let update = ObjectAttrsUpdate::from_requested("", "", "");
        assert!(update.is_empty());

        let update = ObjectAttrsUpdate::from_requested("text/plain", "", "publicRead");
        assert_eq!(update.content_type.as_deref(), Some("text/plain"));
        assert_eq!(update.cache_control, None);
        assert_eq!(update.predefined_acl.as_deref(), Some("publicRead"));
        assert!(!update.is_empty());
    }

    #[test]
    fn zero_generation_is_unpinned() {
        assert_eq!(pinned(0), None);
        assert_eq!(pinned(42), Some(42));
    }
}
