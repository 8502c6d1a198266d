//! JSON resources of the Cloud Storage JSON API.
//!
//! The same types are decoded by [`GcsBackend`](crate::backends::gcs::GcsBackend)
//! and encoded by the emulator handlers, so both sides agree on the wire
//! format. The API renders 64-bit integers as decimal strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backends::BackendError;
use crate::models::{bucket::BucketAttrs, object::ObjectAttrs};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Versioning {
    pub enabled: bool,
}

/// `storage#bucket`
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct BucketResource {
    #[serde(default)]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versioning: Option<Versioning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_created: Option<DateTime<Utc>>,
}

/// `storage#object`
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectResource {
    #[serde(default)]
    pub kind: String,
    pub bucket: String,
    pub name: String,
    pub generation: String,
    #[serde(default)]
    pub metageneration: String,
    #[serde(default)]
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
}

/// `storage#objects`
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectsResource {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub items: Vec<ObjectResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// Error envelope returned with non-2xx statuses.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorResource {
    pub error: ErrorBody,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

impl From<&BucketAttrs> for BucketResource {
    fn from(bucket: &BucketAttrs) -> Self {
        Self {
            kind: "storage#bucket".into(),
            name: bucket.name.clone(),
            versioning: Some(Versioning {
                enabled: bucket.versioning_enabled,
            }),
            time_created: Some(bucket.created_at),
        }
    }
}

impl From<BucketResource> for BucketAttrs {
    fn from(resource: BucketResource) -> Self {
        Self {
            name: resource.name,
            // An absent `versioning` block means it was never enabled.
            versioning_enabled: resource.versioning.is_some_and(|v| v.enabled),
            created_at: resource.time_created.unwrap_or_default(),
        }
    }
}

impl From<&ObjectAttrs> for ObjectResource {
    fn from(object: &ObjectAttrs) -> Self {
        Self {
            kind: "storage#object".into(),
            bucket: object.bucket.clone(),
            name: object.name.clone(),
            generation: object.generation.to_string(),
            metageneration: object.metageneration.to_string(),
            size: object.size.to_string(),
            content_type: object.content_type.clone(),
            cache_control: object.cache_control.clone(),
            md5_hash: object.md5_hash.clone(),
            time_created: Some(object.created_at),
            updated: Some(object.updated_at),
        }
    }
}

impl TryFrom<ObjectResource> for ObjectAttrs {
    type Error = BackendError;

    fn try_from(resource: ObjectResource) -> Result<Self, Self::Error> {
        let created_at = resource.time_created.unwrap_or_default();
        Ok(Self {
            generation: parse_int("generation", &resource.generation)?,
            metageneration: parse_int_or_zero("metageneration", &resource.metageneration)?,
            size: parse_int_or_zero("size", &resource.size)?,
            bucket: resource.bucket,
            name: resource.name,
            content_type: resource.content_type,
            cache_control: resource.cache_control,
            md5_hash: resource.md5_hash,
            created_at,
            updated_at: resource.updated.unwrap_or(created_at),
        })
    }
}

fn parse_int(field: &str, value: &str) -> Result<i64, BackendError> {
    value
        .parse::<i64>()
        .map_err(|err| BackendError::Decode(format!("field `{field}` = `{value}`: {err}")))
}

fn parse_int_or_zero(field: &str, value: &str) -> Result<i64, BackendError> {
    if value.is_empty() {
        Ok(0)
    } else {
        parse_int(field, value)
    }
}
