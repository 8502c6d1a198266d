//! Emulator handlers for the Cloud Storage JSON API subset spoken by
//! `GcsBackend`. Object bodies are streamed in both directions and all
//! storage concerns are delegated to `LocalBackend`.

use crate::{
    backends::{StorageBackend, local::LocalBackend},
    errors::AppError,
    models::{
        listing::ListQuery,
        object::{ObjectAttrs, ObjectAttrsUpdate},
        resource::{BucketResource, ObjectResource, ObjectsResource},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

const GENERATION_HEADER: HeaderName = HeaderName::from_static("x-goog-generation");
const METAGENERATION_HEADER: HeaderName = HeaderName::from_static("x-goog-metageneration");

/// Query params accepted by `objects.list`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListObjectsQuery {
    pub prefix: Option<String>,
    pub versions: Option<bool>,
    pub page_token: Option<String>,
    pub max_results: Option<u32>,
}

/// Query params accepted by `objects.get` and `objects.delete`.
#[derive(Debug, Deserialize)]
pub struct ObjectQuery {
    pub generation: Option<i64>,
    pub alt: Option<String>,
}

/// Query params accepted by the media upload endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQuery {
    pub upload_type: Option<String>,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchQuery {
    pub predefined_acl: Option<String>,
}

/// `GET /storage/v1/b/{bucket}`
pub async fn get_bucket(
    State(backend): State<LocalBackend>,
    Path(bucket): Path<String>,
) -> Result<Json<BucketResource>, AppError> {
    let attrs = backend.bucket_attrs(&bucket).await?;
    Ok(Json(BucketResource::from(&attrs)))
}

/// `POST /storage/v1/b` — create bucket, honoring `versioning.enabled`.
pub async fn create_bucket(
    State(backend): State<LocalBackend>,
    Json(payload): Json<BucketResource>,
) -> Result<Json<BucketResource>, AppError> {
    let versioning = payload.versioning.is_some_and(|v| v.enabled);
    let attrs = backend.create_bucket(&payload.name, versioning).await?;
    Ok(Json(BucketResource::from(&attrs)))
}

/// `DELETE /storage/v1/b/{bucket}` — only empty buckets can be deleted.
pub async fn delete_bucket(
    State(backend): State<LocalBackend>,
    Path(bucket): Path<String>,
) -> Result<StatusCode, AppError> {
    backend.delete_bucket(&bucket).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /storage/v1/b/{bucket}/o` — supports ?prefix=&versions=&pageToken=&maxResults=
pub async fn list_objects(
    State(backend): State<LocalBackend>,
    Path(bucket): Path<String>,
    Query(q): Query<ListObjectsQuery>,
) -> Result<Json<ObjectsResource>, AppError> {
    let query = ListQuery {
        prefix: q.prefix.unwrap_or_default(),
        versions: q.versions.unwrap_or(false),
        page_token: q.page_token,
        max_results: q.max_results,
    };

    let page = backend.list_objects(&bucket, &query).await?;
    Ok(Json(ObjectsResource {
        kind: "storage#objects".into(),
        items: page.items.iter().map(ObjectResource::from).collect(),
        next_page_token: page.next_page_token,
    }))
}

/// `GET /storage/v1/b/{bucket}/o/{*object}` — metadata, or the content
/// itself as a streaming response with `?alt=media`.
pub async fn get_object(
    State(backend): State<LocalBackend>,
    Path((bucket, object)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
) -> Result<Response, AppError> {
    let attrs = backend.object_attrs(&bucket, &object, q.generation).await?;
    if q.alt.as_deref() != Some("media") {
        return Ok(Json(ObjectResource::from(&attrs)).into_response());
    }

    // Pin the read to the generation whose headers we are about to send.
    let reader = backend
        .open_reader(&bucket, &object, Some(attrs.generation))
        .await?;
    let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
    set_object_headers(response.headers_mut(), &attrs);
    Ok(response)
}

/// `PATCH /storage/v1/b/{bucket}/o/{*object}` — update live object metadata.
pub async fn patch_object(
    State(backend): State<LocalBackend>,
    Path((bucket, object)): Path<(String, String)>,
    Query(q): Query<PatchQuery>,
    Json(mut update): Json<ObjectAttrsUpdate>,
) -> Result<Json<ObjectResource>, AppError> {
    update.predefined_acl = q.predefined_acl;
    let attrs = backend.update_object(&bucket, &object, &update).await?;
    Ok(Json(ObjectResource::from(&attrs)))
}

/// `DELETE /storage/v1/b/{bucket}/o/{*object}` — optionally `?generation=`.
pub async fn delete_object(
    State(backend): State<LocalBackend>,
    Path((bucket, object)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
) -> Result<StatusCode, AppError> {
    backend.delete_object(&bucket, &object, q.generation).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /upload/storage/v1/b/{bucket}/o?uploadType=media&name=`: the
/// request body is the object content. A body that does not match its
/// `Content-Length` is not committed.
pub async fn upload_object(
    State(backend): State<LocalBackend>,
    Path(bucket): Path<String>,
    Query(q): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ObjectResource>, AppError> {
    if q.upload_type.as_deref().unwrap_or("media") != "media" {
        return Err(AppError::bad_request("only uploadType=media is supported"));
    }
    let size = declared_length(&headers)?;

    let mut writer = backend.open_writer(&bucket, &q.name, size).await?;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                writer.abort().await;
                return Err(AppError::bad_request(format!("upload body interrupted: {err}")));
            }
        };
        if let Err(err) = writer.write(chunk).await {
            writer.abort().await;
            return Err(err.into());
        }
    }

    let attrs = writer.finish().await?;
    Ok(Json(ObjectResource::from(&attrs)))
}

fn declared_length(headers: &HeaderMap) -> Result<Option<u64>, AppError> {
    headers
        .get(header::CONTENT_LENGTH)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .ok_or_else(|| AppError::bad_request("invalid Content-Length header"))
        })
        .transpose()
}

fn set_object_headers(headers: &mut HeaderMap, attrs: &ObjectAttrs) {
    let content_type = attrs
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(attrs.size.max(0)));

    if let Some(cache_control) = attrs
        .cache_control
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
    {
        headers.insert(header::CACHE_CONTROL, cache_control);
    }

    headers.insert(GENERATION_HEADER, HeaderValue::from(attrs.generation));
    headers.insert(METAGENERATION_HEADER, HeaderValue::from(attrs.metageneration));
}
