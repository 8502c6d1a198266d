//! Google Cloud Storage backend speaking the JSON API over `reqwest`.
//!
//! Credentials are not acquired here: the caller supplies a ready OAuth2
//! bearer token, or none for emulators and public buckets.

use crate::backends::{BackendError, BackendResult, ObjectReader, ObjectWriter, StorageBackend};
use crate::models::{
    bucket::BucketAttrs,
    listing::{ListQuery, ObjectsPage},
    object::{ObjectAttrs, ObjectAttrsUpdate},
    resource::{BucketResource, ErrorResource, ObjectResource, ObjectsResource},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url, header};
use std::io;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// Chunks buffered between the copy loop and the upload request body.
const UPLOAD_CHANNEL_DEPTH: usize = 4;

#[derive(Clone, Debug)]
pub struct GcsConfig {
    /// Scheme and authority of the API, e.g. `https://storage.googleapis.com`.
    pub endpoint: String,
    pub user_agent: String,
    pub access_token: Option<String>,
}

#[derive(Clone)]
pub struct GcsBackend {
    http: Client,
    endpoint: Url,
    access_token: Option<String>,
}

impl std::fmt::Debug for GcsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsBackend")
            .field("endpoint", &self.endpoint.as_str())
            .field("authenticated", &self.access_token.is_some())
            .finish_non_exhaustive()
    }
}

impl GcsBackend {
    pub fn new(config: GcsConfig) -> BackendResult<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|err| BackendError::InvalidArgument(format!("endpoint `{}`: {err}", config.endpoint)))?;
        if endpoint.cannot_be_a_base() {
            return Err(BackendError::InvalidArgument(format!(
                "endpoint `{}` cannot be a base URL",
                config.endpoint
            )));
        }

        let http = Client::builder().user_agent(&config.user_agent).build()?;

        debug!(endpoint = %endpoint, "GCS backend initialized");
        Ok(Self {
            http,
            endpoint,
            access_token: config.access_token,
        })
    }

    /// Build `{endpoint}/{segments...}`, percent-encoding each segment so
    /// object names containing `/` stay a single segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn bucket_url(&self, bucket: &str) -> Url {
        self.url(&["storage", "v1", "b", bucket])
    }

    fn objects_url(&self, bucket: &str) -> Url {
        self.url(&["storage", "v1", "b", bucket, "o"])
    }

    fn object_url(&self, bucket: &str, key: &str) -> Url {
        self.url(&["storage", "v1", "b", bucket, "o", key])
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn fetch_object(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> BackendResult<ObjectAttrs> {
        let mut request = self.request(Method::GET, self.object_url(bucket, key));
        if let Some(generation) = generation {
            request = request.query(&[("generation", generation)]);
        }

        let response = check(request.send().await?, || object_not_found(bucket, key, generation)).await?;
        decode_object(response).await
    }
}

#[async_trait]
impl StorageBackend for GcsBackend {
    async fn bucket_attrs(&self, bucket: &str) -> BackendResult<BucketAttrs> {
        debug!(bucket, "fetching bucket attributes");
        let response = self.request(Method::GET, self.bucket_url(bucket)).send().await?;
        let response = check(response, || BackendError::BucketNotFound(bucket.to_string())).await?;
        let resource: BucketResource = response.json().await?;
        Ok(resource.into())
    }

    async fn list_objects(&self, bucket: &str, query: &ListQuery) -> BackendResult<ObjectsPage> {
        let mut request = self
            .request(Method::GET, self.objects_url(bucket))
            .query(&[("versions", query.versions)]);
        if !query.prefix.is_empty() {
            request = request.query(&[("prefix", query.prefix.as_str())]);
        }
        if let Some(token) = &query.page_token {
            request = request.query(&[("pageToken", token.as_str())]);
        }
        if let Some(max_results) = query.max_results {
            request = request.query(&[("maxResults", max_results)]);
        }

        let response = check(request.send().await?, || BackendError::BucketNotFound(bucket.to_string())).await?;
        let resource: ObjectsResource = response.json().await?;
        let items = resource
            .items
            .into_iter()
            .map(ObjectAttrs::try_from)
            .collect::<BackendResult<Vec<_>>>()?;

        debug!(
            bucket,
            prefix = %query.prefix,
            versions = query.versions,
            count = items.len(),
            truncated = resource.next_page_token.is_some(),
            "listed objects"
        );
        Ok(ObjectsPage {
            items,
            next_page_token: resource.next_page_token.filter(|token| !token.is_empty()),
        })
    }

    async fn object_attrs(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> BackendResult<ObjectAttrs> {
        self.fetch_object(bucket, key, generation).await
    }

    async fn open_reader(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> BackendResult<ObjectReader> {
        let mut request = self
            .request(Method::GET, self.object_url(bucket, key))
            .query(&[("alt", "media")]);
        if let Some(generation) = generation {
            request = request.query(&[("generation", generation)]);
        }

        let response = check(request.send().await?, || object_not_found(bucket, key, generation)).await?;
        let body = response.bytes_stream().map_err(io::Error::other);
        Ok(Box::pin(StreamReader::new(body)))
    }

    /// Start a simple media upload whose request body is fed by the writer.
    ///
    /// A known `size` is sent as `Content-Length`, so a body cut short never
    /// commits as a truncated object.
    async fn open_writer(
        &self,
        bucket: &str,
        key: &str,
        size: Option<u64>,
    ) -> BackendResult<Box<dyn ObjectWriter>> {
        let (sender, receiver) = mpsc::channel::<io::Result<Bytes>>(UPLOAD_CHANNEL_DEPTH);
        let mut request = self
            .request(
                Method::POST,
                self.url(&["upload", "storage", "v1", "b", bucket, "o"]),
            )
            .query(&[("uploadType", "media"), ("name", key)])
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(ReceiverStream::new(receiver)));
        if let Some(size) = size {
            request = request.header(header::CONTENT_LENGTH, size);
        }

        let bucket_name = bucket.to_string();
        let upload = tokio::spawn(async move {
            let response = request.send().await?;
            let response = check(response, || BackendError::BucketNotFound(bucket_name)).await?;
            decode_object(response).await
        });

        debug!(bucket, key, size, "upload session opened");
        Ok(Box::new(GcsObjectWriter {
            sender: Some(sender),
            upload: Some(upload),
        }))
    }

    async fn update_object(
        &self,
        bucket: &str,
        key: &str,
        update: &ObjectAttrsUpdate,
    ) -> BackendResult<ObjectAttrs> {
        let mut request = self
            .request(Method::PATCH, self.object_url(bucket, key))
            .json(update);
        if let Some(acl) = &update.predefined_acl {
            request = request.query(&[("predefinedAcl", acl.as_str())]);
        }

        let response = check(request.send().await?, || object_not_found(bucket, key, None)).await?;
        decode_object(response).await
    }

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> BackendResult<()> {
        let mut request = self.request(Method::DELETE, self.object_url(bucket, key));
        if let Some(generation) = generation {
            request = request.query(&[("generation", generation)]);
        }

        check(request.send().await?, || object_not_found(bucket, key, generation)).await?;
        Ok(())
    }
}

/// Upload session: chunks go through a channel into the in-flight request body.
///
/// Dropping the session without `finish` fails the body, so the server
/// discards whatever it received.
struct GcsObjectWriter {
    sender: Option<mpsc::Sender<io::Result<Bytes>>>,
    upload: Option<JoinHandle<BackendResult<ObjectAttrs>>>,
}

impl GcsObjectWriter {
    /// Outcome of the upload request, once its body has been ended.
    async fn response(&mut self) -> BackendResult<ObjectAttrs> {
        let upload = self
            .upload
            .take()
            .ok_or_else(|| BackendError::Upload("upload response already consumed".into()))?;
        match upload.await {
            Ok(result) => result,
            Err(err) => Err(BackendError::Upload(err.to_string())),
        }
    }
}

#[async_trait]
impl ObjectWriter for GcsObjectWriter {
    async fn write(&mut self, chunk: Bytes) -> BackendResult<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| BackendError::Upload("upload stream already closed".into()))?;
        if sender.send(Ok(chunk)).await.is_ok() {
            return Ok(());
        }

        // The request stopped reading the body, usually because the server
        // already answered. Surface that answer.
        self.sender = None;
        match self.response().await {
            Err(err) => Err(err),
            Ok(object) => Err(BackendError::Upload(format!(
                "upload committed generation {} before the body was sent",
                object.generation
            ))),
        }
    }

    async fn finish(mut self: Box<Self>) -> BackendResult<ObjectAttrs> {
        // Dropping the sender ends the request body.
        self.sender = None;
        self.response().await
    }

    async fn abort(mut self: Box<Self>) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Err(io::Error::other("upload aborted"))).await;
        }
        if self.upload.is_none() {
            return;
        }
        match self.response().await {
            Ok(object) => debug!(generation = object.generation, "aborted upload committed anyway"),
            Err(err) => debug!("aborted upload ended with: {}", err),
        }
    }
}

impl Drop for GcsObjectWriter {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            // A full channel still ends short of Content-Length when sized.
            let _ = sender.try_send(Err(io::Error::other("upload abandoned")));
        }
    }
}

fn object_not_found(bucket: &str, key: &str, generation: Option<i64>) -> BackendError {
    BackendError::ObjectNotFound {
        bucket: bucket.to_string(),
        key: key.to_string(),
        generation,
    }
}

/// Turn a non-2xx response into a [`BackendError`], keeping the server's message.
async fn check(
    response: Response,
    not_found: impl FnOnce() -> BackendError,
) -> BackendResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(not_found());
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResource>(&body)
        .map(|resource| resource.error.message)
        .unwrap_or(body);
    Err(BackendError::Status {
        status: status.as_u16(),
        message,
    })
}

async fn decode_object(response: Response) -> BackendResult<ObjectAttrs> {
    let resource: ObjectResource = response.json().await?;
    ObjectAttrs::try_from(resource)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(endpoint: &str) -> GcsBackend {
        GcsBackend::new(GcsConfig {
            endpoint: endpoint.into(),
            user_agent: "gcs-resource-test".into(),
            access_token: None,
        })
        .unwrap()
    }

    #[test]
    fn object_names_are_single_path_segments() {
        let backend = backend("https://storage.googleapis.com");
        let url = backend.object_url("demo", "a/b c.txt");
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/demo/o/a%2Fb%20c.txt"
        );
    }

    #[test]
    fn endpoint_path_prefix_is_kept() {
        let backend = backend("http://127.0.0.1:4443/proxy/");
        assert_eq!(
            backend.bucket_url("demo").as_str(),
            "http://127.0.0.1:4443/proxy/storage/v1/b/demo"
        );
    }

    #[test]
    fn rejects_unusable_endpoints() {
        for endpoint in ["not a url", "mailto:someone@example.com"] {
            let result = GcsBackend::new(GcsConfig {
                endpoint: endpoint.into(),
                user_agent: "test".into(),
                access_token: None,
            });
            assert!(matches!(result, Err(BackendError::InvalidArgument(_))));
        }
    }
}
