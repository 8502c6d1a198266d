//! StorageClient: generation-aware access to objects in a bucket.
//!
//! A caller-facing generation of `0` means "the live object"; any other value
//! pins one historical generation and is only accepted for reads and deletes
//! when the bucket has versioning enabled. Bucket attributes are re-read by
//! every operation that depends on them; nothing is cached between calls.

use crate::backends::{BackendError, ObjectWriter, StorageBackend};
use crate::errors::{ClientError, ClientResult};
use crate::models::{
    listing::ListQuery,
    object::{ObjectAttrs, ObjectAttrsUpdate, pinned},
};
use crate::services::{
    listing::object_stream,
    progress::{ProgressReader, ProgressSink},
};
use bytes::Bytes;
use futures::{TryStreamExt, future};
use std::{path::Path, sync::Arc};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};
use tracing::{debug, info};

/// Scheme of the locators returned by [`StorageClient::url`].
pub const URL_SCHEME: &str = "gs";

/// Size of the single buffer used by each transfer.
pub const COPY_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Clone, Debug)]
pub struct StorageClient {
    backend: Arc<dyn StorageBackend>,
    progress: ProgressSink,
    page_size: Option<u32>,
}

impl StorageClient {
    pub fn new(backend: Arc<dyn StorageBackend>, progress: ProgressSink) -> Self {
        Self {
            backend,
            progress,
            page_size: None,
        }
    }

    /// Ask the backend for pages of at most `page_size` entries.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Whether `bucket` currently has object versioning enabled.
    pub async fn bucket_versioning(&self, bucket: &str) -> ClientResult<bool> {
        let attrs = self.backend.bucket_attrs(bucket).await?;
        Ok(attrs.versioning_enabled)
    }

    async fn ensure_versioned(&self, bucket: &str) -> ClientResult<()> {
        if self.bucket_versioning(bucket).await? {
            Ok(())
        } else {
            Err(ClientError::NotVersioned {
                bucket: bucket.to_string(),
            })
        }
    }

    fn query(&self, mut query: ListQuery) -> ListQuery {
        query.max_results = self.page_size;
        query
    }

    /// Names of the live objects starting with `prefix`, in backend order.
    pub async fn bucket_objects(&self, bucket: &str, prefix: &str) -> ClientResult<Vec<String>> {
        debug!(bucket, prefix, "listing objects");
        let names = object_stream(self.backend.clone(), bucket, self.query(ListQuery::latest(prefix)))
            .map_ok(|object| object.name)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(names)
    }

    /// Every stored generation of exactly `path`, in backend order.
    ///
    /// The backend lists by prefix, so siblings such as `path.bak` are
    /// filtered out here.
    pub async fn object_generations(&self, bucket: &str, path: &str) -> ClientResult<Vec<i64>> {
        self.ensure_versioned(bucket).await?;

        debug!(bucket, path, "listing generations");
        let generations = object_stream(self.backend.clone(), bucket, self.query(ListQuery::all_versions(path)))
            .try_filter(|object| future::ready(object.name == path))
            .map_ok(|object| object.generation)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(generations)
    }

    /// Download `path` (pinned to `generation` unless it is `0`) into
    /// `local_path`, overwriting it.
    ///
    /// A failure mid-stream leaves the partially written file in place.
    pub async fn download_file(
        &self,
        bucket: &str,
        path: &str,
        generation: i64,
        local_path: impl AsRef<Path>,
    ) -> ClientResult<()> {
        let local_path = local_path.as_ref();
        let generation = pinned(generation);
        let versioned = self.bucket_versioning(bucket).await?;
        if generation.is_some() && !versioned {
            return Err(ClientError::NotVersioned {
                bucket: bucket.to_string(),
            });
        }

        let mut file = File::create(local_path)
            .await
            .map_err(ClientError::local_io(local_path))?;
        let mut reader = self.backend.open_reader(bucket, path, generation).await?;
        let copied = copy_to_local(&mut reader, &mut file, local_path).await?;

        debug!(
            bucket,
            path,
            generation = ?generation,
            bytes = copied,
            local_path = %local_path.display(),
            "download complete"
        );
        Ok(())
    }

    /// Upload `local_path` to `path`, replacing any live object there, then
    /// apply the requested metadata. Empty strings mean "not requested".
    ///
    /// Returns the new generation on a versioned bucket and `0` otherwise.
    pub async fn upload_file(
        &self,
        bucket: &str,
        path: &str,
        content_type: &str,
        local_path: impl AsRef<Path>,
        predefined_acl: &str,
        cache_control: &str,
    ) -> ClientResult<i64> {
        let local_path = local_path.as_ref();
        let versioned = self.bucket_versioning(bucket).await?;

        let size = fs::metadata(local_path)
            .await
            .map_err(ClientError::local_io(local_path))?
            .len();
        let file = File::open(local_path)
            .await
            .map_err(ClientError::local_io(local_path))?;
        let mut source = ProgressReader::new(file, self.progress.clone(), size);

        let mut writer = self.backend.open_writer(bucket, path, Some(size)).await?;
        let copied = copy_to_remote(&mut source, writer.as_mut(), local_path).await;
        if let Err(err) = copied {
            // Release the upload session even though the copy failed.
            writer.abort().await;
            return Err(err);
        }
        drop(source);
        let written = writer.finish().await?;
        debug!(bucket, path, generation = written.generation, size, "upload committed");

        let update = ObjectAttrsUpdate::from_requested(content_type, cache_control, predefined_acl);
        if !update.is_empty() {
            self.backend
                .update_object(bucket, path, &update)
                .await
                .map_err(|source| ClientError::MetadataUpdate {
                    bucket: bucket.to_string(),
                    path: path.to_string(),
                    source,
                })?;
        }

        let generation = if versioned {
            self.object_info(bucket, path).await?.generation
        } else {
            0
        };
        info!(bucket, path, generation, size, "uploaded {}", local_path.display());
        Ok(generation)
    }

    /// Locator for `path`: `gs://bucket/path`, or `gs://bucket/path#generation`
    /// when pinned. The object must exist.
    pub async fn url(&self, bucket: &str, path: &str, generation: i64) -> ClientResult<String> {
        let generation = pinned(generation);
        let attrs = self.backend.object_attrs(bucket, path, generation).await?;

        Ok(match generation {
            Some(_) => format!("{URL_SCHEME}://{bucket}/{path}#{}", attrs.generation),
            None => format!("{URL_SCHEME}://{bucket}/{path}"),
        })
    }

    /// Delete the live object, or exactly one generation when pinned.
    pub async fn delete_object(&self, bucket: &str, path: &str, generation: i64) -> ClientResult<()> {
        let generation = pinned(generation);
        if generation.is_some() {
            self.ensure_versioned(bucket).await?;
        }

        self.backend.delete_object(bucket, path, generation).await?;
        debug!(bucket, path, generation = ?generation, "object deleted");
        Ok(())
    }

    /// Attributes of the live object at `path`.
    pub async fn object_info(&self, bucket: &str, path: &str) -> ClientResult<ObjectAttrs> {
        Ok(self.backend.object_attrs(bucket, path, None).await?)
    }
}

/// Remote read failures are backend errors; local write failures are local.
///
/// Bytes received before a remote failure are flushed to `file`.
async fn copy_to_local<R, W>(reader: &mut R, file: &mut W, local_path: &Path) -> ClientResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                if let Err(flush_err) = file.flush().await {
                    debug!("flushing partial {} failed: {}", local_path.display(), flush_err);
                }
                return Err(BackendError::Io(err).into());
            }
        };
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .await
            .map_err(ClientError::local_io(local_path))?;
        copied += n as u64;
    }
    file.flush().await.map_err(ClientError::local_io(local_path))?;
    Ok(copied)
}

/// Local read failures are local errors; remote write failures are backend errors.
async fn copy_to_remote<R>(
    source: &mut R,
    writer: &mut dyn ObjectWriter,
    local_path: &Path,
) -> ClientResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = source
            .read(&mut buf)
            .await
            .map_err(ClientError::local_io(local_path))?;
        if n == 0 {
            break;
        }
        writer.write(Bytes::copy_from_slice(&buf[..n])).await?;
        copied += n as u64;
    }
    Ok(copied)
}
