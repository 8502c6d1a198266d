#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use gcs_resource::{
    StorageClient,
    backends::{
        BackendResult, ObjectReader, ObjectWriter, StorageBackend, local::LocalBackend,
    },
    models::{
        bucket::BucketAttrs,
        listing::{ListQuery, ObjectsPage},
        object::{ObjectAttrs, ObjectAttrsUpdate},
    },
    services::progress::ProgressSink,
};
use std::{
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll, ready},
};
use tempfile::TempDir;
use tokio::io::{AsyncRead, ReadBuf};

pub const PLAIN_BUCKET: &str = "demo";
pub const VERSIONED_BUCKET: &str = "demo-v";

/// Wraps a backend and counts the calls made through it.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub bucket_attrs: AtomicUsize,
    pub list_objects: AtomicUsize,
    pub object_calls: AtomicUsize,
    pub writes_finished: AtomicUsize,
    pub writes_aborted: AtomicUsize,
}

impl CallCounts {
    pub fn bucket_attrs(&self) -> usize {
        self.bucket_attrs.load(Ordering::SeqCst)
    }

    pub fn list_objects(&self) -> usize {
        self.list_objects.load(Ordering::SeqCst)
    }

    /// Reads, writes, patches and deletes of objects, including listings.
    pub fn object_calls(&self) -> usize {
        self.object_calls.load(Ordering::SeqCst)
    }

    pub fn writes_finished(&self) -> usize {
        self.writes_finished.load(Ordering::SeqCst)
    }

    pub fn writes_aborted(&self) -> usize {
        self.writes_aborted.load(Ordering::SeqCst)
    }
}

pub struct RecordingBackend {
    inner: Arc<dyn StorageBackend>,
    pub counts: Arc<CallCounts>,
    /// When set, every reader fails once it has yielded this many bytes.
    read_limit: Option<usize>,
}

impl RecordingBackend {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            counts: Arc::new(CallCounts::default()),
            read_limit: None,
        }
    }

    pub fn failing_reads_after(mut self, limit: usize) -> Self {
        self.read_limit = Some(limit);
        self
    }

    fn object_call(&self) {
        self.counts.object_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for RecordingBackend {
    async fn bucket_attrs(&self, bucket: &str) -> BackendResult<BucketAttrs> {
        self.counts.bucket_attrs.fetch_add(1, Ordering::SeqCst);
        self.inner.bucket_attrs(bucket).await
    }

    async fn list_objects(&self, bucket: &str, query: &ListQuery) -> BackendResult<ObjectsPage> {
        self.counts.list_objects.fetch_add(1, Ordering::SeqCst);
        self.object_call();
        self.inner.list_objects(bucket, query).await
    }

    async fn object_attrs(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> BackendResult<ObjectAttrs> {
        self.object_call();
        self.inner.object_attrs(bucket, key, generation).await
    }

    async fn open_reader(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> BackendResult<ObjectReader> {
        self.object_call();
        let reader = self.inner.open_reader(bucket, key, generation).await?;
        Ok(match self.read_limit {
            Some(limit) => Box::pin(FailAfter {
                inner: reader,
                remaining: limit,
            }),
            None => reader,
        })
    }

    async fn open_writer(
        &self,
        bucket: &str,
        key: &str,
        size: Option<u64>,
    ) -> BackendResult<Box<dyn ObjectWriter>> {
        self.object_call();
        let inner = self.inner.open_writer(bucket, key, size).await?;
        Ok(Box::new(RecordingWriter {
            inner,
            counts: self.counts.clone(),
        }))
    }

    async fn update_object(
        &self,
        bucket: &str,
        key: &str,
        update: &ObjectAttrsUpdate,
    ) -> BackendResult<ObjectAttrs> {
        self.object_call();
        self.inner.update_object(bucket, key, update).await
    }

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> BackendResult<()> {
        self.object_call();
        self.inner.delete_object(bucket, key, generation).await
    }
}

/// Counts how upload sessions end.
struct RecordingWriter {
    inner: Box<dyn ObjectWriter>,
    counts: Arc<CallCounts>,
}

#[async_trait]
impl ObjectWriter for RecordingWriter {
    async fn write(&mut self, chunk: Bytes) -> BackendResult<()> {
        self.inner.write(chunk).await
    }

    async fn finish(self: Box<Self>) -> BackendResult<ObjectAttrs> {
        self.counts.writes_finished.fetch_add(1, Ordering::SeqCst);
        self.inner.finish().await
    }

    async fn abort(self: Box<Self>) {
        self.counts.writes_aborted.fetch_add(1, Ordering::SeqCst);
        self.inner.abort().await
    }
}

/// Yields at most `remaining` bytes of `inner`, then fails.
struct FailAfter {
    inner: ObjectReader,
    remaining: usize,
}

impl AsyncRead for FailAfter {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset mid-body",
            )));
        }

        let mut limited = vec![0u8; self.remaining.min(buf.remaining())];
        let mut limited_buf = ReadBuf::new(&mut limited);
        ready!(self.inner.as_mut().poll_read(cx, &mut limited_buf))?;
        let filled = limited_buf.filled();
        buf.put_slice(filled);
        let n = filled.len();
        self.remaining -= n;
        Poll::Ready(Ok(()))
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub local: LocalBackend,
    pub client: StorageClient,
    pub counts: Arc<CallCounts>,
}

impl Fixture {
    /// A local backend holding `demo` (unversioned) and `demo-v` (versioned).
    pub async fn new() -> Self {
        Self::with_backend(RecordingBackend::new).await
    }

    /// Like [`Fixture::new`], but downloads break after `limit` bytes.
    pub async fn failing_reads_after(limit: usize) -> Self {
        Self::with_backend(|inner| RecordingBackend::new(inner).failing_reads_after(limit)).await
    }

    async fn with_backend(wrap: impl FnOnce(Arc<dyn StorageBackend>) -> RecordingBackend) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let local = local_backend(&dir).await;
        local.create_bucket(PLAIN_BUCKET, false).await.unwrap();
        local.create_bucket(VERSIONED_BUCKET, true).await.unwrap();

        let recording = wrap(Arc::new(local.clone()));
        let counts = recording.counts.clone();
        let client = StorageClient::new(Arc::new(recording), ProgressSink::discard());
        Self {
            dir,
            local,
            client,
            counts,
        }
    }

    /// Write `contents` to a file inside the fixture directory and return its path.
    pub fn local_file(&self, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }
}

pub async fn local_backend(dir: &TempDir) -> LocalBackend {
    let url = format!("sqlite://{}", dir.path().join("meta/meta.db").display());
    LocalBackend::connect(&url, dir.path().join("objects"))
        .await
        .unwrap()
}
