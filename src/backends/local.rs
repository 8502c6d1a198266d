//! src/backends/local.rs
//!
//! LocalBackend: a generation-aware object store backed by SQLite for
//! metadata and local disk for payloads. Every write gets a fresh, strictly
//! increasing generation; a versioned bucket keeps noncurrent generations,
//! an unversioned one replaces the live generation. Payloads are sharded
//! beneath `base_path/{bucket}/{shard}/{shard}/{key}#{generation}`.

use crate::backends::{BackendError, BackendResult, ObjectReader, ObjectWriter, StorageBackend};
use crate::models::{
    bucket::BucketAttrs,
    listing::{ListQuery, ObjectsPage},
    object::{ObjectAttrs, ObjectAttrsUpdate},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use md5::Context;
use sqlx::{
    QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const DEFAULT_PAGE_SIZE: u32 = 1000;
const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");
const OBJECT_COLUMNS: &str = "bucket, name, generation, metageneration, size, content_type, \
                              cache_control, md5_hash, created_at, updated_at";
const PREDEFINED_ACLS: [&str; 6] = [
    "authenticatedRead",
    "bucketOwnerFullControl",
    "bucketOwnerRead",
    "private",
    "projectPrivate",
    "publicRead",
];

#[derive(Clone)]
pub struct LocalBackend {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    /// Serializes upload commits, which read and then write in one transaction.
    commit_lock: Arc<Mutex<()>>,
}

impl LocalBackend {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Open (creating if needed) the metadata database and payload directory,
    /// then apply the schema.
    pub async fn connect(database_url: &str, base_path: impl Into<PathBuf>) -> BackendResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if let Some(parent) = options.get_filename().parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let backend = Self::new(Arc::new(pool), base_path);
        fs::create_dir_all(&backend.base_path).await?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn run_migrations(&self) -> BackendResult<()> {
        let statements = MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Rejects keys that would escape the bucket directory on disk.
    fn ensure_key_safe(&self, key: &str) -> BackendResult<()> {
        let invalid = || BackendError::InvalidObjectKey(key.to_string());
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        // `a..b` is a valid name; only `.` and `..` segments could escape.
        if key.starts_with('/')
            || key
                .split('/')
                .any(|segment| segment == "." || segment == "..")
        {
            return Err(invalid());
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Follows Cloud Storage naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens, underscores only
    /// - must start and end with a letter or digit
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address or start with `goog`
    fn ensure_bucket_name_safe(&self, name: &str) -> BackendResult<()> {
        let invalid = |reason: &str| BackendError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }

        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-' | '_'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, hyphens, and underscores",
            ));
        }

        let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
        if !edge_ok(name.chars().next()) || !edge_ok(name.chars().last()) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }

        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }

        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }

        if name.starts_with("goog") {
            return Err(invalid("cannot begin with the `goog` prefix"));
        }

        Ok(())
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(bucket);
        path
    }

    /// Two-level shard identifiers from MD5(bucket/key).
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Payload path of one generation. Parent directories may not exist yet.
    fn object_path(&self, bucket: &str, key: &str, generation: i64) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(format!("{}#{}", key, generation));
        path
    }

    async fn fetch_bucket(&self, bucket: &str) -> BackendResult<BucketAttrs> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<Sqlite, BucketAttrs>(
            "SELECT name, versioning_enabled, created_at FROM buckets WHERE name = ?",
        )
        .bind(bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => BackendError::BucketNotFound(bucket.to_string()),
            other => BackendError::Sqlx(other),
        })
    }

    /// A pinned generation (live or not), or the live generation.
    async fn fetch_object(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> BackendResult<ObjectAttrs> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE bucket = "
        ));
        builder.push_bind(bucket);
        builder.push(" AND name = ");
        builder.push_bind(key);
        match generation {
            Some(generation) => {
                builder.push(" AND generation = ");
                builder.push_bind(generation);
            }
            None => {
                builder.push(" AND is_live = 1");
            }
        }

        builder
            .build_query_as::<ObjectAttrs>()
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| BackendError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
                generation,
            })
    }

    /// Create a bucket and its payload directory.
    pub async fn create_bucket(&self, name: &str, versioning_enabled: bool) -> BackendResult<BucketAttrs> {
        self.ensure_bucket_name_safe(name)?;
        fs::create_dir_all(self.bucket_root(name)).await?;

        let bucket = BucketAttrs {
            name: name.to_string(),
            versioning_enabled,
            created_at: Utc::now(),
        };

        match sqlx::query(
            "INSERT INTO buckets (name, versioning_enabled, created_at) VALUES (?, ?, ?)",
        )
        .bind(&bucket.name)
        .bind(bucket.versioning_enabled)
        .bind(bucket.created_at)
        .execute(&*self.db)
        .await
        {
            Ok(_) => Ok(bucket),
            Err(err) if is_unique_violation(&err) => {
                Err(BackendError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(BackendError::Sqlx(err)),
        }
    }

    /// Turn versioning on or off. Existing noncurrent generations are kept.
    pub async fn set_versioning(&self, name: &str, enabled: bool) -> BackendResult<BucketAttrs> {
        self.ensure_bucket_name_safe(name)?;
        let result = sqlx::query("UPDATE buckets SET versioning_enabled = ? WHERE name = ?")
            .bind(enabled)
            .bind(name)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BackendError::BucketNotFound(name.to_string()));
        }
        self.fetch_bucket(name).await
    }

    /// Delete an empty bucket and its directory.
    pub async fn delete_bucket(&self, name: &str) -> BackendResult<()> {
        self.fetch_bucket(name).await?;

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE bucket = ?")
            .bind(name)
            .fetch_one(&*self.db)
            .await?;
        if remaining > 0 {
            return Err(BackendError::BucketNotEmpty(name.to_string()));
        }

        sqlx::query("DELETE FROM buckets WHERE name = ?")
            .bind(name)
            .execute(&*self.db)
            .await?;

        let bucket_path = self.bucket_root(name);
        if let Err(err) = fs::remove_dir_all(&bucket_path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove bucket directory {} after delete: {}",
                    bucket_path.display(),
                    err
                );
            }
        }
        Ok(())
    }

    /// Remove one generation's payload and prune empty shard directories.
    async fn remove_payload(&self, bucket: &str, key: &str, generation: i64) -> BackendResult<()> {
        let file_path = self.object_path(bucket, key, generation);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(BackendError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            prune_empty_dirs(parent, &self.bucket_root(bucket)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn bucket_attrs(&self, bucket: &str) -> BackendResult<BucketAttrs> {
        self.fetch_bucket(bucket).await
    }

    /// Keys are returned in ascending order, generations ascending within a key.
    async fn list_objects(&self, bucket: &str, query: &ListQuery) -> BackendResult<ObjectsPage> {
        self.fetch_bucket(bucket).await?;
        let max_results = query.max_results.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, DEFAULT_PAGE_SIZE) as usize;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE bucket = "
        ));
        builder.push_bind(bucket);
        if !query.versions {
            builder.push(" AND is_live = 1");
        }

        // `LIKE` would treat `_` and `%` in the prefix as wildcards.
        if !query.prefix.is_empty() {
            builder.push(" AND substr(name, 1, length(");
            builder.push_bind(&query.prefix);
            builder.push(")) = ");
            builder.push_bind(&query.prefix);
        }

        if let Some(token) = &query.page_token {
            let (name, generation) = decode_page_token(token)?;
            builder.push(" AND (name > ");
            builder.push_bind(name.clone());
            builder.push(" OR (name = ");
            builder.push_bind(name);
            builder.push(" AND generation > ");
            builder.push_bind(generation);
            builder.push("))");
        }

        builder.push(" ORDER BY name ASC, generation ASC LIMIT ");
        builder.push_bind((max_results + 1) as i64);

        let mut items: Vec<ObjectAttrs> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut next_page_token = None;
        if items.len() > max_results {
            items.truncate(max_results);
            next_page_token = items
                .last()
                .map(|last| encode_page_token(&last.name, last.generation));
        }

        debug!(
            bucket,
            prefix = %query.prefix,
            versions = query.versions,
            count = items.len(),
            truncated = next_page_token.is_some(),
            "listed objects"
        );
        Ok(ObjectsPage {
            items,
            next_page_token,
        })
    }

    async fn object_attrs(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> BackendResult<ObjectAttrs> {
        self.ensure_key_safe(key)?;
        self.fetch_bucket(bucket).await?;
        self.fetch_object(bucket, key, generation).await
    }

    /// Returns ObjectNotFound if metadata exists but the payload file is missing.
    async fn open_reader(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> BackendResult<ObjectReader> {
        let object = self.object_attrs(bucket, key, generation).await?;
        let file_path = self.object_path(bucket, key, object.generation);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BackendError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    generation,
                }
            } else {
                BackendError::Io(err)
            }
        })?;

        Ok(Box::pin(file))
    }

    /// Stage the upload in a temporary file next to its final location.
    async fn open_writer(
        &self,
        bucket: &str,
        key: &str,
        size: Option<u64>,
    ) -> BackendResult<Box<dyn ObjectWriter>> {
        self.ensure_key_safe(key)?;
        self.fetch_bucket(bucket).await?;

        let staging_dir = self
            .object_path(bucket, key, 0)
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                BackendError::Io(io::Error::other("object path missing parent directory"))
            })?;
        fs::create_dir_all(&staging_dir).await?;
        let tmp_path = staging_dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let file = File::create(&tmp_path).await?;

        Ok(Box::new(LocalObjectWriter {
            backend: self.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            tmp_path,
            file,
            size: 0,
            expected_size: size,
            digest: Context::new(),
        }))
    }

    async fn update_object(
        &self,
        bucket: &str,
        key: &str,
        update: &ObjectAttrsUpdate,
    ) -> BackendResult<ObjectAttrs> {
        self.ensure_key_safe(key)?;
        self.fetch_bucket(bucket).await?;
        if let Some(acl) = update.predefined_acl.as_deref() {
            if !PREDEFINED_ACLS.contains(&acl) {
                return Err(BackendError::InvalidArgument(format!(
                    "unknown predefined ACL `{acl}`"
                )));
            }
        }

        let query = format!(
            "UPDATE objects SET
                content_type = COALESCE(?, content_type),
                cache_control = COALESCE(?, cache_control),
                predefined_acl = COALESCE(?, predefined_acl),
                metageneration = metageneration + 1,
                updated_at = ?
             WHERE bucket = ? AND name = ? AND is_live = 1
             RETURNING {OBJECT_COLUMNS}"
        );
        sqlx::query_as::<_, ObjectAttrs>(&query)
            .bind(update.content_type.as_deref())
            .bind(update.cache_control.as_deref())
            .bind(update.predefined_acl.as_deref())
            .bind(Utc::now())
            .bind(bucket)
            .bind(key)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| BackendError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
                generation: None,
            })
    }

    /// A pinned delete purges that generation. An unpinned delete on a
    /// versioned bucket only demotes the live generation to noncurrent.
    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> BackendResult<()> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let not_found = || BackendError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
            generation,
        };

        let purged = match generation {
            Some(generation) => {
                sqlx::query_scalar::<_, i64>(
                    "DELETE FROM objects WHERE bucket = ? AND name = ? AND generation = ?
                     RETURNING generation",
                )
                .bind(bucket)
                .bind(key)
                .bind(generation)
                .fetch_optional(&*self.db)
                .await?
            }
            None if bucket_rec.versioning_enabled => {
                let result = sqlx::query(
                    "UPDATE objects SET is_live = 0 WHERE bucket = ? AND name = ? AND is_live = 1",
                )
                .bind(bucket)
                .bind(key)
                .execute(&*self.db)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(not_found());
                }
                debug!(bucket, key, "live generation made noncurrent");
                return Ok(());
            }
            None => {
                sqlx::query_scalar::<_, i64>(
                    "DELETE FROM objects WHERE bucket = ? AND name = ? AND is_live = 1
                     RETURNING generation",
                )
                .bind(bucket)
                .bind(key)
                .fetch_optional(&*self.db)
                .await?
            }
        };

        let purged = purged.ok_or_else(not_found)?;
        self.remove_payload(bucket, key, purged).await
    }
}

/// Upload session staged in a temporary file.
struct LocalObjectWriter {
    backend: LocalBackend,
    bucket: String,
    key: String,
    tmp_path: PathBuf,
    file: File,
    size: i64,
    expected_size: Option<u64>,
    digest: Context,
}

#[async_trait]
impl ObjectWriter for LocalObjectWriter {
    async fn write(&mut self, chunk: Bytes) -> BackendResult<()> {
        self.size += chunk.len() as i64;
        self.digest.consume(&chunk);
        self.file.write_all(&chunk).await?;
        Ok(())
    }

    /// Commit the staged payload.
    ///
    /// - Rejects a body shorter or longer than the announced size.
    /// - Flushes and fsyncs the temp file.
    /// - Demotes (versioned) or drops (unversioned) the previous live row.
    /// - Assigns a generation above every existing one and renames the
    ///   payload into place.
    async fn finish(self: Box<Self>) -> BackendResult<ObjectAttrs> {
        let LocalObjectWriter {
            backend,
            bucket,
            key,
            tmp_path,
            mut file,
            size,
            expected_size,
            digest,
        } = *self;

        if let Some(expected) = expected_size
            && expected != size as u64
        {
            drop(file);
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::InvalidArgument(format!(
                "upload of `{key}` carried {size} bytes, expected {expected}"
            )));
        }

        let staged = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = staged {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }

        let md5_hash = general_purpose::STANDARD.encode(digest.compute().0);
        match commit(&backend, &bucket, &key, &tmp_path, size, md5_hash).await {
            Ok((object, replaced)) => {
                if let Some(replaced) = replaced {
                    if let Err(err) = backend.remove_payload(&bucket, &key, replaced).await {
                        debug!("failed to remove replaced payload: {}", err);
                    }
                }
                Ok(object)
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(err)
            }
        }
    }

    async fn abort(self: Box<Self>) {
        let LocalObjectWriter { tmp_path, file, .. } = *self;
        drop(file);
        if let Err(err) = fs::remove_file(&tmp_path).await {
            debug!("failed to remove staged upload {}: {}", tmp_path.display(), err);
        }
    }
}

/// Swap the staged payload in and return the new row plus the generation
/// whose payload it replaced, if any.
async fn commit(
    backend: &LocalBackend,
    bucket: &str,
    key: &str,
    tmp_path: &Path,
    size: i64,
    md5_hash: String,
) -> BackendResult<(ObjectAttrs, Option<i64>)> {
    let _guard = backend.commit_lock.lock().await;
    let mut tx = backend.db.begin().await?;

    let versioning_enabled: bool =
        sqlx::query_scalar("SELECT versioning_enabled FROM buckets WHERE name = ?")
            .bind(bucket)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| BackendError::BucketNotFound(bucket.to_string()))?;

    // Commits within this process are serialized by `commit_lock`; the first
    // write statement also takes the database write lock.
    let replaced = if versioning_enabled {
        sqlx::query("UPDATE objects SET is_live = 0 WHERE bucket = ? AND name = ? AND is_live = 1")
            .bind(bucket)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        None
    } else {
        sqlx::query_scalar::<_, i64>(
            "DELETE FROM objects WHERE bucket = ? AND name = ? AND is_live = 1
             RETURNING generation",
        )
        .bind(bucket)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?
    };

    let highest: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(generation), 0) FROM objects")
        .fetch_one(&mut *tx)
        .await?;
    let now = Utc::now();
    let generation = now.timestamp_micros().max(highest + 1);

    let query = format!(
        "INSERT INTO objects (
            bucket, name, generation, metageneration, size, md5_hash,
            is_live, created_at, updated_at
         ) VALUES (?, ?, ?, 1, ?, ?, 1, ?, ?)
         RETURNING {OBJECT_COLUMNS}"
    );
    let object = sqlx::query_as::<_, ObjectAttrs>(&query)
        .bind(bucket)
        .bind(key)
        .bind(generation)
        .bind(size)
        .bind(&md5_hash)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

    let file_path = backend.object_path(bucket, key, generation);
    fs::rename(tmp_path, &file_path).await?;
    if let Err(err) = tx.commit().await {
        let _ = fs::remove_file(&file_path).await;
        return Err(BackendError::Sqlx(err));
    }

    debug!(bucket, key, generation, size, "object committed");
    Ok((object, replaced))
}

/// Page tokens are `base64url("{generation}:{name}")` of the last row returned.
fn encode_page_token(name: &str, generation: i64) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(format!("{}:{}", generation, name))
}

fn decode_page_token(token: &str) -> BackendResult<(String, i64)> {
    let raw = general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| BackendError::InvalidPageToken)?;
    let raw = String::from_utf8(raw).map_err(|_| BackendError::InvalidPageToken)?;
    let (generation, name) = raw.split_once(':').ok_or(BackendError::InvalidPageToken)?;
    let generation = generation
        .parse::<i64>()
        .map_err(|_| BackendError::InvalidPageToken)?;
    Ok((name.to_string(), generation))
}

/// Recursively remove empty directories up to the bucket root.
async fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut current = start.to_path_buf();
    while current.starts_with(stop) && current != stop {
        match fs::remove_dir(&current).await {
            Ok(_) => {
                if let Some(parent) = current.parent() {
                    current = parent.to_path_buf();
                } else {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => break,
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
            Err(err) => {
                debug!("failed to prune directory {}: {}", current.display(), err);
                break;
            }
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|segment| {
        !segment.is_empty()
            && segment.len() <= 3
            && segment.chars().all(|c| c.is_ascii_digit())
            && segment.parse::<u8>().is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn backend() -> (TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta.db").display());
        let backend = LocalBackend::connect(&url, dir.path().join("objects"))
            .await
            .unwrap();
        (dir, backend)
    }

    async fn put(backend: &LocalBackend, bucket: &str, key: &str, body: &[u8]) -> ObjectAttrs {
        let mut writer = backend
            .open_writer(bucket, key, Some(body.len() as u64))
            .await
            .unwrap();
        writer.write(Bytes::copy_from_slice(body)).await.unwrap();
        writer.finish().await.unwrap()
    }

    async fn read(backend: &LocalBackend, bucket: &str, key: &str, generation: Option<i64>) -> Vec<u8> {
        let mut reader = backend.open_reader(bucket, key, generation).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn page_tokens_survive_colons_in_names() {
        let token = encode_page_token("a:b/c.txt", 17);
        assert_eq!(decode_page_token(&token).unwrap(), ("a:b/c.txt".to_string(), 17));
        assert!(matches!(
            decode_page_token("not a token!"),
            Err(BackendError::InvalidPageToken)
        ));
    }

    #[tokio::test]
    async fn rejects_invalid_bucket_names() {
        let (_dir, backend) = backend().await;
        for name in ["ab", "Upper", "-edge", "edge.", "a..b", "192.168.1.1", "google-things"] {
            assert!(
                matches!(
                    backend.create_bucket(name, false).await,
                    Err(BackendError::InvalidBucketName { .. })
                ),
                "{name} should be rejected"
            );
        }
        backend.create_bucket("my_bucket.v2", false).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_bucket_is_rejected() {
        let (_dir, backend) = backend().await;
        backend.create_bucket("demo", false).await.unwrap();
        assert!(matches!(
            backend.create_bucket("demo", true).await,
            Err(BackendError::BucketAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn unversioned_overwrite_replaces_generation() {
        let (_dir, backend) = backend().await;
        backend.create_bucket("demo", false).await.unwrap();

        let first = put(&backend, "demo", "f.txt", b"one").await;
        let second = put(&backend, "demo", "f.txt", b"two").await;
        assert!(second.generation > first.generation);

        let page = backend
            .list_objects("demo", &ListQuery::all_versions("f.txt"))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].generation, second.generation);
        assert_eq!(read(&backend, "demo", "f.txt", None).await, b"two");
        assert!(!backend.object_path("demo", "f.txt", first.generation).exists());
    }

    #[tokio::test]
    async fn versioned_overwrite_keeps_history() {
        let (_dir, backend) = backend().await;
        backend.create_bucket("demo-v", true).await.unwrap();

        let first = put(&backend, "demo-v", "f.txt", b"one").await;
        let second = put(&backend, "demo-v", "f.txt", b"two").await;

        let all = backend
            .list_objects("demo-v", &ListQuery::all_versions("f.txt"))
            .await
            .unwrap();
        let generations: Vec<i64> = all.items.iter().map(|o| o.generation).collect();
        assert_eq!(generations, vec![first.generation, second.generation]);

        let live = backend
            .list_objects("demo-v", &ListQuery::latest("f.txt"))
            .await
            .unwrap();
        assert_eq!(live.items.len(), 1);

        assert_eq!(read(&backend, "demo-v", "f.txt", Some(first.generation)).await, b"one");
        assert_eq!(read(&backend, "demo-v", "f.txt", None).await, b"two");
    }

    #[tokio::test]
    async fn upload_records_size_and_md5() {
        let (_dir, backend) = backend().await;
        backend.create_bucket("demo", false).await.unwrap();

        let object = put(&backend, "demo", "hello.txt", b"hello").await;
        assert_eq!(object.size, 5);
        assert_eq!(object.metageneration, 1);
        assert_eq!(object.md5_hash.as_deref(), Some("XUFAKrxLKna5cZ2REBfFkg=="));
    }

    #[tokio::test]
    async fn prefix_is_matched_literally() {
        let (_dir, backend) = backend().await;
        backend.create_bucket("demo", false).await.unwrap();
        put(&backend, "demo", "a_b/1", b"x").await;
        put(&backend, "demo", "axb/2", b"x").await;
        put(&backend, "demo", "A_b/3", b"x").await;

        let page = backend
            .list_objects("demo", &ListQuery::latest("a_b"))
            .await
            .unwrap();
        let names: Vec<&str> = page.items.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a_b/1"]);
    }

    #[tokio::test]
    async fn listing_pages_until_exhausted() {
        let (_dir, backend) = backend().await;
        backend.create_bucket("demo", false).await.unwrap();
        for i in 0..5 {
            put(&backend, "demo", &format!("k/{i}"), b"x").await;
        }

        let mut query = ListQuery {
            max_results: Some(2),
            ..ListQuery::latest("k/")
        };
        let mut names = Vec::new();
        let mut pages = 0;
        loop {
            let page = backend.list_objects("demo", &query).await.unwrap();
            pages += 1;
            names.extend(page.items.into_iter().map(|o| o.name));
            match page.next_page_token {
                Some(token) => query.page_token = Some(token),
                None => break,
            }
        }
        assert_eq!(pages, 3);
        assert_eq!(names, vec!["k/0", "k/1", "k/2", "k/3", "k/4"]);
    }

    #[tokio::test]
    async fn delete_semantics_follow_versioning() {
        let (_dir, backend) = backend().await;
        backend.create_bucket("demo-v", true).await.unwrap();
        let first = put(&backend, "demo-v", "f.txt", b"one").await;
        put(&backend, "demo-v", "f.txt", b"two").await;

        backend.delete_object("demo-v", "f.txt", None).await.unwrap();
        assert!(backend.object_attrs("demo-v", "f.txt", None).await.unwrap_err().is_not_found());
        let history = backend
            .list_objects("demo-v", &ListQuery::all_versions("f.txt"))
            .await
            .unwrap();
        assert_eq!(history.items.len(), 2);

        backend
            .delete_object("demo-v", "f.txt", Some(first.generation))
            .await
            .unwrap();
        let err = backend
            .delete_object("demo-v", "f.txt", Some(first.generation))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::ObjectNotFound { generation: Some(_), .. }));
    }

    #[tokio::test]
    async fn update_bumps_metageneration() {
        let (_dir, backend) = backend().await;
        backend.create_bucket("demo", false).await.unwrap();
        let object = put(&backend, "demo", "f.txt", b"x").await;

        let update = ObjectAttrsUpdate::from_requested("text/plain", "no-cache", "publicRead");
        let updated = backend.update_object("demo", "f.txt", &update).await.unwrap();
        assert_eq!(updated.generation, object.generation);
        assert_eq!(updated.metageneration, 2);
        assert_eq!(updated.content_type.as_deref(), Some("text/plain"));
        assert_eq!(updated.cache_control.as_deref(), Some("no-cache"));

        let bad = ObjectAttrsUpdate::from_requested("", "", "everyone");
        assert!(matches!(
            backend.update_object("demo", "f.txt", &bad).await,
            Err(BackendError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn aborted_upload_leaves_nothing_behind() {
        let (_dir, backend) = backend().await;
        backend.create_bucket("demo", false).await.unwrap();

        let mut writer = backend.open_writer("demo", "f.txt", None).await.unwrap();
        writer.write(Bytes::from_static(b"partial")).await.unwrap();
        writer.abort().await;

        assert!(backend.object_attrs("demo", "f.txt", None).await.unwrap_err().is_not_found());
        let staging = backend.object_path("demo", "f.txt", 0);
        let leftovers = std::fs::read_dir(staging.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let (_dir, backend) = backend().await;
        backend.create_bucket("demo", false).await.unwrap();
        for key in ["", "/abs", "../escape", "a/../b", "a/./b", "dir/..", "a\\b"] {
            assert!(
                matches!(
                    backend.open_writer("demo", key, None).await,
                    Err(BackendError::InvalidObjectKey(_))
                ),
                "{key} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn dots_inside_a_segment_are_ordinary_characters() {
        let (_dir, backend) = backend().await;
        backend.create_bucket("demo", false).await.unwrap();
        for key in ["a..b", "release..tar.gz", "dir/...", ".hidden/..x"] {
            put(&backend, "demo", key, key.as_bytes()).await;
            assert_eq!(read(&backend, "demo", key, None).await, key.as_bytes());
        }
    }

    #[tokio::test]
    async fn short_body_is_not_committed() {
        let (_dir, backend) = backend().await;
        backend.create_bucket("demo", false).await.unwrap();

        let mut writer = backend.open_writer("demo", "f.txt", Some(10)).await.unwrap();
        writer.write(Bytes::from_static(b"four")).await.unwrap();
        let err = writer.finish().await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidArgument(_)), "{err}");

        assert!(backend.object_attrs("demo", "f.txt", None).await.unwrap_err().is_not_found());
        let staging = backend.object_path("demo", "f.txt", 0);
        assert_eq!(std::fs::read_dir(staging.parent().unwrap()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn delete_bucket_requires_empty() {
        let (_dir, backend) = backend().await;
        backend.create_bucket("demo", false).await.unwrap();
        put(&backend, "demo", "f.txt", b"x").await;
        assert!(matches!(
            backend.delete_bucket("demo").await,
            Err(BackendError::BucketNotEmpty(_))
        ));
        backend.delete_object("demo", "f.txt", None).await.unwrap();
        backend.delete_bucket("demo").await.unwrap();
        assert!(matches!(
            backend.bucket_attrs("demo").await,
            Err(BackendError::BucketNotFound(_))
        ));
    }
}
