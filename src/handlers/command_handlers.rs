//! Command-line handlers. Each one runs a single client operation and prints
//! its result on stdout; logs and progress go to stderr.

use crate::{
    backends::{self, local::LocalBackend},
    config::{AppConfig, Command},
    services::{progress::ProgressSink, storage_client::StorageClient},
};
use anyhow::{Context, Result, bail};
use std::io::{self, Write};

/// Run one non-server command against the configured backend, writing its
/// output to `out`.
pub async fn run(cfg: &AppConfig, command: Command, out: &mut (dyn Write + Send)) -> Result<()> {
    if let Command::CreateBucket { bucket, versioning } = &command {
        let backend = LocalBackend::connect(&cfg.database_url, &cfg.storage_dir).await?;
        let attrs = backend.create_bucket(bucket, *versioning).await?;
        writeln!(out, "{}", serde_json::to_string_pretty(&attrs)?)?;
        return Ok(());
    }

    let backend = backends::connect(cfg)
        .await
        .with_context(|| format!("connecting to {:?} backend", cfg.backend))?;
    let progress = if cfg.progress {
        ProgressSink::new(io::stderr())
    } else {
        ProgressSink::discard()
    };
    let client = StorageClient::new(backend, progress);

    match command {
        Command::List { bucket, prefix } => {
            for name in client.bucket_objects(&bucket, &prefix).await? {
                writeln!(out, "{name}")?;
            }
        }
        Command::Generations { bucket, path } => {
            for generation in client.object_generations(&bucket, &path).await? {
                writeln!(out, "{generation}")?;
            }
        }
        Command::Download {
            bucket,
            path,
            dest,
            generation,
        } => {
            client.download_file(&bucket, &path, generation, &dest).await?;
            tracing::info!(bucket, path, generation, dest, "downloaded");
        }
        Command::Upload {
            bucket,
            path,
            source,
            content_type,
            predefined_acl,
            cache_control,
        } => {
            let generation = client
                .upload_file(
                    &bucket,
                    &path,
                    &content_type,
                    &source,
                    &predefined_acl,
                    &cache_control,
                )
                .await?;
            writeln!(out, "{generation}")?;
        }
        Command::Url {
            bucket,
            path,
            generation,
        } => {
            writeln!(out, "{}", client.url(&bucket, &path, generation).await?)?;
        }
        Command::Delete {
            bucket,
            path,
            generation,
        } => {
            client.delete_object(&bucket, &path, generation).await?;
        }
        Command::Info { bucket, path } => {
            let attrs = client.object_info(&bucket, &path).await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&attrs)?)?;
        }
        Command::CreateBucket { .. } | Command::Serve => {
            bail!("command is not handled by the client dispatcher")
        }
    }

    Ok(())
}
