use anyhow::{Context, Result};
use gcs_resource::{
    backends::local::LocalBackend,
    config::{AppConfig, Command},
    handlers::command_handlers,
    routes::routes::routes,
};
use std::io::ErrorKind;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let (cfg, command) = AppConfig::from_env_and_args()?;
    tracing::debug!(?cfg, ?command, "configuration loaded");

    match command {
        Command::Serve => serve(&cfg).await,
        command => command_handlers::run(&cfg, command, &mut std::io::stdout()).await,
    }
}

/// Expose the local backend over the Cloud Storage JSON API until interrupted.
async fn serve(cfg: &AppConfig) -> Result<()> {
    let backend = LocalBackend::connect(&cfg.database_url, &cfg.storage_dir)
        .await
        .with_context(|| format!("opening local store at {}", cfg.storage_dir))?;
    tracing::info!(
        storage_dir = %cfg.storage_dir,
        database_url = %cfg.database_url,
        "local store ready"
    );

    let listener = bind(cfg).await?;
    tracing::info!("emulator listening on http://{}", listener.local_addr()?);
    axum::serve(listener, routes().with_state(backend)).await?;
    Ok(())
}

/// Bind the configured address. A wildcard host that is not permitted falls
/// back to loopback on the same port.
async fn bind(cfg: &AppConfig) -> Result<TcpListener> {
    let addr = cfg.addr();
    match TcpListener::bind(&addr).await {
        Ok(listener) => Ok(listener),
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let loopback = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!("permission denied binding {} ({}), using {}", addr, err, loopback);
            TcpListener::bind(&loopback)
                .await
                .with_context(|| format!("binding {loopback}"))
        }
        Err(err) => Err(err).with_context(|| format!("binding {addr}")),
    }
}
