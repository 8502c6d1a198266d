use crate::backends::gcs::DEFAULT_ENDPOINT;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::env;

const DEFAULT_USER_AGENT: &str = concat!("gcs-resource/", env!("CARGO_PKG_VERSION"));

/// Which object store the client talks to.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Cloud Storage JSON API (or an emulator speaking it).
    Gcs,
    /// SQLite metadata plus payload files on local disk.
    Local,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend: BackendKind,
    pub storage_dir: String,
    pub database_url: String,
    pub endpoint: String,
    pub access_token: Option<String>,
    pub user_agent: String,
    pub host: String,
    pub port: u16,
    /// Draw a progress bar on stderr while uploading.
    pub progress: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Generation-aware Cloud Storage client")]
pub struct Args {
    /// Backend to use (overrides GCS_RESOURCE_BACKEND)
    #[arg(long, value_enum, global = true)]
    pub backend: Option<BackendKind>,

    /// Directory where local payloads are stored (overrides GCS_RESOURCE_STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    /// Local metadata database URL (overrides GCS_RESOURCE_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Cloud Storage API endpoint (overrides GCS_RESOURCE_ENDPOINT)
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// OAuth2 bearer token (overrides GCS_RESOURCE_ACCESS_TOKEN)
    #[arg(long, global = true)]
    pub access_token: Option<String>,

    /// User-Agent sent with API requests (overrides GCS_RESOURCE_USER_AGENT)
    #[arg(long, global = true)]
    pub user_agent: Option<String>,

    /// Host the emulator binds to (overrides GCS_RESOURCE_HOST)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port the emulator binds to (overrides GCS_RESOURCE_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Do not draw upload progress
    #[arg(long, global = true)]
    pub no_progress: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List live object names
    List {
        bucket: String,
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// List every stored generation of one object
    Generations { bucket: String, path: String },
    /// Download an object to a local file
    Download {
        bucket: String,
        path: String,
        dest: String,
        /// Generation to read; 0 reads the live object
        #[arg(long, default_value_t = 0)]
        generation: i64,
    },
    /// Upload a local file and print the new generation
    Upload {
        bucket: String,
        path: String,
        source: String,
        #[arg(long, default_value = "")]
        content_type: String,
        #[arg(long, default_value = "")]
        predefined_acl: String,
        #[arg(long, default_value = "")]
        cache_control: String,
    },
    /// Print the gs:// locator of an object
    Url {
        bucket: String,
        path: String,
        #[arg(long, default_value_t = 0)]
        generation: i64,
    },
    /// Delete the live object or one generation
    Delete {
        bucket: String,
        path: String,
        #[arg(long, default_value_t = 0)]
        generation: i64,
    },
    /// Print attributes of the live object as JSON
    Info { bucket: String, path: String },
    /// Create a bucket in the local backend
    CreateBucket {
        bucket: String,
        #[arg(long)]
        versioning: bool,
    },
    /// Serve the local backend over the Cloud Storage JSON API
    Serve,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<(Self, Command)> {
        // --- Environment fallback ---
        let env_backend = match env::var("GCS_RESOURCE_BACKEND") {
            Ok(value) => BackendKind::from_str(&value, true)
                .map_err(|err| anyhow::anyhow!(err))
                .with_context(|| format!("parsing GCS_RESOURCE_BACKEND value `{}`", value))?,
            Err(env::VarError::NotPresent) => BackendKind::Gcs,
            Err(err) => return Err(err).context("reading GCS_RESOURCE_BACKEND"),
        };
        let env_port = match env::var("GCS_RESOURCE_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing GCS_RESOURCE_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 4443,
            Err(err) => return Err(err).context("reading GCS_RESOURCE_PORT"),
        };
        let env_host = env::var("GCS_RESOURCE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_storage =
            env::var("GCS_RESOURCE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("GCS_RESOURCE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/gcs_resource.db".into());
        let env_endpoint =
            env::var("GCS_RESOURCE_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.into());
        let env_token = env::var("GCS_RESOURCE_ACCESS_TOKEN").ok().filter(|t| !t.is_empty());
        let env_agent =
            env::var("GCS_RESOURCE_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.into());

        // --- Merge ---
        let cfg = Self {
            backend: args.backend.unwrap_or(env_backend),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            endpoint: args.endpoint.unwrap_or(env_endpoint),
            access_token: args.access_token.or(env_token),
            user_agent: args.user_agent.unwrap_or(env_agent),
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            progress: !args.no_progress,
        };

        Ok((cfg, args.command))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
