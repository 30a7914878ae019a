use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Upper bound on a whole multipart upload request.
    pub max_upload_bytes: usize,
    pub request_timeout: Duration,
    /// Quota recorded on new buckets. Informational only.
    pub default_size_quota: f64,
}

/// What the process does after configuration is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    PurgeDeleted,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Bucket-based file storage service")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding bucket containers (overrides OBJECT_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides OBJECT_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Maximum upload request size in bytes (overrides OBJECT_STORE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Per-request deadline in seconds (overrides OBJECT_STORE_REQUEST_TIMEOUT_SECS)
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,

    /// Size quota given to new buckets (overrides OBJECT_STORE_DEFAULT_SIZE_QUOTA)
    #[arg(long)]
    pub default_size_quota: Option<f64>,

    /// Run migrations and exit
    #[arg(long, conflicts_with = "purge_deleted")]
    pub migrate: bool,

    /// Finish interrupted deletes (remove blobs and rows of soft-deleted files) and exit
    #[arg(long)]
    pub purge_deleted: bool,
}

/// Read `name` from the environment, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        Self::from_args(Args::parse())
    }

    fn from_args(args: Args) -> Result<(Self, RunMode)> {
        // --- Environment fallback ---
        let env_host = env::var("OBJECT_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("OBJECT_STORE_PORT", 3000u16)?;
        let env_storage =
            env::var("OBJECT_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("OBJECT_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/bucket_store.db".into());
        let env_max_upload = env_or("OBJECT_STORE_MAX_UPLOAD_BYTES", 64 * 1024 * 1024usize)?;
        let env_timeout = env_or("OBJECT_STORE_REQUEST_TIMEOUT_SECS", 30u64)?;
        let env_quota = env_or("OBJECT_STORE_DEFAULT_SIZE_QUOTA", 1024.0f64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
            request_timeout: Duration::from_secs(args.request_timeout_secs.unwrap_or(env_timeout)),
            default_size_quota: args.default_size_quota.unwrap_or(env_quota),
        };

        if cfg.request_timeout.is_zero() {
            anyhow::bail!("request timeout must be at least one second");
        }
        if !cfg.default_size_quota.is_finite() || cfg.default_size_quota < 0.0 {
            anyhow::bail!(
                "default size quota must be a non-negative number, got {}",
                cfg.default_size_quota
            );
        }

        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.purge_deleted {
            RunMode::PurgeDeleted
        } else {
            RunMode::Serve
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
