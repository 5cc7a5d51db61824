//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::{domain::card::Viewport, util::retry::RetryPolicy};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "social-cards";
const ENV_PREFIX: &str = "SOCIAL_CARDS";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_STORE_DIR: &str = "cards";
const DEFAULT_STORE_PAGE_SIZE: usize = 1000;
const DEFAULT_TEMPLATE_DIR: &str = "templates";
const DEFAULT_RENDER_POOL_SIZE: usize = 2;
const DEFAULT_RENDER_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_CDN_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_CDN_RETRY_BASE_MS: u64 = 200;
const DEFAULT_PURGE_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_PURGE_RETRY_BASE_MS: u64 = 100;

/// Command-line arguments for the social-cards binary.
#[derive(Debug, Parser)]
#[command(name = "social-cards", version, about = "Social card render-or-serve service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SOCIAL_CARDS_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the public and admin HTTP listeners.
    Serve(Box<ServeArgs>),
    /// Delete cached cards under a key prefix and invalidate the CDN.
    Purge(PurgeArgs),
    /// Print the request path and cache key for a card.
    Key(KeyArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub store: StoreOverrides,

    /// Key prefix to purge; omit to purge every card.
    #[arg(value_name = "PATH", default_value = "")]
    pub path: String,
}

#[derive(Debug, Args, Clone)]
pub struct KeyArgs {
    /// Template name.
    #[arg(value_name = "TEMPLATE")]
    pub template: String,

    /// Card title.
    #[arg(value_name = "TITLE")]
    pub title: String,

    /// Compact options, e.g. `font_serif-size_big`.
    #[arg(long, value_name = "OPTIONS", default_value = "")]
    pub options: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Fs,
    Memory,
    S3,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverrides {
    /// Override the object store backend.
    #[arg(long = "store-backend", value_name = "BACKEND", value_enum)]
    pub store_backend: Option<StoreBackend>,

    /// Override the filesystem store root.
    #[arg(long = "store-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub store_directory: Option<PathBuf>,

    /// Override the S3 bucket.
    #[arg(long = "store-bucket", value_name = "BUCKET")]
    pub store_bucket: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub store: StoreOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the public listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle cache lookups; disabled lookups always render.
    #[arg(
        long = "cache-lookup",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_lookup_enabled: Option<bool>,

    /// Override the Chromium executable.
    #[arg(long = "render-chrome-path", value_name = "PATH", value_hint = ValueHint::ExecutablePath)]
    pub chrome_path: Option<PathBuf>,

    /// Override the template directory.
    #[arg(long = "render-template-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub template_dir: Option<PathBuf>,

    /// Override the number of pooled browsers.
    #[arg(long = "render-pool-size", value_name = "COUNT")]
    pub pool_size: Option<usize>,

    /// Override the per-render deadline.
    #[arg(long = "render-timeout-ms", value_name = "MS")]
    pub render_timeout_ms: Option<u64>,

    /// Launch Chromium without its sandbox (containers).
    #[arg(
        long = "render-no-sandbox",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub no_sandbox: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub cache: CacheSettings,
    pub render: RenderSettings,
    pub cdn: CdnSettings,
    pub purge: PurgeSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub directory: PathBuf,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub key_prefix: String,
    pub page_size: NonZeroUsize,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub lookup_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub chrome_path: Option<PathBuf>,
    pub template_dir: PathBuf,
    pub pool_size: NonZeroUsize,
    pub timeout: Duration,
    pub viewport: Viewport,
    pub no_sandbox: bool,
}

#[derive(Debug, Clone)]
pub struct CdnSettings {
    pub invalidation_url: Option<Url>,
    pub token: Option<String>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct PurgeSettings {
    pub batch_retry: RetryPolicy,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Purge(args)) => raw.apply_store_overrides(&args.store),
        Some(Command::Key(_)) => {}
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    cache: RawCacheSettings,
    render: RawRenderSettings,
    cdn: RawCdnSettings,
    purge: RawPurgeSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_lookup_enabled {
            self.cache.lookup_enabled = Some(enabled);
        }
        if let Some(path) = overrides.chrome_path.as_ref() {
            self.render.chrome_path = Some(path.clone());
        }
        if let Some(dir) = overrides.template_dir.as_ref() {
            self.render.template_dir = Some(dir.clone());
        }
        if let Some(size) = overrides.pool_size {
            self.render.pool_size = Some(size);
        }
        if let Some(ms) = overrides.render_timeout_ms {
            self.render.timeout_ms = Some(ms);
        }
        if let Some(no_sandbox) = overrides.no_sandbox {
            self.render.no_sandbox = Some(no_sandbox);
        }

        self.apply_store_overrides(&overrides.store);
    }

    fn apply_store_overrides(&mut self, overrides: &StoreOverrides) {
        if let Some(backend) = overrides.store_backend {
            self.store.backend = Some(backend);
        }
        if let Some(directory) = overrides.store_directory.as_ref() {
            self.store.directory = Some(directory.clone());
        }
        if let Some(bucket) = overrides.store_bucket.as_ref() {
            self.store.bucket = Some(bucket.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            store,
            cache,
            render,
            cdn,
            purge,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            store: build_store_settings(store)?,
            cache: CacheSettings {
                lookup_enabled: cache.lookup_enabled.unwrap_or(true),
            },
            render: build_render_settings(render)?,
            cdn: build_cdn_settings(cdn)?,
            purge: build_purge_settings(purge)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }
    if admin_port == public_port {
        return Err(LoadError::invalid(
            "server.admin_port",
            "must differ from server.public_port",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.host", reason))?;
    let admin_addr = parse_socket_addr(&host, admin_port)
        .map_err(|reason| LoadError::invalid("server.host", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let backend = store.backend.unwrap_or(StoreBackend::Fs);

    let directory = store
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR));
    if backend == StoreBackend::Fs && directory.as_os_str().is_empty() {
        return Err(LoadError::invalid("store.directory", "path must not be empty"));
    }

    let bucket = non_empty(store.bucket);
    if backend == StoreBackend::S3 {
        if !cfg!(feature = "s3") {
            return Err(LoadError::invalid(
                "store.backend",
                "s3 backend requires building with the `s3` feature",
            ));
        }
        if bucket.is_none() {
            return Err(LoadError::invalid(
                "store.bucket",
                "required when store.backend = \"s3\"",
            ));
        }
    }

    let key_prefix = store.key_prefix.unwrap_or_default();
    if key_prefix.starts_with('/') {
        return Err(LoadError::invalid(
            "store.key_prefix",
            "must not start with `/`",
        ));
    }

    let page_size = non_zero_usize(
        store.page_size.unwrap_or(DEFAULT_STORE_PAGE_SIZE),
        "store.page_size",
    )?;

    Ok(StoreSettings {
        backend,
        directory,
        bucket,
        region: non_empty(store.region),
        endpoint: non_empty(store.endpoint),
        key_prefix,
        page_size,
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let chrome_path = render
        .chrome_path
        .filter(|path| !path.as_os_str().is_empty());

    let template_dir = render
        .template_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATE_DIR));
    if template_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.template_dir",
            "path must not be empty",
        ));
    }

    let pool_size = non_zero_usize(
        render.pool_size.unwrap_or(DEFAULT_RENDER_POOL_SIZE),
        "render.pool_size",
    )?;

    let timeout_ms = render.timeout_ms.unwrap_or(DEFAULT_RENDER_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "render.timeout_ms",
            "must be greater than zero",
        ));
    }

    let defaults = Viewport::default();
    let viewport = Viewport {
        width: render.viewport_width.unwrap_or(defaults.width),
        height: render.viewport_height.unwrap_or(defaults.height),
    };
    if viewport.width == 0 || viewport.height == 0 {
        return Err(LoadError::invalid(
            "render.viewport_width",
            "viewport dimensions must be greater than zero",
        ));
    }

    Ok(RenderSettings {
        chrome_path,
        template_dir,
        pool_size,
        timeout: Duration::from_millis(timeout_ms),
        viewport,
        no_sandbox: render.no_sandbox.unwrap_or(false),
    })
}

fn build_cdn_settings(cdn: RawCdnSettings) -> Result<CdnSettings, LoadError> {
    let invalidation_url = match non_empty(cdn.invalidation_url) {
        Some(raw) => {
            let url = Url::parse(&raw).map_err(|err| {
                LoadError::invalid("cdn.invalidation_url", format!("invalid URL: {err}"))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(LoadError::invalid(
                    "cdn.invalidation_url",
                    "scheme must be http or https",
                ));
            }
            Some(url)
        }
        None => None,
    };

    let retry = RetryPolicy::new(
        non_zero_attempts(
            cdn.retry_attempts.unwrap_or(DEFAULT_CDN_RETRY_ATTEMPTS),
            "cdn.retry_attempts",
        )?,
        Duration::from_millis(cdn.retry_base_ms.unwrap_or(DEFAULT_CDN_RETRY_BASE_MS)),
    );

    Ok(CdnSettings {
        invalidation_url,
        token: non_empty(cdn.token),
        retry,
    })
}

fn build_purge_settings(purge: RawPurgeSettings) -> Result<PurgeSettings, LoadError> {
    let batch_retry = RetryPolicy::new(
        non_zero_attempts(
            purge
                .batch_retry_attempts
                .unwrap_or(DEFAULT_PURGE_RETRY_ATTEMPTS),
            "purge.batch_retry_attempts",
        )?,
        Duration::from_millis(purge.retry_base_ms.unwrap_or(DEFAULT_PURGE_RETRY_BASE_MS)),
    );

    Ok(PurgeSettings { batch_retry })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    backend: Option<StoreBackend>,
    directory: Option<PathBuf>,
    bucket: Option<String>,
    region: Option<String>,
    endpoint: Option<String>,
    key_prefix: Option<String>,
    page_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    lookup_enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    chrome_path: Option<PathBuf>,
    template_dir: Option<PathBuf>,
    pool_size: Option<usize>,
    timeout_ms: Option<u64>,
    viewport_width: Option<u32>,
    viewport_height: Option<u32>,
    no_sandbox: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCdnSettings {
    invalidation_url: Option<String>,
    token: Option<String>,
    retry_attempts: Option<u32>,
    retry_base_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPurgeSettings {
    batch_retry_attempts: Option<u32>,
    retry_base_ms: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_attempts(value: u32, key: &'static str) -> Result<u32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}
