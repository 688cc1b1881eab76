//! Runtime configuration: optional TOML file, `.env`, then environment
//! variables, in increasing order of precedence.

use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use pixvault_core::{
    admission::DEFAULT_ADMISSION_CAPACITY,
    infra::UNSPLASH_BASE_URL,
    queue::QueueConfig,
    worker::WorkerConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] =
    ["pixvault.toml", "config/pixvault.toml"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub unsplash: UnsplashConfig,
    pub blobs: BlobConfig,
    pub admission: AdmissionConfig,
    pub queue: QueueSettings,
    pub worker: WorkerConfig,
    pub cors: CorsConfig,
    pub dev_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnsplashConfig {
    pub access_key: Option<String>,
    pub base_url: String,
}

impl Default for UnsplashConfig {
    fn default() -> Self {
        Self {
            access_key: None,
            base_url: UNSPLASH_BASE_URL.to_string(),
        }
    }
}

impl fmt::Debug for UnsplashConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsplashConfig")
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    pub root: PathBuf,
    /// Base URL blob links are issued under. Defaults to this server's
    /// `/blobs` route.
    pub public_base_url: Option<String>,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/blobs"),
            public_base_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub capacity: usize,
    /// How long a search request may wait for a slot before 503.
    pub search_wait_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_ADMISSION_CAPACITY,
            search_wait_ms: 1_000,
        }
    }
}

impl AdmissionConfig {
    pub fn search_wait(&self) -> Duration {
        Duration::from_millis(self.search_wait_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    #[default]
    Postgres,
    Memory,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown queue backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub backend: QueueBackend,
    #[serde(flatten)]
    pub broker: QueueConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
}

impl Config {
    /// URL prefix handed to the blob store.
    pub fn blob_public_url(&self) -> String {
        match &self.blobs.public_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}/blobs", self.server.port),
        }
    }
}

/// Values read from the process environment.
#[derive(Debug, Clone, Default)]
struct EnvConfig {
    config_path: Option<PathBuf>,
    database_url: Option<String>,
    server_host: Option<String>,
    server_port: Option<String>,
    unsplash_api_key: Option<String>,
    unsplash_base_url: Option<String>,
    blob_root: Option<PathBuf>,
    blob_public_url: Option<String>,
    admission_capacity: Option<String>,
    queue_name: Option<String>,
    queue_backend: Option<String>,
    queue_max_attempts: Option<String>,
    worker_consumers: Option<String>,
    shutdown_grace_secs: Option<String>,
    dev_mode: Option<String>,
}

impl EnvConfig {
    fn gather() -> Self {
        Self {
            config_path: var("PIXVAULT_CONFIG").map(PathBuf::from),
            database_url: var("DATABASE_URL"),
            server_host: var("SERVER_HOST"),
            server_port: var("SERVER_PORT"),
            unsplash_api_key: var("UNSPLASH_API_KEY"),
            unsplash_base_url: var("UNSPLASH_BASE_URL"),
            blob_root: var("BLOB_ROOT").map(PathBuf::from),
            blob_public_url: var("BLOB_PUBLIC_URL"),
            admission_capacity: var("ADMISSION_CAPACITY"),
            queue_name: var("QUEUE_NAME"),
            queue_backend: var("QUEUE_BACKEND"),
            queue_max_attempts: var("QUEUE_MAX_ATTEMPTS"),
            worker_consumers: var("WORKER_CONSUMERS"),
            shutdown_grace_secs: var("SHUTDOWN_GRACE_SECS"),
            dev_mode: var("DEV_MODE"),
        }
    }

    fn apply(self, config: &mut Config) -> Result<(), ConfigLoadError> {
        if let Some(url) = self.database_url {
            config.database.url = Some(url);
        }
        if let Some(host) = self.server_host {
            config.server.host = host;
        }
        if let Some(port) = self.server_port {
            config.server.port = parse_var("SERVER_PORT", &port)?;
        }
        if let Some(key) = self.unsplash_api_key {
            config.unsplash.access_key = Some(key);
        }
        if let Some(base_url) = self.unsplash_base_url {
            config.unsplash.base_url = base_url;
        }
        if let Some(root) = self.blob_root {
            config.blobs.root = root;
        }
        if let Some(url) = self.blob_public_url {
            config.blobs.public_base_url = Some(url);
        }
        if let Some(capacity) = self.admission_capacity {
            config.admission.capacity =
                parse_var("ADMISSION_CAPACITY", &capacity)?;
        }
        if let Some(name) = self.queue_name {
            config.queue.broker.name = name;
        }
        if let Some(backend) = self.queue_backend {
            config.queue.backend = backend.parse().map_err(|_| {
                ConfigLoadError::InvalidEnv {
                    name: "QUEUE_BACKEND",
                    value: backend,
                }
            })?;
        }
        if let Some(attempts) = self.queue_max_attempts {
            config.queue.broker.max_attempts =
                parse_var("QUEUE_MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(consumers) = self.worker_consumers {
            config.worker.consumers =
                parse_var("WORKER_CONSUMERS", &consumers)?;
        }
        if let Some(secs) = self.shutdown_grace_secs {
            let secs: u64 = parse_var("SHUTDOWN_GRACE_SECS", &secs)?;
            config.worker.shutdown_grace_ms = secs.saturating_mul(1_000);
        }
        if let Some(flag) = self.dev_mode {
            config.dev_mode = parse_var("DEV_MODE", &flag)?;
        }
        Ok(())
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: FromStr>(
    name: &'static str,
    value: &str,
) -> Result<T, ConfigLoadError> {
    value.parse().map_err(|_| ConfigLoadError::InvalidEnv {
        name,
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint(
        &mut self,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to load .env file")]
    EnvFile(#[from] dotenvy::Error),
    #[error("invalid value '{value}' for {name}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid database URL: {reason}")]
    InvalidDatabaseUrl { reason: String },
    #[error("invalid blob public URL '{url}'")]
    InvalidBlobUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let loaded = match &self.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| ()),
            None => dotenvy::dotenv().map(|_| ()),
        };
        match loaded {
            Ok(()) | Err(dotenvy::Error::Io(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let env_config = EnvConfig::gather();
        let mut warnings = ConfigWarnings::default();

        let explicit = self
            .config_path
            .clone()
            .or_else(|| env_config.config_path.clone());
        let mut config = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigLoadError::MissingConfig { path });
                }
                read_config_file(&path)?
            }
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(Path::new)
                .find(|candidate| candidate.exists())
            {
                Some(path) => read_config_file(path)?,
                None => {
                    warnings.push_with_hint(
                        "No pixvault.toml detected; using defaults and environment variables",
                        "Create pixvault.toml or set PIXVAULT_CONFIG to point at one",
                    );
                    Config::default()
                }
            },
        };

        env_config.apply(&mut config)?;
        validate(&config, &mut warnings)?;

        Ok(ConfigLoad { config, warnings })
    }
}

fn read_config_file(path: &Path) -> Result<Config, ConfigLoadError> {
    let contents =
        fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Hard errors for settings the process cannot run with, warnings for the
/// ones that only disable part of it.
pub fn validate(
    config: &Config,
    warnings: &mut ConfigWarnings,
) -> Result<(), ConfigLoadError> {
    match &config.database.url {
        Some(url) => validate_database_url(url)?,
        None => warnings.push_with_hint(
            "DATABASE_URL is not set",
            "Every process mode needs PostgreSQL; set DATABASE_URL or database.url",
        ),
    }

    if config.admission.capacity == 0 {
        return Err(ConfigLoadError::ZeroValue {
            field: "admission.capacity",
        });
    }
    if config.queue.broker.max_attempts == 0 {
        return Err(ConfigLoadError::ZeroValue {
            field: "queue.max_attempts",
        });
    }
    if config.worker.consumers == 0 {
        return Err(ConfigLoadError::ZeroValue {
            field: "worker.consumers",
        });
    }
    if config.database.max_connections == 0 {
        return Err(ConfigLoadError::ZeroValue {
            field: "database.max_connections",
        });
    }

    if let Some(url) = &config.blobs.public_base_url {
        Url::parse(url).map_err(|source| ConfigLoadError::InvalidBlobUrl {
            url: url.clone(),
            source,
        })?;
    }

    if config.unsplash.access_key.is_none() {
        warnings.push_with_hint(
            "UNSPLASH_API_KEY is not set; serve, worker and all modes will refuse to start",
            "Create an application at unsplash.com/developers and export its access key",
        );
    }

    if config.queue.backend == QueueBackend::Memory {
        warnings.push_with_hint(
            "In-memory queue selected; queued searches are lost on restart and not shared between processes",
            "Use QUEUE_BACKEND=postgres outside local development",
        );
    }

    for origin in &config.cors.allowed_origins {
        if axum::http::HeaderValue::from_str(origin).is_err() {
            warnings.push(format!("ignoring invalid CORS origin '{origin}'"));
        }
    }

    Ok(())
}

fn validate_database_url(raw: &str) -> Result<(), ConfigLoadError> {
    let url = Url::parse(raw).map_err(|err| {
        ConfigLoadError::InvalidDatabaseUrl {
            reason: err.to_string(),
        }
    })?;
    match url.scheme() {
        "postgres" | "postgresql" => Ok(()),
        other => Err(ConfigLoadError::InvalidDatabaseUrl {
            reason: format!(
                "scheme '{other}' is not supported; use postgres:// or postgresql://"
            ),
        }),
    }
}
