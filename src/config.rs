//! Layered settings: configuration file, then `XML_CONTENT_MODEL_*`
//! environment variables, then command-line flags.

use crate::cli::Cli;
use crate::resolver::FileAssociation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "XML_CONTENT_MODEL_";
const APP_NAME: &str = "xml-content-model";
const CONFIG_FILE_NAMES: [&str; 4] = [
    "xml-content-model.toml",
    "xml-content-model.json",
    ".xml-content-model.toml",
    ".xml-content-model.json",
];

/// Source of environment variables, swappable in tests.
pub trait EnvProvider {
    fn get(&self, key: &str) -> Option<String>;
}

pub struct SystemEnvProvider;

impl EnvProvider for SystemEnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML configuration: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("Invalid JSON configuration: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Invalid environment variable: {0}")]
    Environment(String),

    #[error("Configuration files must be TOML or JSON, got .{0}")]
    UnsupportedFormat(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub network: NetworkConfig,
    pub resolution: ResolutionConfig,
}

/// Remote grammar cache and grammar pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Where downloaded grammars are stored
    pub directory: PathBuf,
    /// Cache remote grammars on disk
    pub enabled: bool,
    /// Allow downloading remote grammars
    pub download_external_resources: bool,
    /// Age in hours after which a cached grammar is downloaded again
    pub resource_ttl_hours: Option<u64>,
    /// How long a failed download is remembered, 0 to retry every time
    pub negative_ttl_seconds: u64,
    /// Maximum number of compiled grammars kept in the pool
    pub max_pool_entries: u64,
}

/// Downloads of remote grammars.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub timeout_seconds: u64,
    /// Retries after the first attempt of a download
    pub retry_attempts: u32,
    /// Initial delay between retries in milliseconds
    pub retry_delay_ms: u64,
    /// Cap for the exponential retry delay in milliseconds
    pub max_retry_delay_ms: u64,
    /// Redirects followed per download
    pub max_redirects: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResolutionConfig {
    /// XML catalog files, in precedence order
    pub catalogs: Vec<String>,
    /// Glob pattern to grammar mappings
    pub file_associations: Vec<FileAssociation>,
    /// Base for relative catalog paths and file association patterns
    pub root_uri: Option<String>,
    /// How long consumers that need a grammar wait for its download
    pub download_wait_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(APP_NAME),
            enabled: true,
            download_external_resources: true,
            resource_ttl_hours: None,
            negative_ttl_seconds: 30,
            max_pool_entries: 64,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            max_redirects: 10,
        }
    }
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            catalogs: Vec::new(),
            file_associations: Vec::new(),
            root_uri: None,
            download_wait_ms: 2000,
        }
    }
}

pub struct ConfigManager;

impl ConfigManager {
    /// File, then environment, then command line; the result is validated.
    pub async fn load_config(cli: &Cli) -> Result<Config> {
        Self::load_config_with(&SystemEnvProvider, cli).await
    }

    pub async fn load_config_with(env: &impl EnvProvider, cli: &Cli) -> Result<Config> {
        let from_file = match &cli.config {
            Some(path) => Self::load_from_file(path).await?,
            None => Self::find_config_file().await?.unwrap_or_default(),
        };
        let config = Self::merge_with_cli(Self::apply_environment_overrides_with(env, from_file)?, cli);
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// Format is picked by extension; files without one may be either.
    pub async fn load_from_file(path: &Path) -> Result<Config> {
        let content = tokio::fs::read_to_string(path).await?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some(ext) => Err(ConfigError::UnsupportedFormat(ext.to_string())),
            None => match toml::from_str::<Config>(&content) {
                Ok(config) => Ok(config),
                Err(_) => Ok(serde_json::from_str(&content)?),
            },
        }
    }

    /// First configuration file found in the working directory, then in the
    /// user configuration directory.
    pub async fn find_config_file() -> Result<Option<Config>> {
        let mut directories = vec![PathBuf::new()];
        directories.extend(dirs::config_dir().map(|dir| dir.join(APP_NAME)));

        for directory in &directories {
            for name in CONFIG_FILE_NAMES {
                let path = directory.join(name);
                if path.is_file() {
                    return Self::load_from_file(&path).await.map(Some);
                }
            }
        }
        Ok(None)
    }

    pub fn apply_environment_overrides(config: Config) -> Result<Config> {
        Self::apply_environment_overrides_with(&SystemEnvProvider, config)
    }

    pub fn apply_environment_overrides_with(
        env: &impl EnvProvider,
        mut config: Config,
    ) -> Result<Config> {
        if let Some(directory) = env_string(env, "CACHE_DIR") {
            config.cache.directory = PathBuf::from(directory);
        }
        if let Some(enabled) = parse_env(env, "USE_CACHE")? {
            config.cache.enabled = enabled;
        }
        if let Some(download) = parse_env(env, "DOWNLOAD_EXTERNAL_RESOURCES")? {
            config.cache.download_external_resources = download;
        }
        if let Some(hours) = parse_env(env, "RESOURCE_TTL_HOURS")? {
            config.cache.resource_ttl_hours = Some(hours);
        }
        if let Some(seconds) = parse_env(env, "NEGATIVE_TTL_SECONDS")? {
            config.cache.negative_ttl_seconds = seconds;
        }
        if let Some(seconds) = parse_env(env, "TIMEOUT")? {
            config.network.timeout_seconds = seconds;
        }
        if let Some(attempts) = parse_env(env, "RETRY_ATTEMPTS")? {
            config.network.retry_attempts = attempts;
        }
        if let Some(catalogs) = env_string(env, "CATALOGS") {
            config.resolution.catalogs = split_list(&catalogs);
        }
        if let Some(root_uri) = env_string(env, "ROOT_URI") {
            config.resolution.root_uri = Some(root_uri);
        }
        if let Some(wait) = parse_env(env, "DOWNLOAD_WAIT_MS")? {
            config.resolution.download_wait_ms = wait;
        }
        Ok(config)
    }

    pub fn merge_with_cli(mut config: Config, cli: &Cli) -> Config {
        if let Some(directory) = &cli.cache_dir {
            config.cache.directory = directory.clone();
        }
        if cli.no_cache {
            config.cache.enabled = false;
        }
        if cli.offline {
            config.cache.download_external_resources = false;
        }
        if !cli.catalogs.is_empty() {
            config.resolution.catalogs = cli.catalogs.clone();
        }
        if let Some(wait_ms) = cli.wait_ms {
            config.resolution.download_wait_ms = wait_ms;
        }
        config
    }

    pub fn validate_config(config: &Config) -> Result<()> {
        let invalid = |message: String| Err(ConfigError::Validation(message));

        if config.cache.resource_ttl_hours == Some(0) {
            return invalid("cache.resource_ttl_hours must be at least 1".into());
        }
        if config.cache.max_pool_entries == 0 {
            return invalid("cache.max_pool_entries must be at least 1".into());
        }
        if config.network.timeout_seconds == 0 {
            return invalid("network.timeout_seconds must be at least 1".into());
        }
        if config.network.retry_attempts > 10 {
            return invalid("network.retry_attempts must be 10 or less".into());
        }
        if config.network.retry_delay_ms > config.network.max_retry_delay_ms {
            return invalid("network.retry_delay_ms exceeds network.max_retry_delay_ms".into());
        }
        for association in &config.resolution.file_associations {
            if association.pattern.trim().is_empty() || association.system_id.trim().is_empty() {
                return invalid(format!(
                    "file association needs a pattern and a system id: {association:?}"
                ));
            }
            if let Err(e) = glob::Pattern::new(&association.pattern) {
                return invalid(format!(
                    "file association pattern {} is not a glob: {e}",
                    association.pattern
                ));
            }
        }
        Ok(())
    }

    /// Wait used by consumers that need a grammar before going on.
    pub fn get_download_wait(config: &Config) -> Duration {
        Duration::from_millis(config.resolution.download_wait_ms)
    }

    pub fn get_timeout_duration(config: &Config) -> Duration {
        Duration::from_secs(config.network.timeout_seconds)
    }
}

fn env_string(env: &impl EnvProvider, name: &str) -> Option<String> {
    env.get(&format!("{ENV_PREFIX}{name}"))
}

fn parse_env<T: std::str::FromStr>(env: &impl EnvProvider, name: &str) -> Result<Option<T>> {
    let Some(value) = env_string(env, name) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Environment(format!("{ENV_PREFIX}{name}={value}")))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
