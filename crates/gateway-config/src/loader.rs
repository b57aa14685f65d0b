//! Configuration loading from files and environment.
//!
//! Sources are parsed into a generic document tree, deep-merged in order
//! (later sources win key by key), deserialized once, overridden from the
//! environment and validated.

use crate::schema::{CacheStoreKind, GatewayConfig};
use regex::{Captures, Regex};
use serde_yaml::Value;
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Prefix for environment overrides read by [`load_config`]
pub const ENV_PREFIX: &str = "MODEL_GATEWAY";

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// The path to the file that was not found
        path: String,
    },

    /// IO error
    #[error("IO error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error
    #[error("Configuration validation error: {0}")]
    Validation(String),

    /// Unsupported format
    #[error("Unsupported configuration format: {extension}")]
    UnsupportedFormat {
        /// The file extension that was not supported
        extension: String,
    },

    /// Environment override could not be parsed
    #[error("Invalid value for {name}: {value}")]
    InvalidOverride {
        /// Environment variable name
        name: String,
        /// Rejected value
        value: String,
    },
}

/// Configuration source
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File path; format chosen by extension
    File(String),
    /// Raw YAML string
    Yaml(String),
    /// Raw TOML string
    Toml(String),
    /// Raw JSON string
    Json(String),
    /// Default configuration
    Default,
}

/// Configuration loader
#[derive(Debug, Default)]
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// Create a new config loader
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a configuration source
    #[must_use]
    pub fn with_source(mut self, source: ConfigSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Add a file source
    #[must_use]
    pub fn with_file(self, path: impl Into<String>) -> Self {
        self.with_source(ConfigSource::File(path.into()))
    }

    /// Set environment variable prefix for overrides
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Load configuration from all sources
    ///
    /// # Errors
    /// Returns error if any source fails to load, an override is malformed,
    /// or the result fails validation
    pub async fn load(self) -> Result<GatewayConfig, ConfigError> {
        let mut merged = Value::Mapping(serde_yaml::Mapping::new());

        for source in &self.sources {
            let document = Self::load_source(source).await?;
            merge_values(&mut merged, document);
        }

        let mut config: GatewayConfig = serde_yaml::from_value(merged)?;

        if let Some(ref prefix) = self.env_prefix {
            Self::apply_env_overrides(&mut config, prefix, |name| std::env::var(name).ok())?;
        }

        config
            .validate_config()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    async fn load_source(source: &ConfigSource) -> Result<Value, ConfigError> {
        match source {
            ConfigSource::File(path) => Self::load_file(path).await,
            ConfigSource::Yaml(content) => Self::parse_yaml(&substitute_env_vars(content)),
            ConfigSource::Toml(content) => Self::parse_toml(&substitute_env_vars(content)),
            ConfigSource::Json(content) => Self::parse_json(&substitute_env_vars(content)),
            ConfigSource::Default => Ok(serde_yaml::to_value(GatewayConfig::default())?),
        }
    }

    async fn load_file(path: &str) -> Result<Value, ConfigError> {
        let path = Path::new(path);

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let content = fs::read_to_string(path).await?;
        let content = substitute_env_vars(&content);

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        debug!(path = %path.display(), format = %extension, "Loading configuration file");

        match extension.as_str() {
            "yaml" | "yml" => Self::parse_yaml(&content),
            "toml" => Self::parse_toml(&content),
            "json" => Self::parse_json(&content),
            ext => Err(ConfigError::UnsupportedFormat {
                extension: ext.to_string(),
            }),
        }
    }

    fn parse_yaml(content: &str) -> Result<Value, ConfigError> {
        let value: Value = serde_yaml::from_str(content)?;
        // An empty document parses as null
        Ok(if value.is_null() {
            Value::Mapping(serde_yaml::Mapping::new())
        } else {
            value
        })
    }

    fn parse_toml(content: &str) -> Result<Value, ConfigError> {
        let table: toml::Value = toml::from_str(content)?;
        Ok(serde_yaml::to_value(table)?)
    }

    fn parse_json(content: &str) -> Result<Value, ConfigError> {
        let json: serde_json::Value = serde_json::from_str(content)?;
        Ok(serde_yaml::to_value(json)?)
    }

    /// Apply `<PREFIX>_*` overrides using `lookup` to read variables
    fn apply_env_overrides(
        config: &mut GatewayConfig,
        prefix: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let var = |suffix: &str| {
            let name = format!("{prefix}_{suffix}");
            lookup(&name).map(|value| (name, value))
        };

        if let Some((_, host)) = var("SERVER_HOST") {
            config.server.host = host;
        }

        if let Some((name, port)) = var("SERVER_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidOverride { name, value: port })?;
        }

        if let Some((_, level)) = var("LOG_LEVEL") {
            config.observability.logging.level = level;
        }

        if let Some((name, enabled)) = var("METRICS_ENABLED") {
            config.observability.metrics.enabled = enabled
                .parse()
                .map_err(|_| ConfigError::InvalidOverride {
                    name,
                    value: enabled,
                })?;
        }

        if let Some((_, endpoint)) = var("BACKEND_ENDPOINT") {
            config.backend.endpoint = endpoint;
        }

        if let Some((_, url)) = var("CACHE_REDIS_URL") {
            config.cache.redis_url = url;
            config.cache.store = CacheStoreKind::Redis;
        }

        Ok(())
    }
}

/// Recursively merge `overlay` into `base`; mappings merge key by key,
/// anything else is replaced
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Substitute environment variables in content
///
/// Supports `${VAR}` and `${VAR:-default}`. Unset variables without a
/// default are left in place and logged.
#[allow(clippy::expect_used)]
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("valid regex");

    re.replace_all(content, |caps: &Captures<'_>| {
        let name = &caps[1];
        match (std::env::var(name), caps.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                warn!(variable = %name, "Environment variable not found");
                caps[0].to_string()
            }
        }
    })
    .into_owned()
}

/// Load configuration from default locations
///
/// Looks for configuration in order:
/// 1. Path from CONFIG_PATH environment variable
/// 2. ./config.yaml
/// 3. ./config.yml
/// 4. ./config/default.yaml
/// 5. /etc/model-gateway/config.yaml
///
/// Environment overrides with the `MODEL_GATEWAY` prefix are applied in
/// every case.
///
/// # Errors
/// Returns error if the chosen file cannot be parsed or validated
pub async fn load_config() -> Result<GatewayConfig, ConfigError> {
    let loader = ConfigLoader::new().with_env_prefix(ENV_PREFIX);

    if let Ok(path) = std::env::var("CONFIG_PATH") {
        info!(path = %path, "Loading configuration");
        return loader.with_file(path).load().await;
    }

    let search_paths = [
        "config.yaml",
        "config.yml",
        "config/default.yaml",
        "/etc/model-gateway/config.yaml",
    ];

    for path in search_paths {
        if Path::new(path).exists() {
            info!(path = %path, "Loading configuration");
            return loader.with_file(path).load().await;
        }
    }

    warn!("No configuration file found, using defaults");
    loader.with_source(ConfigSource::Default).load().await
}
