//! Configuration loading.
//!
//! Gateway settings are read from a TOML, YAML or JSON file (format detected
//! from the extension), with `${VAR}` / `$VAR` references substituted from the
//! process environment, and then overridden by `ESGATE_*` environment
//! variables (`__` separates nested keys, e.g. `ESGATE_ELASTICSEARCH__URL`).

mod gateway;

pub use ::config::FileFormat;
pub use gateway::{
    AbTestingConfig, BackendEndpointConfig, GatewayConfig, IndexConfig, RateLimitConfig,
};

use ::config::{Config as Cfg, Environment, File};
use regex::Regex;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Prefix of environment variables overriding file settings.
pub const ENV_PREFIX: &str = "ESGATE";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A loaded configuration violates a structural invariant.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Detect configuration format from file extension.
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Replace `${VAR}` and `$VAR` with the variable's value. Unknown variables
/// are left untouched.
pub fn substitute_env_vars(content: &str) -> ConfigResult<String> {
    let braced = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let bare = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let result = braced.replace_all(content, env_lookup).to_string();
    Ok(bare.replace_all(&result, env_lookup).to_string())
}

fn env_lookup(caps: &regex::Captures<'_>) -> String {
    std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
}

/// Parse configuration from a string in an explicit format.
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let substituted = substitute_env_vars(content)?;

    Cfg::builder()
        .add_source(File::from_str(&substituted, format))
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

/// Load configuration from a file.
pub fn load_config<T>(path: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    from_str(&content, format)
}

/// Load configuration from a file, then apply `{env_prefix}_*` overrides.
pub fn load_with_env<T>(path: &str, env_prefix: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let substituted = substitute_env_vars(&content)?;

    Cfg::builder()
        .add_source(File::from_str(&substituted, format))
        .add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

/// Load and validate the gateway configuration at `path`.
pub fn load_gateway_config(path: &str) -> ConfigResult<GatewayConfig> {
    let cfg: GatewayConfig = load_with_env(path, ENV_PREFIX)?;
    cfg.validate()?;
    Ok(cfg)
}
