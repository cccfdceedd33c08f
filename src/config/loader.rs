/// Configuration loading from TOML file plus `TWSC_*` environment overrides
use ::config::{Environment, File, FileFormat};
use std::path::Path;

use crate::error::{Result, TwsError};
use crate::types::ClientConfig;

pub const ENV_PREFIX: &str = "TWSC";

/// Load and validate; the file must exist
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ClientConfig> {
    build(Some(path.as_ref()), true, ENV_PREFIX)
}

/// Like [`load_config`] but falls back to defaults when the file is absent
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> Result<ClientConfig> {
    build(Some(path.as_ref()), false, ENV_PREFIX)
}

fn build(path: Option<&Path>, required: bool, env_prefix: &str) -> Result<ClientConfig> {
    let mut builder = ::config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(required));
    }
    builder = builder.add_source(Environment::with_prefix(env_prefix).try_parsing(true));

    let config: ClientConfig = builder
        .build()
        .and_then(|settings| settings.try_deserialize())
        .map_err(|e| TwsError::ConfigError(format!("Failed to load config: {}", e)))?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &ClientConfig) -> Result<()> {
    // Connection
    if config.host.trim().is_empty() {
        return Err(TwsError::ConfigError("host is empty".to_string()));
    }
    if config.port == 0 {
        return Err(TwsError::ConfigError("port must be non-zero".to_string()));
    }

    // Timeouts
    if config.connect_timeout_sec == 0
        || config.disconnect_timeout_sec == 0
        || config.request_timeout_sec == 0
    {
        return Err(TwsError::ConfigError("timeouts must be > 0".to_string()));
    }

    // Pacing
    if config.pacing_max_requests == 0 || config.pacing_window_sec == 0 {
        return Err(TwsError::ConfigError(format!(
            "Invalid pacing: {} requests per {}s",
            config.pacing_max_requests, config.pacing_window_sec
        )));
    }

    if config.cache_dir.as_os_str().is_empty() {
        return Err(TwsError::ConfigError("cache_dir is empty".to_string()));
    }

    Ok(())
}

/// Write the default configuration as TOML
pub fn write_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
    let content = toml::to_string_pretty(&ClientConfig::default())
        .map_err(|e| TwsError::ConfigError(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, content)?;
    Ok(())
}
