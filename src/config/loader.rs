use super::schema::ProxyConfig;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::Path;

const ENV_PREFIX: &str = "CAPTURE_PROXY_";

pub async fn load_from_env_or_file() -> Result<ProxyConfig> {
    let config: ProxyConfig = Figment::new()
        // Try to load from various config files
        .merge(Toml::file("capture-proxy.toml"))
        .merge(Json::file("capture-proxy.json"))
        .merge(Yaml::file("capture-proxy.yaml"))
        .merge(Yaml::file("capture-proxy.yml"))
        // Override with environment variables (CAPTURE_PROXY_ prefix)
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;

    Ok(config)
}

pub async fn load_from_path(path: &Path) -> Result<ProxyConfig> {
    let figment = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(format!(
                "Unsupported config file format: {}",
                path.display()
            ))
            .into())
        }
    };

    if !path.exists() {
        return Err(ConfigError::Parse(format!("Config file not found: {}", path.display())).into());
    }

    let config: ProxyConfig = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;

    Ok(config)
}

pub fn validate(config: &ProxyConfig) -> Result<()> {
    if config.host.trim().is_empty() {
        return Err(ConfigError::Validation("Listener host must not be empty".into()).into());
    }

    if config.connect_timeout_ms == 0 || config.origin_timeout_ms == 0 {
        return Err(
            ConfigError::Validation("Relay timeouts must be greater than 0".into()).into(),
        );
    }

    if config.tls.enabled {
        if config.port != 0 && config.port == config.tls.port {
            return Err(ConfigError::Validation(
                "HTTP and TLS listener ports must be different".into(),
            )
            .into());
        }

        if config.tls.hosts.iter().all(|h| h.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "TLS listener needs at least one certificate host".into(),
            )
            .into());
        }
    }

    Ok(())
}
