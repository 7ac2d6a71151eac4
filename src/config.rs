use bridge_core::config::{BridgeConfig, ConfigError};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_VERTO_URL: &str = "FREESWITCH_VERTO_WS_URL";
pub const ENV_VERTO_LOGIN: &str = "FREESWITCH_VERTO_LOGIN";
pub const ENV_VERTO_PASSWORD: &str = "FREESWITCH_VERTO_PASS";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Reads, overrides from the process environment, and validates.
pub fn load(path: &Path) -> Result<BridgeConfig, LoadError> {
    load_with_env(path, |key| std::env::var(key).ok())
}

pub fn load_with_env(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<BridgeConfig, LoadError> {
    let raw = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config = parse(&raw).map_err(|source| LoadError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    apply_env(&mut config, env);
    config.validate()?;
    Ok(config)
}

pub fn parse(raw: &str) -> Result<BridgeConfig, serde_yaml::Error> {
    if raw.trim().is_empty() {
        return Ok(BridgeConfig::default());
    }
    serde_yaml::from_str(raw)
}

/// The media server connection may be supplied by the environment, which
/// wins over the file.
pub fn apply_env(config: &mut BridgeConfig, env: impl Fn(&str) -> Option<String>) {
    let overrides = [
        (ENV_VERTO_URL, &mut config.verto.url),
        (ENV_VERTO_LOGIN, &mut config.verto.login),
        (ENV_VERTO_PASSWORD, &mut config.verto.password),
    ];
    for (key, field) in overrides {
        if let Some(value) = env(key).filter(|v| !v.is_empty()) {
            *field = value;
        }
    }
}
