//! Persisted credentials at `~/.warp/config.json`, generated on first run
//! and reused across invocations.

use std::fs;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use warp_proto::{prefixed_token, random_token};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub credentials: Credentials,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("cannot locate home directory")]
    NoHome,
}

pub fn config_path() -> Result<PathBuf, ConfigError> {
    let base = BaseDirs::new().ok_or(ConfigError::NoHome)?;
    Ok(base.home_dir().join(".warp").join("config.json"))
}

/// Read the config, generating fresh credentials on first run.
pub fn load_or_generate() -> Result<Config, ConfigError> {
    load_or_generate_at(&config_path()?)
}

pub fn load_or_generate_at(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        let raw = fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&raw)?);
    }

    let config = Config {
        credentials: Credentials {
            user: prefixed_token("guest"),
            secret: random_token(),
        },
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(&config)?)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    }
    Ok(config)
}

/// Human label attached to sessions; purely cosmetic.
pub fn username() -> String {
    std::env::var("USER")
        .ok()
        .filter(|user| !user.is_empty())
        .unwrap_or_else(|| "guest".to_string())
}
