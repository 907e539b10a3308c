//! Daemon configuration (§6): a TOML file where every field is optional and
//! falls back to a documented default, matching the "everything optional"
//! shape the connection pool's own config struct uses upstream.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub log_level: Option<String>,
    pub reusable_ttl_secs: Option<u64>,
    pub share_ttl_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub reusable_ttl_secs: u64,
    pub share_ttl_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            log_level: "info".to_string(),
            reusable_ttl_secs: 12 * 60 * 60,
            share_ttl_secs: 5,
            connect_timeout_secs: 10,
        }
    }
}

impl From<ConfigFile> for Config {
    fn from(file: ConfigFile) -> Config {
        let defaults = Config::default();
        Config {
            log_level: file.log_level.unwrap_or(defaults.log_level),
            reusable_ttl_secs: file.reusable_ttl_secs.unwrap_or(defaults.reusable_ttl_secs),
            share_ttl_secs: file.share_ttl_secs.unwrap_or(defaults.share_ttl_secs),
            connect_timeout_secs: file.connect_timeout_secs.unwrap_or(defaults.connect_timeout_secs),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file at {}", path.display()))?;
        let file: ConfigFile = toml::from_str(&contents)
            .with_context(|| format!("parsing config file at {}", path.display()))?;
        Ok(file.into())
    }
}
