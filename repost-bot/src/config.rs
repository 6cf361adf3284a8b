//! Configuration for repost-bot.
//!
//! Config file lives at `~/.config/repost/config.toml` unless `--config`
//! (or `REPOST_CONFIG`) points elsewhere.
//!
//! ```toml
//! [[network]]
//! name = "libera"
//! servers = ["irc.libera.chat:6667", "irc.eu.libera.chat:6667"]
//! nick = "repost"
//!
//! [reconnect]
//! initial_delay_ms = 2000
//! max_delay_ms = 30000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use repost_irc::{ConnectConfig, ReconnectConfig};
use serde::Deserialize;

/// Real name announced when a network doesn't set one.
pub const DEFAULT_REALNAME: &str = "repost bot";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "network", default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

/// One `[[network]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    /// Candidate servers (host:port), tried in order.
    pub servers: Vec<String>,
    pub nick: String,
    /// Username (ident). Defaults to the nick.
    pub user: Option<String>,
    pub realname: Option<String>,
    /// Seconds of silence before the connection is considered dead.
    pub read_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        let defaults = ReconnectConfig::default();
        Self {
            initial_delay_ms: defaults.initial_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            backoff_factor: defaults.backoff_factor,
        }
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(s: &ReconnectSettings) -> Self {
        ReconnectConfig {
            initial_delay: Duration::from_millis(s.initial_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            backoff_factor: s.backoff_factor,
        }
    }
}

pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("repost")
        .join("config.toml")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("can't read config file {}", path.display()))?;
        Self::parse(&s).with_context(|| format!("bad config file {}", path.display()))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.networks.is_empty() {
            bail!("no [[network]] configured");
        }
        for network in &self.networks {
            if network.servers.is_empty() {
                bail!("network {:?} has no servers", network.name);
            }
            if network.nick.is_empty() {
                bail!("network {:?} has an empty nick", network.name);
            }
            if network.read_timeout_secs == Some(0) {
                bail!("network {:?}: read_timeout_secs must be positive", network.name);
            }
        }
        let reconnect = &self.reconnect;
        if reconnect.initial_delay_ms == 0 {
            bail!("reconnect.initial_delay_ms must be positive");
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            bail!("reconnect.max_delay_ms must not be below reconnect.initial_delay_ms");
        }
        if reconnect.backoff_factor < 1.0 {
            bail!("reconnect.backoff_factor must be at least 1.0");
        }
        Ok(())
    }
}

impl NetworkConfig {
    pub fn connect_config(&self, reconnect: &ReconnectSettings) -> ConnectConfig {
        let mut config = ConnectConfig::new(
            self.name.clone(),
            self.servers.clone(),
            self.nick.clone(),
            self.user.clone().unwrap_or_else(|| self.nick.clone()),
            self.realname
                .clone()
                .unwrap_or_else(|| DEFAULT_REALNAME.to_string()),
        );
        if let Some(secs) = self.read_timeout_secs {
            config.read_timeout = Duration::from_secs(secs);
        }
        config.reconnect = reconnect.into();
        config
    }
}
