//! Persistent configuration for the playdate CLI.
//!
//! Config file lives at `~/.config/playdate/cli.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use playdate_sdk::ClientConfig;
use playdate_sdk::connection::ReconnectPolicy;
use serde::{Deserialize, Serialize};

/// User configuration (persisted in cli.toml).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Websocket endpoint, e.g. wss://api.playdate.app/ws
    pub socket_url: Option<String>,
    /// Base URL of the REST API.
    pub api_base_url: Option<String>,
    /// Fixed reconnect delay in milliseconds.
    pub reconnect_ms: Option<u64>,
    /// Cap for exponential reconnect backoff. When set, backoff replaces the
    /// fixed delay and `reconnect_ms` becomes its base.
    pub reconnect_max_ms: Option<u64>,
    /// Delay before the in-band token handshake.
    pub verify_delay_ms: Option<u64>,
    /// Where the session token is stored.
    pub token_file: Option<PathBuf>,
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("playdate")
}

pub fn default_path() -> PathBuf {
    config_dir().join("cli.toml")
}

impl Config {
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(s) => match toml::from_str(&s) {
                    Ok(c) => return c,
                    Err(e) => tracing::warn!("bad config file {}: {e}", path.display()),
                },
                Err(e) => tracing::warn!("can't read {}: {e}", path.display()),
            }
        }
        Self::default()
    }
}

/// Effective settings after merging CLI args > config file > defaults.
pub struct Resolved {
    pub client: ClientConfig,
    pub token_file: Option<PathBuf>,
}

impl Resolved {
    pub fn merge(cli: &super::Cli, config: &Config) -> Self {
        let defaults = ClientConfig::default();

        let socket_url = cli.socket_url.clone()
            .or_else(|| config.socket_url.clone())
            .unwrap_or(defaults.socket_url.clone());
        let api_base_url = cli.api_url.clone()
            .or_else(|| config.api_base_url.clone())
            .unwrap_or(defaults.api_base_url.clone());

        let reconnect_ms = cli.reconnect_ms.or(config.reconnect_ms);
        let reconnect = match (reconnect_ms, config.reconnect_max_ms) {
            (base, Some(max)) => ReconnectPolicy::Backoff {
                base: Duration::from_millis(base.unwrap_or(1000)),
                max: Duration::from_millis(max),
                factor: 2.0,
            },
            (Some(ms), None) => ReconnectPolicy::Fixed(Duration::from_millis(ms)),
            (None, None) => defaults.reconnect.clone(),
        };

        let verify_delay = config.verify_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.verify_delay);

        let token_file = cli.token_file.clone().or_else(|| config.token_file.clone());

        Self {
            client: ClientConfig {
                socket_url,
                api_base_url,
                reconnect,
                verify_delay,
                ..defaults
            },
            token_file,
        }
    }
}
