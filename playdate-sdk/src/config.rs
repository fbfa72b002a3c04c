//! Client configuration.

use std::time::Duration;

use crate::cache::DEFAULT_TTL;
use crate::connection::ReconnectPolicy;
use crate::error::{Error, Result};

pub const DEFAULT_SOCKET_URL: &str = "wss://api.playdate.app/ws";
pub const DEFAULT_API_BASE_URL: &str = "https://api.playdate.app";

/// Delay between the socket opening (with a verified token) and the in-band
/// `verifyToken` handshake.
pub const VERIFY_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_url: String,
    pub api_base_url: String,
    pub reconnect: ReconnectPolicy,
    pub verify_delay: Duration,
    /// Lifetime of profile and kid cache entries.
    pub cache_ttl: Duration,
    /// Capacity of the [`crate::Event`] channel. Events are dropped, not
    /// awaited, when the consumer falls behind.
    pub event_capacity: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
            verify_delay: VERIFY_DELAY,
            cache_ttl: DEFAULT_TTL,
            event_capacity: 1024,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.socket_url.starts_with("ws://") || self.socket_url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "socket url must be ws:// or wss://, got {}",
                self.socket_url
            )));
        }
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "api base url must be http:// or https://, got {}",
                self.api_base_url
            )));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event capacity must be positive".to_string()));
        }
        if self.cache_ttl.is_zero() {
            return Err(Error::Config("cache ttl must be positive".to_string()));
        }
        if let ReconnectPolicy::Backoff { base, max, .. } = &self.reconnect {
            if base.is_zero() || max < base {
                return Err(Error::Config("backoff needs 0 < base <= max".to_string()));
            }
        }
        Ok(())
    }
}
