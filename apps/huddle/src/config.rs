use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::manager::{HostCapabilities, ManagerConfig, ManagerTimings};
use crate::peer::{RelayServer, default_relay_servers};
use crate::signaling::ChannelTimings;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/signal";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a whole number of seconds, got {value:?}")]
    InvalidSeconds { var: &'static str, value: String },
    #[error("{var} must be a boolean, got {value:?}")]
    InvalidBool { var: &'static str, value: String },
    #[error("invalid relay server entry {entry:?}: expected url or url|username|credential")]
    InvalidRelay { entry: String },
}

/// Huddle runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Rendezvous service endpoint; normalised when the connector is built.
    pub signaling_url: String,
    pub relay_servers: Vec<RelayServer>,
    pub clone_media: bool,
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    pub initializing_timeout: Duration,
    pub broken_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let timings = ManagerTimings::default();
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            relay_servers: default_relay_servers(),
            clone_media: HostCapabilities::default().clone_media,
            heartbeat_interval: timings.channel.heartbeat_interval,
            reconnect_interval: timings.channel.reconnect_interval,
            initializing_timeout: timings.initializing_timeout,
            broken_timeout: timings.broken_timeout,
        }
    }
}

impl Config {
    /// Load configuration from `HUDDLE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let value = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(url) = value("HUDDLE_SIGNALING_URL") {
            config.signaling_url = url.trim().to_string();
        }
        if let Some(raw) = value("HUDDLE_RELAY_SERVERS") {
            config.relay_servers = parse_relay_servers(&raw)?;
        }
        if let Some(raw) = value("HUDDLE_CLONE_MEDIA") {
            config.clone_media = parse_bool("HUDDLE_CLONE_MEDIA", &raw)?;
        }
        if let Some(raw) = value("HUDDLE_HEARTBEAT_SECS") {
            config.heartbeat_interval = parse_secs("HUDDLE_HEARTBEAT_SECS", &raw)?;
        }
        if let Some(raw) = value("HUDDLE_RECONNECT_SECS") {
            config.reconnect_interval = parse_secs("HUDDLE_RECONNECT_SECS", &raw)?;
        }
        if let Some(raw) = value("HUDDLE_INITIALIZING_TIMEOUT_SECS") {
            config.initializing_timeout = parse_secs("HUDDLE_INITIALIZING_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = value("HUDDLE_BROKEN_TIMEOUT_SECS") {
            config.broken_timeout = parse_secs("HUDDLE_BROKEN_TIMEOUT_SECS", &raw)?;
        }
        Ok(config)
    }

    pub fn channel_timings(&self) -> ChannelTimings {
        ChannelTimings {
            heartbeat_interval: self.heartbeat_interval,
            reconnect_interval: self.reconnect_interval,
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            relay_servers: self.relay_servers.clone(),
            host: HostCapabilities {
                clone_media: self.clone_media,
            },
            timings: ManagerTimings {
                initializing_timeout: self.initializing_timeout,
                broken_timeout: self.broken_timeout,
                channel: self.channel_timings(),
                ..ManagerTimings::default()
            },
        }
    }
}

fn parse_secs(var: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidSeconds {
            var,
            value: raw.to_string(),
        }),
    }
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var,
            value: raw.to_string(),
        }),
    }
}

/// Parses `url[|username|credential]` entries separated by commas.
pub fn parse_relay_servers(raw: &str) -> Result<Vec<RelayServer>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split('|').map(str::trim).collect();
            match parts.as_slice() {
                [url] if !url.is_empty() => Ok(RelayServer::stun(*url)),
                [url, username, credential] if !url.is_empty() => {
                    Ok(RelayServer::turn(*url, *username, *credential))
                }
                _ => Err(ConfigError::InvalidRelay {
                    entry: entry.to_string(),
                }),
            }
        })
        .collect()
}
