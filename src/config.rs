//! Configuration module for the position feed

use rust_decimal::Decimal;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FeedError, Result};
use crate::parser::Channel;
use crate::risk::RiskParams;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket endpoint of the position stream
    pub ws_endpoint: String,

    /// REST API endpoint for position snapshots, if any
    pub rest_endpoint: Option<String>,
    /// Per-request limit for snapshot fetches
    pub rest_timeout_ms: u64,

    /// Channels subscribed on every connect
    pub channels: Vec<Channel>,

    /// IPC socket path for publishing risk reports, if any
    pub ipc_socket_path: Option<String>,

    /// Health server bind address
    pub health_addr: SocketAddr,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// Zero means retry forever
    pub max_reconnect_attempts: u32,
    /// A session that stayed up this long resets the backoff
    pub backoff_reset_secs: u64,

    /// Heartbeat settings
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub connect_timeout_ms: u64,

    /// Capacity of the event broadcast channel
    pub event_buffer: usize,

    pub risk: RiskParams,

    /// Status logging interval in seconds
    pub status_log_interval_secs: u64,

    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mut channels: Vec<Channel> = match lookup("CHANNELS") {
            Some(raw) => parse_list(&raw)
                .map(|name| name.parse())
                .collect::<Result<_>>()?,
            None => defaults.channels.clone(),
        };
        if let Some(raw) = lookup("SYMBOLS") {
            for symbol in parse_list(&raw) {
                let channel = Channel::MarkPrice(symbol.to_uppercase());
                if !channels.contains(&channel) {
                    channels.push(channel);
                }
            }
        }

        let log_format = match lookup("LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("json") => LogFormat::Json,
            Some("pretty") => LogFormat::Pretty,
            Some(other) => {
                return Err(FeedError::ConfigError(format!("LOG_FORMAT: unknown format {}", other)))
            }
        };

        let config = Self {
            ws_endpoint: lookup("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            rest_endpoint: non_empty(lookup("REST_ENDPOINT")),
            rest_timeout_ms: parse_var(&lookup, "REST_TIMEOUT_MS", defaults.rest_timeout_ms)?,
            channels,
            ipc_socket_path: non_empty(lookup("IPC_SOCKET_PATH")),
            health_addr: parse_var(&lookup, "HEALTH_ADDR", defaults.health_addr)?,
            reconnect_delay_ms: parse_var(&lookup, "RECONNECT_DELAY_MS", defaults.reconnect_delay_ms)?,
            max_reconnect_delay_ms: parse_var(
                &lookup,
                "MAX_RECONNECT_DELAY_MS",
                defaults.max_reconnect_delay_ms,
            )?,
            max_reconnect_attempts: parse_var(
                &lookup,
                "MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            backoff_reset_secs: parse_var(&lookup, "BACKOFF_RESET_SECS", defaults.backoff_reset_secs)?,
            heartbeat_interval_ms: parse_var(
                &lookup,
                "HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            )?,
            heartbeat_timeout_ms: parse_var(
                &lookup,
                "HEARTBEAT_TIMEOUT_MS",
                defaults.heartbeat_timeout_ms,
            )?,
            connect_timeout_ms: parse_var(&lookup, "CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms)?,
            event_buffer: parse_var(&lookup, "EVENT_BUFFER", defaults.event_buffer)?,
            risk: RiskParams {
                maint_margin_rate: parse_var::<Decimal, _>(
                    &lookup,
                    "MAINT_MARGIN_RATE",
                    defaults.risk.maint_margin_rate,
                )?,
                warning_ratio: parse_var(&lookup, "WARNING_RATIO", defaults.risk.warning_ratio)?,
                danger_ratio: parse_var(&lookup, "DANGER_RATIO", defaults.risk.danger_ratio)?,
            },
            status_log_interval_secs: parse_var(
                &lookup,
                "STATUS_LOG_INTERVAL_SECS",
                defaults.status_log_interval_secs,
            )?,
            log_format,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the feed cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(FeedError::ConfigError("no channels configured".to_string()));
        }
        if self.reconnect_delay_ms == 0 || self.max_reconnect_delay_ms < self.reconnect_delay_ms {
            return Err(FeedError::ConfigError(
                "MAX_RECONNECT_DELAY_MS must be at least RECONNECT_DELAY_MS, which must be non-zero"
                    .to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(FeedError::ConfigError(
                "HEARTBEAT_TIMEOUT_MS must exceed a non-zero HEARTBEAT_INTERVAL_MS".to_string(),
            ));
        }
        if self.rest_timeout_ms == 0 {
            return Err(FeedError::ConfigError("REST_TIMEOUT_MS must be non-zero".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(FeedError::ConfigError("EVENT_BUFFER must be non-zero".to_string()));
        }
        let risk = &self.risk;
        if risk.maint_margin_rate < Decimal::ZERO || risk.maint_margin_rate >= Decimal::ONE {
            return Err(FeedError::ConfigError("MAINT_MARGIN_RATE must be in [0, 1)".to_string()));
        }
        if !(Decimal::ZERO < risk.warning_ratio
            && risk.warning_ratio <= risk.danger_ratio
            && risk.danger_ratio <= Decimal::ONE)
        {
            return Err(FeedError::ConfigError(
                "expected 0 < WARNING_RATIO <= DANGER_RATIO <= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn backoff_reset_after(&self) -> Duration {
        Duration::from_secs(self.backoff_reset_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn rest_timeout(&self) -> Duration {
        Duration::from_millis(self.rest_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_endpoint: "ws://127.0.0.1:9443/ws".to_string(),
            rest_endpoint: None,
            rest_timeout_ms: 5_000,
            channels: vec![Channel::Positions, Channel::Account],
            ipc_socket_path: None,
            health_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 60_000,
            max_reconnect_attempts: 10,
            backoff_reset_secs: 300,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 45_000,
            connect_timeout_ms: 10_000,
            event_buffer: 1024,
            risk: RiskParams::default(),
            status_log_interval_secs: 30,
            log_format: LogFormat::Json,
        }
    }
}

fn parse_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| FeedError::ConfigError(format!("{}: {}", key, e))),
        None => Ok(default),
    }
}
