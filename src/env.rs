use anyhow::{Context, Result};
use dotenv::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::rabbitmq::ChannelConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub amqp_addr: String,
    pub rabbitmq_reconnect_interval_ms: u64,
    pub rabbitmq_prefetch_count: u16,
    pub rabbitmq_connect_timeout_seconds: u64,
    pub rabbitmq_max_recovery_attempts: Option<u32>,
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

impl Config {
    /// Reads the process environment after loading `.env`, if there is one.
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset optional keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let amqp_addr = lookup("AMQP_ADDR").context("AMQP_ADDR must be set")?;
        Ok(Config {
            amqp_addr,
            rabbitmq_reconnect_interval_ms: parse_or(&lookup, "RABBITMQ_RECONNECT_INTERVAL_MS", default_reconnect_interval_ms)?,
            rabbitmq_prefetch_count: parse_or(&lookup, "RABBITMQ_PREFETCH_COUNT", default_prefetch_count)?,
            rabbitmq_connect_timeout_seconds: parse_or(&lookup, "RABBITMQ_CONNECT_TIMEOUT_SECONDS", default_connect_timeout_seconds)?,
            rabbitmq_max_recovery_attempts: match lookup("RABBITMQ_MAX_RECOVERY_ATTEMPTS") {
                Some(val) => Some(
                    val.parse()
                        .context("RABBITMQ_MAX_RECOVERY_ATTEMPTS must be a number")?,
                ),
                None => None,
            },
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.rabbitmq_connect_timeout_seconds)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.rabbitmq_reconnect_interval_ms)
    }

    /// Channel settings with a fresh id and this config's recovery policy.
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            reconnect_interval: Some(self.reconnect_interval()),
            max_recovery_attempts: self.rabbitmq_max_recovery_attempts,
            ..ChannelConfig::default()
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: fn() -> T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(val) => val
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", key, val)),
        None => Ok(default()),
    }
}
