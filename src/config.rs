//! Client settings.
//!
//! Settings are read from a plain `key = value` file. Blank lines and `#` comments are
//! skipped, and keys this crate does not know about are ignored so one file can be shared
//! with other tools.
//!
//! ```text
//! # cal_client.txt
//! enable_cal = true
//! cal_pool_name = checkout
//! cal_socket_machine_port = 1118
//! ```
use std::{fs, io, path::Path, str::FromStr, time::Duration};

use log::debug;
use thiserror::Error;

use crate::cal::Status;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub enabled: bool,
    pub pool: String,
    pub environment: String,
    pub host: String,
    pub port: u16,
    pub min_status: Status,
    pub build_label: String,
    pub heartbeat_interval: Duration,
    pub max_send_attempts: u32,
    pub backoff_base: Duration,
    pub connect_timeout: Duration,
    pub overflow_threshold: u32,
    pub overflow_backstop: usize,
    pub read_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pool: "play_abc".to_string(),
            environment: "PayPal".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1118,
            min_status: Status::Success,
            build_label: "rust;***;default".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            max_send_attempts: 4,
            backoff_base: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(1),
            overflow_threshold: 64,
            overflow_backstop: 512,
            read_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        debug!("loading config from {}", path.as_ref().display());
        text.parse()
    }

    /// `host:port` of the logging daemon.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "enable_cal" => self.enabled = parse_bool(key, value)?,
            "cal_pool_name" => self.pool = value.to_string(),
            "cal_environment" => self.environment = value.to_string(),
            "cal_socket_machine_name" => self.host = value.to_string(),
            "cal_socket_machine_port" => self.port = parse_num(key, value)?,
            "cal_min_status" => self.min_status = Status::from(value),
            "cal_build_label" => self.build_label = value.to_string(),
            "cal_heartbeat_interval_secs" => {
                self.heartbeat_interval = Duration::from_secs(parse_num(key, value)?)
            }
            "cal_send_max_attempts" => self.max_send_attempts = parse_num(key, value)?,
            "cal_send_backoff_ms" => {
                self.backoff_base = Duration::from_millis(parse_num(key, value)?)
            }
            "cal_socket_connect_timeout_secs" => {
                self.connect_timeout = Duration::from_secs(parse_num(key, value)?)
            }
            "cal_overflow_threshold" => self.overflow_threshold = parse_num(key, value)?,
            "cal_overflow_backstop" => self.overflow_backstop = parse_num(key, value)?,
            "netstring_read_timeout_secs" => {
                self.read_timeout = Duration::from_secs(parse_num(key, value)?)
            }
            _ => debug!("ignoring config key {key}"),
        }
        Ok(())
    }
}

impl FromStr for ClientConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut config = Self::default();
        for line in s.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::InvalidValue {
                    key: line.to_string(),
                    value: String::new(),
                });
            };
            config.apply(key.trim(), value.trim())?;
        }
        Ok(config)
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}
