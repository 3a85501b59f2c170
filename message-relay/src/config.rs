//! Server configuration.
//!
//! Loaded from an optional TOML file, overridden from the command line and
//! validated once when the server is bound.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::relay::RetryPolicy;

/// Longest bounded wait the server loop may spend accepting.
pub const MAX_ACCEPT_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("port {0} is not available; use 1024-65535, or 0 for an ephemeral port")]
    PortOutOfRange(u16),
    #[error("accept_timeout_ms must be between 1 and {MAX_ACCEPT_TIMEOUT_MS}, got {0}")]
    AcceptTimeout(u64),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen_address: IpAddr,
    pub port: u16,
    pub accept_timeout_ms: u64,
    pub max_frame_bytes: usize,
    pub max_outbound_bytes: usize,
    pub linger_ms: u64,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_queued: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 7777,
            accept_timeout_ms: MAX_ACCEPT_TIMEOUT_MS,
            max_frame_bytes: 64 * 1024,
            max_outbound_bytes: 256 * 1024,
            linger_ms: 1000,
            relay: RelayConfig::default(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_queued: 256,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port != 0 && self.port < 1024 {
            return Err(ConfigError::PortOutOfRange(self.port));
        }
        if !(1..=MAX_ACCEPT_TIMEOUT_MS).contains(&self.accept_timeout_ms) {
            return Err(ConfigError::AcceptTimeout(self.accept_timeout_ms));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Zero("max_frame_bytes"));
        }
        if self.max_outbound_bytes == 0 {
            return Err(ConfigError::Zero("max_outbound_bytes"));
        }
        if self.relay.max_attempts == 0 {
            return Err(ConfigError::Zero("relay.max_attempts"));
        }
        if self.relay.max_queued == 0 {
            return Err(ConfigError::Zero("relay.max_queued"));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.port)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.relay.max_attempts,
            initial_backoff: Duration::from_millis(self.relay.initial_backoff_ms),
            max_queued: self.relay.max_queued,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::parse("").expect("parse");
        assert_eq!(config, Config::default());
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn loads_partial_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "listen_address = \"127.0.0.1\"\nport = 8888\n\n[relay]\nmax_attempts = 2"
        )
        .expect("write config");

        let config = Config::load(file.path()).expect("load");
        assert_eq!(config.socket_addr(), "127.0.0.1:8888".parse().unwrap());
        assert_eq!(config.relay.max_attempts, 2);
        assert_eq!(config.relay.initial_backoff_ms, 50);
        assert_eq!(config.retry_policy().max_queued, 256);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            Config::parse("prot = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::load("/definitely/not/here.toml").expect_err("missing");
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }

    #[test]
    fn privileged_ports_are_rejected() {
        let config = Config {
            port: 80,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PortOutOfRange(80))
        ));

        for port in [0, 1024, 65535] {
            let config = Config {
                port,
                ..Config::default()
            };
            config.validate().expect("port is allowed");
        }
    }

    #[test]
    fn accept_timeout_is_bounded() {
        for accept_timeout_ms in [0, MAX_ACCEPT_TIMEOUT_MS + 1] {
            let config = Config {
                accept_timeout_ms,
                ..Config::default()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::AcceptTimeout(_))
            ));
        }
    }

    #[test]
    fn empty_relay_backlog_is_rejected() {
        let config = Config::parse("[relay]\nmax_queued = 0").expect("parse");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("relay.max_queued"))
        ));
    }
}
