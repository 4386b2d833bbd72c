//! Configuration for the relay.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::ConfigError;
use crate::observability::ObservabilityConfig;
use crate::relay::{DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS, RelaySettings};

/// Main configuration for the relay process.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub observability: ObservabilityConfig,
    /// Base URL used by the `tab`, `channels` and `exec` commands.
    pub relay_url: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            server: ServerConfig::from_env()?,
            relay: RelayConfig::from_env()?,
            observability: ObservabilityConfig {
                backend: optional_env("OBSERVABILITY_BACKEND")?
                    .unwrap_or_else(|| "none".to_string()),
            },
            relay_url: optional_env("RELAY_URL")?
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
        })
    }
}

/// HTTP bind configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
}

impl ServerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: parse_optional_env("SERVER_HOST", IpAddr::from([127, 0, 0, 1]))?,
            port: parse_optional_env("SERVER_PORT", 3000)?,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Relay timing and CORS configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub keepalive_secs: u64,
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_timeout_ms: MAX_TIMEOUT_MS,
            keepalive_secs: 30,
            allowed_origins: Vec::new(),
        }
    }
}

impl RelayConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            default_timeout_ms: parse_optional_env(
                "RELAY_DEFAULT_TIMEOUT_MS",
                defaults.default_timeout_ms,
            )?,
            max_timeout_ms: parse_optional_env("RELAY_MAX_TIMEOUT_MS", defaults.max_timeout_ms)?,
            keepalive_secs: parse_optional_env("RELAY_KEEPALIVE_SECS", defaults.keepalive_secs)?,
            allowed_origins: optional_env("RELAY_ALLOWED_ORIGINS")?
                .map(|s| parse_origins(&s))
                .unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_KEEPALIVE_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_DEFAULT_TIMEOUT_MS".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.max_timeout_ms < self.default_timeout_ms {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_MAX_TIMEOUT_MS".to_string(),
                message: format!(
                    "{} is below the default timeout of {}",
                    self.max_timeout_ms, self.default_timeout_ms
                ),
            });
        }
        Ok(())
    }

    pub fn settings(&self) -> RelaySettings {
        RelaySettings {
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            max_timeout: Duration::from_millis(self.max_timeout_ms),
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

/// Which transport a tab uses to reach the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportChoice {
    #[default]
    Sse,
    WebSocket,
}

impl std::str::FromStr for TransportChoice {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sse" | "http" => Ok(Self::Sse),
            "ws" | "websocket" => Ok(Self::WebSocket),
            _ => Err(ConfigError::InvalidValue {
                key: "transport".to_string(),
                message: format!("unknown transport: {s}, expected 'sse' or 'ws'"),
            }),
        }
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_choice_parsing() {
        assert_eq!("sse".parse::<TransportChoice>().unwrap(), TransportChoice::Sse);
        assert_eq!("WS".parse::<TransportChoice>().unwrap(), TransportChoice::WebSocket);
        assert_eq!(
            "websocket".parse::<TransportChoice>().unwrap(),
            TransportChoice::WebSocket
        );
        assert!("carrier-pigeon".parse::<TransportChoice>().is_err());
    }

    #[test]
    fn test_origins_are_trimmed() {
        assert_eq!(
            parse_origins(" https://www.owlbear.rodeo, ,http://localhost:5173"),
            vec!["https://www.owlbear.rodeo", "http://localhost:5173"]
        );
    }

    #[test]
    fn test_relay_defaults_are_valid() {
        let config = RelayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.settings().default_timeout, Duration::from_secs(30));
        assert_eq!(config.keepalive(), Duration::from_secs(30));
    }

    #[test]
    fn test_max_below_default_is_rejected() {
        let config = RelayConfig {
            default_timeout_ms: 30_000,
            max_timeout_ms: 1_000,
            ..RelayConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("RELAY_MAX_TIMEOUT_MS"));
    }

    #[test]
    fn test_unset_variable_takes_default() {
        let port: u16 = parse_optional_env("OBR_RELAY_TEST_UNSET_PORT", 4242).unwrap();
        assert_eq!(port, 4242);
    }
}
