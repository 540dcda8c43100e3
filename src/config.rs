#![forbid(unsafe_code)]

// Server configuration, read from environment variables

use crate::media::{MediaConfig, TransportConfig, WorkerConfig};
use crate::session::CoordinatorSettings;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_ANNOUNCE_IP: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_MAX_CONSUMERS_PER_PARTICIPANT: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("RTC port range is inverted: {min} > {max}")]
    InvertedPortRange { min: u16, max: u16 },

    #[error("MEDIA_ENGINE={0} requires building with the `mediasoup` feature")]
    EngineUnavailable(String),
}

/// Which media engine backs the routers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Mediasoup,
    /// In-process engine without real media; for tests and local development
    Loopback,
}

impl EngineKind {
    fn default_for_build() -> Self {
        if cfg!(feature = "mediasoup") {
            EngineKind::Mediasoup
        } else {
            EngineKind::Loopback
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Mediasoup => f.write_str("mediasoup"),
            EngineKind::Loopback => f.write_str("loopback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub engine: EngineKind,
    pub media: MediaConfig,
    pub coordinator: CoordinatorSettings,
    pub max_connections: usize,
    /// Bearer token guarding `/metrics`; open when unset
    pub metrics_token: Option<String>,
    pub log_format: LogFormat,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("port", &self.port)
            .field("engine", &self.engine)
            .field("media", &self.media)
            .field("coordinator", &self.coordinator)
            .field("max_connections", &self.max_connections)
            .field("metrics_token", &self.metrics_token.as_ref().map(|_| "[REDACTED]"))
            .field("log_format", &self.log_format)
            .finish()
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|e: T::Err| ConfigError::InvalidValue {
            name,
            value: raw.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn positive(name: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            name,
            value: "0".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Builds the configuration from a variable map (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = parse_var(vars, "PORT")?.unwrap_or(DEFAULT_PORT);

        let engine = match vars.get("MEDIA_ENGINE").map(|v| v.trim().to_ascii_lowercase()) {
            None => EngineKind::default_for_build(),
            Some(v) if v.is_empty() => EngineKind::default_for_build(),
            Some(v) if v == "loopback" => EngineKind::Loopback,
            Some(v) if v == "mediasoup" => {
                if !cfg!(feature = "mediasoup") {
                    return Err(ConfigError::EngineUnavailable(v));
                }
                EngineKind::Mediasoup
            }
            Some(v) => {
                return Err(ConfigError::InvalidValue {
                    name: "MEDIA_ENGINE",
                    value: v,
                    reason: "expected `mediasoup` or `loopback`".to_string(),
                });
            }
        };

        let announce_ip: IpAddr =
            parse_var(vars, "ANNOUNCE_IP")?.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let mut worker_config = WorkerConfig::default();
        if let Some(n) = parse_var(vars, "MEDIA_WORKERS")? {
            worker_config.num_workers = positive("MEDIA_WORKERS", n)?;
        }
        if let Some(port) = parse_var(vars, "RTC_MIN_PORT")? {
            worker_config.rtc_min_port = port;
        }
        if let Some(port) = parse_var(vars, "RTC_MAX_PORT")? {
            worker_config.rtc_max_port = port;
        }
        if worker_config.rtc_min_port > worker_config.rtc_max_port {
            return Err(ConfigError::InvertedPortRange {
                min: worker_config.rtc_min_port,
                max: worker_config.rtc_max_port,
            });
        }
        if let Some(base) = parse_var(vars, "WEBRTC_SERVER_PORT_BASE")? {
            worker_config.webrtc_server_port_base = base;
        }
        worker_config.dtls_certificate_file = vars.get("DTLS_CERT_FILE").cloned();
        worker_config.dtls_private_key_file = vars.get("DTLS_KEY_FILE").cloned();

        let transport_config = TransportConfig::default().with_public_ip(announce_ip);
        let media = MediaConfig::new(worker_config, transport_config);

        let engine_timeout_ms = parse_var(vars, "ENGINE_TIMEOUT_MS")?.unwrap_or(DEFAULT_ENGINE_TIMEOUT_MS);
        if engine_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                name: "ENGINE_TIMEOUT_MS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let max_participants_per_room = parse_var(vars, "MAX_PARTICIPANTS_PER_ROOM")?
            .map(|n| positive("MAX_PARTICIPANTS_PER_ROOM", n))
            .transpose()?;
        let max_consumers_per_participant = positive(
            "MAX_CONSUMERS_PER_PARTICIPANT",
            parse_var(vars, "MAX_CONSUMERS_PER_PARTICIPANT")?
                .unwrap_or(DEFAULT_MAX_CONSUMERS_PER_PARTICIPANT),
        )?;
        let coordinator = CoordinatorSettings {
            engine_timeout: Duration::from_millis(engine_timeout_ms),
            max_participants_per_room,
            max_consumers_per_participant,
            ..CoordinatorSettings::default()
        };

        let max_connections = positive(
            "MAX_CONNECTIONS",
            parse_var(vars, "MAX_CONNECTIONS")?.unwrap_or(DEFAULT_MAX_CONNECTIONS),
        )?;

        let metrics_token = vars
            .get("METRICS_TOKEN")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let log_format = match vars.get("LOG_FORMAT").map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            port,
            engine,
            media,
            coordinator,
            max_connections,
            metrics_token,
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = ServerConfig::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.engine, EngineKind::default_for_build());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.coordinator.engine_timeout, Duration::from_secs(5));
        assert_eq!(config.coordinator.max_participants_per_room, None);
        assert_eq!(config.coordinator.max_consumers_per_participant, 32);
        assert_eq!(config.media.worker_config.rtc_min_port, 10000);
        assert_eq!(config.media.worker_config.rtc_max_port, 59999);
        assert_eq!(config.media.worker_config.webrtc_server_port_base, 44444);
        assert_eq!(
            config.media.transport_config.announced_address.as_deref(),
            Some(DEFAULT_ANNOUNCE_IP)
        );
        assert!(config.metrics_token.is_none());
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn overrides_are_applied() {
        let config = ServerConfig::from_vars(&vars(&[
            ("PORT", "8080"),
            ("ANNOUNCE_IP", "203.0.113.9"),
            ("MEDIA_ENGINE", "loopback"),
            ("MEDIA_WORKERS", "3"),
            ("ENGINE_TIMEOUT_MS", "250"),
            ("MAX_PARTICIPANTS_PER_ROOM", "12"),
            ("MAX_CONSUMERS_PER_PARTICIPANT", "8"),
            ("METRICS_TOKEN", "s3cret"),
            ("LOG_FORMAT", "JSON"),
        ]))
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.engine, EngineKind::Loopback);
        assert_eq!(config.media.worker_config.num_workers, 3);
        assert_eq!(config.coordinator.engine_timeout, Duration::from_millis(250));
        assert_eq!(config.coordinator.max_participants_per_room, Some(12));
        assert_eq!(config.coordinator.max_consumers_per_participant, 8);
        assert_eq!(config.metrics_token.as_deref(), Some("s3cret"));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.media.transport_config.announced_address.as_deref(),
            Some("203.0.113.9")
        );
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = ServerConfig::from_vars(&vars(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "PORT", .. }));

        let err = ServerConfig::from_vars(&vars(&[("MAX_CONNECTIONS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "MAX_CONNECTIONS", .. }));

        let err = ServerConfig::from_vars(&vars(&[("ANNOUNCE_IP", "not-an-ip")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "ANNOUNCE_IP", .. }));
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let err = ServerConfig::from_vars(&vars(&[("RTC_MIN_PORT", "40000"), ("RTC_MAX_PORT", "30000")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::InvertedPortRange { min: 40000, max: 30000 });
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let err = ServerConfig::from_vars(&vars(&[("MEDIA_ENGINE", "janus")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "MEDIA_ENGINE", .. }));
    }

    #[cfg(not(feature = "mediasoup"))]
    #[test]
    fn mediasoup_needs_the_feature() {
        let err = ServerConfig::from_vars(&vars(&[("MEDIA_ENGINE", "mediasoup")])).unwrap_err();
        assert_eq!(err, ConfigError::EngineUnavailable("mediasoup".to_string()));
    }

    #[test]
    fn debug_output_redacts_metrics_token() {
        let config = ServerConfig::from_vars(&vars(&[("METRICS_TOKEN", "s3cret")])).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
