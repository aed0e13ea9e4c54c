use std::{
    collections::HashSet,
    env,
    net::{AddrParseError, SocketAddr},
    time::Duration,
};

use thiserror::Error;

use crate::attribution::store::TableName;
use crate::db::PoolConfig;
use crate::identity::IdentityFallback;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub build_sha: String,
    pub db_url: Option<String>,
    pub table: TableName,
    pub db_pool: PoolConfig,
    pub request_timeout_ms: u64,
    pub identity_fallback: IdentityFallback,
    pub allowed_variants: HashSet<String>,
    pub default_device_type: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid ATTRIBUTION_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid ATTRIBUTION_TABLE: {0}")]
    InvalidTable(String),
    #[error("invalid connection pool setting: {0}")]
    InvalidPoolConfig(String),
    #[error("invalid ATTRIBUTION_REQUEST_TIMEOUT_MS: {0}")]
    InvalidRequestTimeout(String),
    #[error("invalid ATTRIBUTION_IDENTITY_FALLBACK: {0}")]
    InvalidIdentityFallback(String),
    #[error("invalid ATTRIBUTION_ALLOWED_VARIANTS: {0}")]
    InvalidAllowedVariants(String),
    #[error("invalid ATTRIBUTION_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = lookup("ATTRIBUTION_BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .trim()
            .parse()?;
        let service_name = lookup("ATTRIBUTION_SERVICE_NAME")
            .unwrap_or_else(|| "deeplink-attribution".to_string());
        let build_sha = lookup("ATTRIBUTION_BUILD_SHA").unwrap_or_else(|| "dev".to_string());
        let db_url = lookup("DB_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let table = match lookup("ATTRIBUTION_TABLE") {
            Some(raw) if !raw.trim().is_empty() => {
                TableName::parse(&raw).map_err(ConfigError::InvalidTable)?
            }
            _ => TableName::default(),
        };

        let defaults = PoolConfig::default();
        let max_connections = parse_u64_lookup(
            &lookup,
            "ATTRIBUTION_DB_MAX_CONNECTIONS",
            defaults.max_connections as u64,
            1,
            1_024,
        )
        .map_err(ConfigError::InvalidPoolConfig)? as usize;
        let max_idle_connections = parse_u64_lookup(
            &lookup,
            "ATTRIBUTION_DB_MAX_IDLE_CONNECTIONS",
            defaults.max_idle_connections as u64,
            0,
            1_024,
        )
        .map_err(ConfigError::InvalidPoolConfig)? as usize;
        let acquire_timeout_ms = parse_u64_lookup(
            &lookup,
            "ATTRIBUTION_DB_ACQUIRE_TIMEOUT_MS",
            defaults.acquire_timeout.as_millis() as u64,
            1,
            60_000,
        )
        .map_err(ConfigError::InvalidPoolConfig)?;
        let idle_timeout_ms = parse_u64_lookup(
            &lookup,
            "ATTRIBUTION_DB_IDLE_TIMEOUT_MS",
            defaults.idle_timeout.as_millis() as u64,
            1_000,
            86_400_000,
        )
        .map_err(ConfigError::InvalidPoolConfig)?;
        let db_pool = PoolConfig {
            max_connections,
            max_idle_connections: max_idle_connections.min(max_connections),
            acquire_timeout: Duration::from_millis(acquire_timeout_ms),
            idle_timeout: Duration::from_millis(idle_timeout_ms),
        };

        let request_timeout_ms = parse_u64_lookup(
            &lookup,
            "ATTRIBUTION_REQUEST_TIMEOUT_MS",
            3_000,
            1,
            120_000,
        )
        .map_err(ConfigError::InvalidRequestTimeout)?;

        let identity_fallback = match lookup("ATTRIBUTION_IDENTITY_FALLBACK") {
            Some(raw) => IdentityFallback::parse(&raw)
                .ok_or_else(|| ConfigError::InvalidIdentityFallback(raw.trim().to_string()))?,
            None => IdentityFallback::Reject,
        };

        let allowed_variants = lookup("ATTRIBUTION_ALLOWED_VARIANTS")
            .unwrap_or_else(|| "red,blue".to_string())
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_ascii_lowercase)
            .collect::<HashSet<_>>();
        if allowed_variants.is_empty() {
            return Err(ConfigError::InvalidAllowedVariants(
                "at least one variant must be allowed".to_string(),
            ));
        }

        let default_device_type = lookup("ATTRIBUTION_DEFAULT_DEVICE_TYPE")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "Android".to_string());

        let log_format = match lookup("ATTRIBUTION_LOG_FORMAT")
            .unwrap_or_else(|| "text".to_string())
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "text" | "pretty" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => return Err(ConfigError::InvalidLogFormat(other.to_string())),
        };

        Ok(Self {
            service_name,
            bind_addr,
            build_sha,
            db_url,
            table,
            db_pool,
            request_timeout_ms,
            identity_fallback,
            allowed_variants,
            default_device_type,
            log_format,
        })
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse_u64_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, String> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value = raw
        .trim()
        .parse::<u64>()
        .map_err(|error| format!("{key}: {error}"))?;
    if value < min || value > max {
        return Err(format!("{key}: {value} outside {min}..={max}"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{Config, ConfigError, LogFormat};
    use crate::identity::IdentityFallback;

    fn config_from(values: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let values: HashMap<&str, &str> = values.iter().copied().collect();
        Config::from_lookup(|key| values.get(key).map(ToString::to_string))
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = config_from(&[]).expect("default config");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.db_url, None);
        assert_eq!(config.table.to_string(), "deferred_deep_links");
        assert_eq!(config.db_pool.max_connections, 8);
        assert_eq!(config.db_pool.max_idle_connections, 4);
        assert_eq!(config.db_pool.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.request_timeout(), Duration::from_secs(3));
        assert_eq!(config.identity_fallback, IdentityFallback::Reject);
        assert!(config.allowed_variants.contains("red"));
        assert!(config.allowed_variants.contains("blue"));
        assert_eq!(config.default_device_type, "Android");
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = config_from(&[
            ("ATTRIBUTION_BIND_ADDR", "0.0.0.0:9090"),
            ("DATABASE_URL", " postgres://attribution@localhost/links "),
            ("ATTRIBUTION_TABLE", "marketing.pills"),
            ("ATTRIBUTION_DB_MAX_CONNECTIONS", "3"),
            ("ATTRIBUTION_DB_MAX_IDLE_CONNECTIONS", "10"),
            ("ATTRIBUTION_DB_IDLE_TIMEOUT_MS", "60000"),
            ("ATTRIBUTION_REQUEST_TIMEOUT_MS", "750"),
            ("ATTRIBUTION_IDENTITY_FALLBACK", "peer"),
            ("ATTRIBUTION_ALLOWED_VARIANTS", "Red, green ,,"),
            ("ATTRIBUTION_LOG_FORMAT", "json"),
        ])
        .expect("config parse");
        assert_eq!(config.bind_addr.port(), 9090);
        assert_eq!(
            config.db_url.as_deref(),
            Some("postgres://attribution@localhost/links")
        );
        assert_eq!(config.table.quoted(), "\"marketing\".\"pills\"");
        assert_eq!(config.db_pool.max_connections, 3);
        assert_eq!(config.db_pool.max_idle_connections, 3);
        assert_eq!(config.db_pool.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.request_timeout_ms, 750);
        assert_eq!(config.identity_fallback, IdentityFallback::PeerAddress);
        assert_eq!(config.allowed_variants.len(), 2);
        assert!(config.allowed_variants.contains("red"));
        assert!(config.allowed_variants.contains("green"));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn db_url_takes_precedence_over_database_url() {
        let config = config_from(&[
            ("DB_URL", "postgres://primary/links"),
            ("DATABASE_URL", "postgres://secondary/links"),
        ])
        .expect("config parse");
        assert_eq!(config.db_url.as_deref(), Some("postgres://primary/links"));
    }

    #[test]
    fn malformed_numbers_are_rejected_with_the_variable_name() {
        let error = config_from(&[("ATTRIBUTION_DB_MAX_CONNECTIONS", "many")])
            .expect_err("invalid pool size should fail");
        match error {
            ConfigError::InvalidPoolConfig(message) => {
                assert!(message.contains("ATTRIBUTION_DB_MAX_CONNECTIONS"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let error = config_from(&[("ATTRIBUTION_REQUEST_TIMEOUT_MS", "0")])
            .expect_err("zero timeout should fail");
        assert!(matches!(error, ConfigError::InvalidRequestTimeout(_)));
    }

    #[test]
    fn invalid_table_identifier_is_rejected() {
        let error = config_from(&[("ATTRIBUTION_TABLE", "links; DROP TABLE users")])
            .expect_err("unsafe table name should fail");
        assert!(matches!(error, ConfigError::InvalidTable(_)));
    }

    #[test]
    fn empty_variant_allow_list_is_rejected() {
        let error = config_from(&[("ATTRIBUTION_ALLOWED_VARIANTS", " , ")])
            .expect_err("empty allow list should fail");
        assert!(matches!(error, ConfigError::InvalidAllowedVariants(_)));
    }

    #[test]
    fn unknown_identity_fallback_is_rejected() {
        let error = config_from(&[("ATTRIBUTION_IDENTITY_FALLBACK", "constant")])
            .expect_err("unknown fallback should fail");
        match error {
            ConfigError::InvalidIdentityFallback(value) => assert_eq!(value, "constant"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn invalid_bind_addr_is_rejected() {
        let error = config_from(&[("ATTRIBUTION_BIND_ADDR", "localhost")])
            .expect_err("bind addr without port should fail");
        assert!(matches!(error, ConfigError::BindAddrParse(_)));
    }
}
