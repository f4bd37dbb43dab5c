//! Gateway configuration.
//!
//! Loaded from environment variables with sane defaults; validated once at
//! startup. A validation failure aborts the process with a nonzero exit.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ConfigError, ConfigResult};

/// Main gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub login: LoginConfig,
    #[serde(default)]
    pub rate: RateLimitConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "supersecret".to_string(),
            expiration_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    pub username: String,
    pub password: String,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Refill rate in tokens (requests) per second, per client IP.
    pub limit: f64,
    /// Bucket capacity.
    pub burst_limit: u32,
    /// GC period; entries idle longer than this are evicted.
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 1.0,
            burst_limit: 5,
            cleanup_interval_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 10,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub namespace: String,
    pub watch_all_namespaces: bool,
    /// Static route file used when discovery is disabled.
    pub static_routes_path: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "default".to_string(),
            watch_all_namespaces: false,
            static_routes_path: "config/gateway.yaml".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
    pub sensitive_headers: Vec<String>,
    pub slow_request_threshold_ms: u64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            sensitive_headers: vec![
                "authorization".to_string(),
                "cookie".to_string(),
                "x-api-key".to_string(),
                "x-auth-token".to_string(),
            ],
            slow_request_threshold_ms: 5_000,
        }
    }
}

impl LoggingSettings {
    pub fn slow_request_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_request_threshold_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Backend dial timeout.
    pub connect_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("HOST", "0.0.0.0"),
                port: env_parse_or("PORT", 8080),
                read_timeout_secs: env_parse_or("READ_TIMEOUT_SECS", 30),
                write_timeout_secs: env_parse_or("WRITE_TIMEOUT_SECS", 30),
            },
            jwt: JwtConfig {
                secret: env_or("JWT_SECRET", "supersecret"),
                expiration_secs: env_parse_or("JWT_EXPIRATION_SECS", 24 * 60 * 60),
            },
            login: LoginConfig {
                username: env_or("LOGIN_USERNAME", "admin"),
                password: env_or("LOGIN_PASSWORD", ""),
            },
            rate: RateLimitConfig {
                limit: env_parse_or("RATE_LIMIT", 1.0),
                burst_limit: env_parse_or("RATE_BURST_LIMIT", 5),
                cleanup_interval_secs: env_parse_or("RATE_CLEANUP_SECS", 60),
            },
            health: HealthConfig {
                check_interval_secs: env_parse_or("HEALTH_CHECK_INTERVAL_SECS", 10),
                timeout_secs: env_parse_or("HEALTH_CHECK_TIMEOUT_SECS", 5),
            },
            discovery: DiscoveryConfig {
                enabled: env_parse_or("DISCOVERY_ENABLED", true),
                namespace: env_or("DISCOVERY_NAMESPACE", "default"),
                watch_all_namespaces: env_parse_or("DISCOVERY_WATCH_ALL_NAMESPACES", false),
                static_routes_path: env_or("STATIC_ROUTES_PATH", "config/gateway.yaml"),
            },
            logging: LoggingSettings {
                level: env_or("LOG_LEVEL", "info"),
                format: env_or("LOG_FORMAT", "json"),
                sensitive_headers: env_list_or(
                    "SENSITIVE_HEADERS",
                    &["authorization", "cookie", "x-api-key", "x-auth-token"],
                ),
                slow_request_threshold_ms: env_parse_or("SLOW_REQUEST_THRESHOLD_MS", 5_000),
            },
            proxy: ProxyConfig {
                connect_timeout_secs: env_parse_or("PROXY_CONNECT_TIMEOUT_SECS", 10),
            },
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.jwt.secret == "supersecret" {
            return Err(ConfigError::ValidationFailed {
                reason: "JWT_SECRET must be changed from its default value".to_string(),
            });
        }
        if self.login.password.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "LOGIN_PASSWORD must be set".to_string(),
            });
        }
        if self.rate.limit <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "RATE_LIMIT".to_string(),
                value: self.rate.limit.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.rate.burst_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "RATE_BURST_LIMIT".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.discovery.enabled && self.discovery.namespace.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "DISCOVERY_NAMESPACE must be set when discovery is enabled".to_string(),
            });
        }

        const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "LOG_LEVEL".to_string(),
                value: self.logging.level.clone(),
                reason: "must be one of: trace, debug, info, warn, error".to_string(),
            });
        }
        if !["json", "text"].contains(&self.logging.format.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "LOG_FORMAT".to_string(),
                value: self.logging.format.clone(),
                reason: "must be one of: json, text".to_string(),
            });
        }

        Ok(())
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

fn env_list_or(key: &str, fallback: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => fallback.iter().map(|s| s.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> GatewayConfig {
        GatewayConfig {
            jwt: JwtConfig {
                secret: "a-real-secret".to_string(),
                expiration_secs: 3600,
            },
            login: LoginConfig {
                username: "admin".to_string(),
                password: "hunter2".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.rate.burst_limit, 5);
        assert_eq!(config.rate.cleanup_interval(), Duration::from_secs(60));
        assert!(config.discovery.enabled);
        assert_eq!(config.logging.format, "json");
        assert!(config
            .logging
            .sensitive_headers
            .contains(&"authorization".to_string()));
    }

    #[test]
    fn test_validate_accepts_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_default_secret() {
        let mut config = valid_config();
        config.jwt.secret = "supersecret".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_rate() {
        let mut config = valid_config();
        config.rate.limit = 0.0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.rate.burst_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_namespace() {
        let mut config = valid_config();
        config.discovery.namespace = String::new();
        assert!(config.validate().is_err());

        config.discovery.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_logging() {
        let mut config = valid_config();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
