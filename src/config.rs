//! Configuration management for Turnstile.
//!
//! Sources are layered with the `config` crate: serde defaults, then an
//! optional YAML file, then `TURNSTILE__SECTION__KEY` environment variables.

use config::{Config, Environment, File, Map};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::http::HttpLimitPolicy;
use crate::ratelimit::{RateLimitRule, TimeUnit, WindowLimit, DEFAULT_MAX_KEYS};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listen addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            http_addr: default_http_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Descriptor rate limiting (gRPC and the JSON API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the rate limit rules file
    #[serde(default)]
    pub rules_path: Option<PathBuf>,

    /// Rules reload interval in seconds; 0 disables reloading
    #[serde(default = "default_reload_interval")]
    pub rules_reload_interval_secs: u64,

    /// Upper bound on tracked keys before eviction kicks in
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,

    /// Limit for descriptors no rule matches; `None` leaves them unlimited
    #[serde(default = "default_limit")]
    pub default_limit: Option<RateLimitRule>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            rules_reload_interval_secs: default_reload_interval(),
            max_keys: default_max_keys(),
            default_limit: default_limit(),
        }
    }
}

fn default_reload_interval() -> u64 {
    60
}

fn default_max_keys() -> usize {
    DEFAULT_MAX_KEYS
}

fn default_limit() -> Option<RateLimitRule> {
    Some(RateLimitRule::new(1000, TimeUnit::Second))
}

impl RateLimitingConfig {
    pub fn reload_interval(&self) -> Option<Duration> {
        (self.rules_reload_interval_secs > 0)
            .then(|| Duration::from_secs(self.rules_reload_interval_secs))
    }
}

/// HTTP middleware limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u64,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Allowance multiplier for authenticated callers
    #[serde(default = "default_authenticated_multiplier")]
    pub authenticated_multiplier: u64,

    /// Request header trusted as caller identity; only set this behind a
    /// proxy that controls the header
    #[serde(default)]
    pub trusted_identity_header: Option<String>,

    #[serde(default = "default_exclude_paths")]
    pub exclude_paths: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            requests_per_window: default_requests_per_window(),
            window_secs: default_window_secs(),
            authenticated_multiplier: default_authenticated_multiplier(),
            trusted_identity_header: None,
            exclude_paths: default_exclude_paths(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_requests_per_window() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_authenticated_multiplier() -> u64 {
    2
}

fn default_exclude_paths() -> Vec<String> {
    vec!["/health".to_string()]
}

impl HttpConfig {
    /// Build the middleware policy, rejecting zero limits and windows.
    pub fn policy(&self) -> Result<HttpLimitPolicy> {
        let limit = WindowLimit::new(self.requests_per_window, Duration::from_secs(self.window_secs))?;
        Ok(HttpLimitPolicy::new(limit)
            .with_authenticated_multiplier(self.authenticated_multiplier)?
            .with_trusted_identity_header(self.trusted_identity_header.as_deref())?
            .with_exclude_paths(self.exclude_paths.clone()))
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`load`](Self::load), reading variables from `env` instead of
    /// the process environment when given.
    pub fn load_with_env(path: Option<&Path>, env: Option<Map<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let config: TurnstileConfig = builder
            .add_source(
                Environment::with_prefix("TURNSTILE")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("http.exclude_paths")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Fail fast on values that would admit nothing or everything.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.max_keys == 0 {
            return Err(TurnstileError::Config("max_keys must be at least 1".into()));
        }
        if let Some(rule) = &self.rate_limiting.default_limit {
            rule.window_limit()?;
        }
        self.http.policy()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TurnstileConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.grpc_addr.port(), 8081);
        assert_eq!(config.server.http_addr.port(), 8080);
        assert_eq!(config.rate_limiting.max_keys, DEFAULT_MAX_KEYS);
        assert_eq!(config.http.exclude_paths, vec!["/health"]);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
server:
  grpc_addr: "0.0.0.0:9000"
http:
  requests_per_window: 10
  window_secs: 1
logging:
  format: json
"#;
        let config: TurnstileConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.grpc_addr.port(), 9000);
        assert_eq!(config.server.http_addr.port(), 8080);
        assert_eq!(config.http.requests_per_window, 10);
        assert_eq!(config.http.authenticated_multiplier, 2);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_null_default_limit_means_unlimited() {
        let yaml = r#"
rate_limiting:
  default_limit: null
"#;
        let config: TurnstileConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.rate_limiting.default_limit.is_none());
    }

    #[test]
    fn test_zero_values_fail_validation() {
        let mut config = TurnstileConfig::default();
        config.http.window_secs = 0;
        assert!(matches!(config.validate(), Err(TurnstileError::Config(_))));

        let mut config = TurnstileConfig::default();
        config.http.requests_per_window = 0;
        assert!(config.validate().is_err());

        let mut config = TurnstileConfig::default();
        config.http.authenticated_multiplier = 0;
        assert!(config.validate().is_err());

        let mut config = TurnstileConfig::default();
        config.rate_limiting.default_limit = Some(RateLimitRule::new(0, TimeUnit::Minute));
        assert!(config.validate().is_err());

        let mut config = TurnstileConfig::default();
        config.rate_limiting.max_keys = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reload_interval() {
        let mut config = RateLimitingConfig::default();
        assert_eq!(config.reload_interval(), Some(Duration::from_secs(60)));
        config.rules_reload_interval_secs = 0;
        assert_eq!(config.reload_interval(), None);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TurnstileConfig::load_with_env(None, Some(Map::new())).unwrap();
        assert_eq!(config.http.requests_per_window, 100);
    }

    #[test]
    fn test_environment_overrides_defaults() {
        let env: Map<String, String> = [
            ("TURNSTILE__HTTP__REQUESTS_PER_WINDOW", "7"),
            ("TURNSTILE__HTTP__EXCLUDE_PATHS", "/a,/b"),
            ("TURNSTILE__HTTP__TRUSTED_IDENTITY_HEADER", "x-forwarded-user"),
            ("TURNSTILE__SERVER__GRPC_ADDR", "0.0.0.0:9999"),
            ("TURNSTILE__LOGGING__FORMAT", "json"),
            ("OTHER__HTTP__WINDOW_SECS", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = TurnstileConfig::load_with_env(None, Some(env)).unwrap();
        assert_eq!(config.http.requests_per_window, 7);
        assert_eq!(config.http.exclude_paths, vec!["/a", "/b"]);
        assert_eq!(config.http.trusted_identity_header.as_deref(), Some("x-forwarded-user"));
        assert_eq!(config.http.window_secs, 60);
        assert_eq!(config.server.grpc_addr.port(), 9999);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_environment_zero_limit_fails_validation() {
        let env: Map<String, String> =
            [("TURNSTILE__HTTP__WINDOW_SECS".to_string(), "0".to_string())].into_iter().collect();

        let result = TurnstileConfig::load_with_env(None, Some(env));
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = TurnstileConfig::load(Some(Path::new("/nonexistent/turnstile.yaml")));
        assert!(matches!(result, Err(TurnstileError::ConfigSource(_))));
    }
}
