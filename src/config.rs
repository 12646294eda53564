//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Rate Limiting
//!
//! - `RATE_LIMIT_ENABLED`: Set to `false` to admit every request (default: true)
//! - `RATE_LIMIT_REQUESTS` + `RATE_LIMIT_WINDOW_SECONDS`: Global override of
//!   every policy table entry. Both must be set; one alone is ignored with a
//!   warning.
//! - `RATE_LIMIT_SWEEP_INTERVAL_MS`: Expired-window sweep interval (default: 10000)
//!
//! # Security Configuration
//!
//! - `APP_ENV`: `production` and `staging` enable HSTS
//! - `TRUSTED_PROXIES`: CIDR ranges whose forwarding headers are believed

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::logging::LogFormat;
use crate::policy::PolicyOverride;

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Test,
    Staging,
    Production,
}

impl Environment {
    /// Whether the deployment is served over public TLS and gets HSTS.
    pub fn is_production_like(self) -> bool {
        matches!(self, Environment::Production | Environment::Staging)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Deployment environment (default: development)
    pub environment: Environment,

    /// Maximum request body size in bytes (default: 10MB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Master switch for admission control (default: true)
    pub rate_limit_enabled: bool,

    /// Global quota/window replacing every non-exempt policy
    pub rate_limit_override: Option<PolicyOverride>,

    /// Spacing of expired-window sweeps (default: 10s, 0 = every request)
    pub rate_limit_sweep_interval: Duration,

    /// Trusted proxy CIDR ranges for IP spoofing mitigation.
    /// Forwarding headers are only believed when the connection originates
    /// from one of these networks.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    /// Default: Empty (trust all sources - NOT recommended for production)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Log output format (default: pretty)
    pub log_format: LogFormat,

    /// Traces retained by the in-memory trace store (default: 10000)
    pub trace_store_capacity: usize,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any configuration value is invalid
    /// (e.g., non-numeric PORT value, zero quota).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            // Server
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_env(&lookup, "PORT", defaults.port)?,
            environment: parse_env(&lookup, "APP_ENV", defaults.environment)?,
            max_request_body_size: parse_env(
                &lookup,
                "MAX_REQUEST_BODY_SIZE",
                defaults.max_request_body_size,
            )?,

            // Rate limiting
            rate_limit_enabled: parse_env(&lookup, "RATE_LIMIT_ENABLED", true)?,
            rate_limit_override: parse_override(&lookup)?,
            rate_limit_sweep_interval: Duration::from_millis(parse_env(
                &lookup,
                "RATE_LIMIT_SWEEP_INTERVAL_MS",
                10_000,
            )?),
            trusted_proxies: parse_list(lookup("TRUSTED_PROXIES")),

            // Observability
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse_env(&lookup, "LOG_FORMAT", defaults.log_format)?,
            trace_store_capacity: parse_env(
                &lookup,
                "TRACE_STORE_CAPACITY",
                defaults.trace_store_capacity,
            )?,
            metrics_port: parse_env(&lookup, "METRICS_PORT", defaults.metrics_port)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if let Some(ov) = self.rate_limit_override {
            if ov.max_requests == 0 {
                return Err(AppError::ConfigError(
                    "RATE_LIMIT_REQUESTS must be greater than 0".to_string(),
                ));
            }
            if ov.window_secs == 0 {
                return Err(AppError::ConfigError(
                    "RATE_LIMIT_WINDOW_SECONDS must be greater than 0".to_string(),
                ));
            }
        }

        if self.trace_store_capacity == 0 {
            return Err(AppError::ConfigError(
                "TRACE_STORE_CAPACITY must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if trusted proxy validation is enabled.
    pub fn proxy_validation_enabled(&self) -> bool {
        !self.trusted_proxies.is_empty()
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }
}

/// Parse a variable into the specified type with a default value.
fn parse_env<F, T>(lookup: &F, name: &str, default: T) -> AppResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(name) {
        Some(val) => val
            .trim()
            .parse()
            .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
        None => Ok(default),
    }
}

/// Parse an optional variable; absent stays `None`.
fn parse_opt<F, T>(lookup: &F, name: &str) -> AppResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    lookup(name)
        .map(|val| {
            val.trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}")))
        })
        .transpose()
}

/// Parse the global policy override; both variables are required.
fn parse_override<F>(lookup: &F) -> AppResult<Option<PolicyOverride>>
where
    F: Fn(&str) -> Option<String>,
{
    let requests: Option<u32> = parse_opt(lookup, "RATE_LIMIT_REQUESTS")?;
    let window: Option<u64> = parse_opt(lookup, "RATE_LIMIT_WINDOW_SECONDS")?;

    match (requests, window) {
        (Some(max_requests), Some(window_secs)) => Ok(Some(PolicyOverride {
            max_requests,
            window_secs,
        })),
        (None, None) => Ok(None),
        _ => {
            warn!(
                "Only one of RATE_LIMIT_REQUESTS and RATE_LIMIT_WINDOW_SECONDS is set; \
                 using the built-in policy table"
            );
            Ok(None)
        }
    }
}

/// Split a comma-separated list, dropping blanks.
fn parse_list(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            environment: Environment::Development,
            max_request_body_size: 10 * 1024 * 1024, // 10MB
            // Rate limiting
            rate_limit_enabled: true,
            rate_limit_override: None,
            rate_limit_sweep_interval: Duration::from_secs(10),
            trusted_proxies: vec![], // Empty = trust all (dev mode)
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            trace_store_capacity: 10_000,
            metrics_port: 9090,
        }
    }
}
