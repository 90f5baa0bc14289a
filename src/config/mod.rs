//! Configuration types and builders.

use crate::database::registry::MAX_PROBE_TIMEOUT;
use crate::error::{ConfigError, GatewayError, Result};
use crate::security::{DocumentPolicy, RateLimitConfig, StatementPolicy};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Network timeouts applied by the gateway.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Liveness probe budget, never above five seconds.
    pub probe_timeout_ms: u64,
    /// Upper bound for building a new pool.
    pub build_timeout_ms: u64,
    /// Upper bound for one backend operation.
    pub query_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 5_000,
            build_timeout_ms: 15_000,
            query_timeout_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms).min(MAX_PROBE_TIMEOUT)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub name: Cow<'static, str>,
    pub version: Cow<'static, str>,
    pub rate_limit: RateLimitConfig,
    pub document_policy: DocumentPolicy,
    pub sql_policy: StatementPolicy,
    pub timeouts: TimeoutConfig,
    /// JSON file with the per-user connection descriptors.
    pub connections_file: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: "db-gateway".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            rate_limit: RateLimitConfig::default(),
            document_policy: DocumentPolicy::default(),
            sql_policy: StatementPolicy::default(),
            timeouts: TimeoutConfig::default(),
            connections_file: None,
        }
    }
}

impl GatewayConfig {
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

/// Builder for GatewayConfig with fluent API.
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.config.rate_limit = rate_limit;
        self
    }

    pub fn route_limit(mut self, route: impl Into<String>, limit: u32) -> Self {
        self.config.rate_limit.routes.insert(route.into(), limit);
        self
    }

    pub fn document_policy(mut self, policy: DocumentPolicy) -> Self {
        self.config.document_policy = policy;
        self
    }

    pub fn sql_policy(mut self, policy: StatementPolicy) -> Self {
        self.config.sql_policy = policy;
        self
    }

    pub fn allow_write(mut self, allow: bool) -> Self {
        self.config.sql_policy.allow_write = allow;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.probe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn build_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.build_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.query_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connections_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.connections_file = Some(path.into());
        self
    }

    /// Build from environment variables.
    pub fn from_env(self) -> Result<Self> {
        self.from_lookup(|key| env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(window) = lookup("GATEWAY_RATE_LIMIT_WINDOW_MS") {
            self.config.rate_limit.window_ms = parse_number("GATEWAY_RATE_LIMIT_WINDOW_MS", &window)?;
        }

        if let Some(limit) = lookup("GATEWAY_RATE_LIMIT_DEFAULT") {
            self.config.rate_limit.default_limit = parse_number("GATEWAY_RATE_LIMIT_DEFAULT", &limit)?;
        }

        if let Some(routes) = lookup("GATEWAY_RATE_LIMIT_ROUTES") {
            for entry in routes.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let (route, limit) = entry.split_once('=').ok_or_else(|| {
                    invalid(
                        "GATEWAY_RATE_LIMIT_ROUTES",
                        format!("expected route=limit, got '{}'", entry),
                    )
                })?;
                let limit = parse_number("GATEWAY_RATE_LIMIT_ROUTES", limit.trim())?;
                self.config
                    .rate_limit
                    .routes
                    .insert(route.trim().to_string(), limit);
            }
        }

        if let Some(probe) = lookup("GATEWAY_PROBE_TIMEOUT_MS") {
            let ms: u64 = parse_number("GATEWAY_PROBE_TIMEOUT_MS", &probe)?;
            self.config.timeouts.probe_timeout_ms = ms.min(MAX_PROBE_TIMEOUT.as_millis() as u64);
        }

        if let Some(query) = lookup("GATEWAY_QUERY_TIMEOUT_MS") {
            self.config.timeouts.query_timeout_ms = parse_number("GATEWAY_QUERY_TIMEOUT_MS", &query)?;
        }

        if let Some(allow_write) = lookup("GATEWAY_SQL_ALLOW_WRITE") {
            self.config.sql_policy.allow_write = parse_bool("GATEWAY_SQL_ALLOW_WRITE", &allow_write)?;
        }

        if let Some(max_limit) = lookup("GATEWAY_MAX_FIND_LIMIT") {
            self.config.document_policy.max_limit = parse_number("GATEWAY_MAX_FIND_LIMIT", &max_limit)?;
        }

        if let Some(path) = lookup("GATEWAY_CONNECTIONS_FILE") {
            self.config.connections_file = Some(PathBuf::from(path));
        }

        Ok(self)
    }

    pub fn build(self) -> Result<GatewayConfig> {
        self.validate()?;
        Ok(self.config)
    }

    fn validate(&self) -> Result<()> {
        if self.config.rate_limit.window_ms == 0 {
            return Err(invalid("rate_limit.window_ms", "window must be greater than 0").into());
        }
        if self.config.timeouts.probe_timeout_ms == 0 {
            return Err(invalid("timeouts.probe_timeout_ms", "timeout must be greater than 0").into());
        }
        if self.config.timeouts.query_timeout_ms == 0 {
            return Err(invalid("timeouts.query_timeout_ms", "timeout must be greater than 0").into());
        }
        let policy = &self.config.document_policy;
        if policy.max_limit <= 0 {
            return Err(invalid("document_policy.max_limit", "limit must be greater than 0").into());
        }
        if policy.max_depth == 0 {
            return Err(invalid("document_policy.max_depth", "depth must be at least 1").into());
        }
        if self.config.sql_policy.max_length == 0 {
            return Err(invalid("sql_policy.max_length", "length must be greater than 0").into());
        }
        Ok(())
    }
}

fn invalid(field: &'static str, message: impl Into<Cow<'static, str>>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        message: message.into(),
    }
}

fn parse_number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GatewayError::Config(invalid(field, format!("not a number: '{}'", value))))
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(GatewayError::Config(invalid(
            field,
            format!("expected true or false, got '{}'", value),
        ))),
    }
}
