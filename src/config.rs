//! Gateway configuration.
//!
//! Precedence, lowest to highest: built-in defaults, a YAML file, then
//! `GATEWAY_*` environment variables. Configuration is passed into
//! constructors; nothing reads it from globals, so a reload is a matter of
//! building a new [`Gateway`](crate::gateway::Gateway).
//!
//! ```yaml
//! security:
//!   enabled: true
//!   api_keys: ["client-key"]
//!   admin_key: "admin-key"
//! rate_limit:
//!   global_rpm: 300
//!   client_rpm: 150
//!   burst_factor: 2.0
//! circuit_breaker:
//!   failure_ratio: 0.5
//!   min_samples: 5
//!   cooldown_ms: 30000
//! retry:
//!   max_attempts: 3
//!   base_delay_ms: 250
//! watchdog:
//!   timeout_ms: 25000
//! ```

use crate::auth::SecurityConfig;
use crate::credential::CredentialConfig;
use crate::error::{Error, ErrorContext};
use crate::gateway::PayloadLimits;
use crate::metrics::MetricsConfig;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::rate_limiter::RateLimitConfig;
use crate::resilience::retry::RetryConfig;
use crate::resilience::watchdog::WatchdogConfig;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

pub const ENV_PREFIX: &str = "GATEWAY_";

const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub watchdog: WatchdogConfig,
    pub metrics: MetricsConfig,
    pub credential: CredentialConfig,
    pub limits: PayloadLimits,
}

fn invalid(field: &str, message: impl Into<String>) -> Error {
    Error::configuration_with_context(
        message,
        ErrorContext::new().with_field_path(field).with_source("config"),
    )
}

fn parse<T: FromStr>(var: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(var, format!("cannot parse {value:?}: {e}")))
}

fn parse_bool(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(invalid(var, format!("expected a boolean, got {other:?}"))),
    }
}

impl GatewayConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| {
            let ctx = ErrorContext::new().with_source("config");
            let ctx = match e.location() {
                Some(loc) => ctx.with_details(format!("line {}, column {}", loc.line(), loc.column())),
                None => ctx,
            };
            Error::configuration_with_context(format!("invalid YAML: {e}"), ctx)
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read config file: {e}"),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("config"),
            )
        })?;
        Self::from_yaml_str(&text)
    }

    /// Defaults or `path`, then the process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(std::env::vars())
    }

    /// Apply `GATEWAY_*` overrides from `vars`; unknown names are ignored.
    pub fn apply_env_from<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (k, v) in vars {
            let (var, value) = (k.as_ref(), v.as_ref());
            let Some(name) = var.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "ENABLE_SECURITY" => self.security.enabled = parse_bool(var, value)?,
                "API_KEY" => {
                    self.security.api_keys = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                }
                "ADMIN_KEY" => {
                    self.security.admin_key = Some(value.trim().to_string()).filter(|s| !s.is_empty())
                }
                "ADMIN_BYPASSES_CIRCUIT" => {
                    self.security.admin_bypasses_circuit = parse_bool(var, value)?
                }
                "RATE_LIMIT_GLOBAL_RPM" => self.rate_limit.global_rpm = parse(var, value)?,
                "RATE_LIMIT_CLIENT_RPM" => self.rate_limit.client_rpm = parse(var, value)?,
                "RATE_LIMIT_BURST_FACTOR" => self.rate_limit.burst_factor = parse(var, value)?,
                "BREAKER_FAILURE_RATIO" => self.circuit_breaker.failure_ratio = parse(var, value)?,
                "BREAKER_WINDOW_SIZE" => self.circuit_breaker.window_size = parse(var, value)?,
                "BREAKER_MIN_SAMPLES" => self.circuit_breaker.min_samples = parse(var, value)?,
                "BREAKER_COOLDOWN_MS" => self.circuit_breaker.cooldown_ms = parse(var, value)?,
                "RETRY_MAX_ATTEMPTS" => self.retry.max_attempts = parse(var, value)?,
                "RETRY_BASE_DELAY_MS" => self.retry.base_delay_ms = parse(var, value)?,
                "RETRY_MAX_DELAY_MS" => self.retry.max_delay_ms = parse(var, value)?,
                "RETRY_JITTER" => self.retry.jitter = parse_bool(var, value)?,
                "WATCHDOG_TIMEOUT_MS" => self.watchdog.timeout_ms = parse(var, value)?,
                "METRICS_CAPACITY" => self.metrics.capacity = parse(var, value)?,
                "METRICS_JSONL_PATH" => self.metrics.jsonl_path = Some(value.into()),
                "ENCRYPTION_KEY" => {
                    self.credential.encryption_key = Some(value.trim().to_string()).filter(|s| !s.is_empty())
                }
                "CREDENTIAL_PATH" => self.credential.store_path = Some(value.into()),
                "USE_KEYRING" => self.credential.use_keyring = parse_bool(var, value)?,
                "MAX_UPLOAD_BYTES" => self.limits.max_upload_bytes = parse(var, value)?,
                "MAX_BODY_BYTES" => self.limits.max_body_bytes = parse(var, value)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limit;
        for (field, rpm) in [
            ("rate_limit.global_rpm", rl.global_rpm),
            ("rate_limit.client_rpm", rl.client_rpm),
        ] {
            if !rpm.is_finite() || rpm < 0.0 {
                return Err(invalid(field, "must be a finite, non-negative number (0 disables)"));
            }
        }
        if !rl.burst_factor.is_finite() || rl.burst_factor < 1.0 {
            return Err(invalid("rate_limit.burst_factor", "must be at least 1.0"));
        }

        let cb = &self.circuit_breaker;
        if !(cb.failure_ratio > 0.0 && cb.failure_ratio <= 1.0) {
            return Err(invalid("circuit_breaker.failure_ratio", "must be in (0, 1]"));
        }
        if cb.window_size == 0 {
            return Err(invalid("circuit_breaker.window_size", "must be greater than 0"));
        }
        if cb.min_samples == 0 || cb.min_samples > cb.window_size {
            return Err(invalid(
                "circuit_breaker.min_samples",
                "must be between 1 and circuit_breaker.window_size",
            ));
        }
        if cb.cooldown_ms == 0 {
            return Err(invalid("circuit_breaker.cooldown_ms", "must be greater than 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid("retry.base_delay_ms", "must not exceed retry.max_delay_ms"));
        }
        if self.watchdog.timeout_ms == 0 {
            return Err(invalid("watchdog.timeout_ms", "must be greater than 0"));
        }
        if self.metrics.capacity == 0 {
            return Err(invalid("metrics.capacity", "must be greater than 0"));
        }
        if self.limits.max_upload_bytes == 0 {
            return Err(invalid("limits.max_upload_bytes", "must be greater than 0"));
        }
        if self.limits.max_body_bytes == 0 {
            return Err(invalid("limits.max_body_bytes", "must be greater than 0"));
        }
        if let Some(ref admin) = self.security.admin_key {
            if self.security.api_keys.iter().any(|k| k == admin) {
                return Err(invalid(
                    "security.admin_key",
                    "admin key must differ from every client API key",
                ));
            }
        }
        if self.security.enabled && self.security.api_keys.is_empty() && self.security.admin_key.is_none() {
            return Err(invalid(
                "security.api_keys",
                "security is enabled but no API key is configured",
            ));
        }
        Ok(())
    }

    /// JSON view with every secret replaced.
    pub fn redacted(&self) -> Result<serde_json::Value> {
        let mut v = serde_json::to_value(self)?;
        if let Some(keys) = v.pointer_mut("/security/api_keys").and_then(|k| k.as_array_mut()) {
            for k in keys.iter_mut() {
                *k = serde_json::Value::from(REDACTED);
            }
        }
        for ptr in ["/security/admin_key", "/credential/encryption_key"] {
            if let Some(slot) = v.pointer_mut(ptr) {
                if !slot.is_null() {
                    *slot = serde_json::Value::from(REDACTED);
                }
            }
        }
        Ok(v)
    }
}
