//! Gateway facade.
//!
//! Every inbound request passes, in order:
//!
//! 1. authentication (constant-time key comparison)
//! 2. payload size check
//! 3. rate limiting (skipped for the admin credential)
//! 4. the [`Executor`]: circuit check, attempts under the watchdog with
//!    retry, metrics for every attempt, one breaker report
//!
//! The first stage that rejects short-circuits the rest and returns its own
//! error kind.

use crate::auth::{Authenticator, Principal};
use crate::config::GatewayConfig;
use crate::credential::{CredentialStatus, CredentialStore, SecretString};
use crate::error::{Error, ErrorContext, ErrorKind};
use crate::executor::Executor;
use crate::metrics::{
    AttemptSink, CallAttemptRecord, JsonlAttemptSink, MetricsAggregator, MetricsSummary,
    NoopAttemptSink,
};
use crate::resilience::circuit_breaker::{CircuitBreakerRegistry, CircuitSnapshot};
use crate::resilience::rate_limiter::{Admission, RateLimiter, RateLimiterSnapshot};
use crate::upstream::{OpClass, UpstreamError};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadLimits {
    /// Limit for multipart audio uploads.
    pub max_upload_bytes: u64,
    /// Limit for every other request body.
    pub max_body_bytes: u64,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_upload_bytes: 20 * 1024 * 1024,
            max_body_bytes: 25 * 1024 * 1024,
        }
    }
}

impl PayloadLimits {
    pub fn limit_for(&self, multipart: bool) -> u64 {
        if multipart {
            self.max_upload_bytes
        } else {
            self.max_body_bytes
        }
    }
}

/// What the HTTP layer knows about an inbound request.
#[derive(Clone)]
pub struct RequestContext {
    /// Rate-limit scope, typically the source address.
    pub client_id: String,
    pub credential: Option<String>,
    pub op_class: OpClass,
    /// Declared body size in bytes.
    pub payload_bytes: u64,
    pub multipart: bool,
}

impl RequestContext {
    pub fn new(client_id: impl Into<String>, op_class: OpClass) -> Self {
        Self {
            client_id: client_id.into(),
            credential: None,
            op_class,
            payload_bytes: 0,
            multipart: false,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_payload(mut self, bytes: u64, multipart: bool) -> Self {
        self.payload_bytes = bytes;
        self.multipart = multipart;
        self
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("client_id", &self.client_id)
            .field("credential", &self.credential.as_deref().map(crate::auth::mask))
            .field("op_class", &self.op_class)
            .field("payload_bytes", &self.payload_bytes)
            .field("multipart", &self.multipart)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterDiagnostics {
    pub client_scopes: usize,
    pub global: Option<RateLimiterSnapshot>,
}

/// Read-only view for the diagnostics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub security_enabled: bool,
    pub metrics: MetricsSummary,
    pub circuits: Vec<CircuitSnapshot>,
    pub rate_limiter: RateLimiterDiagnostics,
    pub credential: CredentialStatus,
}

pub struct Gateway {
    auth: Authenticator,
    admin_bypasses_circuit: bool,
    limits: PayloadLimits,
    limiter: RateLimiter,
    executor: Executor,
    metrics: Arc<MetricsAggregator>,
    credentials: CredentialStore,
}

impl Gateway {
    /// Validate `cfg`, open the credential store and wire every component.
    pub async fn new(cfg: GatewayConfig) -> Result<Self> {
        cfg.validate()?;
        let credentials = cfg.credential.open_store().await?;
        let sink: Arc<dyn AttemptSink> = match cfg.metrics.jsonl_path {
            Some(ref path) => Arc::new(JsonlAttemptSink::new(path)),
            None => Arc::new(NoopAttemptSink),
        };
        Ok(Self::with_parts(&cfg, credentials, sink))
    }

    /// Build from an already opened credential store, without validation.
    pub fn with_parts(cfg: &GatewayConfig, credentials: CredentialStore, sink: Arc<dyn AttemptSink>) -> Self {
        let metrics = Arc::new(MetricsAggregator::new(&cfg.metrics));
        let breakers = Arc::new(CircuitBreakerRegistry::new(cfg.circuit_breaker.clone()));
        let executor = Executor::new(breakers, Arc::clone(&metrics), cfg.retry.clone(), &cfg.watchdog)
            .with_sink(sink);
        info!(
            security_enabled = cfg.security.enabled,
            global_rpm = cfg.rate_limit.global_rpm,
            client_rpm = cfg.rate_limit.client_rpm,
            "gateway ready"
        );
        Self {
            auth: Authenticator::new(&cfg.security),
            admin_bypasses_circuit: cfg.security.admin_bypasses_circuit,
            limits: cfg.limits.clone(),
            limiter: RateLimiter::new(&cfg.rate_limit),
            executor,
            metrics,
            credentials,
        }
    }

    fn reject(&self, err: Error) -> Error {
        self.metrics.record_rejection(err.kind());
        err
    }

    /// Run the pre-upstream stages: authenticate, check payload, rate limit.
    pub fn admit(&self, ctx: &RequestContext) -> Result<Principal> {
        let principal = self
            .auth
            .authenticate(ctx.credential.as_deref())
            .map_err(|e| self.reject(e))?;

        let limit = self.limits.limit_for(ctx.multipart);
        if ctx.payload_bytes > limit {
            debug!(client = %ctx.client_id, size = ctx.payload_bytes, limit, "payload too large");
            return Err(self.reject(Error::PayloadTooLarge {
                size: ctx.payload_bytes,
                limit,
            }));
        }

        if !principal.is_admin() {
            if let Admission::Reject {
                scope,
                retry_after_ms,
            } = self.limiter.admit(&ctx.client_id)
            {
                return Err(self.reject(Error::RateLimited {
                    scope,
                    retry_after_ms,
                }));
            }
        }
        Ok(principal)
    }

    /// Admit the request, then run `operation` through the executor.
    ///
    /// `operation` performs exactly one upstream call per invocation.
    pub async fn execute<T, F, Fut>(&self, ctx: &RequestContext, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>> + Send + 'static,
        T: Send + 'static,
    {
        let principal = self.admit(ctx)?;
        let bypass = principal.is_admin() && self.admin_bypasses_circuit;
        self.executor
            .execute_with(&ctx.op_class, bypass, operation)
            .await
    }

    /// Like [`execute`](Self::execute), handing each attempt the decrypted
    /// provider key.
    pub async fn execute_with_key<T, F, Fut>(&self, ctx: &RequestContext, mut operation: F) -> Result<T>
    where
        F: FnMut(SecretString) -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>> + Send + 'static,
        T: Send + 'static,
    {
        let principal = self.admit(ctx)?;
        let key = self.require_provider_key()?;
        let bypass = principal.is_admin() && self.admin_bypasses_circuit;
        self.executor
            .execute_with(&ctx.op_class, bypass, move || operation(key.clone()))
            .await
    }

    /// Store a new provider key. Requires the admin credential.
    pub async fn set_provider_key(&self, admin_credential: Option<&str>, plaintext: &str) -> Result<()> {
        self.auth
            .authorize_admin(admin_credential)
            .map_err(|e| self.reject(e))?;
        if plaintext.trim().is_empty() {
            return Err(Error::configuration_with_context(
                "provider key must not be empty",
                ErrorContext::new()
                    .with_field_path("provider_key")
                    .with_source("gateway"),
            ));
        }
        self.credentials.set_key(plaintext.trim()).await
    }

    /// Delete the stored provider key. Requires the admin credential.
    pub async fn clear_provider_key(&self, admin_credential: Option<&str>) -> Result<bool> {
        self.auth
            .authorize_admin(admin_credential)
            .map_err(|e| self.reject(e))?;
        self.credentials.clear_key().await
    }

    pub fn provider_key(&self) -> Result<Option<SecretString>> {
        self.credentials.get_key()
    }

    /// The provider key, or a configuration error when none is stored.
    pub fn require_provider_key(&self) -> Result<SecretString> {
        self.credentials.get_key()?.ok_or_else(|| {
            Error::configuration_with_context(
                "no provider key configured",
                ErrorContext::new()
                    .with_field_path("provider_key")
                    .with_source("credential_store"),
            )
        })
    }

    pub fn has_provider_key(&self) -> bool {
        self.credentials.has_key()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            security_enabled: self.auth.security_enabled(),
            metrics: self.metrics.summary(),
            circuits: self.executor.breakers().snapshots(),
            rate_limiter: RateLimiterDiagnostics {
                client_scopes: self.limiter.scope_count(),
                global: self.limiter.global_snapshot(),
            },
            credential: self.credentials.status(),
        }
    }

    pub fn recent_errors(&self, n: usize) -> Vec<CallAttemptRecord> {
        self.metrics.recent_errors(n)
    }

    pub fn rejections(&self, kind: ErrorKind) -> u64 {
        self.metrics.rejections().get(&kind).copied().unwrap_or(0)
    }

    /// Drop rate-limit state of clients idle for `idle_for`.
    pub fn prune_idle_clients(&self, idle_for: Duration) -> usize {
        let pruned = self.limiter.prune_idle(idle_for);
        if pruned > 0 {
            debug!(pruned, "pruned idle client rate-limit scopes");
        }
        pruned
    }

    /// Flush the attempt sink; call before shutdown.
    pub async fn flush(&self) -> Result<()> {
        self.executor.flush().await
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        self.executor.breakers()
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_limit_selection() {
        let limits = PayloadLimits::default();
        assert_eq!(limits.limit_for(true), 20 * 1024 * 1024);
        assert_eq!(limits.limit_for(false), 25 * 1024 * 1024);
    }

    #[test]
    fn test_request_context_debug_masks_credential() {
        let ctx = RequestContext::new("10.0.0.1", OpClass::stt()).with_credential("client-secret-key");
        let dbg = format!("{ctx:?}");
        assert!(!dbg.contains("client-secret-key"));
        assert!(dbg.contains("clie***"));
    }
}
