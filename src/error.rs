use crate::resilience::rate_limiter::RateScope;
use crate::upstream::{OpClass, UpstreamError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Structured error context for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Configuration key or record field that caused the error (e.g. "rate_limit.burst_factor")
    pub field_path: Option<String>,
    /// Additional detail (expected value, key fingerprints, ...)
    pub details: Option<String>,
    /// Component that raised the error (e.g. "credential_store", "authenticator")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Gateway error taxonomy.
///
/// Errors are classified once where they are produced and never reclassified;
/// each variant is a distinct stage-specific kind so callers can show the
/// right guidance ("try later" vs "this call failed" vs "operator fault").
#[derive(Debug, Error)]
pub enum Error {
    #[error("Authentication failed: {message}{}", format_context(.context))]
    Authentication {
        message: String,
        context: ErrorContext,
    },

    #[error("Forbidden: {message}{}", format_context(.context))]
    Forbidden {
        message: String,
        context: ErrorContext,
    },

    #[error("Rate limited ({scope} scope): retry after {retry_after_ms} ms")]
    RateLimited { scope: RateScope, retry_after_ms: u64 },

    #[error("Circuit open for '{op_class}': upstream presumed down, retry after {retry_after_ms} ms")]
    CircuitOpen { op_class: OpClass, retry_after_ms: u64 },

    #[error("Upstream transient failure for '{op_class}' after {attempts} attempt(s): {source}")]
    UpstreamTransient {
        op_class: OpClass,
        attempts: u32,
        source: UpstreamError,
    },

    #[error("Upstream rejected '{op_class}' request: {source}")]
    UpstreamPermanent {
        op_class: OpClass,
        source: UpstreamError,
    },

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Encryption error: {message}{}", format_context(.context))]
    Encryption {
        message: String,
        context: ErrorContext,
    },

    #[error("Decryption error: {message}{}", format_context(.context))]
    Decryption {
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

/// Flat error kind used in metrics histograms and wire bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Forbidden,
    RateLimited,
    CircuitOpen,
    UpstreamTransient,
    UpstreamPermanent,
    PayloadTooLarge,
    Encryption,
    Decryption,
    Configuration,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Forbidden => "forbidden",
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::UpstreamTransient => "upstream_transient",
            Self::UpstreamPermanent => "upstream_permanent",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Encryption => "encryption",
            Self::Decryption => "decryption",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON error body handed to the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_class: Option<String>,
}

impl Error {
    pub fn authentication(msg: impl Into<String>) -> Self {
        Error::Authentication {
            message: msg.into(),
            context: ErrorContext::new().with_source("authenticator"),
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Error::Forbidden {
            message: msg.into(),
            context: ErrorContext::new().with_source("authenticator"),
        }
    }

    pub fn encryption_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Encryption {
            message: msg.into(),
            context,
        }
    }

    pub fn decryption_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Decryption {
            message: msg.into(),
            context,
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Authentication { .. } => ErrorKind::Authentication,
            Error::Forbidden { .. } => ErrorKind::Forbidden,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::UpstreamTransient { .. } => ErrorKind::UpstreamTransient,
            Error::UpstreamPermanent { .. } => ErrorKind::UpstreamPermanent,
            Error::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Error::Encryption { .. } => ErrorKind::Encryption,
            Error::Decryption { .. } => ErrorKind::Decryption,
            Error::Configuration { .. } => ErrorKind::Configuration,
            Error::Io(_) | Error::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Wait hint for the caller, when the error has one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after_ms, .. } | Error::CircuitOpen { retry_after_ms, .. } => {
                Some(*retry_after_ms)
            }
            Error::UpstreamTransient { source, .. } => source.retry_after_ms,
            _ => None,
        }
    }

    pub fn op_class(&self) -> Option<&OpClass> {
        match self {
            Error::CircuitOpen { op_class, .. }
            | Error::UpstreamTransient { op_class, .. }
            | Error::UpstreamPermanent { op_class, .. } => Some(op_class),
            _ => None,
        }
    }

    /// The upstream failure behind this error, if it came from the provider.
    pub fn upstream(&self) -> Option<&UpstreamError> {
        match self {
            Error::UpstreamTransient { source, .. } | Error::UpstreamPermanent { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Authentication { context, .. }
            | Error::Forbidden { context, .. }
            | Error::Encryption { context, .. }
            | Error::Decryption { context, .. }
            | Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Authentication { .. } => "UNAUTHORIZED",
            Error::Forbidden { .. } => "FORBIDDEN",
            Error::RateLimited { .. } => "RATE_LIMIT",
            Error::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Error::UpstreamTransient { source, .. }
                if source.code == crate::error_code::StandardErrorCode::Timeout =>
            {
                "UPSTREAM_TIMEOUT"
            }
            Error::UpstreamTransient { .. } => "UPSTREAM_ERROR",
            Error::UpstreamPermanent { .. } => "UPSTREAM_REJECTED",
            Error::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Error::Encryption { .. } | Error::Decryption { .. } => "CREDENTIAL_FAULT",
            Error::Configuration { .. } => "CONFIG_ERROR",
            Error::Io(_) | Error::Serialization(_) => "INTERNAL",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Error::Authentication { .. } => 401,
            Error::Forbidden { .. } => 403,
            Error::RateLimited { .. } => 429,
            Error::CircuitOpen { .. } => 503,
            Error::UpstreamTransient { .. } if self.code() == "UPSTREAM_TIMEOUT" => 504,
            Error::UpstreamTransient { .. } => 502,
            Error::UpstreamPermanent { source, .. } => match source.status {
                Some(s) if (400..500).contains(&s) => s,
                _ => 400,
            },
            Error::PayloadTooLarge { .. } => 413,
            Error::Encryption { .. }
            | Error::Decryption { .. }
            | Error::Configuration { .. }
            | Error::Io(_)
            | Error::Serialization(_) => 500,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            detail: self.to_string(),
            retry_after_ms: self.retry_after_ms(),
            op_class: self.op_class().map(|c| c.to_string()),
        }
    }
}
