//! Classification codes for upstream provider failures.
//!
//! Every failure produced by an upstream call is classified exactly once, at
//! the point it is produced, into a [`StandardErrorCode`]. The code decides
//! whether the executor may retry the call and whether the failure counts
//! against the circuit breaker for its operation class.
//!
//! | Category    | Codes                                              | Retried |
//! |-------------|----------------------------------------------------|---------|
//! | client      | invalid_request, authentication, permission_denied, not_found, request_too_large, unsupported_media | no |
//! | rate        | rate_limited, quota_exhausted                      | rate_limited only |
//! | server      | server_error, overloaded, timeout, network         | yes     |
//! | unknown     | unknown                                            | no      |
//!
//! ```rust
//! use speech_gateway::error_code::StandardErrorCode;
//!
//! let code = StandardErrorCode::from_http_status(503);
//! assert_eq!(code, StandardErrorCode::Overloaded);
//! assert!(code.retryable());
//! assert_eq!(code.category(), "server");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StandardErrorCode {
    /// Malformed request or invalid parameters (e.g. unknown voice settings)
    InvalidRequest,
    /// Provider rejected our provider key
    Authentication,
    /// Provider key valid but lacks access to the feature
    PermissionDenied,
    /// Voice, model or resource does not exist
    NotFound,
    /// Audio or text exceeds provider limits
    RequestTooLarge,
    /// Audio container or codec not accepted
    UnsupportedMedia,
    /// Provider-side request rate exceeded
    RateLimited,
    /// Character / minute quota exhausted for the billing period
    QuotaExhausted,
    /// Internal error on provider side
    ServerError,
    /// Provider temporarily overloaded
    Overloaded,
    /// No response before a deadline (watchdog or transport)
    Timeout,
    /// Connection refused, reset, DNS failure
    Network,
    /// Could not be classified
    Unknown,
}

impl StandardErrorCode {
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::Authentication => "authentication",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::RequestTooLarge => "request_too_large",
            Self::UnsupportedMedia => "unsupported_media",
            Self::RateLimited => "rate_limited",
            Self::QuotaExhausted => "quota_exhausted",
            Self::ServerError => "server_error",
            Self::Overloaded => "overloaded",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }

    /// Transient failures: the same call may succeed if repeated later.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ServerError | Self::Overloaded | Self::Timeout | Self::Network
        )
    }

    #[inline]
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidRequest
            | Self::Authentication
            | Self::PermissionDenied
            | Self::NotFound
            | Self::RequestTooLarge
            | Self::UnsupportedMedia => "client",
            Self::RateLimited | Self::QuotaExhausted => "rate",
            Self::ServerError | Self::Overloaded | Self::Timeout | Self::Network => "server",
            Self::Unknown => "unknown",
        }
    }

    /// Maps a provider error `status`/`code` string from a JSON error body.
    ///
    /// Accepts the standard names plus aliases seen in speech provider
    /// responses (`"invalid_api_key"`, `"quota_exceeded"`, `"voice_not_found"`,
    /// `"too_many_concurrent_requests"`, ...).
    pub fn from_provider_code(provider_code: &str) -> Option<Self> {
        let code = match provider_code {
            "invalid_request" | "invalid_request_error" | "validation_error" => Self::InvalidRequest,
            "authentication" | "invalid_api_key" | "unauthorized" => Self::Authentication,
            "permission_denied" | "missing_permissions" => Self::PermissionDenied,
            "not_found" | "voice_not_found" | "model_not_found" => Self::NotFound,
            "request_too_large" | "text_too_long" | "max_character_limit_exceeded" => {
                Self::RequestTooLarge
            }
            "unsupported_media" | "invalid_audio" | "unsupported_format" => Self::UnsupportedMedia,
            "rate_limited" | "too_many_concurrent_requests" | "system_busy" => Self::RateLimited,
            "quota_exhausted" | "quota_exceeded" => Self::QuotaExhausted,
            "server_error" | "internal_error" => Self::ServerError,
            "overloaded" => Self::Overloaded,
            "timeout" => Self::Timeout,
            "network" => Self::Network,
            _ => return None,
        };
        Some(code)
    }

    /// Maps an HTTP status code to the most likely classification.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::InvalidRequest,
            401 => Self::Authentication,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            408 => Self::Timeout,
            413 => Self::RequestTooLarge,
            415 => Self::UnsupportedMedia,
            429 => Self::RateLimited,
            500 | 502 => Self::ServerError,
            503 | 529 => Self::Overloaded,
            504 => Self::Timeout,
            s if (500..600).contains(&s) => Self::ServerError,
            s if (400..500).contains(&s) => Self::InvalidRequest,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for StandardErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
