//! Upstream call abstraction.
//!
//! The gateway never builds provider requests. Callers hand it a zero-argument
//! closure producing a future that performs exactly one upstream call and
//! resolves to `Ok(payload)` or a classified [`UpstreamError`]. The helpers in
//! this module classify `reqwest` responses and transport failures so the
//! provider-client layer does not have to.

use crate::error_code::StandardErrorCode;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// Logical category of upstream call with independent breaker and metrics state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpClass(Arc<str>);

impl OpClass {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Speech-to-text.
    pub fn stt() -> Self {
        Self::new("stt")
    }

    /// Text-to-speech.
    pub fn tts() -> Self {
        Self::new("tts")
    }

    /// Chained speech-to-speech (transcribe then synthesize).
    pub fn chain() -> Self {
        Self::new("chain")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for OpClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for OpClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(OpClass::from)
    }
}

impl From<&str> for OpClass {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for OpClass {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// A classified failure of one upstream attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    pub code: StandardErrorCode,
    pub message: String,
    /// HTTP status returned by the provider, if any.
    pub status: Option<u16>,
    /// Provider-requested wait before the next attempt.
    pub retry_after_ms: Option<u64>,
}

impl UpstreamError {
    pub fn new(code: StandardErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            retry_after_ms: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StandardErrorCode::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(StandardErrorCode::Network, message)
    }

    /// Classifies a non-success HTTP response.
    ///
    /// A provider error code found in the JSON body wins over the status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let code = provider_code_from_body(body)
            .and_then(|c| StandardErrorCode::from_provider_code(&c))
            .unwrap_or_else(|| StandardErrorCode::from_http_status(status));
        Self {
            code,
            message: truncate(body, 512),
            status: Some(status),
            retry_after_ms: None,
        }
    }

    /// Classifies a transport-level failure.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), &err.to_string());
        }
        let code = if err.is_timeout() {
            StandardErrorCode::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() {
            StandardErrorCode::Network
        } else {
            StandardErrorCode::Unknown
        };
        Self::new(code, err.to_string())
    }

    /// Turns a response into `Ok(response)` on success or a classified failure.
    pub async fn check_response(
        resp: reqwest::Response,
    ) -> std::result::Result<reqwest::Response, UpstreamError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let retry_after_ms = retry_after_ms(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        let mut err = Self::from_status(status, &body);
        err.retry_after_ms = retry_after_ms;
        Err(err)
    }

    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[inline]
    pub fn retryable(&self) -> bool {
        self.code.retryable()
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {}): {}", self.code, status, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        Self::from_reqwest(&err)
    }
}

/// Parses `Retry-After: <seconds>`. The HTTP-date form is ignored.
pub fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    let secs: u64 = raw.parse().ok()?;
    Some(secs.saturating_mul(1000))
}

fn provider_code_from_body(body: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    // `{"detail": {"status": "..."}}` and `{"error": {"code": "..."}}` shapes
    json.get("detail")
        .and_then(|d| d.get("status"))
        .or_else(|| json.get("error").and_then(|e| e.get("code")))
        .or_else(|| json.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_body_code_overrides_status() {
        let body = r#"{"detail":{"status":"quota_exceeded","message":"out of characters"}}"#;
        let err = UpstreamError::from_status(401, body);
        assert_eq!(err.code, StandardErrorCode::QuotaExhausted);
        assert_eq!(err.status, Some(401));
        assert!(!err.retryable());
    }

    #[test]
    fn test_status_fallback_when_body_is_not_json() {
        let err = UpstreamError::from_status(502, "<html>bad gateway</html>");
        assert_eq!(err.code, StandardErrorCode::ServerError);
        assert!(err.retryable());
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("3"));
        assert_eq!(retry_after_ms(&headers), Some(3000));

        headers.insert("retry-after", HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after_ms(&headers), None);
    }

    #[test]
    fn test_long_bodies_are_truncated_on_char_boundary() {
        let body = "ü".repeat(400);
        let err = UpstreamError::from_status(500, &body);
        assert!(err.message.ends_with("..."));
        assert!(err.message.len() <= 515);
    }

    #[test]
    fn test_op_class_display_and_equality() {
        assert_eq!(OpClass::stt().to_string(), "stt");
        assert_eq!(OpClass::from("tts"), OpClass::tts());
        assert_ne!(OpClass::stt(), OpClass::chain());
    }
}
