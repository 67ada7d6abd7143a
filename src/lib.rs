//! # speech-gateway
//!
//! Resilience and security layer that sits in front of speech AI providers
//! (speech-to-text, text-to-speech and chained STT→TTS calls).
//!
//! ## Overview
//!
//! Every inbound request is authenticated, size checked and rate limited
//! before it may reach an upstream provider. Upstream calls then run under a
//! per-operation-class circuit breaker, a watchdog timeout and a bounded
//! retry policy with exponential backoff. Each attempt is recorded into a
//! bounded metrics window. The upstream provider key is stored encrypted
//! with AES-256-GCM and swapped atomically on update.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use speech_gateway::{Gateway, GatewayConfig, OpClass, RequestContext, UpstreamError};
//!
//! #[tokio::main]
//! async fn main() -> speech_gateway::Result<()> {
//!     let cfg = GatewayConfig::load(None)?;
//!     let gateway = Gateway::new(cfg).await?;
//!
//!     let ctx = RequestContext::new("203.0.113.7", OpClass::tts())
//!         .with_credential("client-key")
//!         .with_payload(512, false);
//!
//!     let audio: Vec<u8> = gateway
//!         .execute_with_key(&ctx, |key| async move {
//!             // one upstream call using `key`
//!             let _ = key;
//!             Ok::<_, UpstreamError>(Vec::new())
//!         })
//!         .await?;
//!     println!("{} bytes", audio.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`gateway`] | Request admission and the facade tying everything together |
//! | [`auth`] | API key and admin key checks |
//! | [`resilience`] | Rate limiter, circuit breaker, retry policy and watchdog |
//! | [`executor`] | Breaker + watchdog + retry loop around one upstream operation |
//! | [`metrics`] | Per-attempt records, rolling summaries and sinks |
//! | [`credential`] | Encrypted provider key storage |
//! | [`upstream`] | Operation classes and upstream failure classification |
//! | [`config`] | YAML and environment configuration |

pub mod auth;
pub mod config;
pub mod credential;
pub mod error_code;
pub mod executor;
pub mod gateway;
pub mod metrics;
pub mod resilience;
pub mod upstream;

pub use auth::{Authenticator, Principal, SecurityConfig};
pub use config::GatewayConfig;
pub use credential::{CredentialStore, MasterKey, SecretString};
pub use error_code::StandardErrorCode;
pub use executor::Executor;
pub use gateway::{DiagnosticsSnapshot, Gateway, PayloadLimits, RequestContext};
pub use metrics::{CallAttemptRecord, MetricsAggregator, MetricsSummary};
pub use upstream::{OpClass, UpstreamError};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, ErrorKind};
