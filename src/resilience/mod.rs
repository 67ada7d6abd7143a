//! Resilience primitives guarding the upstream speech provider.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter`] | Global and per-client token buckets |
//! | [`circuit_breaker`] | Failure-ratio breaker per operation class |
//! | [`retry`] | Exponential backoff with jitter for transient failures |
//! | [`watchdog`] | Per-attempt deadline |
//!
//! The pieces are wired together by [`crate::executor::Executor`] and, one
//! level up, by [`crate::gateway::Gateway`]. All clocks are
//! `tokio::time::Instant`, so tests drive them with a paused runtime.
//!
//! ```rust
//! use speech_gateway::resilience::rate_limiter::{RateLimitConfig, RateLimiter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new(&RateLimitConfig::new().with_client_rpm(60.0).with_burst_factor(1.0));
//! assert!(limiter.admit("client-a").is_allowed());
//! # }
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;
pub mod watchdog;
