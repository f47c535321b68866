//! Resilient client for the external image-classification service.
//!
//! Three layers, composable and individually testable:
//! - [`HttpVisionClient`] — the raw HTTP call with a per-call timeout,
//!   mapping response status onto the transient/permanent error split.
//! - [`RetryPolicy`] — bounded exponential backoff with jitter, applied to
//!   transient failures only.
//! - [`CircuitBreaker`] — injectable breaker instance; after N consecutive
//!   failures calls fail fast with `VisionError::CircuitOpen` until the
//!   cooldown elapses, then a single half-open trial decides.
//!
//! [`ResilientClassifier`] composes all three behind the [`VisionClassifier`]
//! trait. The orchestrator decides what a definitive failure means for the
//! report; this crate only decides when to stop calling.

pub mod breaker;
pub mod http;
pub mod resilient;
pub mod retry;
pub mod traits;
pub mod types;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use http::HttpVisionClient;
pub use resilient::ResilientClassifier;
pub use retry::RetryPolicy;
pub use traits::VisionClassifier;
pub use types::{Classification, ImageRef, VisionError};
