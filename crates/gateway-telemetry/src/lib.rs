//! # Gateway Telemetry
//!
//! Observability for the model-serving gateway:
//! - Structured logging via `tracing-subscriber`
//! - Prometheus metrics implementing the core `MetricsRecorder`

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, LoggingError, SpanEvents};
pub use metrics::{Metrics, MetricsConfig, METRICS_NAMESPACE};
