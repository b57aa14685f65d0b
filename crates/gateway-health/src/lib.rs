//! # Gateway Health
//!
//! Composite health model for the model-serving gateway: dependency probes,
//! liveness, readiness and a detailed per-dependency view.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregator;
pub mod probe;

pub use aggregator::{
    DetailedHealth, HealthAggregator, HealthConfig, HealthRecord, HealthStatus, ProbeReport,
};
pub use probe::{BackendProbe, CacheProbe, DependencyProbe};
