//! # Gateway Backend
//!
//! Model backend clients for the model-serving gateway.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod http;

pub use http::{HttpBackendConfig, HttpModelBackend};
