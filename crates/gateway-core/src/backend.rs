//! Model backend abstraction.
//!
//! The gateway never talks to a model directly. It calls a [`ModelBackend`],
//! which may be a remote HTTP service or an in-process stand-in.

use crate::error::GatewayResult;
use crate::types::{BackendOutput, InferenceInput, ModelIdentity};
use async_trait::async_trait;
use std::time::Duration;

/// Core trait for model backends
///
/// Implementations report failures as [`crate::GatewayError::Backend`] or
/// [`crate::GatewayError::Timeout`] so the caller can classify them for retry
/// and circuit breaking.
#[async_trait]
pub trait ModelBackend: Send + Sync + 'static {
    /// Backend instance identifier, also used as the breaker dependency name
    fn id(&self) -> &str;

    /// Identity of the model this backend serves
    fn model(&self) -> &ModelIdentity;

    /// Run one prediction
    ///
    /// # Errors
    /// Returns `GatewayError` on transport failures, timeouts or backend errors
    async fn predict(&self, input: &InferenceInput) -> GatewayResult<BackendOutput>;

    /// Lightweight reachability probe
    ///
    /// # Errors
    /// Returns `GatewayError` if the backend does not answer healthily
    async fn health_check(&self) -> GatewayResult<()>;

    /// Per-call timeout applied by the backend client
    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }
}
