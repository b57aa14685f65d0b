//! # Gateway Core
//!
//! Core types for the model-serving gateway:
//! - Error taxonomy and the client-facing error envelope
//! - Prediction request/response data model and input validation
//! - The `ModelBackend` trait implemented by backend clients
//! - The `MetricsRecorder` interface used by every component

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod telemetry;
pub mod types;

pub use backend::ModelBackend;
pub use error::{ErrorBody, ErrorEnvelope, GatewayError, GatewayResult, INTERNAL_ERROR_MESSAGE};
pub use telemetry::{noop_recorder, MetricsRecorder, NoopRecorder, SharedRecorder};
pub use types::{
    BackendOutput, BatchItemResult, BatchPredictionRequest, BatchPredictionResponse, Features,
    InferenceInput, InputError, InputLimits, ItemError, ItemStatus, ModelIdentity, Parameters,
    Prediction, PredictionRequest, PredictionResponse, RETURN_PROBABILITY_PARAM,
};
