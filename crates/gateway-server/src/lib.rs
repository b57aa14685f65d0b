//! # Gateway Server
//!
//! HTTP surface of the model-serving gateway: the prediction pipeline,
//! health and metrics endpoints, middleware and server lifecycle.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod pipeline;
pub mod routes;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use extractors::{hash_api_key, CallerContext, JsonBody, RequestId};
pub use pipeline::{PipelineSettings, PredictionGateway};
pub use routes::create_router;
pub use server::{shutdown_signal, Server, ServerError};
pub use state::{AppState, AppStateBuilder};
