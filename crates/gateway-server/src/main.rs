//! Model-serving gateway binary.

use gateway_config::{load_config, GatewayConfig};
use gateway_server::{AppState, Server, ServerError};
use gateway_telemetry::{init_logging, LogFormat, LoggingConfig};
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Gateway exited with error");
            eprintln!("model-gateway: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), ServerError> {
    let config = load_config()
        .await
        .map_err(|e| ServerError::Config(e.to_string()))?;

    init_logging(&logging_config(&config)).map_err(|e| ServerError::Config(e.to_string()))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = %config.backend.endpoint,
        cache_store = ?config.cache.store,
        "Configuration loaded"
    );

    let server_config = config.server.clone();
    let state = AppState::builder().config(config).build()?;

    Server::new(server_config, state).run().await
}

fn logging_config(config: &GatewayConfig) -> LoggingConfig {
    let logging = &config.observability.logging;
    let format = match logging.format {
        gateway_config::LogFormat::Json => LogFormat::Json,
        gateway_config::LogFormat::Pretty => LogFormat::Pretty,
        gateway_config::LogFormat::Compact => LogFormat::Compact,
    };

    let mut telemetry = LoggingConfig::default()
        .with_level(logging.level.clone())
        .with_format(format);
    telemetry.include_location = logging.include_location;
    if let Some(filter) = &logging.filter {
        telemetry = telemetry.with_filter(filter.clone());
    }
    telemetry
}
