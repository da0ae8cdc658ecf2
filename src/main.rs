use std::sync::Arc;

use proctor_server::{InMemoryProfileStore, ServerConfig};
use proctor_telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() {
    let telemetry = init_telemetry(TelemetryConfig::default());

    tracing::info!("Starting exam session coordination server");

    let config = ServerConfig::from_env();
    let profiles = Arc::new(InMemoryProfileStore::new());

    let handle = proctor_server::start(config, profiles, telemetry.metrics())
        .await
        .expect("Failed to start server");

    tracing::info!(port = handle.port, "Coordination server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    tracing::info!("Shutting down");
}
