/// flowrunner: distributed workflow execution worker
///
/// Main entry point. Loads configuration from the environment and starts the
/// worker together with its monitoring server.

use flowrunner::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Job submission at /api/jobs
/// - Worker status at /api/worker/status
/// - Execution state and recent events at /api/executions/{id}
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (FLOWRUNNER_* environment variables over defaults)
    let config = Config::default();

    // Start the server
    start_server(config).await?;

    Ok(())
}
