/// flowrun server entry point
///
/// Loads configuration from `FLOWRUN_*` environment variables and starts the
/// HTTP control API together with the cron scheduler.

use flowrun::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Workflow definitions and manual runs at /api/workflows/*
/// - Execution inspection and debug control at /api/executions/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
