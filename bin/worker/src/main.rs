use classync_worker::{config::WorkerConfig, error::StartupError, runtime};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,classync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match WorkerConfig::from_env().map_err(StartupError::from) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "worker failed to start");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("Loaded configuration");

    match runtime::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "worker failed to start");
            ExitCode::FAILURE
        }
    }
}
