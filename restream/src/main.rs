use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use restream::api::{ApiServer, AppState};
use restream::catalog::StaticCatalog;
use restream::config::AppConfig;
use restream::logging::init_logging;
use restream::panic_hook;
use restream::stream::StreamSupervisor;

/// How long in-flight HTTP requests get after the supervisor has stopped.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env_or_default()?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let (logging, _log_guard) = init_logging(&config.log_dir)?;
    panic_hook::install(&config.log_dir);

    let shutdown_token = CancellationToken::new();
    logging.start_retention_cleanup(shutdown_token.clone());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        output_root = %config.supervisor.output_root.display(),
        ffmpeg = %config.supervisor.transcoder.binary_path,
        "Starting restream"
    );

    let catalog = StaticCatalog::load_json(&config.channels_file).await?;
    if catalog.is_empty() {
        warn!(path = %config.channels_file.display(), "Channel catalog is empty");
    }

    let supervisor = StreamSupervisor::new(Arc::new(catalog), config.supervisor.clone())?;

    let state = AppState::new(supervisor.clone(), config.public_base_url.clone())
        .with_logging_config(logging.clone());
    let server = ApiServer::new(config.api.clone(), state);
    let server_token = server.cancel_token();
    let mut server_task = tokio::spawn(async move { server.run().await });

    let early_exit = tokio::select! {
        () = shutdown_signal() => None,
        result = &mut server_task => Some(result),
    };

    server_token.cancel();
    shutdown_token.cancel();

    let report = supervisor.shutdown().await;
    for failure in report.failures() {
        error!(
            channel_id = %failure.channel_id,
            error = failure.error.as_deref().unwrap_or_default(),
            "Channel did not stop cleanly"
        );
    }

    let server_result = match early_exit {
        Some(result) => result,
        None => match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, server_task).await {
            Ok(result) => result,
            Err(_) => {
                warn!("API server did not drain in time");
                Ok(Ok(()))
            }
        },
    };

    server_result??;
    info!("restream stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
