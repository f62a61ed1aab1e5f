use crate::config::parse::load_config;
use crate::config::Config;
use crate::ingest::Pipeline;
use crate::storage::duckdb::DuckDbStorage;
use crate::storage::traits::Storage;
use crate::web::{run_server, AppState};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::traits::StorageError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/ingestor/config.yml");
            eprintln!("  /etc/ingestor/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'ingestor config init' to generate one.");
            std::process::exit(1);
        }
    };

    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(&config_path)?;
    let grace = config.ingest.flush_timeout;

    let result = block_on_service(grace, async move {
        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("Shutdown signal received");
            signal_token.cancel();
        });

        run_service(config, shutdown).await
    })?;

    result.map_err(|e| e.into())
}

/// Drive `service` to completion on a fresh multi-threaded runtime.
///
/// Blocking store calls still running afterwards (a flush abandoned on
/// timeout) get at most `grace` to return before the runtime is torn down
/// without them.
pub fn block_on_service<F>(grace: Duration, service: F) -> Result<F::Output, std::io::Error>
where
    F: Future,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(service);
    runtime.shutdown_timeout(grace);
    Ok(output)
}

/// Run storage, pipeline and web server until `shutdown` is cancelled, then
/// stop the server and let the accumulator perform its drain flush.
pub async fn run_service(config: Config, shutdown: CancellationToken) -> Result<(), RunError> {
    info!(path = %config.storage.path.display(), "Initializing storage");
    let storage = Arc::new(DuckDbStorage::new(&config.storage.path)?);
    storage.init_schema().await?;

    let listener = TcpListener::bind(&config.web.listen)
        .await
        .map_err(|source| RunError::Bind {
            addr: config.web.listen.clone(),
            source,
        })?;

    info!(
        buffer_limit = config.ingest.buffer_limit,
        batch_size = config.ingest.batch_size,
        "Starting ingest pipeline"
    );
    let pipeline = Pipeline::start(storage.clone(), &config.ingest, shutdown.clone());

    let state = AppState {
        gateway: pipeline.gateway.clone(),
        storage: storage.clone(),
    };
    let web_handle = tokio::spawn(run_server(listener, state, shutdown.clone()));
    drop(pipeline.gateway);

    info!("Ingestor started, press Ctrl+C to shutdown");
    shutdown.cancelled().await;

    match web_handle.await {
        Ok(Ok(())) => info!("Web server stopped"),
        Ok(Err(e)) => error!(error = %e, "Web server error"),
        Err(e) => error!(error = %e, "Web server task join error"),
    }

    let final_state = pipeline.worker.await?;
    let stored_rows = storage.count_metrics().await.ok();
    info!(state = ?final_state, stored_rows = ?stored_rows, "Ingestor shutdown complete");

    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
