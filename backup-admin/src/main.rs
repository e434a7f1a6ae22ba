mod config;
mod error;
mod routes;
mod services;
mod state;

use crate::config::AppConfig;
use crate::services::scheduler::TaskScheduler;
use crate::state::AppState;
use anyhow::Context;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    let engine_config = backup_engine::Config::from_file(&config.engine_config)
        .with_context(|| format!("loading {}", config.engine_config.display()))?;

    // Initialize logging
    backup_engine::utils::logger::init(&engine_config.log.level)?;
    tracing::info!(
        "Starting backup admin on port {} (role: {})",
        config.port,
        engine_config.role
    );
    if config.admin_token.is_none() {
        tracing::warn!("ADMIN_TOKEN is not set, every /admin request will be refused");
    }

    let state = Arc::new(AppState::new(config.clone(), engine_config));

    // Initialize cron scheduler
    let scheduler = match TaskScheduler::new(state.clone()).await {
        Ok(s) => {
            if let Err(e) = s.init_schedules(&config).await {
                tracing::warn!("Failed to initialize schedules: {}", e);
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down...");

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    // In-flight engine runs are not awaited.
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
