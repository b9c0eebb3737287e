//! Backup Keeper - Main Entry Point

use std::net::SocketAddr;
use std::sync::Arc;

use backup_keeper_backend::{
    api::{self, AppState, Collaborators},
    config::Config,
    db,
    error::Result,
    services::{
        metrics_service,
        process_lifecycle::CommandProcessLifecycle,
        retention::SysinfoDiskProbe,
        server_registry::PgServerRegistry,
        trigger::SystemClock,
    },
    store::PgBackupStore,
    telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let otel_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
    let _otel_guard = telemetry::init_tracing(otel_endpoint.as_deref(), "backup-keeper")?;

    let config = Config::from_env()?;
    tracing::info!(?config, "Starting Backup Keeper");

    let db_pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Connected to database");
    db::run_migrations(&db_pool).await?;
    tracing::info!("Database migrations complete");

    tokio::fs::create_dir_all(&config.backup_root).await?;

    let metrics_handle = metrics_service::init_metrics()?;
    tracing::info!("Prometheus metrics recorder initialized");

    let collaborators = Collaborators {
        store: Arc::new(PgBackupStore::new(db_pool.clone())),
        registry: Arc::new(PgServerRegistry::new(db_pool.clone())),
        lifecycle: Arc::new(CommandProcessLifecycle::new(
            config.process_stop_cmd.clone(),
            config.process_start_cmd.clone(),
            config.process_status_cmd.clone(),
        )
        .with_timeout(config.process_command_timeout())),
        clock: Arc::new(SystemClock),
        disk_probe: Arc::new(SysinfoDiskProbe::new(config.backup_root.clone())),
    };

    let mut app_state = AppState::new(config.clone(), collaborators)?;
    app_state.set_db(db_pool);
    app_state.set_metrics_handle(metrics_handle);
    let state = Arc::new(app_state);

    let swept = state.executor.sweep_incomplete().await?;
    if !swept.is_empty() {
        tracing::warn!(count = swept.len(), "Removed archives left by interrupted backups");
    }

    let scheduler = state.scheduler.clone();
    let ticker = scheduler.spawn();

    let app = api::routes::create_router(state);

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(
        drain_secs = config.shutdown_drain_secs,
        "Draining in-flight backups"
    );
    scheduler.shutdown(config.shutdown_drain()).await;
    if let Err(e) = ticker.await {
        tracing::warn!(error = %e, "Scheduler ticker ended abnormally");
    }
    tracing::info!("Backup Keeper stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
