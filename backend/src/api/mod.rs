//! API module - HTTP handlers and shared state.

pub mod dto;
pub mod handlers;
pub mod openapi;
pub mod routes;

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;

use crate::config::Config;
use crate::error::Result;
use crate::services::backup_executor::{BackupExecutor, ExecutorSettings};
use crate::services::process_lifecycle::ProcessLifecycle;
use crate::services::restore_service::{RestoreManager, RestoreSettings};
use crate::services::retention::{DiskUsageProbe, RetentionManager, RetentionPolicy};
use crate::services::scheduler_service::Scheduler;
use crate::services::server_lock::ServerLocks;
use crate::services::server_registry::ServerRegistry;
use crate::services::trigger::Clock;
use crate::services::verification::VerificationEngine;
use crate::store::BackupStore;

/// External collaborators the backup engine is built on.
pub struct Collaborators {
    pub store: Arc<dyn BackupStore>,
    pub registry: Arc<dyn ServerRegistry>,
    pub lifecycle: Arc<dyn ProcessLifecycle>,
    pub clock: Arc<dyn Clock>,
    pub disk_probe: Arc<dyn DiskUsageProbe>,
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn BackupStore>,
    pub registry: Arc<dyn ServerRegistry>,
    pub clock: Arc<dyn Clock>,
    pub locks: Arc<ServerLocks>,
    pub executor: Arc<BackupExecutor>,
    pub scheduler: Arc<Scheduler>,
    pub restores: Arc<RestoreManager>,
    /// Present when running against Postgres; used by the readiness probe.
    pub db: Option<PgPool>,
    pub metrics_handle: Option<Arc<PrometheusHandle>>,
}

impl AppState {
    /// Wire the executor, scheduler and restore manager from configuration.
    ///
    /// The scheduler is constructed but not started; call `Scheduler::spawn`.
    pub fn new(config: Config, deps: Collaborators) -> Result<Self> {
        let key = config.encryption_key()?;
        let locks = ServerLocks::new();

        let verifier = VerificationEngine::new(
            config.verify_markers.clone(),
            config.verify_test_extraction,
            key.clone(),
        );
        let retention = Arc::new(RetentionManager::new(
            deps.store.clone(),
            locks.clone(),
            deps.disk_probe,
            RetentionPolicy {
                threshold_percent: config.disk_pressure_threshold_percent,
                floor: config.emergency_retention_floor,
            },
        ));

        let executor = Arc::new(BackupExecutor::new(
            deps.store.clone(),
            deps.registry.clone(),
            deps.lifecycle.clone(),
            locks.clone(),
            deps.clock.clone(),
            verifier,
            retention,
            key.clone(),
            ExecutorSettings::from_config(&config),
        ));

        let scheduler = Scheduler::new(
            deps.store.clone(),
            executor.clone(),
            deps.clock.clone(),
            config.scheduler_tick(),
        );

        let restores = Arc::new(RestoreManager::new(
            deps.store.clone(),
            deps.registry.clone(),
            deps.lifecycle,
            locks.clone(),
            deps.clock.clone(),
            key,
            RestoreSettings::from_config(&config),
        ));

        Ok(Self {
            config,
            store: deps.store,
            registry: deps.registry,
            clock: deps.clock,
            locks,
            executor,
            scheduler,
            restores,
            db: None,
            metrics_handle: None,
        })
    }

    /// Attach the Postgres pool checked by `/ready`.
    pub fn set_db(&mut self, db: PgPool) {
        self.db = Some(db);
    }

    /// Set the Prometheus metrics handle for rendering /metrics output.
    pub fn set_metrics_handle(&mut self, handle: PrometheusHandle) {
        self.metrics_handle = Some(Arc::new(handle));
    }
}

pub type SharedState = Arc<AppState>;
