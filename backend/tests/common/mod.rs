//! Common test utilities for backend integration tests
//!
//! This module provides shared infrastructure for testing:
//! - Fake process manager and a simulated disk
//! - An application state wired on the in-memory store
//! - Request helpers for driving the router

#![allow(dead_code)]
#![allow(unused_imports)]

pub mod fixtures;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{body::Body, http::Request, response::Response, Router};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use backup_keeper_backend::api::{AppState, Collaborators, SharedState};
use backup_keeper_backend::config::Config;
use backup_keeper_backend::error::Result;
use backup_keeper_backend::models::ServerId;
use backup_keeper_backend::services::process_lifecycle::ProcessLifecycle;
use backup_keeper_backend::services::retention::DiskUsageProbe;
use backup_keeper_backend::services::server_registry::{ServerInfo, StaticServerRegistry};
use backup_keeper_backend::services::trigger::{Clock, ManualClock};
use backup_keeper_backend::store::MemoryBackupStore;

use fixtures::{dir_size, TestWorld};

/// Process manager double. Stops can be slowed down to hold a job mid-flight.
#[derive(Default)]
pub struct FakeProcess {
    running: Mutex<HashMap<ServerId, bool>>,
    stop_delay_ms: AtomicU64,
}

impl FakeProcess {
    pub fn set_running(&self, server_id: ServerId, running: bool) {
        self.running.lock().unwrap().insert(server_id, running);
    }

    pub fn is_up(&self, server_id: ServerId) -> bool {
        self.running
            .lock()
            .unwrap()
            .get(&server_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        self.stop_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessLifecycle for FakeProcess {
    async fn stop(&self, server_id: ServerId) -> Result<()> {
        let delay = self.stop_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.set_running(server_id, false);
        Ok(())
    }

    async fn start(&self, server_id: ServerId) -> Result<()> {
        self.set_running(server_id, true);
        Ok(())
    }

    async fn is_running(&self, server_id: ServerId) -> bool {
        self.is_up(server_id)
    }
}

/// Disk whose usage is the size of the backup root over a settable capacity.
pub struct SimulatedDisk {
    root: PathBuf,
    capacity: AtomicU64,
}

impl SimulatedDisk {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            capacity: AtomicU64::new(u64::MAX),
        }
    }

    pub fn set_capacity(&self, bytes: u64) {
        self.capacity.store(bytes.max(1), Ordering::SeqCst);
    }
}

impl DiskUsageProbe for SimulatedDisk {
    fn usage_percent(&self) -> Result<f64> {
        let used = dir_size(&self.root) as f64;
        Ok(used / self.capacity.load(Ordering::SeqCst) as f64 * 100.0)
    }
}

/// A full application state on in-memory collaborators.
pub struct TestHarness {
    pub state: SharedState,
    pub store: Arc<MemoryBackupStore>,
    pub registry: Arc<StaticServerRegistry>,
    pub process: Arc<FakeProcess>,
    pub clock: Arc<ManualClock>,
    pub disk: Arc<SimulatedDisk>,
    pub tmp: TempDir,
}

impl TestHarness {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::with_config(start, |_| {})
    }

    pub fn with_config(start: DateTime<Utc>, adjust: impl FnOnce(&mut Config)) -> Self {
        let tmp = TempDir::new().unwrap();
        let backup_root = tmp.path().join("backups");
        std::fs::create_dir_all(&backup_root).unwrap();

        let mut config = Config {
            backup_root: backup_root.clone(),
            process_stop_timeout_secs: 5,
            interactive_lock_wait_secs: 0,
            verify_markers: vec!["world/level.dat".into(), "server.properties".into()],
            ..Config::default()
        };
        adjust(&mut config);

        let store = Arc::new(MemoryBackupStore::new());
        let registry = Arc::new(StaticServerRegistry::new());
        let process = Arc::new(FakeProcess::default());
        let clock = Arc::new(ManualClock::new(start));
        let disk = Arc::new(SimulatedDisk::new(backup_root));

        let state = AppState::new(
            config,
            Collaborators {
                store: store.clone(),
                registry: registry.clone(),
                lifecycle: process.clone(),
                clock: clock.clone(),
                disk_probe: disk.clone(),
            },
        )
        .unwrap();

        Self {
            state: Arc::new(state),
            store,
            registry,
            process,
            clock,
            disk,
            tmp,
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn server_dir(&self, server_id: ServerId) -> PathBuf {
        self.tmp.path().join("servers").join(server_id.to_string())
    }

    /// Register a server and lay down its files.
    pub fn add_server(&self, server_id: ServerId, name: &str) -> PathBuf {
        let dir = self.server_dir(server_id);
        TestWorld::game_server().write_to(&dir);
        self.registry.insert(ServerInfo {
            id: server_id,
            name: name.to_string(),
            directory: dir.clone(),
            owner: Some("tester".into()),
        });
        dir
    }

    pub fn router(&self) -> Router {
        backup_keeper_backend::api::routes::create_router(self.state.clone())
    }
}

/// Send one request through a router.
pub async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    router.clone().oneshot(request).await.unwrap()
}

pub async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
