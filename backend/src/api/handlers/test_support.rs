//! In-memory application state for handler tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::Request,
    response::Response,
    Router,
};
use chrono::{NaiveTime, TimeZone, Utc};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use crate::api::{AppState, Collaborators, SharedState};
use crate::config::Config;
use crate::error::Result;
use crate::models::{BackupSchedule, ScheduleType, ServerId};
use crate::services::process_lifecycle::ProcessLifecycle;
use crate::services::retention::DiskUsageProbe;
use crate::services::server_registry::{ServerInfo, StaticServerRegistry};
use crate::services::trigger::{Clock, ManualClock};
use crate::store::{BackupStore, MemoryBackupStore};

/// Process manager that flips a flag per server.
#[derive(Default)]
pub struct FakeProcess {
    running: Mutex<HashMap<ServerId, bool>>,
}

impl FakeProcess {
    pub fn set_running(&self, server_id: ServerId, running: bool) {
        self.running
            .lock()
            .unwrap()
            .insert(server_id, running);
    }

    pub fn is_up(&self, server_id: ServerId) -> bool {
        self.running
            .lock()
            .unwrap()
            .get(&server_id)
            .copied()
            .unwrap_or(false)
    }
}

#[async_trait]
impl ProcessLifecycle for FakeProcess {
    async fn stop(&self, server_id: ServerId) -> Result<()> {
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

struct QuietDisk;

impl DiskUsageProbe for QuietDisk {
    fn usage_percent(&self) -> Result<f64> {
        Ok(10.0)
    }
}

pub struct TestApp {
    pub state: SharedState,
    pub store: Arc<MemoryBackupStore>,
    pub registry: Arc<StaticServerRegistry>,
    pub process: Arc<FakeProcess>,
    pub clock: Arc<ManualClock>,
    tmp: TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let tmp = TempDir::new().unwrap();
        let backup_root = tmp.path().join("backups");
        std::fs::create_dir_all(&backup_root).unwrap();

        let mut config = Config {
            backup_root,
            process_stop_timeout_secs: 2,
            interactive_lock_wait_secs: 1,
            verify_markers: vec!["world".into()],
            ..Config::default()
        };
        adjust(&mut config);

        let store = Arc::new(MemoryBackupStore::new());
        let registry = Arc::new(StaticServerRegistry::new());
        let process = Arc::new(FakeProcess::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap(),
        ));

        let state = AppState::new(
            config,
            Collaborators {
                store: store.clone(),
                registry: registry.clone(),
                lifecycle: process.clone(),
                clock: clock.clone(),
                disk_probe: Arc::new(QuietDisk),
            },
        )
        .unwrap();

        Self {
            state: Arc::new(state),
            store,
            registry,
            process,
            clock,
            tmp,
        }
    }

    pub fn server_dir(&self, server_id: ServerId) -> PathBuf {
        self.tmp.path().join("servers").join(server_id.to_string())
    }

    /// Register a server whose directory holds a small world.
    pub fn add_server(&self, server_id: ServerId, name: &str) {
        let dir = self.server_dir(server_id);
        std::fs::create_dir_all(dir.join("world")).unwrap();
        std::fs::write(dir.join("world/level.dat"), b"level-data").unwrap();
        std::fs::write(dir.join("server.properties"), b"motd=hello\n").unwrap();
        self.registry.insert(ServerInfo {
            id: server_id,
            name: name.to_string(),
            directory: dir,
            owner: None,
        });
    }

    pub async fn add_schedule(&self, server_id: ServerId, retention_days: i32) {
        let now = self.clock.now();
        let schedule = BackupSchedule {
            server_id,
            schedule_type: ScheduleType::Daily,
            schedule_time: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            retention_days,
            enabled: true,
            last_backup: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_schedule(&schedule).await.unwrap();
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
