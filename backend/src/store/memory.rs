//! In-memory backup store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::BackupStore;
use crate::error::{AppError, Result};
use crate::models::{BackupArchive, BackupSchedule, RestoreOperation, ServerId};

#[derive(Default)]
struct State {
    schedules: BTreeMap<ServerId, BackupSchedule>,
    archives: HashMap<Uuid, BackupArchive>,
    restores: HashMap<Uuid, RestoreOperation>,
}

/// Store backed by process memory. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryBackupStore {
    state: RwLock<State>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(archives: &mut [BackupArchive]) {
    archives.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.filename.cmp(&a.filename))
    });
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    async fn list_schedules(&self) -> Result<Vec<BackupSchedule>> {
        Ok(self.state.read().await.schedules.values().cloned().collect())
    }

    async fn get_schedule(&self, server_id: ServerId) -> Result<Option<BackupSchedule>> {
        Ok(self.state.read().await.schedules.get(&server_id).cloned())
    }

    async fn insert_schedule(&self, schedule: &BackupSchedule) -> Result<BackupSchedule> {
        let mut state = self.state.write().await;
        if state.schedules.contains_key(&schedule.server_id) {
            return Err(AppError::ScheduleConflict(schedule.server_id));
        }
        state
            .schedules
            .insert(schedule.server_id, schedule.clone());
        Ok(schedule.clone())
    }

    async fn update_schedule(&self, schedule: &BackupSchedule) -> Result<BackupSchedule> {
        let mut state = self.state.write().await;
        match state.schedules.get_mut(&schedule.server_id) {
            Some(existing) => {
                *existing = schedule.clone();
                Ok(schedule.clone())
            }
            None => Err(AppError::ScheduleNotFound(schedule.server_id)),
        }
    }

    async fn delete_schedule(&self, server_id: ServerId) -> Result<()> {
        self.state
            .write()
            .await
            .schedules
            .remove(&server_id)
            .map(|_| ())
            .ok_or(AppError::ScheduleNotFound(server_id))
    }

    async fn set_last_backup(&self, server_id: ServerId, at: DateTime<Utc>) -> Result<()> {
        if let Some(schedule) = self.state.write().await.schedules.get_mut(&server_id) {
            schedule.last_backup = Some(at);
        }
        Ok(())
    }

    async fn insert_archive(&self, archive: &BackupArchive) -> Result<()> {
        self.state
            .write()
            .await
            .archives
            .insert(archive.id, archive.clone());
        Ok(())
    }

    async fn update_archive(&self, archive: &BackupArchive) -> Result<()> {
        let mut state = self.state.write().await;
        match state.archives.get_mut(&archive.id) {
            Some(existing) => {
                *existing = archive.clone();
                Ok(())
            }
            None => Err(AppError::ArchiveNotFound(archive.filename.clone())),
        }
    }

    async fn delete_archive(&self, id: Uuid) -> Result<()> {
        self.state.write().await.archives.remove(&id);
        Ok(())
    }

    async fn list_archives(&self, server_id: ServerId) -> Result<Vec<BackupArchive>> {
        let mut archives: Vec<BackupArchive> = self
            .state
            .read()
            .await
            .archives
            .values()
            .filter(|a| a.server_id == server_id)
            .cloned()
            .collect();
        newest_first(&mut archives);
        Ok(archives)
    }

    async fn list_all_archives(&self) -> Result<Vec<BackupArchive>> {
        let mut archives: Vec<BackupArchive> =
            self.state.read().await.archives.values().cloned().collect();
        newest_first(&mut archives);
        Ok(archives)
    }

    async fn find_archive(
        &self,
        server_id: ServerId,
        filename: &str,
    ) -> Result<Option<BackupArchive>> {
        Ok(self
            .state
            .read()
            .await
            .archives
            .values()
            .find(|a| a.server_id == server_id && a.filename == filename)
            .cloned())
    }

    async fn save_restore(&self, op: &RestoreOperation) -> Result<()> {
        self.state.write().await.restores.insert(op.id, op.clone());
        Ok(())
    }

    async fn list_restores(&self, server_id: ServerId) -> Result<Vec<RestoreOperation>> {
        let mut ops: Vec<RestoreOperation> = self
            .state
            .read()
            .await
            .restores
            .values()
            .filter(|op| op.server_id == server_id)
            .cloned()
            .collect();
        ops.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        Ok(ops)
    }
}
