//! Persistence for schedules, archive metadata and restore operations.
//!
//! The scheduling core only talks to [`BackupStore`]; the Postgres
//! implementation is used in production and the in-memory one in tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{BackupArchive, BackupSchedule, RestoreOperation, ServerId};

pub use memory::MemoryBackupStore;
pub use postgres::PgBackupStore;

/// Repository interface over the three backup entities.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// All schedules ordered by server id.
    async fn list_schedules(&self) -> Result<Vec<BackupSchedule>>;

    async fn get_schedule(&self, server_id: ServerId) -> Result<Option<BackupSchedule>>;

    /// Insert a schedule. Fails with `ScheduleConflict` if the server already has one.
    async fn insert_schedule(&self, schedule: &BackupSchedule) -> Result<BackupSchedule>;

    /// Replace an existing schedule. Fails with `ScheduleNotFound` if there is none.
    async fn update_schedule(&self, schedule: &BackupSchedule) -> Result<BackupSchedule>;

    async fn delete_schedule(&self, server_id: ServerId) -> Result<()>;

    /// Record a successful backup. A server without a schedule is left untouched.
    async fn set_last_backup(&self, server_id: ServerId, at: DateTime<Utc>) -> Result<()>;

    async fn insert_archive(&self, archive: &BackupArchive) -> Result<()>;

    async fn update_archive(&self, archive: &BackupArchive) -> Result<()>;

    async fn delete_archive(&self, id: Uuid) -> Result<()>;

    /// Archives for one server, newest first.
    async fn list_archives(&self, server_id: ServerId) -> Result<Vec<BackupArchive>>;

    /// Archives across all servers, newest first.
    async fn list_all_archives(&self) -> Result<Vec<BackupArchive>>;

    async fn find_archive(
        &self,
        server_id: ServerId,
        filename: &str,
    ) -> Result<Option<BackupArchive>>;

    /// Insert or update a restore operation.
    async fn save_restore(&self, op: &RestoreOperation) -> Result<()>;

    /// Restore operations for one server, newest first.
    async fn list_restores(&self, server_id: ServerId) -> Result<Vec<RestoreOperation>>;

    async fn latest_restore(&self, server_id: ServerId) -> Result<Option<RestoreOperation>> {
        Ok(self.list_restores(server_id).await?.into_iter().next())
    }
}
