//! Postgres-backed backup store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::BackupStore;
use crate::error::{AppError, Result};
use crate::models::{BackupArchive, BackupSchedule, RestoreOperation, ServerId};

const SCHEDULE_COLUMNS: &str = "server_id, schedule_type, schedule_time, retention_days, \
     enabled, last_backup, created_at, updated_at";

const ARCHIVE_COLUMNS: &str = "id, server_id, filename, path, size_bytes, checksum, \
     compression_method, encrypted, quality_score, quality_level, was_running, status, \
     trigger_reason, created_at";

const RESTORE_COLUMNS: &str = "id, server_id, backup_filename, state, \
     pre_restore_snapshot_path, server_was_running, error_message, created_at, updated_at";

pub struct PgBackupStore {
    db: PgPool,
}

impl PgBackupStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BackupStore for PgBackupStore {
    async fn list_schedules(&self) -> Result<Vec<BackupSchedule>> {
        let schedules = sqlx::query_as::<_, BackupSchedule>(&format!(
            "SELECT {} FROM backup_schedules ORDER BY server_id",
            SCHEDULE_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;
        Ok(schedules)
    }

    async fn get_schedule(&self, server_id: ServerId) -> Result<Option<BackupSchedule>> {
        let schedule = sqlx::query_as::<_, BackupSchedule>(&format!(
            "SELECT {} FROM backup_schedules WHERE server_id = $1",
            SCHEDULE_COLUMNS
        ))
        .bind(server_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(schedule)
    }

    async fn insert_schedule(&self, schedule: &BackupSchedule) -> Result<BackupSchedule> {
        sqlx::query_as::<_, BackupSchedule>(&format!(
            r#"
            INSERT INTO backup_schedules
                (server_id, schedule_type, schedule_time, retention_days, enabled,
                 last_backup, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (server_id) DO NOTHING
            RETURNING {}
            "#,
            SCHEDULE_COLUMNS
        ))
        .bind(schedule.server_id)
        .bind(schedule.schedule_type)
        .bind(schedule.schedule_time)
        .bind(schedule.retention_days)
        .bind(schedule.enabled)
        .bind(schedule.last_backup)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .fetch_optional(&self.db)
        .await?
        .ok_or(AppError::ScheduleConflict(schedule.server_id))
    }

    async fn update_schedule(&self, schedule: &BackupSchedule) -> Result<BackupSchedule> {
        sqlx::query_as::<_, BackupSchedule>(&format!(
            r#"
            UPDATE backup_schedules
            SET schedule_type = $2, schedule_time = $3, retention_days = $4,
                enabled = $5, updated_at = $6
            WHERE server_id = $1
            RETURNING {}
            "#,
            SCHEDULE_COLUMNS
        ))
        .bind(schedule.server_id)
        .bind(schedule.schedule_type)
        .bind(schedule.schedule_time)
        .bind(schedule.retention_days)
        .bind(schedule.enabled)
        .bind(schedule.updated_at)
        .fetch_optional(&self.db)
        .await?
        .ok_or(AppError::ScheduleNotFound(schedule.server_id))
    }

    async fn delete_schedule(&self, server_id: ServerId) -> Result<()> {
        let result = sqlx::query("DELETE FROM backup_schedules WHERE server_id = $1")
            .bind(server_id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::ScheduleNotFound(server_id));
        }
        Ok(())
    }

    async fn set_last_backup(&self, server_id: ServerId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE backup_schedules SET last_backup = $2 WHERE server_id = $1")
            .bind(server_id)
            .bind(at)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_archive(&self, archive: &BackupArchive) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_archives
                (id, server_id, filename, path, size_bytes, checksum, compression_method,
                 encrypted, quality_score, quality_level, was_running, status,
                 trigger_reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(archive.id)
        .bind(archive.server_id)
        .bind(&archive.filename)
        .bind(&archive.path)
        .bind(archive.size_bytes)
        .bind(&archive.checksum)
        .bind(archive.compression_method)
        .bind(archive.encrypted)
        .bind(archive.quality_score)
        .bind(archive.quality_level)
        .bind(archive.was_running)
        .bind(archive.status)
        .bind(archive.trigger_reason)
        .bind(archive.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn update_archive(&self, archive: &BackupArchive) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE backup_archives
            SET size_bytes = $2, checksum = $3, quality_score = $4, quality_level = $5,
                was_running = $6, status = $7
            WHERE id = $1
            "#,
        )
        .bind(archive.id)
        .bind(archive.size_bytes)
        .bind(&archive.checksum)
        .bind(archive.quality_score)
        .bind(archive.quality_level)
        .bind(archive.was_running)
        .bind(archive.status)
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::ArchiveNotFound(archive.filename.clone()));
        }
        Ok(())
    }

    async fn delete_archive(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM backup_archives WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn list_archives(&self, server_id: ServerId) -> Result<Vec<BackupArchive>> {
        let archives = sqlx::query_as::<_, BackupArchive>(&format!(
            "SELECT {} FROM backup_archives WHERE server_id = $1 \
             ORDER BY created_at DESC, filename DESC",
            ARCHIVE_COLUMNS
        ))
        .bind(server_id)
        .fetch_all(&self.db)
        .await?;
        Ok(archives)
    }

    async fn list_all_archives(&self) -> Result<Vec<BackupArchive>> {
        let archives = sqlx::query_as::<_, BackupArchive>(&format!(
            "SELECT {} FROM backup_archives ORDER BY created_at DESC, filename DESC",
            ARCHIVE_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;
        Ok(archives)
    }

    async fn find_archive(
        &self,
        server_id: ServerId,
        filename: &str,
    ) -> Result<Option<BackupArchive>> {
        let archive = sqlx::query_as::<_, BackupArchive>(&format!(
            "SELECT {} FROM backup_archives WHERE server_id = $1 AND filename = $2",
            ARCHIVE_COLUMNS
        ))
        .bind(server_id)
        .bind(filename)
        .fetch_optional(&self.db)
        .await?;
        Ok(archive)
    }

    async fn save_restore(&self, op: &RestoreOperation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO restore_operations
                (id, server_id, backup_filename, state, pre_restore_snapshot_path,
                 server_was_running, error_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                pre_restore_snapshot_path = EXCLUDED.pre_restore_snapshot_path,
                server_was_running = EXCLUDED.server_was_running,
                error_message = EXCLUDED.error_message,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(op.id)
        .bind(op.server_id)
        .bind(&op.backup_filename)
        .bind(op.state)
        .bind(&op.pre_restore_snapshot_path)
        .bind(op.server_was_running)
        .bind(&op.error_message)
        .bind(op.created_at)
        .bind(op.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn list_restores(&self, server_id: ServerId) -> Result<Vec<RestoreOperation>> {
        let ops = sqlx::query_as::<_, RestoreOperation>(&format!(
            "SELECT {} FROM restore_operations WHERE server_id = $1 ORDER BY created_at DESC, updated_at DESC",
            RESTORE_COLUMNS
        ))
        .bind(server_id)
        .fetch_all(&self.db)
        .await?;
        Ok(ops)
    }
}
