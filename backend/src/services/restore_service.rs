//! Restore of a server directory from a backup archive.
//!
//! A restore request without confirmation only previews: it records the
//! request and returns the archive metadata with a warning, touching nothing
//! on disk. A confirmed restore takes the server lock, stops the server, moves
//! the live directory aside as a snapshot and extracts the archive into a
//! fresh directory. If extraction fails the snapshot is moved back, leaving
//! the server exactly as it was. The snapshot of the latest completed restore
//! is kept so it can be rolled back. Restores and rollbacks run under a job
//! deadline like backups do.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::restore::RESTORE_WARNING;
use crate::models::{BackupArchive, RestoreOperation, RestoreState, ServerId};
use crate::services::archive_codec;
use crate::services::encryption::EncryptionKey;
use crate::services::backup_executor::JobDeadline;
use crate::services::metrics_service;
use crate::services::process_lifecycle::{
    is_running_within, restart_within, stop_and_wait, ProcessLifecycle,
};
use crate::services::server_lock::{LockPurpose, ServerLocks};
use crate::services::server_registry::{ServerInfo, ServerRegistry};
use crate::services::trigger::Clock;
use crate::store::BackupStore;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RestorePreview {
    pub operation: RestoreOperation,
    pub archive: BackupArchive,
    pub server_running: bool,
    pub warning: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RestoreSettings {
    pub lock_wait: Duration,
    pub stop_timeout: Duration,
    pub command_timeout: Duration,
    pub job_timeout: Duration,
}

impl RestoreSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lock_wait: config.interactive_lock_wait(),
            stop_timeout: config.process_stop_timeout(),
            command_timeout: config.process_command_timeout(),
            job_timeout: config.backup_job_timeout(),
        }
    }
}

pub struct RestoreManager {
    store: Arc<dyn BackupStore>,
    registry: Arc<dyn ServerRegistry>,
    lifecycle: Arc<dyn ProcessLifecycle>,
    locks: Arc<ServerLocks>,
    clock: Arc<dyn Clock>,
    key: Option<EncryptionKey>,
    settings: RestoreSettings,
}

impl RestoreManager {
    pub fn new(
        store: Arc<dyn BackupStore>,
        registry: Arc<dyn ServerRegistry>,
        lifecycle: Arc<dyn ProcessLifecycle>,
        locks: Arc<ServerLocks>,
        clock: Arc<dyn Clock>,
        key: Option<EncryptionKey>,
        settings: RestoreSettings,
    ) -> Self {
        Self {
            store,
            registry,
            lifecycle,
            locks,
            clock,
            key,
            settings,
        }
    }

    async fn restorable_archive(&self, server_id: ServerId, filename: &str) -> Result<BackupArchive> {
        self.store
            .find_archive(server_id, filename)
            .await?
            .filter(BackupArchive::is_completed)
            .ok_or_else(|| AppError::ArchiveNotFound(filename.to_string()))
    }

    /// Completed archives whose file is still on disk, newest first.
    pub async fn available(&self, server_id: ServerId) -> Result<Vec<BackupArchive>> {
        self.registry.lookup(server_id).await?;
        let mut available = Vec::new();
        for archive in self.store.list_archives(server_id).await? {
            if archive.is_completed() && tokio::fs::try_exists(&archive.path).await.unwrap_or(false) {
                available.push(archive);
            }
        }
        Ok(available)
    }

    /// Latest restore operation for a server.
    pub async fn status(&self, server_id: ServerId) -> Result<Option<RestoreOperation>> {
        self.store.latest_restore(server_id).await
    }

    /// Record a restore request and describe what applying it would do.
    pub async fn preview(&self, server_id: ServerId, filename: &str) -> Result<RestorePreview> {
        self.registry.lookup(server_id).await?;
        let archive = self.restorable_archive(server_id, filename).await?;

        let operation = RestoreOperation::new(
            server_id,
            filename,
            RestoreState::Previewed,
            self.clock.now(),
        );
        self.store.save_restore(&operation).await?;
        tracing::info!(server_id, filename, "Restore previewed");

        let server_running = is_running_within(
            self.lifecycle.as_ref(),
            server_id,
            self.settings.command_timeout,
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(server_id, error = %e, "Could not tell whether the server is running");
            false
        });

        Ok(RestorePreview {
            operation,
            archive,
            server_running,
            warning: RESTORE_WARNING.to_string(),
        })
    }

    async fn save(&self, op: &mut RestoreOperation, state: RestoreState) -> Result<()> {
        op.state = state;
        op.updated_at = self.clock.now();
        self.store.save_restore(op).await
    }

    /// Stop the server if it is running. Returns whether it was.
    async fn stop_server(&self, server_id: ServerId, cancel: &CancellationToken) -> Result<bool> {
        let running = is_running_within(
            self.lifecycle.as_ref(),
            server_id,
            self.settings.command_timeout,
            cancel,
        )
        .await?;
        if !running {
            return Ok(false);
        }
        if let Err(e) = stop_and_wait(
            self.lifecycle.as_ref(),
            server_id,
            self.settings.stop_timeout,
            cancel,
        )
        .await
        {
            self.start_server(server_id, true, cancel).await;
            return Err(e);
        }
        Ok(true)
    }

    /// Start the server again if it was running. Returns the failure, if any.
    async fn start_server(
        &self,
        server_id: ServerId,
        was_running: bool,
        cancel: &CancellationToken,
    ) -> Option<String> {
        if !was_running {
            return None;
        }
        match restart_within(
            self.lifecycle.as_ref(),
            server_id,
            self.settings.command_timeout,
            cancel,
        )
        .await
        {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(server_id, error = %e, "Server failed to start after restore");
                Some(e.to_string())
            }
        }
    }

    /// Apply a confirmed restore.
    pub async fn apply(&self, server_id: ServerId, filename: &str) -> Result<RestoreOperation> {
        let server = self.registry.lookup(server_id).await?;
        let archive = self.restorable_archive(server_id, filename).await?;
        let _guard = self
            .locks
            .acquire_timeout(server_id, LockPurpose::Restore, self.settings.lock_wait)
            .await?;

        let mut op = RestoreOperation::new(server_id, filename, RestoreState::Confirmed, self.clock.now());
        self.store.save_restore(&op).await?;
        tracing::info!(server_id, filename, "Restore confirmed");

        let cancel = CancellationToken::new();
        let deadline = JobDeadline::arm(&cancel, self.settings.job_timeout, server_id, "restore");
        let result = self.apply_locked(&server, &archive, &mut op, &cancel).await;
        drop(deadline);
        metrics_service::record_restore("apply", result.is_ok());
        if let Err(e) = &result {
            op.error_message = Some(e.to_string());
            if let Err(save_err) = self.save(&mut op, RestoreState::Failed).await {
                tracing::error!(server_id, error = %save_err, "Failed to record failed restore");
            }
            tracing::error!(server_id, filename, error = %e, "Restore failed");
        }
        result.map(|()| op)
    }

    async fn apply_locked(
        &self,
        server: &ServerInfo,
        archive: &BackupArchive,
        op: &mut RestoreOperation,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let server_id = server.id;
        let was_running = self.stop_server(server_id, cancel).await?;
        op.server_was_running = was_running;
        if let Err(e) = self.save(op, RestoreState::Applying).await {
            self.start_server(server_id, was_running, cancel).await;
            return Err(e);
        }

        if let Err(e) = self.check_archive(archive, cancel).await {
            self.start_server(server_id, was_running, cancel).await;
            return Err(e);
        }

        let snapshot = match self.take_snapshot(&server.directory).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.start_server(server_id, was_running, cancel).await;
                return Err(AppError::RestoreApplyFailed(format!(
                    "could not move {} aside: {}",
                    server.directory.display(),
                    e
                )));
            }
        };

        if let Err(e) = self.extract(archive, &server.directory, cancel).await {
            self.put_back(&server.directory, snapshot.as_deref()).await;
            self.start_server(server_id, was_running, cancel).await;
            return Err(AppError::RestoreApplyFailed(e.to_string()));
        }

        op.pre_restore_snapshot_path = snapshot.map(|p| p.to_string_lossy().into_owned());
        op.error_message = self.start_server(server_id, was_running, cancel).await;
        self.save(op, RestoreState::Completed).await?;
        tracing::info!(
            server_id,
            filename = %archive.filename,
            snapshot = ?op.pre_restore_snapshot_path,
            "Restore completed"
        );

        self.discard_older_snapshots(server_id, op.id).await;
        Ok(())
    }

    async fn check_archive(&self, archive: &BackupArchive, cancel: &CancellationToken) -> Result<()> {
        let path = PathBuf::from(&archive.path);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(AppError::ArchiveNotFound(archive.filename.clone()));
        }
        let expected = archive
            .checksum
            .as_deref()
            .ok_or_else(|| AppError::VerificationFailed(format!("{} has no checksum", archive.filename)))?;
        let actual = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AppError::Cancelled(format!(
                    "checksum of {} cancelled",
                    archive.filename
                )));
            }
            actual = archive_codec::sha256_file_async(path) => actual?,
        };
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(AppError::VerificationFailed(format!(
                "checksum mismatch for {}: expected {}, got {}",
                archive.filename, expected, actual
            )));
        }
        Ok(())
    }

    /// Move the live directory to a sibling snapshot path. `None` if there was
    /// no live directory.
    async fn take_snapshot(&self, dir: &Path) -> io::Result<Option<PathBuf>> {
        if !tokio::fs::try_exists(dir).await? {
            return Ok(None);
        }
        let stamp = self.clock.now().with_timezone(&chrono::Local).format("%Y%m%d_%H%M%S");
        let snapshot = unused_sibling(dir, &format!("pre_restore_{}", stamp)).await?;
        tokio::fs::rename(dir, &snapshot).await?;
        Ok(Some(snapshot))
    }

    async fn extract(
        &self,
        archive: &BackupArchive,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let entries = archive_codec::decode_async(
            PathBuf::from(&archive.path),
            dir.to_path_buf(),
            self.key.clone(),
            cancel.clone(),
        )
        .await?;
        tracing::debug!(dir = %dir.display(), entries, "Archive extracted");
        Ok(())
    }

    /// Undo a partial extraction by restoring the snapshot.
    async fn put_back(&self, dir: &Path, snapshot: Option<&Path>) {
        if let Err(e) = remove_dir_if_exists(dir).await {
            tracing::error!(dir = %dir.display(), error = %e, "Failed to remove partial restore");
        }
        if let Some(snapshot) = snapshot {
            if let Err(e) = tokio::fs::rename(snapshot, dir).await {
                tracing::error!(
                    snapshot = %snapshot.display(),
                    dir = %dir.display(),
                    error = %e,
                    "Failed to move snapshot back after failed restore"
                );
            }
        }
    }

    /// Only the newest completed restore keeps its snapshot.
    async fn discard_older_snapshots(&self, server_id: ServerId, keep: uuid::Uuid) {
        let ops = match self.store.list_restores(server_id).await {
            Ok(ops) => ops,
            Err(e) => {
                tracing::warn!(server_id, error = %e, "Could not list restores for snapshot cleanup");
                return;
            }
        };
        for mut old in ops.into_iter().filter(|o| o.id != keep) {
            let Some(snapshot) = old.pre_restore_snapshot_path.take() else {
                continue;
            };
            if let Err(e) = remove_dir_if_exists(Path::new(&snapshot)).await {
                tracing::warn!(server_id, snapshot, error = %e, "Failed to remove old restore snapshot");
                continue;
            }
            old.updated_at = self.clock.now();
            if let Err(e) = self.store.save_restore(&old).await {
                tracing::warn!(server_id, error = %e, "Failed to update old restore record");
            }
            tracing::info!(server_id, snapshot, "Removed superseded restore snapshot");
        }
    }

    /// Put back the directory saved by the latest completed restore.
    pub async fn rollback(&self, server_id: ServerId) -> Result<RestoreOperation> {
        let server = self.registry.lookup(server_id).await?;
        let mut op = self
            .store
            .list_restores(server_id)
            .await?
            .into_iter()
            .find(|o| o.state == RestoreState::Completed)
            .filter(RestoreOperation::can_roll_back)
            .ok_or_else(|| {
                AppError::Validation(format!("server {} has no restore to roll back", server_id))
            })?;
        let snapshot = PathBuf::from(op.pre_restore_snapshot_path.clone().unwrap_or_default());
        if !tokio::fs::try_exists(&snapshot).await.unwrap_or(false) {
            return Err(AppError::Validation(format!(
                "rollback snapshot {} no longer exists",
                snapshot.display()
            )));
        }

        let _guard = self
            .locks
            .acquire_timeout(server_id, LockPurpose::Rollback, self.settings.lock_wait)
            .await?;

        let cancel = CancellationToken::new();
        let deadline = JobDeadline::arm(&cancel, self.settings.job_timeout, server_id, "rollback");
        let result = self
            .rollback_locked(server_id, &server.directory, &snapshot, &cancel)
            .await;
        metrics_service::record_restore("rollback", result.is_ok());
        let was_running = result?;

        op.pre_restore_snapshot_path = None;
        op.error_message = self.start_server(server_id, was_running, &cancel).await;
        drop(deadline);
        self.save(&mut op, RestoreState::RolledBack).await?;
        tracing::info!(server_id, filename = %op.backup_filename, "Restore rolled back");
        Ok(op)
    }

    async fn rollback_locked(
        &self,
        server_id: ServerId,
        dir: &Path,
        snapshot: &Path,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let was_running = self.stop_server(server_id, cancel).await?;

        let discard = if tokio::fs::try_exists(dir).await? {
            let stamp = self.clock.now().with_timezone(&chrono::Local).format("%Y%m%d_%H%M%S");
            let discard = unused_sibling(dir, &format!("rolled_back_{}", stamp)).await?;
            tokio::fs::rename(dir, &discard).await?;
            Some(discard)
        } else {
            None
        };

        if let Err(e) = tokio::fs::rename(snapshot, dir).await {
            if let Some(discard) = &discard {
                if let Err(back) = tokio::fs::rename(discard, dir).await {
                    tracing::error!(dir = %dir.display(), error = %back, "Failed to undo rollback");
                }
            }
            self.start_server(server_id, was_running, cancel).await;
            return Err(AppError::RestoreApplyFailed(format!("rollback failed: {}", e)));
        }

        if let Some(discard) = discard {
            if let Err(e) = remove_dir_if_exists(&discard).await {
                tracing::warn!(path = %discard.display(), error = %e, "Failed to remove rolled back directory");
            }
        }
        Ok(was_running)
    }
}

/// `{dir}.{suffix}`, with a counter appended if that path is taken.
async fn unused_sibling(dir: &Path, suffix: &str) -> io::Result<PathBuf> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "server".to_string());
    let mut candidate = dir.with_file_name(format!("{}.{}", name, suffix));
    let mut n = 1;
    while tokio::fs::try_exists(&candidate).await? {
        n += 1;
        candidate = dir.with_file_name(format!("{}.{}_{}", name, suffix, n));
    }
    Ok(candidate)
}

async fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
