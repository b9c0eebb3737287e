//! Runs one backup job end to end.
//!
//! A job holds the server lock for its whole duration: it stops the server if
//! it was running, archives the directory, verifies the archive, restarts the
//! server, records the result and applies retention. Failures before the
//! archive is verified remove the partial archive and its record and leave
//! `last_backup` alone.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::archive::{archive_filename, with_collision_suffix};
use crate::models::{
    ArchiveStatus, BackupArchive, CompressionMethod, ServerId, TriggerReason,
};
use crate::services::archive_codec;
use crate::services::encryption::EncryptionKey;
use crate::services::metrics_service;
use crate::services::process_lifecycle::{
    is_running_within, restart_within, stop_and_wait, ProcessLifecycle,
};
use crate::services::retention::{self, RetentionManager};
use crate::services::server_lock::{LockPurpose, ServerLockGuard, ServerLocks};
use crate::services::server_registry::ServerRegistry;
use crate::services::trigger::Clock;
use crate::services::verification::{VerificationEngine, VerificationReport};
use crate::store::BackupStore;

/// How a job obtains the server lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Fail at once if the lock is held (scheduler path).
    TryOnce,
    /// Wait up to the given time (API path).
    Wait(Duration),
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BackupOutcome {
    pub archive: BackupArchive,
    pub verification: VerificationReport,
    /// Set when the server was running before the backup and failed to start again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_error: Option<String>,
    /// Archives removed by the retention pass that followed.
    pub pruned: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub backup_root: PathBuf,
    pub compression: CompressionMethod,
    pub stop_timeout: Duration,
    /// Bound on a single start or status call.
    pub command_timeout: Duration,
    pub job_timeout: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backup_root: config.backup_root.clone(),
            compression: config.compression,
            stop_timeout: config.process_stop_timeout(),
            command_timeout: config.process_command_timeout(),
            job_timeout: config.backup_job_timeout(),
        }
    }
}

/// Upper bound on same-second filename collisions before giving up.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Cancels a job's token once its deadline passes. Disarmed on drop.
pub(crate) struct JobDeadline(tokio::task::JoinHandle<()>);

impl JobDeadline {
    pub(crate) fn arm(
        cancel: &CancellationToken,
        timeout: Duration,
        server_id: ServerId,
        job: &'static str,
    ) -> Self {
        let cancel = cancel.clone();
        Self(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::warn!(server_id, job, timeout_secs = timeout.as_secs(), "Job deadline reached");
            cancel.cancel();
        }))
    }
}

impl Drop for JobDeadline {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct BackupExecutor {
    store: Arc<dyn BackupStore>,
    registry: Arc<dyn ServerRegistry>,
    lifecycle: Arc<dyn ProcessLifecycle>,
    locks: Arc<ServerLocks>,
    clock: Arc<dyn Clock>,
    verifier: VerificationEngine,
    retention: Arc<RetentionManager>,
    key: Option<EncryptionKey>,
    settings: ExecutorSettings,
}

impl BackupExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BackupStore>,
        registry: Arc<dyn ServerRegistry>,
        lifecycle: Arc<dyn ProcessLifecycle>,
        locks: Arc<ServerLocks>,
        clock: Arc<dyn Clock>,
        verifier: VerificationEngine,
        retention: Arc<RetentionManager>,
        key: Option<EncryptionKey>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            registry,
            lifecycle,
            locks,
            clock,
            verifier,
            retention,
            key,
            settings,
        }
    }

    pub fn locks(&self) -> &Arc<ServerLocks> {
        &self.locks
    }

    /// Directory holding a server's archives.
    pub fn server_backup_dir(&self, server_id: ServerId) -> PathBuf {
        self.settings.backup_root.join(server_id.to_string())
    }

    async fn lock(
        &self,
        server_id: ServerId,
        purpose: LockPurpose,
        mode: LockMode,
    ) -> Result<ServerLockGuard> {
        match mode {
            LockMode::TryOnce => self.locks.try_acquire(server_id, purpose),
            LockMode::Wait(wait) => self.locks.acquire_timeout(server_id, purpose, wait).await,
        }
    }

    /// Run a backup with its own cancellation token.
    pub async fn run_backup(
        &self,
        server_id: ServerId,
        trigger: TriggerReason,
        mode: LockMode,
    ) -> Result<BackupOutcome> {
        self.run_backup_with_cancel(server_id, trigger, mode, CancellationToken::new())
            .await
    }

    /// Run a backup that stops early when `cancel` fires or the job deadline passes.
    pub async fn run_backup_with_cancel(
        &self,
        server_id: ServerId,
        trigger: TriggerReason,
        mode: LockMode,
        cancel: CancellationToken,
    ) -> Result<BackupOutcome> {
        let guard = self.lock(server_id, LockPurpose::Backup, mode).await?;
        self.run_locked(guard, trigger, cancel).await
    }

    /// Run a backup under a lock the caller already holds. The lock is
    /// released when the job finishes.
    pub async fn run_locked(
        &self,
        guard: ServerLockGuard,
        trigger: TriggerReason,
        cancel: CancellationToken,
    ) -> Result<BackupOutcome> {
        let server_id = guard.server_id();
        let started = Instant::now();
        tracing::info!(server_id, %trigger, "Backup started");

        let deadline = JobDeadline::arm(&cancel, self.settings.job_timeout, server_id, "backup");
        let result = self.execute(server_id, trigger, &cancel).await;
        drop(deadline);

        let elapsed = started.elapsed().as_secs_f64();
        metrics_service::record_backup(&trigger.to_string(), result.is_ok(), elapsed);
        match &result {
            Ok(outcome) => tracing::info!(
                server_id,
                filename = %outcome.archive.filename,
                size_bytes = outcome.archive.size_bytes,
                quality_score = outcome.verification.score,
                pruned = outcome.pruned.len(),
                duration_secs = elapsed,
                "Backup completed"
            ),
            Err(e) => tracing::error!(server_id, error = %e, duration_secs = elapsed, "Backup failed"),
        }
        drop(guard);
        result
    }

    async fn execute(
        &self,
        server_id: ServerId,
        trigger: TriggerReason,
        cancel: &CancellationToken,
    ) -> Result<BackupOutcome> {
        let server = self.registry.lookup(server_id).await?;

        let was_running = is_running_within(
            self.lifecycle.as_ref(),
            server_id,
            self.settings.command_timeout,
            cancel,
        )
        .await?;
        if was_running {
            if let Err(e) = stop_and_wait(
                self.lifecycle.as_ref(),
                server_id,
                self.settings.stop_timeout,
                cancel,
            )
            .await
            {
                self.compensating_start(server_id, cancel).await;
                return Err(e);
            }
        }

        let archive = match self.begin_archive(server_id, &server.name, trigger, was_running).await {
            Ok(archive) => archive,
            Err(e) => {
                self.restart_after_failure(server_id, was_running, cancel).await;
                return Err(e);
            }
        };

        let checked = self.encode_and_verify(&archive, &server.directory, cancel).await;
        let (encoded, report) = match checked {
            Ok(done) => done,
            Err(e) => {
                self.discard(&archive).await;
                self.restart_after_failure(server_id, was_running, cancel).await;
                return Err(e);
            }
        };

        let restart_error = if was_running {
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
                    tracing::error!(server_id, error = %e, "Server failed to restart after backup");
                    Some(e.to_string())
                }
            }
        } else {
            None
        };

        let archive = BackupArchive {
            size_bytes: encoded.size_bytes as i64,
            checksum: Some(encoded.checksum),
            quality_score: Some(i32::from(report.score)),
            quality_level: Some(report.level),
            status: ArchiveStatus::Completed,
            ..archive
        };
        if let Err(e) = self.persist(&archive).await {
            self.discard(&archive).await;
            return Err(e);
        }
        metrics_service::record_backup_size(encoded.size_bytes);

        let pruned = self.apply_retention(server_id).await;

        Ok(BackupOutcome {
            archive,
            verification: report,
            restart_error,
            pruned,
        })
    }

    /// Reserve a filename and record the in-progress archive.
    async fn begin_archive(
        &self,
        server_id: ServerId,
        server_name: &str,
        trigger: TriggerReason,
        was_running: bool,
    ) -> Result<BackupArchive> {
        let dir = self.server_backup_dir(server_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::EncodeFailed(format!("{}: {}", dir.display(), e)))?;

        let created_at = self.clock.now();
        let encrypted = self.key.is_some();
        let base = archive_filename(server_name, created_at, self.settings.compression, encrypted);

        let mut filename = base.clone();
        let mut n = 1;
        while dir.join(&filename).exists()
            || self.store.find_archive(server_id, &filename).await?.is_some()
        {
            n += 1;
            if n > MAX_NAME_ATTEMPTS {
                return Err(AppError::EncodeFailed(format!("no free filename for {}", base)));
            }
            filename = with_collision_suffix(&base, n);
        }

        let archive = BackupArchive {
            id: Uuid::new_v4(),
            server_id,
            path: dir.join(&filename).to_string_lossy().into_owned(),
            filename,
            size_bytes: 0,
            checksum: None,
            compression_method: self.settings.compression,
            encrypted,
            quality_score: None,
            quality_level: None,
            was_running,
            status: ArchiveStatus::InProgress,
            trigger_reason: trigger,
            created_at,
        };
        self.store.insert_archive(&archive).await?;
        Ok(archive)
    }

    async fn encode_and_verify(
        &self,
        archive: &BackupArchive,
        source: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<(archive_codec::EncodeOutcome, VerificationReport)> {
        let encoded = archive_codec::encode_async(
            source.to_path_buf(),
            PathBuf::from(&archive.path),
            archive.compression_method,
            self.key.clone(),
            cancel.clone(),
        )
        .await?;

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled(format!(
                "backup of server {} cancelled",
                archive.server_id
            )));
        }

        let report = self
            .verifier
            .verify_async(PathBuf::from(&archive.path), encoded.checksum.clone())
            .await?;
        metrics_service::record_verification(report.score);
        if !report.warnings.is_empty() {
            tracing::warn!(
                server_id = archive.server_id,
                filename = %archive.filename,
                warnings = ?report.warnings,
                "Archive verified with warnings"
            );
        }
        Ok((encoded, report))
    }

    /// Mark the archive completed and move the schedule's `last_backup`.
    async fn persist(&self, archive: &BackupArchive) -> Result<()> {
        self.store.update_archive(archive).await?;
        self.store
            .set_last_backup(archive.server_id, archive.created_at)
            .await
    }

    /// Age rule for this server, then the global disk-pressure check. Failures
    /// are logged and never fail the backup.
    async fn apply_retention(&self, server_id: ServerId) -> Vec<String> {
        let mut pruned = Vec::new();

        match self.store.get_schedule(server_id).await {
            Ok(Some(schedule)) => {
                match self
                    .retention
                    .prune_by_age(server_id, schedule.retention_days, self.clock.now())
                    .await
                {
                    Ok(deleted) => pruned.extend(deleted),
                    Err(e) => tracing::warn!(server_id, error = %e, "Retention pass failed"),
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(server_id, error = %e, "Could not load schedule for retention"),
        }

        match self.retention.relieve_disk_pressure(Some(server_id)).await {
            Ok(report) => pruned.extend(report.deleted),
            Err(e) => tracing::warn!(error = %e, "Disk pressure check failed"),
        }

        pruned
    }

    /// Remove a failed archive's file and record.
    async fn discard(&self, archive: &BackupArchive) {
        if let Err(e) = retention::remove_archive_file(std::path::Path::new(&archive.path)).await {
            tracing::warn!(path = %archive.path, error = %e, "Failed to remove partial archive");
        }
        if let Err(e) = self.store.delete_archive(archive.id).await {
            tracing::warn!(archive_id = %archive.id, error = %e, "Failed to remove archive record");
        }
    }

    async fn compensating_start(&self, server_id: ServerId, cancel: &CancellationToken) {
        if let Err(e) = restart_within(
            self.lifecycle.as_ref(),
            server_id,
            self.settings.command_timeout,
            cancel,
        )
        .await
        {
            tracing::error!(server_id, error = %e, "Compensating start after failed stop also failed");
        }
    }

    async fn restart_after_failure(
        &self,
        server_id: ServerId,
        was_running: bool,
        cancel: &CancellationToken,
    ) {
        if was_running {
            self.compensating_start(server_id, cancel).await;
        }
    }

    /// Remove archives left `in_progress` by a backup that never finished,
    /// such as one interrupted by a crash. Servers currently locked are skipped.
    pub async fn sweep_incomplete(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for archive in self.store.list_all_archives().await? {
            if archive.is_completed() {
                continue;
            }
            let Ok(_guard) = self
                .locks
                .try_acquire(archive.server_id, LockPurpose::ArchiveMaintenance)
            else {
                continue;
            };
            self.discard(&archive).await;
            tracing::warn!(
                server_id = archive.server_id,
                filename = %archive.filename,
                "Removed incomplete archive from an interrupted backup"
            );
            removed.push(archive.filename);
        }
        Ok(removed)
    }

    /// Delete one archive on request. Refused while the server is busy.
    pub async fn delete_archive(&self, server_id: ServerId, filename: &str) -> Result<BackupArchive> {
        let _guard = self.locks.try_acquire(server_id, LockPurpose::ArchiveMaintenance)?;
        let archive = self
            .store
            .find_archive(server_id, filename)
            .await?
            .ok_or_else(|| AppError::ArchiveNotFound(filename.to_string()))?;

        self.retention.remove(&archive).await?;
        tracing::info!(server_id, filename, "Backup archive deleted on request");
        Ok(archive)
    }

    /// Re-run verification on a stored archive and persist the new score.
    pub async fn reverify(
        &self,
        server_id: ServerId,
        filename: &str,
        wait: Duration,
    ) -> Result<(BackupArchive, VerificationReport)> {
        let _guard = self
            .locks
            .acquire_timeout(server_id, LockPurpose::ArchiveMaintenance, wait)
            .await?;
        let archive = self
            .store
            .find_archive(server_id, filename)
            .await?
            .filter(BackupArchive::is_completed)
            .ok_or_else(|| AppError::ArchiveNotFound(filename.to_string()))?;
        let checksum = archive
            .checksum
            .clone()
            .ok_or_else(|| AppError::VerificationFailed(format!("{} has no checksum", filename)))?;

        let report = self
            .verifier
            .verify_async(PathBuf::from(&archive.path), checksum)
            .await?;
        metrics_service::record_verification(report.score);

        let archive = BackupArchive {
            quality_score: Some(i32::from(report.score)),
            quality_level: Some(report.level),
            ..archive
        };
        self.store.update_archive(&archive).await?;
        Ok((archive, report))
    }
}
