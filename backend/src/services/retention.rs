//! Retention enforcement for backup archives.
//!
//! Two rules apply. The age rule removes a server's archives that are at least
//! `retention_days` old, never touching the newest one. The disk-pressure rule
//! kicks in when backup storage passes the emergency threshold and deletes the
//! oldest archives across all servers, leaving each server at least `floor`
//! archives, until usage drops back under the threshold. Servers whose lock is
//! held by another job are left alone.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::Disks;
use utoipa::ToSchema;

use crate::error::{AppError, Result};
use crate::models::{BackupArchive, ServerId};
use crate::services::metrics_service;
use crate::services::server_lock::{LockPurpose, ServerLocks};
use crate::store::BackupStore;

/// Reports how full backup storage is.
pub trait DiskUsageProbe: Send + Sync {
    /// Used space on the backup volume, 0-100.
    fn usage_percent(&self) -> Result<f64>;
}

/// Measures the volume holding `path` through `sysinfo`.
pub struct SysinfoDiskProbe {
    path: PathBuf,
}

impl SysinfoDiskProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DiskUsageProbe for SysinfoDiskProbe {
    fn usage_percent(&self) -> Result<f64> {
        let path = self.path.canonicalize().unwrap_or_else(|_| self.path.clone());
        let disks = Disks::new_with_refreshed_list();

        // Longest mount point containing the backup root
        let disk = disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or_else(|| {
                AppError::Internal(format!("no mounted disk holds {}", path.display()))
            })?;

        let total = disk.total_space();
        if total == 0 {
            return Ok(0.0);
        }
        let used = total.saturating_sub(disk.available_space());
        Ok(used as f64 / total as f64 * 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    /// Usage percentage above which emergency pruning starts.
    pub threshold_percent: f64,
    /// Archives per server never removed by emergency pruning.
    pub floor: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            threshold_percent: 90.0,
            floor: 3,
        }
    }
}

/// Result of a disk-pressure pass.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct PressureReport {
    pub usage_before: f64,
    pub usage_after: f64,
    pub deleted: Vec<String>,
    /// Still over the threshold once every eligible archive is gone.
    pub critical: bool,
    /// Servers passed over because another job held their lock.
    pub skipped_servers: Vec<ServerId>,
}

pub struct RetentionManager {
    store: Arc<dyn BackupStore>,
    locks: Arc<ServerLocks>,
    probe: Arc<dyn DiskUsageProbe>,
    policy: RetentionPolicy,
}

impl RetentionManager {
    pub fn new(
        store: Arc<dyn BackupStore>,
        locks: Arc<ServerLocks>,
        probe: Arc<dyn DiskUsageProbe>,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            store,
            locks,
            probe,
            policy,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Delete a server's archives aged `retention_days` or more, keeping the
    /// newest. Returns the deleted filenames.
    pub async fn prune_by_age(
        &self,
        server_id: ServerId,
        retention_days: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let archives: Vec<BackupArchive> = self
            .store
            .list_archives(server_id)
            .await?
            .into_iter()
            .filter(BackupArchive::is_completed)
            .collect();

        let mut remaining = archives.len();
        let mut deleted = Vec::new();
        for archive in archives.iter().skip(1) {
            if archive.age_days(now) < i64::from(retention_days) {
                continue;
            }
            self.remove(archive).await.map_err(|e| {
                AppError::RetentionPruneFailed(format!("{}: {}", archive.filename, e))
            })?;
            tracing::info!(
                server_id,
                filename = %archive.filename,
                age_days = archive.age_days(now),
                before = remaining,
                after = remaining - 1,
                "Deleted expired backup archive"
            );
            metrics_service::record_retention_deletion("age");
            remaining -= 1;
            deleted.push(archive.filename.clone());
        }

        Ok(deleted)
    }

    /// Free space when backup storage is over the emergency threshold.
    ///
    /// `held` is the server whose lock the caller already holds. Archives of
    /// any other server are only deleted while that server's lock is free.
    pub async fn relieve_disk_pressure(&self, held: Option<ServerId>) -> Result<PressureReport> {
        let usage_before = self.probe.usage_percent()?;
        metrics_service::set_backup_disk_usage(usage_before);

        let mut report = PressureReport {
            usage_before,
            usage_after: usage_before,
            ..Default::default()
        };
        if usage_before <= self.policy.threshold_percent {
            return Ok(report);
        }

        tracing::warn!(
            usage_percent = usage_before,
            threshold = self.policy.threshold_percent,
            "Backup storage over threshold, pruning oldest archives"
        );

        let archives: Vec<BackupArchive> = self
            .store
            .list_all_archives()
            .await?
            .into_iter()
            .filter(BackupArchive::is_completed)
            .collect();

        let mut counts: HashMap<ServerId, usize> = HashMap::new();
        for archive in &archives {
            *counts.entry(archive.server_id).or_default() += 1;
        }
        let candidates = pressure_candidates(archives, self.policy.floor);

        for archive in candidates {
            if report.skipped_servers.contains(&archive.server_id) {
                continue;
            }
            let _guard = if held == Some(archive.server_id) {
                None
            } else {
                match self
                    .locks
                    .try_acquire(archive.server_id, LockPurpose::ArchiveMaintenance)
                {
                    Ok(guard) => Some(guard),
                    Err(_) => {
                        tracing::info!(
                            server_id = archive.server_id,
                            "Server busy, skipping its archives under disk pressure"
                        );
                        report.skipped_servers.push(archive.server_id);
                        continue;
                    }
                }
            };

            let before = counts.get(&archive.server_id).copied().unwrap_or_default();
            if let Err(e) = self.remove(&archive).await {
                tracing::warn!(
                    server_id = archive.server_id,
                    filename = %archive.filename,
                    error = %e,
                    "Failed to delete archive under disk pressure"
                );
                continue;
            }
            counts.insert(archive.server_id, before.saturating_sub(1));
            tracing::warn!(
                server_id = archive.server_id,
                filename = %archive.filename,
                before,
                after = before.saturating_sub(1),
                "Deleted backup archive under disk pressure"
            );
            metrics_service::record_retention_deletion("disk_pressure");
            report.deleted.push(archive.filename);

            report.usage_after = self.probe.usage_percent()?;
            if report.usage_after < self.policy.threshold_percent {
                break;
            }
        }

        metrics_service::set_backup_disk_usage(report.usage_after);
        report.critical = report.usage_after > self.policy.threshold_percent;
        if report.critical {
            let err = AppError::DiskPressureCritical(format!(
                "usage {:.1}% after pruning to {} archives per server ({} busy servers skipped)",
                report.usage_after,
                self.policy.floor,
                report.skipped_servers.len()
            ));
            tracing::error!(error = %err, code = err.code(), "Disk pressure not relieved");
        }

        Ok(report)
    }

    /// Remove an archive file and its record. A file already gone is not an error.
    pub async fn remove(&self, archive: &BackupArchive) -> Result<()> {
        remove_archive_file(Path::new(&archive.path)).await?;
        self.store.delete_archive(archive.id).await
    }
}

pub(crate) async fn remove_archive_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Archives eligible for emergency deletion, oldest first: everything beyond
/// the newest `floor` of each server.
fn pressure_candidates(mut archives: Vec<BackupArchive>, floor: usize) -> Vec<BackupArchive> {
    // newest first so the per-server floor keeps the most recent
    archives.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let mut seen: HashMap<ServerId, usize> = HashMap::new();
    let mut candidates: Vec<BackupArchive> = archives
        .into_iter()
        .filter(|a| {
            let n = seen.entry(a.server_id).or_default();
            *n += 1;
            *n > floor
        })
        .collect();
    candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    candidates
}
