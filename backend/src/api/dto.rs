//! Shared Data Transfer Objects (DTOs) for API handlers.
//!
//! Every successful response is wrapped in [`Envelope`], which adds
//! `"success": true` next to the payload's own fields:
//!
//! ```rust,ignore
//! use crate::api::dto::{ok, ScheduleResponse};
//!
//! // {"success": true, "schedule": {...}}
//! Ok(ok(ScheduleResponse { schedule }))
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use axum::Json;

use crate::models::{
    ArchiveStatus, BackupArchive, BackupSchedule, CompressionMethod, QualityLevel,
    RestoreOperation, ServerId, TriggerReason,
};
use crate::services::backup_executor::BackupOutcome;
use crate::services::restore_service::RestorePreview;
use crate::services::scheduler_service::ScheduleState;
use crate::services::server_lock::LockPurpose;
use crate::services::verification::VerificationReport;

/// Success wrapper. `T` must serialize as a JSON object.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

/// Wrap a payload in a success envelope.
pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
    })
}

/// Pagination metadata for list responses.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Pagination {
    /// Current page number (1-indexed)
    pub page: u32,
    /// Number of items per page
    pub per_page: u32,
    /// Total number of items across all pages
    pub total: i64,
    /// Total number of pages
    pub total_pages: u32,
}

impl Pagination {
    /// Create pagination from query parameters and total count.
    pub fn from_query_and_total(query: &PaginationQuery, total: i64) -> Self {
        let page = query.page();
        let per_page = query.per_page();
        let total_pages = if total == 0 {
            0
        } else {
            ((total as f64) / (per_page as f64)).ceil() as u32
        };

        Self {
            page,
            per_page,
            total,
            total_pages,
        }
    }

    /// Slice the page this pagination describes out of `items`.
    pub fn page_of<T>(&self, items: Vec<T>) -> Vec<T> {
        let skip = (self.page.saturating_sub(1) as usize).saturating_mul(self.per_page as usize);
        items
            .into_iter()
            .skip(skip)
            .take(self.per_page as usize)
            .collect()
    }
}

/// Query parameters for paginated list requests.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct PaginationQuery {
    /// Requested page number (default: 1)
    pub page: Option<u32>,
    /// Requested items per page (default: 50, max: 500)
    pub per_page: Option<u32>,
}

impl PaginationQuery {
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> u32 {
        self.per_page.unwrap_or(50).clamp(1, 500)
    }
}

/// One archive as listed in history and restore pickers.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BackupEntry {
    pub filename: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
    /// Whole days since the archive was created.
    pub age_days: i64,
    pub compression_method: CompressionMethod,
    pub encrypted: bool,
    pub quality_score: Option<i32>,
    pub quality_level: Option<QualityLevel>,
    pub status: ArchiveStatus,
    pub trigger_reason: TriggerReason,
    pub was_running: bool,
}

impl BackupEntry {
    pub fn from_archive(archive: &BackupArchive, now: DateTime<Utc>) -> Self {
        Self {
            filename: archive.filename.clone(),
            size_bytes: archive.size_bytes,
            created_at: archive.created_at,
            age_days: archive.age_days(now),
            compression_method: archive.compression_method,
            encrypted: archive.encrypted,
            quality_score: archive.quality_score,
            quality_level: archive.quality_level,
            status: archive.status,
            trigger_reason: archive.trigger_reason,
            was_running: archive.was_running,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScheduleListResponse {
    pub schedules: Vec<BackupSchedule>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScheduleResponse {
    pub schedule: BackupSchedule,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeletedResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HistoryResponse {
    pub server_id: ServerId,
    pub backups: Vec<BackupEntry>,
    pub pagination: Pagination,
}

/// Schedule and last-run status for one server.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BackupStatusResponse {
    pub server_id: ServerId,
    pub schedule: Option<BackupSchedule>,
    pub state: Option<ScheduleState>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_backup: Option<DateTime<Utc>>,
    pub last_archive: Option<BackupEntry>,
    pub archive_count: usize,
    /// What holds the server lock right now, if anything.
    pub in_progress: Option<LockPurpose>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AvailableBackupsResponse {
    pub server_id: ServerId,
    pub backups: Vec<BackupEntry>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BackupTriggerResponse {
    pub message: String,
    pub backup: BackupOutcome,
}

/// Body of `POST /backups/{server_id}/restore`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RestoreRequest {
    pub backup_filename: String,
    /// `false` previews only; `true` stops the server and overwrites its files.
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RestorePreviewResponse {
    pub confirm_required: bool,
    pub preview: RestorePreview,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RestoreResponse {
    pub message: String,
    pub restore: RestoreOperation,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RestoreStatusResponse {
    pub server_id: ServerId,
    pub restore: Option<RestoreOperation>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct VerifyArchiveResponse {
    pub backup: BackupEntry,
    pub verification: VerificationReport,
}
