//! Application error types and result alias.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::ServerId;
use crate::services::encryption::EncryptionError;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Feature switched off at the API boundary
    #[error("Access denied: {0}")]
    Forbidden(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// The referenced server no longer exists
    #[error("Server {0} not found")]
    ServerNotFound(ServerId),

    #[error("No backup schedule for server {0}")]
    ScheduleNotFound(ServerId),

    /// A schedule already exists for the server
    #[error("A backup schedule already exists for server {0}")]
    ScheduleConflict(ServerId),

    /// Another backup or restore holds the server lock
    #[error("A backup or restore is already in progress for server {0}")]
    BackupInProgress(ServerId),

    #[error("Server {0} did not stop within {1} seconds")]
    ServerStopTimeout(ServerId, u64),

    /// Process lifecycle collaborator failure
    #[error("Process control failed: {0}")]
    Process(String),

    /// Archive could not be written (disk full, permission, ...)
    #[error("Archive encoding failed: {0}")]
    EncodeFailed(String),

    /// Checksum or structure mismatch
    #[error("Archive verification failed: {0}")]
    VerificationFailed(String),

    #[error("Backup archive not found: {0}")]
    ArchiveNotFound(String),

    /// Decode over the live directory failed; the snapshot was put back
    #[error("Restore failed and was rolled back: {0}")]
    RestoreApplyFailed(String),

    #[error("Retention prune failed: {0}")]
    RetentionPruneFailed(String),

    #[error("Backup storage critically full: {0}")]
    DiskPressureCritical(String),

    /// Operation cancelled or exceeded its deadline
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Address parse error
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<EncryptionError> for AppError {
    fn from(e: EncryptionError) -> Self {
        match e {
            EncryptionError::InvalidKeyLength(_)
            | EncryptionError::InvalidKeyEncoding
            | EncryptionError::MissingKey => AppError::Config(e.to_string()),
            EncryptionError::EncryptionFailed(_) => AppError::EncodeFailed(e.to_string()),
            _ => AppError::VerificationFailed(e.to_string()),
        }
    }
}

impl AppError {
    /// Stable machine-readable error code used in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Migration(_) => "MIGRATION_ERROR",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::ServerNotFound(_) => "SERVER_NOT_FOUND",
            AppError::ScheduleNotFound(_) => "SCHEDULE_NOT_FOUND",
            AppError::ScheduleConflict(_) => "SCHEDULE_CONFLICT",
            AppError::BackupInProgress(_) => "BACKUP_IN_PROGRESS",
            AppError::ServerStopTimeout(_, _) => "SERVER_STOP_TIMEOUT",
            AppError::Process(_) => "PROCESS_ERROR",
            AppError::EncodeFailed(_) => "ENCODE_FAILED",
            AppError::VerificationFailed(_) => "VERIFICATION_FAILED",
            AppError::ArchiveNotFound(_) => "ARCHIVE_NOT_FOUND",
            AppError::RestoreApplyFailed(_) => "RESTORE_APPLY_FAILED",
            AppError::RetentionPruneFailed(_) => "RETENTION_PRUNE_FAILED",
            AppError::DiskPressureCritical(_) => "DISK_PRESSURE_CRITICAL",
            AppError::Cancelled(_) => "CANCELLED",
            AppError::Io(_) => "IO_ERROR",
            AppError::AddrParse(_) => "ADDR_PARSE_ERROR",
            AppError::Json(_) => "JSON_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::Json(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::ServerNotFound(_)
            | AppError::ScheduleNotFound(_)
            | AppError::ArchiveNotFound(_) => StatusCode::NOT_FOUND,
            AppError::ScheduleConflict(_) | AppError::BackupInProgress(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let message = match &self {
            AppError::Database(_) => "Database operation failed".to_string(),
            AppError::Migration(_) => "Database migration failed".to_string(),
            AppError::Io(_) => "IO operation failed".to_string(),
            AppError::Json(_) => "Invalid JSON".to_string(),
            other => other.to_string(),
        };

        // Log the error
        if status.is_server_error() {
            tracing::error!(error = %self, code = code, "Request error");
        } else {
            tracing::warn!(error = %self, code = code, "Request rejected");
        }

        let body = Json(json!({
            "success": false,
            "error": message,
            "code": code,
        }));

        (status, body).into_response()
    }
}
