//! Backup archive model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use super::ServerId;
use crate::error::{AppError, Result};

/// Compression applied to the tar stream before (optional) encryption.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type, ToSchema,
)]
#[sqlx(type_name = "compression_method", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    None,
    #[default]
    Gzip,
    Bzip2,
    Lzma,
}

impl CompressionMethod {
    /// File extension for an archive using this method.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionMethod::None => "tar",
            CompressionMethod::Gzip => "tar.gz",
            CompressionMethod::Bzip2 => "tar.bz2",
            CompressionMethod::Lzma => "tar.xz",
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionMethod::None => write!(f, "none"),
            CompressionMethod::Gzip => write!(f, "gzip"),
            CompressionMethod::Bzip2 => write!(f, "bzip2"),
            CompressionMethod::Lzma => write!(f, "lzma"),
        }
    }
}

impl FromStr for CompressionMethod {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "tar" => Ok(CompressionMethod::None),
            "gzip" | "gz" => Ok(CompressionMethod::Gzip),
            "bzip2" | "bz2" => Ok(CompressionMethod::Bzip2),
            "lzma" | "xz" => Ok(CompressionMethod::Lzma),
            other => Err(AppError::Config(format!(
                "Unknown compression method '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle of an archive record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "archive_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    InProgress,
    Completed,
}

/// Why a backup ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "backup_trigger", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TriggerReason {
    Scheduled,
    Manual,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerReason::Scheduled => write!(f, "scheduled"),
            TriggerReason::Manual => write!(f, "manual"),
        }
    }
}

/// Quality bucket derived from a verification score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "quality_level", rename_all = "lowercase")]
pub enum QualityLevel {
    Excellent,
    Good,
    Poor,
}

impl QualityLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            90.. => QualityLevel::Excellent,
            70..=89 => QualityLevel::Good,
            _ => QualityLevel::Poor,
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityLevel::Excellent => write!(f, "Excellent"),
            QualityLevel::Good => write!(f, "Good"),
            QualityLevel::Poor => write!(f, "Poor"),
        }
    }
}

/// One backup attempt for a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct BackupArchive {
    pub id: Uuid,
    pub server_id: ServerId,
    pub filename: String,
    pub path: String,
    pub size_bytes: i64,
    pub checksum: Option<String>,
    pub compression_method: CompressionMethod,
    pub encrypted: bool,
    pub quality_score: Option<i32>,
    pub quality_level: Option<QualityLevel>,
    pub was_running: bool,
    pub status: ArchiveStatus,
    pub trigger_reason: TriggerReason,
    pub created_at: DateTime<Utc>,
}

impl BackupArchive {
    /// Age of the archive relative to `now`, in whole days.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }

    pub fn is_completed(&self) -> bool {
        self.status == ArchiveStatus::Completed
    }
}

/// Archive filename: `{server_name}_backup_{YYYYMMDD_HHMMSS}.{ext}`, with `.enc`
/// appended for encrypted archives.
pub fn archive_filename(
    server_name: &str,
    created_at: DateTime<Utc>,
    compression: CompressionMethod,
    encrypted: bool,
) -> String {
    let mut name = format!(
        "{}_backup_{}.{}",
        sanitize_server_name(server_name),
        created_at
            .with_timezone(&chrono::Local)
            .format("%Y%m%d_%H%M%S"),
        compression.extension()
    );
    if encrypted {
        name.push_str(".enc");
    }
    name
}

/// Insert `_{n}` before the extension of a filename produced by [`archive_filename`].
pub fn with_collision_suffix(filename: &str, n: u32) -> String {
    match filename.find(".tar") {
        Some(idx) => format!("{}_{}{}", &filename[..idx], n, &filename[idx..]),
        None => format!("{}_{}", filename, n),
    }
}

/// Keep server names filesystem-safe.
fn sanitize_server_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "server".to_string()
    } else {
        cleaned
    }
}
