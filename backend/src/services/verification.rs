//! Archive verification and quality scoring.
//!
//! Checks run cheapest first:
//!
//! | check      | points | on failure                         |
//! |------------|--------|------------------------------------|
//! | checksum   | 40     | `VerificationFailed`               |
//! | structure  | 30     | `VerificationFailed` (empty: 15)   |
//! | markers    | 15     | pro-rata, full when none configured |
//! | extraction | 15     | warning                            |

use std::path::{Path, PathBuf};

use serde::Serialize;
use utoipa::ToSchema;

use crate::error::{AppError, Result};
use crate::models::QualityLevel;
use crate::services::archive_codec::{self, ArchiveEntry};
use crate::services::encryption::EncryptionKey;

const CHECKSUM_POINTS: u8 = 40;
const STRUCTURE_POINTS: u8 = 30;
const EMPTY_STRUCTURE_POINTS: u8 = 15;
const MARKER_POINTS: u8 = 15;
const EXTRACTION_POINTS: u8 = 15;

/// Outcome of a single check.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub points: u8,
    pub max_points: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn new(name: &str, points: u8, max_points: u8, detail: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: points == max_points,
            points,
            max_points,
            detail,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct VerificationReport {
    pub score: u8,
    pub level: QualityLevel,
    pub entry_count: usize,
    pub checks: Vec<CheckResult>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VerificationEngine {
    markers: Vec<String>,
    test_extraction: bool,
    scratch_dir: Option<PathBuf>,
    key: Option<EncryptionKey>,
}

impl VerificationEngine {
    pub fn new(markers: Vec<String>, test_extraction: bool, key: Option<EncryptionKey>) -> Self {
        Self {
            markers,
            test_extraction,
            scratch_dir: None,
            key,
        }
    }

    /// Extract test copies under `dir` instead of the system temp directory.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Verify an archive against the checksum recorded when it was written.
    pub fn verify(&self, path: &Path, expected_checksum: &str) -> Result<VerificationReport> {
        let mut checks = Vec::with_capacity(4);
        let mut warnings = Vec::new();

        // (a) checksum
        let actual = archive_codec::sha256_file(path)?;
        if !actual.eq_ignore_ascii_case(expected_checksum) {
            return Err(AppError::VerificationFailed(format!(
                "checksum mismatch for {}: expected {}, got {}",
                path.display(),
                expected_checksum,
                actual
            )));
        }
        checks.push(CheckResult::new("checksum", CHECKSUM_POINTS, CHECKSUM_POINTS, None));

        // (b) structure
        let entries = archive_codec::list_entries(path, self.key.as_ref()).map_err(|e| {
            AppError::VerificationFailed(format!("unreadable archive {}: {}", path.display(), e))
        })?;
        if entries.is_empty() {
            warnings.push("archive contains no entries".to_string());
            checks.push(CheckResult::new(
                "structure",
                EMPTY_STRUCTURE_POINTS,
                STRUCTURE_POINTS,
                Some("empty archive".into()),
            ));
        } else {
            checks.push(CheckResult::new("structure", STRUCTURE_POINTS, STRUCTURE_POINTS, None));
        }

        // (c) markers
        checks.push(self.check_markers(&entries, &mut warnings));

        // (d) test extraction
        if self.test_extraction {
            checks.push(self.check_extraction(path, &mut warnings));
        } else {
            checks.push(CheckResult::new(
                "extraction",
                EXTRACTION_POINTS,
                EXTRACTION_POINTS,
                Some("skipped".into()),
            ));
        }

        let score = checks.iter().map(|c| c.points).sum::<u8>().min(100);
        Ok(VerificationReport {
            score,
            level: QualityLevel::from_score(score),
            entry_count: entries.len(),
            checks,
            warnings,
        })
    }

    fn check_markers(&self, entries: &[ArchiveEntry], warnings: &mut Vec<String>) -> CheckResult {
        if self.markers.is_empty() {
            return CheckResult::new("markers", MARKER_POINTS, MARKER_POINTS, None);
        }

        let missing: Vec<&str> = self
            .markers
            .iter()
            .map(|m| m.trim_matches('/'))
            .filter(|marker| {
                !entries.iter().any(|e| {
                    e.path.trim_start_matches("./").trim_end_matches('/') == *marker
                })
            })
            .collect();

        let found = self.markers.len() - missing.len();
        let points = (usize::from(MARKER_POINTS) * found / self.markers.len()) as u8;
        let detail = if missing.is_empty() {
            None
        } else {
            let detail = format!("missing markers: {}", missing.join(", "));
            warnings.push(detail.clone());
            Some(detail)
        };
        CheckResult::new("markers", points, MARKER_POINTS, detail)
    }

    fn check_extraction(&self, path: &Path, warnings: &mut Vec<String>) -> CheckResult {
        let scratch = match &self.scratch_dir {
            Some(dir) => tempfile::Builder::new().prefix("verify-").tempdir_in(dir),
            None => tempfile::Builder::new().prefix("verify-").tempdir(),
        };
        let result = scratch
            .map_err(AppError::from)
            .and_then(|dir| archive_codec::decode(path, dir.path(), self.key.as_ref()));

        match result {
            Ok(_) => CheckResult::new("extraction", EXTRACTION_POINTS, EXTRACTION_POINTS, None),
            Err(e) => {
                let detail = format!("test extraction failed: {}", e);
                tracing::warn!(path = %path.display(), error = %e, "Test extraction failed");
                warnings.push(detail.clone());
                CheckResult::new("extraction", 0, EXTRACTION_POINTS, Some(detail))
            }
        }
    }

    /// [`verify`](Self::verify) on the blocking pool.
    pub async fn verify_async(&self, path: PathBuf, expected_checksum: String) -> Result<VerificationReport> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.verify(&path, &expected_checksum))
            .await
            .map_err(|e| AppError::Internal(format!("verification task failed: {}", e)))?
    }
}
