//! Restore operation model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use super::ServerId;

/// Warning returned with every restore preview.
pub const RESTORE_WARNING: &str = "Restoring this backup will stop the server if it is running \
and replace all of its current files with the contents of the backup. The current files are \
kept as a rollback snapshot until the next restore completes.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "restore_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RestoreState {
    Previewed,
    Confirmed,
    Applying,
    Completed,
    Failed,
    RolledBack,
}

/// A restore attempt against a server's live directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct RestoreOperation {
    pub id: Uuid,
    pub server_id: ServerId,
    pub backup_filename: String,
    pub state: RestoreState,
    pub pre_restore_snapshot_path: Option<String>,
    pub server_was_running: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RestoreOperation {
    pub fn new(
        server_id: ServerId,
        backup_filename: impl Into<String>,
        state: RestoreState,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_id,
            backup_filename: backup_filename.into(),
            state,
            pre_restore_snapshot_path: None,
            server_was_running: false,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Only a completed restore with a snapshot on record can be rolled back.
    pub fn can_roll_back(&self) -> bool {
        self.state == RestoreState::Completed && self.pre_restore_snapshot_path.is_some()
    }
}
