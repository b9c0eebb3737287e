//! Database models (SQLx).

pub mod archive;
pub mod restore;
pub mod schedule;

/// Identity of a hosted server. Owned by the external server registry.
pub type ServerId = i64;

pub use archive::{
    ArchiveStatus, BackupArchive, CompressionMethod, QualityLevel, TriggerReason,
};
pub use restore::{RestoreOperation, RestoreState};
pub use schedule::{BackupSchedule, ScheduleType};
