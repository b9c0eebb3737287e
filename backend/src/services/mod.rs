//! Business logic services.

pub mod archive_codec;
pub mod backup_executor;
pub mod encryption;
pub mod metrics_service;
pub mod process_lifecycle;
pub mod restore_service;
pub mod retention;
pub mod scheduler_service;
pub mod server_lock;
pub mod server_registry;
pub mod trigger;
pub mod verification;
