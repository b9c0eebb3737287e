//! Backup Keeper - Backend Library
//!
//! Scheduled, verified and restorable backups of hosted server directories.

#[macro_use]
mod macros;

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod store;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
