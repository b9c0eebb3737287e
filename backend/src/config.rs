//! Application configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::CompressionMethod;
use crate::services::encryption::EncryptionKey;

/// Application configuration
#[derive(Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Server bind address (host:port)
    pub bind_address: String,

    /// Directory holding one sub-directory of archives per server
    pub backup_root: PathBuf,

    /// Compression for new archives
    pub compression: CompressionMethod,

    /// Passphrase for archive encryption (PBKDF2-derived key)
    pub encryption_passphrase: Option<String>,

    /// Raw 32-byte archive key as hex; takes precedence over the passphrase
    pub encryption_key_hex: Option<String>,

    pub scheduler_tick_secs: u64,

    /// How long to wait for a server to stop before giving up
    pub process_stop_timeout_secs: u64,

    /// Bound on one start or status command
    pub process_command_timeout_secs: u64,

    /// Overall deadline for one backup job
    pub backup_job_timeout_secs: u64,

    /// How long API-triggered operations wait for a busy server lock
    pub interactive_lock_wait_secs: u64,

    pub disk_pressure_threshold_percent: f64,

    /// Archives per server kept by emergency pruning
    pub emergency_retention_floor: usize,

    pub verify_test_extraction: bool,

    /// Relative paths expected in every archive
    pub verify_markers: Vec<String>,

    pub restore_api_enabled: bool,

    pub manual_trigger_enabled: bool,

    /// Command templates for the process manager; `{id}` is the server id
    pub process_stop_cmd: String,
    pub process_start_cmd: String,
    pub process_status_cmd: String,

    /// Time given to in-flight backups on shutdown
    pub shutdown_drain_secs: u64,
}

redacted_debug!(Config {
    redact database_url,
    show bind_address,
    show backup_root,
    show compression,
    redact_option encryption_passphrase,
    redact_option encryption_key_hex,
    show scheduler_tick_secs,
    show process_stop_timeout_secs,
    show process_command_timeout_secs,
    show backup_job_timeout_secs,
    show interactive_lock_wait_secs,
    show disk_pressure_threshold_percent,
    show emergency_retention_floor,
    show verify_test_extraction,
    show verify_markers,
    show restore_api_enabled,
    show manual_trigger_enabled,
    show process_stop_cmd,
    show process_start_cmd,
    show process_status_cmd,
    show shutdown_drain_secs,
});

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            bind_address: "0.0.0.0:8080".into(),
            backup_root: PathBuf::from("/var/lib/backup-keeper/backups"),
            compression: CompressionMethod::Gzip,
            encryption_passphrase: None,
            encryption_key_hex: None,
            scheduler_tick_secs: 60,
            process_stop_timeout_secs: 30,
            process_command_timeout_secs: 60,
            backup_job_timeout_secs: 3600,
            interactive_lock_wait_secs: 10,
            disk_pressure_threshold_percent: 90.0,
            emergency_retention_floor: 3,
            verify_test_extraction: true,
            verify_markers: Vec::new(),
            restore_api_enabled: true,
            manual_trigger_enabled: true,
            process_stop_cmd: "systemctl stop gameserver@{id}.service".into(),
            process_start_cmd: "systemctl start gameserver@{id}.service".into(),
            process_status_cmd: "systemctl is-active --quiet gameserver@{id}.service".into(),
            shutdown_drain_secs: 30,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{} has an invalid value '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}

fn parse_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(AppError::Config(format!("{} must be a boolean, got '{}'", name, raw))),
        },
        Err(_) => Ok(default),
    }
}

/// Split a comma-separated list, dropping blanks.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| AppError::Config("DATABASE_URL not set".into()))?,
            bind_address: env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            backup_root: env::var("BACKUP_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.backup_root),
            compression: parse_var("BACKUP_COMPRESSION", defaults.compression)?,
            encryption_passphrase: env::var("BACKUP_ENCRYPTION_PASSPHRASE")
                .ok()
                .filter(|s| !s.is_empty()),
            encryption_key_hex: env::var("BACKUP_ENCRYPTION_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            scheduler_tick_secs: parse_var("SCHEDULER_TICK_SECS", defaults.scheduler_tick_secs)?,
            process_stop_timeout_secs: parse_var(
                "PROCESS_STOP_TIMEOUT_SECS",
                defaults.process_stop_timeout_secs,
            )?,
            process_command_timeout_secs: parse_var(
                "PROCESS_COMMAND_TIMEOUT_SECS",
                defaults.process_command_timeout_secs,
            )?,
            backup_job_timeout_secs: parse_var(
                "BACKUP_JOB_TIMEOUT_SECS",
                defaults.backup_job_timeout_secs,
            )?,
            interactive_lock_wait_secs: parse_var(
                "INTERACTIVE_LOCK_WAIT_SECS",
                defaults.interactive_lock_wait_secs,
            )?,
            disk_pressure_threshold_percent: parse_var(
                "DISK_PRESSURE_THRESHOLD_PERCENT",
                defaults.disk_pressure_threshold_percent,
            )?,
            emergency_retention_floor: parse_var(
                "EMERGENCY_RETENTION_FLOOR",
                defaults.emergency_retention_floor,
            )?,
            verify_test_extraction: parse_bool(
                "VERIFY_TEST_EXTRACTION",
                defaults.verify_test_extraction,
            )?,
            verify_markers: env::var("VERIFY_MARKERS")
                .map(|raw| parse_list(&raw))
                .unwrap_or_default(),
            restore_api_enabled: parse_bool("RESTORE_API_ENABLED", defaults.restore_api_enabled)?,
            manual_trigger_enabled: parse_bool(
                "MANUAL_TRIGGER_ENABLED",
                defaults.manual_trigger_enabled,
            )?,
            process_stop_cmd: env::var("PROCESS_STOP_CMD").unwrap_or(defaults.process_stop_cmd),
            process_start_cmd: env::var("PROCESS_START_CMD")
                .unwrap_or(defaults.process_start_cmd),
            process_status_cmd: env::var("PROCESS_STATUS_CMD")
                .unwrap_or(defaults.process_status_cmd),
            shutdown_drain_secs: parse_var("SHUTDOWN_DRAIN_SECS", defaults.shutdown_drain_secs)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler_tick_secs == 0 {
            return Err(AppError::Config("SCHEDULER_TICK_SECS must be positive".into()));
        }
        if !(1.0..=100.0).contains(&self.disk_pressure_threshold_percent) {
            return Err(AppError::Config(
                "DISK_PRESSURE_THRESHOLD_PERCENT must be between 1 and 100".into(),
            ));
        }
        if self.process_command_timeout_secs == 0 || self.backup_job_timeout_secs == 0 {
            return Err(AppError::Config(
                "PROCESS_COMMAND_TIMEOUT_SECS and BACKUP_JOB_TIMEOUT_SECS must be positive".into(),
            ));
        }
        if self.emergency_retention_floor == 0 {
            return Err(AppError::Config(
                "EMERGENCY_RETENTION_FLOOR must keep at least one archive".into(),
            ));
        }
        self.encryption_key()?;
        Ok(())
    }

    /// Archive encryption key, if encryption is configured.
    pub fn encryption_key(&self) -> Result<Option<EncryptionKey>> {
        if let Some(hex_key) = &self.encryption_key_hex {
            let key = EncryptionKey::from_hex(hex_key)
                .map_err(|e| AppError::Config(format!("BACKUP_ENCRYPTION_KEY: {}", e)))?;
            return Ok(Some(key));
        }
        Ok(self
            .encryption_passphrase
            .as_ref()
            .map(|p| EncryptionKey::passphrase(p.clone())))
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }

    pub fn process_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.process_stop_timeout_secs)
    }

    pub fn process_command_timeout(&self) -> Duration {
        Duration::from_secs(self.process_command_timeout_secs)
    }

    pub fn backup_job_timeout(&self) -> Duration {
        Duration::from_secs(self.backup_job_timeout_secs)
    }

    pub fn interactive_lock_wait(&self) -> Duration {
        Duration::from_secs(self.interactive_lock_wait_secs)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.compression, CompressionMethod::Gzip);
        assert_eq!(config.scheduler_tick(), Duration::from_secs(60));
        assert!(config.encryption_key().unwrap().is_none());
    }

    #[test]
    fn test_raw_key_wins_over_passphrase() {
        let config = Config {
            encryption_passphrase: Some("pass".into()),
            encryption_key_hex: Some("ab".repeat(32)),
            ..Config::default()
        };
        assert!(matches!(
            config.encryption_key().unwrap(),
            Some(EncryptionKey::Raw(_))
        ));
    }

    #[test]
    fn test_bad_key_is_config_error() {
        let config = Config {
            encryption_key_hex: Some("short".into()),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_zero_timeouts_are_rejected() {
        let config = Config {
            process_command_timeout_secs: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(
            parse_list(" server.properties, ,world/level.dat "),
            vec!["server.properties".to_string(), "world/level.dat".to_string()]
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = Config {
            database_url: "postgres://user:hunter2@db/backups".into(),
            encryption_passphrase: Some("swordfish".into()),
            ..Config::default()
        };
        let output = format!("{:?}", config);
        assert!(!output.contains("hunter2"));
        assert!(!output.contains("swordfish"));
        assert!(output.contains("bind_address"));
    }
}
