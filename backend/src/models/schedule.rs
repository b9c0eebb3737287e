//! Backup schedule model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use super::ServerId;
use crate::error::{AppError, Result};

/// Smallest and largest accepted `retention_days`.
pub const MIN_RETENTION_DAYS: i32 = 1;
pub const MAX_RETENTION_DAYS: i32 = 365;

/// Backup cadence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema,
)]
#[sqlx(type_name = "schedule_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Daily,
    Weekly,
    Monthly,
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleType::Daily => write!(f, "daily"),
            ScheduleType::Weekly => write!(f, "weekly"),
            ScheduleType::Monthly => write!(f, "monthly"),
        }
    }
}

impl FromStr for ScheduleType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(ScheduleType::Daily),
            "weekly" => Ok(ScheduleType::Weekly),
            "monthly" => Ok(ScheduleType::Monthly),
            other => Err(AppError::Validation(format!(
                "Invalid schedule_type '{}'. Must be one of: daily, weekly, monthly",
                other
            ))),
        }
    }
}

/// A server's automated backup schedule. At most one exists per server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct BackupSchedule {
    pub server_id: ServerId,
    pub schedule_type: ScheduleType,
    /// Time of day in the host's local zone, rendered as `HH:MM`.
    #[serde(with = "hhmm")]
    #[schema(value_type = String, example = "02:00")]
    pub schedule_time: NaiveTime,
    pub retention_days: i32,
    pub enabled: bool,
    pub last_backup: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a backup schedule.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateScheduleRequest {
    pub server_id: ServerId,
    pub schedule_type: ScheduleType,
    #[serde(with = "hhmm")]
    #[schema(value_type = String, example = "02:00")]
    pub schedule_time: NaiveTime,
    pub retention_days: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Partial update of a backup schedule.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct UpdateScheduleRequest {
    pub schedule_type: Option<ScheduleType>,
    #[serde(default, with = "hhmm::option")]
    #[schema(value_type = Option<String>, example = "03:30")]
    pub schedule_time: Option<NaiveTime>,
    pub retention_days: Option<i32>,
    pub enabled: Option<bool>,
}

pub fn validate_retention_days(days: i32) -> Result<()> {
    if !(MIN_RETENTION_DAYS..=MAX_RETENTION_DAYS).contains(&days) {
        return Err(AppError::Validation(format!(
            "retention_days must be between {} and {}, got {}",
            MIN_RETENTION_DAYS, MAX_RETENTION_DAYS, days
        )));
    }
    Ok(())
}

impl CreateScheduleRequest {
    pub fn validate(&self) -> Result<()> {
        if self.server_id <= 0 {
            return Err(AppError::Validation("server_id must be positive".into()));
        }
        validate_retention_days(self.retention_days)
    }

    /// Build the schedule record this request describes.
    pub fn into_schedule(self, now: DateTime<Utc>) -> BackupSchedule {
        BackupSchedule {
            server_id: self.server_id,
            schedule_type: self.schedule_type,
            schedule_time: self.schedule_time,
            retention_days: self.retention_days,
            enabled: self.enabled,
            last_backup: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl UpdateScheduleRequest {
    /// Apply the update on top of `existing`, validating the result.
    pub fn apply(self, mut existing: BackupSchedule, now: DateTime<Utc>) -> Result<BackupSchedule> {
        if let Some(days) = self.retention_days {
            validate_retention_days(days)?;
            existing.retention_days = days;
        }
        if let Some(schedule_type) = self.schedule_type {
            existing.schedule_type = schedule_type;
        }
        if let Some(time) = self.schedule_time {
            existing.schedule_time = time;
        }
        if let Some(enabled) = self.enabled {
            existing.enabled = enabled;
        }
        existing.updated_at = now;
        Ok(existing)
    }
}

/// Serde adapter for `HH:MM` times. Also accepts `HH:MM:SS` on input.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn parse(s: &str) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(s, FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
            .ok()
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid time '{}', expected HH:MM", s))
        })
    }

    pub mod option {
        use chrono::NaiveTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            time: &Option<NaiveTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match time {
                Some(t) => super::serialize(t, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<NaiveTime>, D::Error> {
            let s: Option<String> = Option::deserialize(deserializer)?;
            match s {
                Some(s) => super::parse(&s).map(Some).ok_or_else(|| {
                    serde::de::Error::custom(format!("invalid time '{}', expected HH:MM", s))
                }),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(days: i32) -> CreateScheduleRequest {
        CreateScheduleRequest {
            server_id: 1,
            schedule_type: ScheduleType::Daily,
            schedule_time: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            retention_days: days,
            enabled: true,
        }
    }

    #[test]
    fn test_retention_bounds() {
        assert!(request(0).validate().is_err());
        assert!(request(1).validate().is_ok());
        assert!(request(365).validate().is_ok());
        assert!(request(366).validate().is_err());
    }

    #[test]
    fn test_create_request_parses_hhmm() {
        let req: CreateScheduleRequest = serde_json::from_str(
            r#"{"server_id": 4, "schedule_type": "weekly", "schedule_time": "03:15", "retention_days": 14}"#,
        )
        .unwrap();
        assert_eq!(req.schedule_type, ScheduleType::Weekly);
        assert_eq!(req.schedule_time, NaiveTime::from_hms_opt(3, 15, 0).unwrap());
        assert!(req.enabled);
    }

    #[test]
    fn test_invalid_time_rejected() {
        let result: std::result::Result<CreateScheduleRequest, _> = serde_json::from_str(
            r#"{"server_id": 4, "schedule_type": "daily", "schedule_time": "25:00", "retention_days": 7}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_schedule_serializes_time_as_hhmm() {
        let schedule = request(7).into_schedule(Utc::now());
        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["schedule_time"], "02:00");
        assert_eq!(json["schedule_type"], "daily");
    }

    #[test]
    fn test_update_applies_fields() {
        let schedule = request(7).into_schedule(Utc::now());
        let update = UpdateScheduleRequest {
            retention_days: Some(30),
            enabled: Some(false),
            ..Default::default()
        };
        let updated = update.apply(schedule, Utc::now()).unwrap();
        assert_eq!(updated.retention_days, 30);
        assert!(!updated.enabled);
        assert_eq!(updated.schedule_type, ScheduleType::Daily);

        let bad = UpdateScheduleRequest {
            retention_days: Some(400),
            ..Default::default()
        };
        assert!(bad.apply(updated, Utc::now()).is_err());
    }

    #[test]
    fn test_schedule_type_from_str() {
        assert_eq!("Monthly".parse::<ScheduleType>().unwrap(), ScheduleType::Monthly);
        assert!("hourly".parse::<ScheduleType>().is_err());
    }
}
