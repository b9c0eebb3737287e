//! Fire-time computation for backup schedules.
//!
//! Everything here is pure: callers pass the current instant and get the next
//! instant at which a schedule should fire. Time-of-day is interpreted in the
//! timezone of `now`, so the scheduler passes host-local times and tests can
//! pass `Utc` or a fixed offset.

use std::sync::Mutex;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc,
};

use crate::models::ScheduleType;

/// Source of the current instant. Injected so the scheduler can be driven by tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Next instant strictly after `now` at which a schedule fires.
///
/// - daily: the next occurrence of `at`
/// - weekly: the next Sunday at `at` (today if today is Sunday and `at` is ahead)
/// - monthly: the 1st of the next month at `at` (today if today is the 1st and
///   `at` is ahead)
pub fn next_fire_time<Tz: TimeZone>(
    schedule_type: ScheduleType,
    at: NaiveTime,
    now: &DateTime<Tz>,
) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.naive_local().date();

    let mut date = first_candidate(schedule_type, today);
    loop {
        let fire = resolve_local(&tz, date, at);
        if fire > *now {
            return fire;
        }
        date = next_candidate(schedule_type, date);
    }
}

fn first_candidate(schedule_type: ScheduleType, today: NaiveDate) -> NaiveDate {
    match schedule_type {
        ScheduleType::Daily => today,
        ScheduleType::Weekly => {
            let until_sunday = (7 - today.weekday().num_days_from_sunday()) % 7;
            today + Duration::days(i64::from(until_sunday))
        }
        ScheduleType::Monthly => {
            if today.day() == 1 {
                today
            } else {
                first_of_next_month(today)
            }
        }
    }
}

fn next_candidate(schedule_type: ScheduleType, date: NaiveDate) -> NaiveDate {
    match schedule_type {
        ScheduleType::Daily => date + Duration::days(1),
        ScheduleType::Weekly => date + Duration::days(7),
        ScheduleType::Monthly => first_of_next_month(date),
    }
}

fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date + Duration::days(28))
}

/// Map a local date and time to an instant. Ambiguous times (DST fold) take the
/// earlier instant; nonexistent times (DST gap) move forward to the first valid
/// minute.
fn resolve_local<Tz: TimeZone>(tz: &Tz, date: NaiveDate, at: NaiveTime) -> DateTime<Tz> {
    let naive = date.and_time(at);
    for minutes in 0..=(4 * 60) {
        match tz.from_local_datetime(&(naive + Duration::minutes(minutes))) {
            LocalResult::Single(t) => return t,
            LocalResult::Ambiguous(earliest, _) => return earliest,
            LocalResult::None => continue,
        }
    }
    tz.from_utc_datetime(&naive)
}
