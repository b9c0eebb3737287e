//! Background backup scheduler.
//!
//! A single ticker walks every enabled schedule. Each schedule remembers when
//! the scheduler last checked it; a backup is dispatched once the next fire
//! time after that check has passed. Windows missed while the process was down
//! are not caught up. Jobs for different servers run concurrently on a
//! `JoinSet` owned by the scheduler and are drained on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::error::Result;
use crate::models::{BackupSchedule, ServerId, TriggerReason};
use crate::services::backup_executor::BackupExecutor;
use crate::services::metrics_service;
use crate::services::server_lock::LockPurpose;
use crate::services::trigger::{next_fire_time, Clock};
use crate::store::BackupStore;

/// Where a schedule is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    Disabled,
    Armed,
    Running,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    last_checked: DateTime<Utc>,
    running: bool,
}

type Slots = Arc<Mutex<HashMap<ServerId, Slot>>>;

/// Next time a schedule fires after `now`, in host-local time.
pub fn next_run(schedule: &BackupSchedule, now: DateTime<Utc>) -> DateTime<Utc> {
    next_fire_time(
        schedule.schedule_type,
        schedule.schedule_time,
        &now.with_timezone(&Local),
    )
    .with_timezone(&Utc)
}

pub struct Scheduler {
    store: Arc<dyn BackupStore>,
    executor: Arc<BackupExecutor>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    slots: Slots,
    jobs: AsyncMutex<JoinSet<()>>,
    /// Stops the ticker.
    stop: CancellationToken,
    /// Cancels in-flight jobs.
    cancel_jobs: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn BackupStore>,
        executor: Arc<BackupExecutor>,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            executor,
            clock,
            tick_interval,
            slots: Arc::new(Mutex::new(HashMap::new())),
            jobs: AsyncMutex::new(JoinSet::new()),
            stop: CancellationToken::new(),
            cancel_jobs: CancellationToken::new(),
        })
    }

    /// Current state of a server's schedule as seen by the scheduler.
    pub fn state(&self, schedule: &BackupSchedule) -> ScheduleState {
        if !schedule.enabled {
            return ScheduleState::Disabled;
        }
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get(&schedule.server_id) {
            Some(slot) if slot.running => ScheduleState::Running,
            _ => ScheduleState::Armed,
        }
    }

    /// Evaluate every schedule once. Returns the servers a backup was started for.
    pub async fn tick(&self) -> Result<Vec<ServerId>> {
        let now = self.clock.now();
        let schedules = self.store.list_schedules().await?;
        let mut dispatched = Vec::new();
        let mut jobs = self.jobs.lock().await;

        // Reap finished jobs
        while let Some(joined) = jobs.try_join_next() {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Backup job panicked or was aborted");
            }
        }

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.retain(|id, slot| {
            slot.running || schedules.iter().any(|s| s.server_id == *id && s.enabled)
        });

        for schedule in schedules.iter().filter(|s| s.enabled) {
            let server_id = schedule.server_id;
            let slot = slots.entry(server_id).or_insert(Slot {
                last_checked: now,
                running: false,
            });
            if slot.running {
                continue;
            }

            let fire = next_run(schedule, slot.last_checked);
            if fire > now || schedule.last_backup.is_some_and(|last| last >= fire) {
                slot.last_checked = now;
                continue;
            }

            let guard = match self.executor.locks().try_acquire(server_id, LockPurpose::Backup) {
                Ok(guard) => guard,
                Err(_) => {
                    tracing::info!(server_id, "Server busy, scheduled backup retried next tick");
                    continue;
                }
            };

            slot.last_checked = now;
            slot.running = true;
            dispatched.push(server_id);
            tracing::info!(server_id, fire_time = %fire, "Dispatching scheduled backup");

            let executor = Arc::clone(&self.executor);
            let job_slots = Arc::clone(&self.slots);
            let cancel = self.cancel_jobs.child_token();
            jobs.spawn(async move {
                if let Err(e) = executor
                    .run_locked(guard, TriggerReason::Scheduled, cancel)
                    .await
                {
                    tracing::warn!(server_id, error = %e, code = e.code(), "Scheduled backup failed");
                }
                let mut slots = job_slots.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(slot) = slots.get_mut(&server_id) {
                    slot.running = false;
                }
            });
        }

        metrics_service::set_running_jobs(slots.values().filter(|s| s.running).count());
        Ok(dispatched)
    }

    /// Start the ticker on the runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(tick_secs = self.tick_interval.as_secs(), "Backup scheduler started");

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "Backup schedule check failed");
                    }
                }
            }
        }
        tracing::info!("Backup scheduler stopped");
    }

    /// Wait for every in-flight job to finish.
    pub async fn wait_idle(&self) {
        let mut jobs = self.jobs.lock().await;
        while jobs.join_next().await.is_some() {}
    }

    /// Stop ticking, give in-flight jobs `timeout` to finish, then cancel them.
    pub async fn shutdown(&self, timeout: Duration) {
        self.stop.cancel();

        if tokio::time::timeout(timeout, self.wait_idle()).await.is_ok() {
            tracing::info!("Backup scheduler drained");
            return;
        }

        tracing::warn!(timeout_secs = timeout.as_secs(), "Cancelling in-flight backups");
        self.cancel_jobs.cancel();
        if tokio::time::timeout(timeout, self.wait_idle()).await.is_err() {
            self.jobs.lock().await.abort_all();
        }
    }
}
