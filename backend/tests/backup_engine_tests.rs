//! End-to-end tests of the backup engine on in-memory collaborators.
//!
//! The scheduler is driven by a manual clock; archives are real files in a
//! temporary backup root.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use chrono::{Local, NaiveTime, TimeZone, Utc};
use serde_json::json;

use backup_keeper_backend::error::AppError;
use backup_keeper_backend::models::{BackupSchedule, ScheduleType, TriggerReason};
use backup_keeper_backend::services::backup_executor::LockMode;
use backup_keeper_backend::services::server_lock::LockPurpose;
use backup_keeper_backend::store::BackupStore;

use common::fixtures::{dir_size, tree_hash};
use common::{json_body, send, TestHarness};

fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> chrono::DateTime<Utc> {
    Local
        .with_ymd_and_hms(y, m, d, h, min, 0)
        .single()
        .unwrap()
        .with_timezone(&Utc)
}

#[tokio::test]
async fn test_daily_schedule_over_ten_days_keeps_seven_archives() {
    let h = TestHarness::new(local(2024, 1, 1, 0, 0));
    h.add_server(1, "survival");
    h.process.set_running(1, true);

    let router = h.router();
    let response = send(
        &router,
        "POST",
        "/api/v1/schedules",
        Some(json!({
            "server_id": 1,
            "schedule_type": "daily",
            "schedule_time": "02:00",
            "retention_days": 7
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let scheduler = h.state.scheduler.clone();
    let mut runs = Vec::new();
    for _ in 0..(10 * 24) {
        h.clock.advance(chrono::Duration::hours(1));
        let dispatched = scheduler.tick().await.unwrap();
        scheduler.wait_idle().await;
        if !dispatched.is_empty() {
            runs.push(h.clock_now());
        }
    }

    assert_eq!(runs.len(), 10, "one backup per day");
    let latest_run = *runs.last().unwrap();
    assert_eq!(latest_run, local(2024, 1, 10, 2, 0));

    let archives = h.store.list_archives(1).await.unwrap();
    assert_eq!(archives.len(), 7);
    assert!(archives
        .windows(2)
        .all(|pair| pair[0].created_at > pair[1].created_at));
    assert_eq!(archives[0].created_at, latest_run);
    assert_eq!(archives[6].created_at, local(2024, 1, 4, 2, 0));
    assert!(archives.iter().all(|a| a.quality_score == Some(100)));

    let schedule = h.store.get_schedule(1).await.unwrap().unwrap();
    assert_eq!(schedule.last_backup, Some(latest_run));

    let on_disk = std::fs::read_dir(h.state.executor.server_backup_dir(1))
        .unwrap()
        .count();
    assert_eq!(on_disk, 7);

    // The server was running throughout and is running again after every job.
    assert!(h.process.is_up(1));

    let history = json_body(send(&router, "GET", "/api/v1/backups/1/history", None).await).await;
    let backups = history["backups"].as_array().unwrap();
    assert_eq!(backups.len(), 7);
    assert_eq!(backups[0]["filename"], archives[0].filename.as_str());
}

#[tokio::test]
async fn test_backup_and_restore_never_overlap() {
    let h = TestHarness::new(Utc::now());
    h.add_server(1, "creative");

    let first = h
        .state
        .executor
        .run_backup(1, TriggerReason::Manual, LockMode::TryOnce)
        .await
        .unwrap();
    h.clock.advance(chrono::Duration::seconds(5));

    // A backup that is slow to stop the server holds the lock.
    h.process.set_running(1, true);
    h.process.set_stop_delay(Duration::from_millis(400));
    let executor = h.state.executor.clone();
    let backup = tokio::spawn(async move {
        executor
            .run_backup(1, TriggerReason::Manual, LockMode::TryOnce)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.state.locks.holder(1), Some(LockPurpose::Backup));

    let restore = h.state.restores.apply(1, &first.archive.filename).await;
    assert!(matches!(restore, Err(AppError::BackupInProgress(1))));

    let router = h.router();
    let response = send(
        &router,
        "POST",
        "/api/v1/backups/1/restore",
        Some(json!({"backup_filename": first.archive.filename, "confirm": true})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["code"], "BACKUP_IN_PROGRESS");

    let second = backup.await.unwrap().unwrap();
    assert_ne!(second.archive.filename, first.archive.filename);
    assert!(h.state.locks.holder(1).is_none());

    // Now the other way round: a restore in flight blocks a backup.
    h.process.set_running(1, true);
    let restores = h.state.restores.clone();
    let filename = first.archive.filename.clone();
    let restore = tokio::spawn(async move { restores.apply(1, &filename).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let blocked = h
        .state
        .executor
        .run_backup(1, TriggerReason::Manual, LockMode::TryOnce)
        .await;
    assert!(matches!(blocked, Err(AppError::BackupInProgress(1))));

    let scheduled = h.state.scheduler.tick().await.unwrap();
    assert!(scheduled.is_empty());

    let op = restore.await.unwrap().unwrap();
    assert_eq!(op.backup_filename, first.archive.filename);
    assert!(h.process.is_up(1), "server restarted after restore");
}

#[tokio::test]
async fn test_restore_preview_and_corrupt_archive_leave_files_untouched() {
    let h = TestHarness::new(Utc::now());
    let dir = h.add_server(3, "hardcore");
    let router = h.router();

    let created = json_body(send(&router, "POST", "/api/v1/backups/3/trigger", None).await).await;
    let filename = created["backup"]["archive"]["filename"]
        .as_str()
        .unwrap()
        .to_string();
    let archive_path = created["backup"]["archive"]["path"].as_str().unwrap().to_string();

    std::fs::write(dir.join("world/level.dat"), b"edited after backup").unwrap();
    let before = tree_hash(&dir);

    let preview = send(
        &router,
        "POST",
        "/api/v1/backups/3/restore",
        Some(json!({"backup_filename": filename, "confirm": false})),
    )
    .await;
    assert_eq!(preview.status(), StatusCode::OK);
    let preview = json_body(preview).await;
    assert!(preview["preview"]["warning"]
        .as_str()
        .unwrap()
        .contains("stop the server"));
    assert_eq!(tree_hash(&dir), before);

    // Flip one byte in the archive.
    let mut bytes = std::fs::read(&archive_path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    std::fs::write(&archive_path, bytes).unwrap();

    let applied = send(
        &router,
        "POST",
        "/api/v1/backups/3/restore",
        Some(json!({"backup_filename": filename, "confirm": true})),
    )
    .await;
    assert_eq!(applied.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(tree_hash(&dir), before);

    let verify = send(
        &router,
        "POST",
        &format!("/api/v1/backups/3/archives/{}/verify", filename),
        None,
    )
    .await;
    assert_eq!(verify.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(verify).await["code"], "VERIFICATION_FAILED");
}

#[tokio::test]
async fn test_disk_pressure_prunes_oldest_archives_across_servers() {
    let h = TestHarness::new(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap());
    for (id, name) in [(1, "one"), (2, "two"), (3, "three")] {
        h.add_server(id, name);
    }

    for id in [1, 2, 3] {
        for _ in 0..5 {
            h.state
                .executor
                .run_backup(id, TriggerReason::Manual, LockMode::TryOnce)
                .await
                .unwrap();
            h.clock.advance(chrono::Duration::minutes(1));
        }
    }
    let root = h.tmp.path().join("backups");
    assert_eq!(h.store.list_all_archives().await.unwrap().len(), 15);

    // Fifteen archives fill the disk; the next backup pushes it over.
    h.disk.set_capacity(dir_size(&root));
    let outcome = h
        .state
        .executor
        .run_backup(1, TriggerReason::Manual, LockMode::TryOnce)
        .await
        .unwrap();
    assert_eq!(outcome.pruned.len(), 3);

    let counts: Vec<usize> = {
        let mut counts = Vec::new();
        for id in [1, 2, 3] {
            counts.push(h.store.list_archives(id).await.unwrap().len());
        }
        counts
    };
    assert_eq!(counts, vec![3, 5, 5]);

    let kept = h.store.list_archives(1).await.unwrap();
    assert_eq!(kept[0].filename, outcome.archive.filename);
}

#[tokio::test]
async fn test_disk_pressure_stops_at_floor() {
    let h = TestHarness::with_config(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(), |c| {
        c.emergency_retention_floor = 2;
    });
    h.add_server(1, "solo");

    for _ in 0..4 {
        h.state
            .executor
            .run_backup(1, TriggerReason::Manual, LockMode::TryOnce)
            .await
            .unwrap();
        h.clock.advance(chrono::Duration::minutes(1));
    }

    // Far too small: nothing short of deleting everything would help.
    h.disk.set_capacity(1);
    let outcome = h
        .state
        .executor
        .run_backup(1, TriggerReason::Manual, LockMode::TryOnce)
        .await
        .unwrap();
    assert_eq!(outcome.pruned.len(), 3);
    assert_eq!(h.store.list_archives(1).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_scheduler_retries_busy_server_next_tick() {
    let h = TestHarness::new(local(2024, 2, 5, 1, 30));
    h.add_server(7, "modded");
    let now = h.clock_now();
    h.store
        .insert_schedule(&BackupSchedule {
            server_id: 7,
            schedule_type: ScheduleType::Daily,
            schedule_time: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            retention_days: 30,
            enabled: true,
            last_backup: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

    let scheduler = h.state.scheduler.clone();
    assert!(scheduler.tick().await.unwrap().is_empty());

    h.clock.advance(chrono::Duration::minutes(45));
    let held = h.state.locks.try_acquire(7, LockPurpose::Restore).unwrap();
    assert!(scheduler.tick().await.unwrap().is_empty());
    drop(held);

    h.clock.advance(chrono::Duration::minutes(1));
    assert_eq!(scheduler.tick().await.unwrap(), vec![7]);
    scheduler.wait_idle().await;

    let schedule = h.store.get_schedule(7).await.unwrap().unwrap();
    assert_eq!(schedule.last_backup, Some(local(2024, 2, 5, 2, 16)));
}
