//! Backup history, manual trigger and restore handlers.

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use utoipa::OpenApi;

use crate::api::dto::{
    ok, AvailableBackupsResponse, BackupEntry, BackupStatusResponse, BackupTriggerResponse,
    DeletedResponse, HistoryResponse, Pagination, PaginationQuery, RestorePreviewResponse,
    RestoreRequest, RestoreResponse, RestoreStatusResponse, VerifyArchiveResponse,
};
use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::{RestoreState, ServerId, TriggerReason};
use crate::services::backup_executor::{BackupOutcome, LockMode};
use crate::services::restore_service::RestorePreview;
use crate::services::scheduler_service::{next_run, ScheduleState};
use crate::services::server_lock::LockPurpose;
use crate::services::verification::{CheckResult, VerificationReport};

#[derive(OpenApi)]
#[openapi(
    paths(
        trigger_backup,
        backup_history,
        backup_status,
        available_backups,
        restore_backup,
        restore_status,
        rollback_restore,
        delete_archive,
        verify_archive,
    ),
    components(schemas(
        BackupEntry,
        BackupOutcome,
        BackupStatusResponse,
        BackupTriggerResponse,
        HistoryResponse,
        Pagination,
        AvailableBackupsResponse,
        RestoreRequest,
        RestorePreview,
        RestorePreviewResponse,
        RestoreResponse,
        RestoreStatusResponse,
        VerifyArchiveResponse,
        VerificationReport,
        CheckResult,
        ScheduleState,
        LockPurpose,
        RestoreState,
    ))
)]
pub struct BackupsApiDoc;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/:server_id/trigger", post(trigger_backup))
        .route("/:server_id/history", get(backup_history))
        .route("/:server_id/status", get(backup_status))
        .route("/:server_id/available", get(available_backups))
        .route("/:server_id/restore", post(restore_backup))
        .route("/:server_id/restore/status", get(restore_status))
        .route("/:server_id/restore/rollback", post(rollback_restore))
        .route("/:server_id/archives/:filename", delete(delete_archive))
        .route("/:server_id/archives/:filename/verify", post(verify_archive))
}

fn require_restore_api(state: &SharedState) -> Result<()> {
    if !state.config.restore_api_enabled {
        return Err(AppError::Forbidden("the restore API is disabled".into()));
    }
    Ok(())
}

/// POST /api/v1/backups/:server_id/trigger
#[utoipa::path(
    post,
    path = "/{server_id}/trigger",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "trigger_backup",
    params(("server_id" = i64, Path, description = "Server ID")),
    responses(
        (status = 200, description = "Backup completed", body = BackupTriggerResponse),
        (status = 403, description = "Manual backups are disabled", body = crate::api::openapi::ErrorResponse),
        (status = 404, description = "Unknown server", body = crate::api::openapi::ErrorResponse),
        (status = 409, description = "A backup or restore is already running", body = crate::api::openapi::ErrorResponse),
        (status = 500, description = "Backup failed", body = crate::api::openapi::ErrorResponse),
    )
)]
pub async fn trigger_backup(
    State(state): State<SharedState>,
    Path(server_id): Path<ServerId>,
) -> Result<impl IntoResponse> {
    if !state.config.manual_trigger_enabled {
        return Err(AppError::Forbidden("manual backups are disabled".into()));
    }

    let outcome = state
        .executor
        .run_backup(
            server_id,
            TriggerReason::Manual,
            LockMode::Wait(state.config.interactive_lock_wait()),
        )
        .await?;

    let message = match &outcome.restart_error {
        Some(_) => format!(
            "Backup {} created but the server failed to restart",
            outcome.archive.filename
        ),
        None => format!("Backup {} created", outcome.archive.filename),
    };
    Ok(ok(BackupTriggerResponse {
        message,
        backup: outcome,
    }))
}

/// GET /api/v1/backups/:server_id/history
#[utoipa::path(
    get,
    path = "/{server_id}/history",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "backup_history",
    params(("server_id" = i64, Path, description = "Server ID"), PaginationQuery),
    responses(
        (status = 200, description = "Archives, newest first", body = HistoryResponse),
    )
)]
pub async fn backup_history(
    State(state): State<SharedState>,
    Path(server_id): Path<ServerId>,
    Query(query): Query<PaginationQuery>,
) -> Result<impl IntoResponse> {
    let now = state.clock.now();
    let archives = state.store.list_archives(server_id).await?;
    let pagination = Pagination::from_query_and_total(&query, archives.len() as i64);
    let backups = pagination
        .page_of(archives)
        .iter()
        .map(|a| BackupEntry::from_archive(a, now))
        .collect();

    Ok(ok(HistoryResponse {
        server_id,
        backups,
        pagination,
    }))
}

/// GET /api/v1/backups/:server_id/status
#[utoipa::path(
    get,
    path = "/{server_id}/status",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "backup_status",
    params(("server_id" = i64, Path, description = "Server ID")),
    responses(
        (status = 200, description = "Schedule and last-run status", body = BackupStatusResponse),
    )
)]
pub async fn backup_status(
    State(state): State<SharedState>,
    Path(server_id): Path<ServerId>,
) -> Result<impl IntoResponse> {
    let now = state.clock.now();
    let schedule = state.store.get_schedule(server_id).await?;
    let archives = state.store.list_archives(server_id).await?;

    let schedule_state = schedule.as_ref().map(|s| state.scheduler.state(s));
    let next = schedule
        .as_ref()
        .filter(|s| s.enabled)
        .map(|s| next_run(s, now));
    let last_archive = archives
        .iter()
        .find(|a| a.is_completed())
        .map(|a| BackupEntry::from_archive(a, now));

    Ok(ok(BackupStatusResponse {
        server_id,
        last_backup: schedule
            .as_ref()
            .and_then(|s| s.last_backup)
            .or(last_archive.as_ref().map(|a| a.created_at)),
        state: schedule_state,
        next_run: next,
        schedule,
        last_archive,
        archive_count: archives.iter().filter(|a| a.is_completed()).count(),
        in_progress: state.locks.holder(server_id),
    }))
}

/// GET /api/v1/backups/:server_id/available
#[utoipa::path(
    get,
    path = "/{server_id}/available",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "available_backups",
    params(("server_id" = i64, Path, description = "Server ID")),
    responses(
        (status = 200, description = "Restorable archives, newest first", body = AvailableBackupsResponse),
        (status = 404, description = "Unknown server", body = crate::api::openapi::ErrorResponse),
    )
)]
pub async fn available_backups(
    State(state): State<SharedState>,
    Path(server_id): Path<ServerId>,
) -> Result<impl IntoResponse> {
    let now = state.clock.now();
    let backups = state
        .restores
        .available(server_id)
        .await?
        .iter()
        .map(|a| BackupEntry::from_archive(a, now))
        .collect();
    Ok(ok(AvailableBackupsResponse { server_id, backups }))
}

/// POST /api/v1/backups/:server_id/restore
///
/// `confirm: false` returns a preview and touches nothing; `confirm: true`
/// stops the server and restores the archive over its directory.
#[utoipa::path(
    post,
    path = "/{server_id}/restore",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "restore_backup",
    params(("server_id" = i64, Path, description = "Server ID")),
    request_body = RestoreRequest,
    responses(
        (status = 200, description = "Preview (confirm=false) or completed restore (confirm=true)", body = RestoreResponse),
        (status = 403, description = "Restore API disabled", body = crate::api::openapi::ErrorResponse),
        (status = 404, description = "Unknown server or archive", body = crate::api::openapi::ErrorResponse),
        (status = 409, description = "A backup or restore is already running", body = crate::api::openapi::ErrorResponse),
        (status = 500, description = "Restore failed and was rolled back", body = crate::api::openapi::ErrorResponse),
    )
)]
pub async fn restore_backup(
    State(state): State<SharedState>,
    Path(server_id): Path<ServerId>,
    Json(payload): Json<RestoreRequest>,
) -> Result<Response> {
    require_restore_api(&state)?;
    if payload.backup_filename.trim().is_empty() {
        return Err(AppError::Validation("backup_filename is required".into()));
    }

    if !payload.confirm {
        let preview = state
            .restores
            .preview(server_id, &payload.backup_filename)
            .await?;
        return Ok(ok(RestorePreviewResponse {
            confirm_required: true,
            preview,
        })
        .into_response());
    }

    let restore = state
        .restores
        .apply(server_id, &payload.backup_filename)
        .await?;
    Ok(ok(RestoreResponse {
        message: format!("Restored {}", restore.backup_filename),
        restore,
    })
    .into_response())
}

/// GET /api/v1/backups/:server_id/restore/status
#[utoipa::path(
    get,
    path = "/{server_id}/restore/status",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "restore_status",
    params(("server_id" = i64, Path, description = "Server ID")),
    responses(
        (status = 200, description = "Latest restore operation, if any", body = RestoreStatusResponse),
    )
)]
pub async fn restore_status(
    State(state): State<SharedState>,
    Path(server_id): Path<ServerId>,
) -> Result<impl IntoResponse> {
    require_restore_api(&state)?;
    let restore = state.restores.status(server_id).await?;
    Ok(ok(RestoreStatusResponse { server_id, restore }))
}

/// POST /api/v1/backups/:server_id/restore/rollback
#[utoipa::path(
    post,
    path = "/{server_id}/restore/rollback",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "rollback_restore",
    params(("server_id" = i64, Path, description = "Server ID")),
    responses(
        (status = 200, description = "Pre-restore files put back", body = RestoreResponse),
        (status = 400, description = "Nothing to roll back", body = crate::api::openapi::ErrorResponse),
        (status = 409, description = "A backup or restore is already running", body = crate::api::openapi::ErrorResponse),
    )
)]
pub async fn rollback_restore(
    State(state): State<SharedState>,
    Path(server_id): Path<ServerId>,
) -> Result<impl IntoResponse> {
    require_restore_api(&state)?;
    let restore = state.restores.rollback(server_id).await?;
    Ok(ok(RestoreResponse {
        message: format!("Rolled back restore of {}", restore.backup_filename),
        restore,
    }))
}

/// DELETE /api/v1/backups/:server_id/archives/:filename
#[utoipa::path(
    delete,
    path = "/{server_id}/archives/{filename}",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "delete_backup_archive",
    params(
        ("server_id" = i64, Path, description = "Server ID"),
        ("filename" = String, Path, description = "Archive filename"),
    ),
    responses(
        (status = 200, description = "Archive deleted", body = DeletedResponse),
        (status = 404, description = "Unknown archive", body = crate::api::openapi::ErrorResponse),
        (status = 409, description = "Server is busy", body = crate::api::openapi::ErrorResponse),
    )
)]
pub async fn delete_archive(
    State(state): State<SharedState>,
    Path((server_id, filename)): Path<(ServerId, String)>,
) -> Result<impl IntoResponse> {
    let archive = state.executor.delete_archive(server_id, &filename).await?;
    Ok(ok(DeletedResponse {
        message: format!("Backup {} deleted", archive.filename),
    }))
}

/// POST /api/v1/backups/:server_id/archives/:filename/verify
#[utoipa::path(
    post,
    path = "/{server_id}/archives/{filename}/verify",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "verify_backup_archive",
    params(
        ("server_id" = i64, Path, description = "Server ID"),
        ("filename" = String, Path, description = "Archive filename"),
    ),
    responses(
        (status = 200, description = "Verification report; the new score is stored", body = VerifyArchiveResponse),
        (status = 404, description = "Unknown archive", body = crate::api::openapi::ErrorResponse),
        (status = 500, description = "Archive failed verification", body = crate::api::openapi::ErrorResponse),
    )
)]
pub async fn verify_archive(
    State(state): State<SharedState>,
    Path((server_id, filename)): Path<(ServerId, String)>,
) -> Result<impl IntoResponse> {
    let (archive, verification) = state
        .executor
        .reverify(server_id, &filename, state.config.interactive_lock_wait())
        .await?;
    Ok(ok(VerifyArchiveResponse {
        backup: BackupEntry::from_archive(&archive, state.clock.now()),
        verification,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::test_support::{json_body, send, TestApp};
    use axum::http::StatusCode;
    use serde_json::json;

    fn app() -> (TestApp, Router) {
        let app = TestApp::new();
        app.add_server(1, "alpha");
        let router = router().with_state(app.state.clone());
        (app, router)
    }

    #[tokio::test]
    async fn test_trigger_creates_archive_and_history() {
        let (app, router) = app();
        app.process.set_running(1, true);

        let response = send(&router, "POST", "/1/trigger", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["success"], true);
        let filename = json["backup"]["archive"]["filename"].as_str().unwrap().to_string();
        assert!(filename.starts_with("alpha_backup_"));
        assert!(filename.ends_with(".tar.gz"));
        assert_eq!(json["backup"]["verification"]["score"], 100);
        assert!(app.process.is_up(1));

        let json = json_body(send(&router, "GET", "/1/history", None).await).await;
        let backups = json["backups"].as_array().unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0]["filename"], filename.as_str());
        assert_eq!(backups[0]["age_days"], 0);
        assert_eq!(json["pagination"]["total"], 1);
    }

    #[tokio::test]
    async fn test_trigger_forbidden_when_disabled() {
        let app = TestApp::with_config(|c| c.manual_trigger_enabled = false);
        app.add_server(1, "alpha");
        let router = router().with_state(app.state.clone());

        let response = send(&router, "POST", "/1/trigger", None).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["code"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_trigger_unknown_server() {
        let (_app, router) = app();
        let response = send(&router, "POST", "/42/trigger", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_trigger_busy_server_conflicts() {
        let app = TestApp::with_config(|c| c.interactive_lock_wait_secs = 0);
        app.add_server(1, "alpha");
        let router = router().with_state(app.state.clone());

        let _held = app.state.locks.try_acquire(1, LockPurpose::Restore).unwrap();
        let response = send(&router, "POST", "/1/trigger", None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["code"], "BACKUP_IN_PROGRESS");
    }

    #[tokio::test]
    async fn test_status_without_schedule() {
        let (_app, router) = app();
        let json = json_body(send(&router, "GET", "/1/status", None).await).await;
        assert_eq!(json["success"], true);
        assert!(json["schedule"].is_null());
        assert!(json["next_run"].is_null());
        assert_eq!(json["archive_count"], 0);
    }

    #[tokio::test]
    async fn test_status_with_schedule_and_backup() {
        let (app, router) = app();
        app.add_schedule(1, 7).await;
        send(&router, "POST", "/1/trigger", None).await;

        let json = json_body(send(&router, "GET", "/1/status", None).await).await;
        assert_eq!(json["state"], "armed");
        assert!(json["next_run"].is_string());
        assert!(json["last_backup"].is_string());
        assert_eq!(json["archive_count"], 1);
        assert!(json["in_progress"].is_null());
    }

    #[tokio::test]
    async fn test_restore_preview_then_apply() {
        let (app, router) = app();
        let created = json_body(send(&router, "POST", "/1/trigger", None).await).await;
        let filename = created["backup"]["archive"]["filename"].as_str().unwrap().to_string();

        let available = json_body(send(&router, "GET", "/1/available", None).await).await;
        assert_eq!(available["backups"].as_array().unwrap().len(), 1);

        std::fs::write(app.server_dir(1).join("world/level.dat"), b"corrupted").unwrap();

        let preview = send(
            &router,
            "POST",
            "/1/restore",
            Some(json!({"backup_filename": filename, "confirm": false})),
        )
        .await;
        assert_eq!(preview.status(), StatusCode::OK);
        let preview = json_body(preview).await;
        assert_eq!(preview["confirm_required"], true);
        assert_eq!(preview["preview"]["operation"]["state"], "previewed");
        assert_eq!(
            std::fs::read(app.server_dir(1).join("world/level.dat")).unwrap(),
            b"corrupted"
        );

        let applied = send(
            &router,
            "POST",
            "/1/restore",
            Some(json!({"backup_filename": filename, "confirm": true})),
        )
        .await;
        assert_eq!(applied.status(), StatusCode::OK);
        let applied = json_body(applied).await;
        assert_eq!(applied["restore"]["state"], "completed");
        assert_eq!(
            std::fs::read(app.server_dir(1).join("world/level.dat")).unwrap(),
            b"level-data"
        );

        let status = json_body(send(&router, "GET", "/1/restore/status", None).await).await;
        assert_eq!(status["restore"]["state"], "completed");

        let rolled = send(&router, "POST", "/1/restore/rollback", None).await;
        assert_eq!(rolled.status(), StatusCode::OK);
        assert_eq!(json_body(rolled).await["restore"]["state"], "rolled_back");
        assert_eq!(
            std::fs::read(app.server_dir(1).join("world/level.dat")).unwrap(),
            b"corrupted"
        );
    }

    #[tokio::test]
    async fn test_restore_unknown_archive() {
        let (_app, router) = app();
        let response = send(
            &router,
            "POST",
            "/1/restore",
            Some(json!({"backup_filename": "nope.tar.gz", "confirm": true})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["code"], "ARCHIVE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_restore_forbidden_when_disabled() {
        let app = TestApp::with_config(|c| c.restore_api_enabled = false);
        app.add_server(1, "alpha");
        let router = router().with_state(app.state.clone());

        let response = send(
            &router,
            "POST",
            "/1/restore",
            Some(json!({"backup_filename": "x.tar.gz"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = send(&router, "POST", "/1/restore/rollback", None).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_rollback_without_restore_is_rejected() {
        let (_app, router) = app();
        let response = send(&router, "POST", "/1/restore/rollback", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_verify_and_delete_archive() {
        let (_app, router) = app();
        let created = json_body(send(&router, "POST", "/1/trigger", None).await).await;
        let filename = created["backup"]["archive"]["filename"].as_str().unwrap().to_string();

        let verified = send(&router, "POST", &format!("/1/archives/{}/verify", filename), None).await;
        assert_eq!(verified.status(), StatusCode::OK);
        let verified = json_body(verified).await;
        assert_eq!(verified["verification"]["score"], 100);
        assert_eq!(verified["backup"]["quality_score"], 100);

        let deleted = send(&router, "DELETE", &format!("/1/archives/{}", filename), None).await;
        assert_eq!(deleted.status(), StatusCode::OK);

        let history = json_body(send(&router, "GET", "/1/history", None).await).await;
        assert!(history["backups"].as_array().unwrap().is_empty());

        let again = send(&router, "DELETE", &format!("/1/archives/{}", filename), None).await;
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }
}
