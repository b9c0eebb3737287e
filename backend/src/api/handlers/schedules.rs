//! Backup schedule CRUD handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use utoipa::OpenApi;

use crate::api::dto::{ok, DeletedResponse, ScheduleListResponse, ScheduleResponse};
use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::schedule::{CreateScheduleRequest, UpdateScheduleRequest};
use crate::models::{BackupSchedule, ScheduleType, ServerId};

#[derive(OpenApi)]
#[openapi(
    paths(
        list_schedules,
        create_schedule,
        get_schedule,
        update_schedule,
        delete_schedule,
    ),
    components(schemas(
        BackupSchedule,
        ScheduleType,
        CreateScheduleRequest,
        UpdateScheduleRequest,
        ScheduleListResponse,
        ScheduleResponse,
        DeletedResponse,
    ))
)]
pub struct SchedulesApiDoc;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_schedules).post(create_schedule))
        .route(
            "/:server_id",
            get(get_schedule).put(update_schedule).delete(delete_schedule),
        )
}

/// GET /api/v1/schedules
#[utoipa::path(
    get,
    path = "",
    context_path = "/api/v1/schedules",
    tag = "schedules",
    operation_id = "list_backup_schedules",
    responses(
        (status = 200, description = "All backup schedules", body = ScheduleListResponse),
    )
)]
pub async fn list_schedules(State(state): State<SharedState>) -> Result<impl IntoResponse> {
    let schedules = state.store.list_schedules().await?;
    Ok(ok(ScheduleListResponse { schedules }))
}

/// POST /api/v1/schedules
#[utoipa::path(
    post,
    path = "",
    context_path = "/api/v1/schedules",
    tag = "schedules",
    operation_id = "create_backup_schedule",
    request_body = CreateScheduleRequest,
    responses(
        (status = 201, description = "Schedule created", body = ScheduleResponse),
        (status = 400, description = "Invalid schedule", body = crate::api::openapi::ErrorResponse),
        (status = 404, description = "Unknown server", body = crate::api::openapi::ErrorResponse),
        (status = 409, description = "Server already has a schedule", body = crate::api::openapi::ErrorResponse),
    )
)]
pub async fn create_schedule(
    State(state): State<SharedState>,
    Json(payload): Json<CreateScheduleRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    state.registry.lookup(payload.server_id).await?;

    let schedule = state
        .store
        .insert_schedule(&payload.into_schedule(state.clock.now()))
        .await?;
    tracing::info!(
        server_id = schedule.server_id,
        schedule_type = %schedule.schedule_type,
        retention_days = schedule.retention_days,
        "Backup schedule created"
    );

    Ok((StatusCode::CREATED, ok(ScheduleResponse { schedule })))
}

async fn load_schedule(state: &SharedState, server_id: ServerId) -> Result<BackupSchedule> {
    state
        .store
        .get_schedule(server_id)
        .await?
        .ok_or(AppError::ScheduleNotFound(server_id))
}

/// GET /api/v1/schedules/:server_id
#[utoipa::path(
    get,
    path = "/{server_id}",
    context_path = "/api/v1/schedules",
    tag = "schedules",
    operation_id = "get_backup_schedule",
    params(("server_id" = i64, Path, description = "Server ID")),
    responses(
        (status = 200, description = "Backup schedule", body = ScheduleResponse),
        (status = 404, description = "No schedule for the server", body = crate::api::openapi::ErrorResponse),
    )
)]
pub async fn get_schedule(
    State(state): State<SharedState>,
    Path(server_id): Path<ServerId>,
) -> Result<impl IntoResponse> {
    let schedule = load_schedule(&state, server_id).await?;
    Ok(ok(ScheduleResponse { schedule }))
}

/// PUT /api/v1/schedules/:server_id
#[utoipa::path(
    put,
    path = "/{server_id}",
    context_path = "/api/v1/schedules",
    tag = "schedules",
    operation_id = "update_backup_schedule",
    params(("server_id" = i64, Path, description = "Server ID")),
    request_body = UpdateScheduleRequest,
    responses(
        (status = 200, description = "Schedule updated", body = ScheduleResponse),
        (status = 400, description = "Invalid schedule", body = crate::api::openapi::ErrorResponse),
        (status = 404, description = "No schedule for the server", body = crate::api::openapi::ErrorResponse),
    )
)]
pub async fn update_schedule(
    State(state): State<SharedState>,
    Path(server_id): Path<ServerId>,
    Json(payload): Json<UpdateScheduleRequest>,
) -> Result<impl IntoResponse> {
    let existing = load_schedule(&state, server_id).await?;
    let updated = payload.apply(existing, state.clock.now())?;
    let schedule = state.store.update_schedule(&updated).await?;
    tracing::info!(server_id, enabled = schedule.enabled, "Backup schedule updated");
    Ok(ok(ScheduleResponse { schedule }))
}

/// DELETE /api/v1/schedules/:server_id
#[utoipa::path(
    delete,
    path = "/{server_id}",
    context_path = "/api/v1/schedules",
    tag = "schedules",
    operation_id = "delete_backup_schedule",
    params(("server_id" = i64, Path, description = "Server ID")),
    responses(
        (status = 200, description = "Schedule deleted", body = DeletedResponse),
        (status = 404, description = "No schedule for the server", body = crate::api::openapi::ErrorResponse),
    )
)]
pub async fn delete_schedule(
    State(state): State<SharedState>,
    Path(server_id): Path<ServerId>,
) -> Result<impl IntoResponse> {
    state.store.delete_schedule(server_id).await?;
    tracing::info!(server_id, "Backup schedule deleted");
    Ok(ok(DeletedResponse {
        message: format!("Backup schedule for server {} deleted", server_id),
    }))
}
