//! Prometheus metrics collection and HTTP request instrumentation.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};

use crate::error::{AppError, Result};

/// Initialize the Prometheus metrics recorder and return the handle for rendering.
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Internal(format!("failed to install Prometheus recorder: {}", e)))
}

/// Axum middleware that records HTTP request metrics.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    // Normalize path to avoid high-cardinality labels
    let path = normalize_path(request.uri().path());

    let start = Instant::now();
    gauge!("bk_http_requests_in_flight", "method" => method.clone(), "path" => path.clone())
        .increment(1.0);

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    histogram!("bk_http_request_duration_seconds", "method" => method.clone(), "path" => path.clone(), "status" => status.clone()).record(duration);
    counter!("bk_http_requests_total", "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    gauge!("bk_http_requests_in_flight", "method" => method, "path" => path).decrement(1.0);

    response
}

/// Replace server ids and archive filenames with placeholders.
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    let normalized: Vec<String> = segments
        .iter()
        .enumerate()
        .map(|(i, seg)| {
            if !seg.is_empty() && seg.parse::<i64>().is_ok() {
                ":id".to_string()
            } else if i > 0 && segments[i - 1] == "archives" {
                ":filename".to_string()
            } else {
                seg.to_string()
            }
        })
        .collect();
    normalized.join("/")
}

/// Record a finished backup job.
pub fn record_backup(trigger: &str, success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "failure" };
    counter!("bk_backup_operations_total", "trigger" => trigger.to_string(), "status" => status.to_string()).increment(1);
    histogram!("bk_backup_duration_seconds", "trigger" => trigger.to_string()).record(duration_secs);
}

pub fn record_backup_size(size_bytes: u64) {
    histogram!("bk_backup_size_bytes").record(size_bytes as f64);
}

/// Record the score of a verification run.
pub fn record_verification(score: u8) {
    histogram!("bk_verification_score").record(f64::from(score));
}

/// Record a restore apply or rollback.
pub fn record_restore(kind: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("bk_restore_operations_total", "kind" => kind.to_string(), "status" => status.to_string()).increment(1);
}

/// Record one archive removed by retention.
pub fn record_retention_deletion(reason: &str) {
    counter!("bk_retention_deletions_total", "reason" => reason.to_string()).increment(1);
}

pub fn set_backup_disk_usage(percent: f64) {
    gauge!("bk_backup_disk_usage_percent").set(percent);
}

/// Count of backup jobs currently running.
pub fn set_running_jobs(count: usize) {
    gauge!("bk_backup_jobs_running").set(count as f64);
}

/// Update database connection pool gauge metrics.
pub fn set_db_pool_gauges(pool: &sqlx::PgPool) {
    let size = pool.size() as f64;
    let idle = pool.num_idle() as f64;
    gauge!("bk_db_pool_connections_active").set(size - idle);
    gauge!("bk_db_pool_connections_idle").set(idle);
    gauge!("bk_db_pool_connections_max").set(pool.options().get_max_connections() as f64);
}
