//! Probes, dashboard aggregates, activity feed, and admin controls.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use tracing::info;

use afx_common::{ActivityEntry, AdminStats, DashboardStats, QueueStats};
use afx_engine::SessionSignal;

use crate::error::{ApiError, Result};
use crate::model::{
    ActivityQuery, ClearFailedResponse, MessageResponse, ProbeResponse, QueueControlResponse,
};
use crate::{require_admin, require_user, AppState};

#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Service is up", body = ProbeResponse))
)]
pub async fn health(State(state): State<AppState>) -> Result<Json<ProbeResponse>> {
    // A probe that cannot reach the store should fail readiness checks.
    state.store.queue_stats().await?;
    Ok(Json(ProbeResponse {
        status: "UP".to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses((status = 200, description = "Process is live", body = ProbeResponse))
)]
pub async fn liveness() -> Json<ProbeResponse> {
    Json(ProbeResponse {
        status: "LIVE".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses((status = 200, description = "Ready to serve", body = ProbeResponse))
)]
pub async fn readiness(State(state): State<AppState>) -> Result<Json<ProbeResponse>> {
    state.store.queue_stats().await?;
    Ok(Json(ProbeResponse {
        status: "READY".to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/dashboard",
    tag = "stats",
    responses((status = 200, description = "Per-user dashboard aggregate", body = DashboardStats))
)]
pub async fn dashboard(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DashboardStats>> {
    let user_id = require_user(&headers)?;
    Ok(Json(state.store.dashboard_stats(&user_id).await?))
}

#[utoipa::path(
    get,
    path = "/api/activity",
    tag = "stats",
    responses((status = 200, description = "Recent activity entries", body = [ActivityEntry]))
)]
pub async fn activity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<ActivityEntry>>> {
    let user_id = require_user(&headers)?;
    let limit = query.limit.unwrap_or(50).min(500);
    Ok(Json(state.store.recent_activity(&user_id, limit).await?))
}

// ============================================================================
// Admin endpoints
// ============================================================================

#[utoipa::path(
    get,
    path = "/api/admin/stats",
    tag = "admin",
    responses((status = 200, description = "Installation-wide aggregate", body = AdminStats))
)]
pub async fn admin_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AdminStats>> {
    require_admin(&headers)?;
    Ok(Json(state.store.admin_stats().await?))
}

#[utoipa::path(
    get,
    path = "/api/admin/queue",
    tag = "admin",
    responses((status = 200, description = "Global queue counts", body = QueueStats))
)]
pub async fn admin_queue_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<QueueStats>> {
    require_admin(&headers)?;
    Ok(Json(state.store.queue_stats().await?))
}

#[utoipa::path(
    post,
    path = "/api/admin/queue/pause",
    tag = "admin",
    responses((status = 200, description = "Queue paused", body = QueueControlResponse))
)]
pub async fn admin_pause_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<QueueControlResponse>> {
    require_admin(&headers)?;
    state.delivery.pause();
    info!("Delivery queue paused by admin");
    Ok(Json(QueueControlResponse { paused: true }))
}

#[utoipa::path(
    post,
    path = "/api/admin/queue/resume",
    tag = "admin",
    responses((status = 200, description = "Queue resumed", body = QueueControlResponse))
)]
pub async fn admin_resume_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<QueueControlResponse>> {
    require_admin(&headers)?;
    state.delivery.resume();
    info!("Delivery queue resumed by admin");
    Ok(Json(QueueControlResponse { paused: false }))
}

#[utoipa::path(
    post,
    path = "/api/admin/queue/clear-failed",
    tag = "admin",
    responses((status = 200, description = "Failed items cleared", body = ClearFailedResponse))
)]
pub async fn admin_clear_failed(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ClearFailedResponse>> {
    require_admin(&headers)?;
    let cleared = state.store.clear_failed().await?;
    info!(cleared, "Failed queue items cleared by admin");
    Ok(Json(ClearFailedResponse { cleared }))
}

#[utoipa::path(
    post,
    path = "/api/admin/sessions/{session_id}/health",
    tag = "admin",
    params(("session_id" = String, Path, description = "Session id")),
    responses((status = 200, description = "Probe scheduled", body = MessageResponse))
)]
pub async fn admin_trigger_health(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<MessageResponse>> {
    require_admin(&headers)?;
    // Existence check so admins get a 404 for typos.
    state.store.get_session(&session_id).await?;
    state
        .supervisor
        .signal_sender()
        .send(SessionSignal::TriggerHealth(session_id))
        .map_err(|_| ApiError::Unavailable("supervisor is not running".into()))?;
    Ok(Json(MessageResponse::new("health check triggered")))
}
