//! Session endpoints: registration, OTP authorization, health trigger,
//! disconnect.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use tracing::info;

use afx_common::{PairState, Session};
use afx_engine::SessionSignal;

use crate::error::{ApiError, Result};
use crate::model::{
    CreateSessionRequest, DialogView, MessageResponse, OtpResponse, SessionView, VerifyOtpRequest,
};
use crate::{request_id, require_user, AppState};

async fn owned_session(state: &AppState, user_id: &str, session_id: &str) -> Result<Session> {
    let session = state.store.get_session(session_id).await?;
    if session.user_id != user_id {
        return Err(ApiError::NotFound(format!("session {session_id}")));
    }
    Ok(session)
}

#[utoipa::path(
    get,
    path = "/api/sessions",
    tag = "sessions",
    responses((status = 200, description = "Caller's sessions with health", body = [SessionView]))
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionView>>> {
    let user_id = require_user(&headers)?;
    let sessions = state.store.list_sessions(&user_id).await?;

    let views = sessions
        .into_iter()
        .map(|session| {
            let health = state.supervisor.health_of(&session.id);
            let rate = if state.pool.is_open(&session.id) {
                Some(state.antiban.snapshot(&session.id))
            } else {
                None
            };
            SessionView::from_session(session, health, rate)
        })
        .collect();
    Ok(Json(views))
}

#[utoipa::path(
    post,
    path = "/api/sessions",
    tag = "sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 200, description = "Session registered", body = SessionView),
        (status = 403, description = "Plan limit exceeded", body = crate::error::ErrorBody)
    )
)]
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<serde_json::Value>> {
    let user_id = require_user(&headers)?;
    let rid = request_id(&headers);
    if let Some(cached) = state.replay(rid.as_deref()) {
        return Ok(cached);
    }

    let user = state.store.get_user(&user_id).await?;
    let limits = user.limits();
    if state.store.count_sessions(&user_id).await? >= limits.max_sessions {
        return Err(ApiError::PlanLimitExceeded(format!(
            "plan allows at most {} sessions",
            limits.max_sessions
        )));
    }
    if req.phone.is_empty() {
        return Err(ApiError::Validation("phone must not be empty".into()));
    }

    let session = Session {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.clone(),
        phone: req.phone,
        credential_blob: String::new(),
        active: false,
        last_health_at: None,
        display_name: req.display_name,
        created_at: Utc::now(),
    };
    state.store.create_session(&session).await?;
    info!(session_id = %session.id, user_id = %user_id, "Session registered");

    Ok(state.respond(
        rid.as_deref(),
        &SessionView::from_session(session, None, None),
    ))
}

#[utoipa::path(
    post,
    path = "/api/sessions/{session_id}/otp",
    tag = "sessions",
    params(("session_id" = String, Path, description = "Session id")),
    responses((status = 200, description = "One-time code dispatched", body = OtpResponse))
)]
pub async fn send_otp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<OtpResponse>> {
    let user_id = require_user(&headers)?;
    let session = owned_session(&state, &user_id, &session_id).await?;

    let code_hash = state.pool.send_otp(&session, &session.phone).await?;
    Ok(Json(OtpResponse { code_hash }))
}

#[utoipa::path(
    post,
    path = "/api/sessions/{session_id}/verify",
    tag = "sessions",
    params(("session_id" = String, Path, description = "Session id")),
    request_body = VerifyOtpRequest,
    responses((status = 200, description = "Session authorized", body = SessionView))
)]
pub async fn verify_otp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(req): Json<VerifyOtpRequest>,
) -> Result<Json<serde_json::Value>> {
    let user_id = require_user(&headers)?;
    let rid = request_id(&headers);
    if let Some(cached) = state.replay(rid.as_deref()) {
        return Ok(cached);
    }

    let session = owned_session(&state, &user_id, &session_id).await?;
    state
        .pool
        .verify_otp(&session, &req.code, &req.code_hash)
        .await?;

    // Pick the session up with fresh credentials and a clean slate.
    state.supervisor.adopt_session(&session.id).await;

    let session = state.store.get_session(&session.id).await?;
    let health = state.supervisor.health_of(&session.id);
    Ok(state.respond(
        rid.as_deref(),
        &SessionView::from_session(session, health, None),
    ))
}

#[utoipa::path(
    post,
    path = "/api/sessions/{session_id}/health",
    tag = "sessions",
    params(("session_id" = String, Path, description = "Session id")),
    responses((status = 200, description = "Probe scheduled", body = MessageResponse))
)]
pub async fn trigger_health(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<MessageResponse>> {
    let user_id = require_user(&headers)?;
    let session = owned_session(&state, &user_id, &session_id).await?;

    state
        .supervisor
        .signal_sender()
        .send(SessionSignal::TriggerHealth(session.id.clone()))
        .map_err(|_| ApiError::Unavailable("supervisor is not running".into()))?;
    Ok(Json(MessageResponse::new("health check triggered")))
}

#[utoipa::path(
    post,
    path = "/api/sessions/{session_id}/disconnect",
    tag = "sessions",
    params(("session_id" = String, Path, description = "Session id")),
    responses((status = 200, description = "Session disconnected", body = MessageResponse))
)]
pub async fn disconnect_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let user_id = require_user(&headers)?;
    let rid = request_id(&headers);
    if let Some(cached) = state.replay(rid.as_deref()) {
        return Ok(cached);
    }

    let session = owned_session(&state, &user_id, &session_id).await?;
    state.supervisor.drop_session(&session.id).await;
    state.store.set_session_active(&session.id, false).await?;
    // Active pairs cannot outlive an inactive session.
    state
        .store
        .set_session_pairs_state(&session.id, PairState::Active, PairState::Paused)
        .await?;
    info!(session_id = %session.id, "Session disconnected");

    Ok(state.respond(rid.as_deref(), &MessageResponse::new("session disconnected")))
}

#[utoipa::path(
    delete,
    path = "/api/sessions/{session_id}",
    tag = "sessions",
    params(("session_id" = String, Path, description = "Session id")),
    responses((status = 200, description = "Session deleted", body = MessageResponse))
)]
pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let user_id = require_user(&headers)?;
    let rid = request_id(&headers);
    if let Some(cached) = state.replay(rid.as_deref()) {
        return Ok(cached);
    }

    let session = owned_session(&state, &user_id, &session_id).await?;
    state.supervisor.drop_session(&session.id).await;
    state
        .store
        .set_session_pairs_state(&session.id, PairState::Active, PairState::Paused)
        .await?;
    state.store.delete_session(&session.id).await?;
    info!(session_id = %session.id, "Session deleted");

    Ok(state.respond(rid.as_deref(), &MessageResponse::new("session deleted")))
}

#[utoipa::path(
    get,
    path = "/api/sessions/{session_id}/dialogs",
    tag = "sessions",
    params(("session_id" = String, Path, description = "Session id")),
    responses((status = 200, description = "Channels visible to the session", body = [DialogView]))
)]
pub async fn list_dialogs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<DialogView>>> {
    let user_id = require_user(&headers)?;
    let session = owned_session(&state, &user_id, &session_id).await?;

    let dialogs = state.pool.list_dialogs(&session.id).await?;
    Ok(Json(
        dialogs
            .into_iter()
            .map(|d| DialogView {
                chat_ref: d.chat_ref,
                title: d.title,
                member_count: d.member_count,
            })
            .collect(),
    ))
}
