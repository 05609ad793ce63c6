//! Pair lifecycle endpoints: create, update, state transitions, bulk
//! operations, failure listing.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use tracing::info;

use afx_common::{
    ActivityEntry, ActivityKind, Pair, PairOptions, PairState, PairStats, QueueItem,
};

use crate::error::{ApiError, Result};
use crate::model::{BulkPairRequest, BulkResponse, BulkUpdateRequest, CreatePairRequest};
use crate::{request_id, require_user, AppState};

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct FailuresQuery {
    pub limit: Option<u32>,
}

/// Load a pair and check it belongs to the caller.
async fn owned_pair(state: &AppState, user_id: &str, pair_id: &str) -> Result<Pair> {
    let pair = state.store.get_pair(pair_id).await?;
    if pair.user_id != user_id {
        // Do not leak other tenants' pair ids.
        return Err(ApiError::NotFound(format!("pair {pair_id}")));
    }
    Ok(pair)
}

#[utoipa::path(
    post,
    path = "/api/pairs",
    tag = "pairs",
    request_body = CreatePairRequest,
    responses(
        (status = 200, description = "Pair created", body = Pair),
        (status = 403, description = "Plan limit exceeded", body = crate::error::ErrorBody),
        (status = 404, description = "Session not found", body = crate::error::ErrorBody)
    )
)]
pub async fn create_pair(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreatePairRequest>,
) -> Result<Json<serde_json::Value>> {
    let user_id = require_user(&headers)?;
    let rid = request_id(&headers);
    if let Some(cached) = state.replay(rid.as_deref()) {
        return Ok(cached);
    }

    let user = state.store.get_user(&user_id).await?;
    let limits = user.limits();
    if state.store.count_pairs(&user_id).await? >= limits.max_pairs {
        return Err(ApiError::PlanLimitExceeded(format!(
            "plan allows at most {} pairs",
            limits.max_pairs
        )));
    }

    let session = state
        .store
        .get_session(&req.session_id)
        .await
        .map_err(|_| ApiError::NotFound(format!("session {}", req.session_id)))?;
    if session.user_id != user_id {
        return Err(ApiError::NotFound(format!("session {}", req.session_id)));
    }

    if req.source_ref.is_empty() || req.destination_ref.is_empty() {
        return Err(ApiError::Validation(
            "source_ref and destination_ref must not be empty".into(),
        ));
    }

    let mut pair = Pair {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.clone(),
        session_id: session.id.clone(),
        source_ref: req.source_ref,
        destination_ref: req.destination_ref,
        // An active pair requires an active session.
        state: if session.active {
            PairState::Active
        } else {
            PairState::Paused
        },
        delay_min_s: 0,
        delay_max_s: 0,
        copy_mode: false,
        silent: false,
        forward_edits: true,
        forward_deletions: false,
        message_type_filter: afx_common::MessageTypeFilter::All,
        chain: false,
        serialized: false,
        stats: PairStats::default(),
        created_at: Utc::now(),
    };
    req.options.apply_to(&mut pair);
    if !pair.delays_valid() {
        return Err(ApiError::Validation(
            "delays must satisfy 0 <= min <= max <= 86400".into(),
        ));
    }

    state.store.create_pair(&pair).await?;
    info!(pair_id = %pair.id, user_id = %user_id, "Pair created");
    state
        .store
        .append_activity(
            &ActivityEntry::new(&user_id, ActivityKind::PairCreated, "Forwarding pair created")
                .with_pair(&pair.id)
                .with_session(&pair.session_id),
        )
        .await?;

    Ok(state.respond(rid.as_deref(), &pair))
}

#[utoipa::path(
    get,
    path = "/api/pairs",
    tag = "pairs",
    responses((status = 200, description = "Caller's pairs", body = [Pair]))
)]
pub async fn list_pairs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Pair>>> {
    let user_id = require_user(&headers)?;
    Ok(Json(state.store.list_pairs(&user_id).await?))
}

#[utoipa::path(
    get,
    path = "/api/pairs/{pair_id}",
    tag = "pairs",
    params(("pair_id" = String, Path, description = "Pair id")),
    responses((status = 200, description = "Pair detail", body = Pair))
)]
pub async fn get_pair(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pair_id): Path<String>,
) -> Result<Json<Pair>> {
    let user_id = require_user(&headers)?;
    Ok(Json(owned_pair(&state, &user_id, &pair_id).await?))
}

#[utoipa::path(
    put,
    path = "/api/pairs/{pair_id}",
    tag = "pairs",
    params(("pair_id" = String, Path, description = "Pair id")),
    request_body = PairOptions,
    responses((status = 200, description = "Updated pair", body = Pair))
)]
pub async fn update_pair(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pair_id): Path<String>,
    Json(options): Json<PairOptions>,
) -> Result<Json<serde_json::Value>> {
    let user_id = require_user(&headers)?;
    let rid = request_id(&headers);
    if let Some(cached) = state.replay(rid.as_deref()) {
        return Ok(cached);
    }

    let mut pair = owned_pair(&state, &user_id, &pair_id).await?;
    options.apply_to(&mut pair);
    if !pair.delays_valid() {
        return Err(ApiError::Validation(
            "delays must satisfy 0 <= min <= max <= 86400".into(),
        ));
    }
    state.store.update_pair(&pair).await?;
    state
        .store
        .append_activity(
            &ActivityEntry::new(&user_id, ActivityKind::PairUpdated, "Pair settings updated")
                .with_pair(&pair.id),
        )
        .await?;

    Ok(state.respond(rid.as_deref(), &pair))
}

#[utoipa::path(
    delete,
    path = "/api/pairs/{pair_id}",
    tag = "pairs",
    params(("pair_id" = String, Path, description = "Pair id")),
    responses((status = 200, description = "Pair deleted", body = crate::model::MessageResponse))
)]
pub async fn delete_pair(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pair_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let user_id = require_user(&headers)?;
    let rid = request_id(&headers);
    if let Some(cached) = state.replay(rid.as_deref()) {
        return Ok(cached);
    }

    let pair = owned_pair(&state, &user_id, &pair_id).await?;
    // Cascades pending queue items to cleared in the same transaction.
    state.store.delete_pair(&pair.id).await?;
    info!(pair_id = %pair.id, user_id = %user_id, "Pair deleted");
    state
        .store
        .append_activity(
            &ActivityEntry::new(&user_id, ActivityKind::PairDeleted, "Forwarding pair deleted")
                .with_pair(&pair.id),
        )
        .await?;

    Ok(state.respond(
        rid.as_deref(),
        &crate::model::MessageResponse::new("pair deleted"),
    ))
}

async fn transition(
    state: &AppState,
    headers: &HeaderMap,
    pair_id: &str,
    to: PairState,
) -> Result<Json<serde_json::Value>> {
    let user_id = require_user(headers)?;
    let rid = request_id(headers);
    if let Some(cached) = state.replay(rid.as_deref()) {
        return Ok(cached);
    }

    let mut pair = owned_pair(state, &user_id, pair_id).await?;
    apply_transition(state, &mut pair, to).await?;

    Ok(state.respond(rid.as_deref(), &pair))
}

/// Allowed transitions: active <-> paused, any non-stopped -> stopped.
async fn apply_transition(state: &AppState, pair: &mut Pair, to: PairState) -> Result<()> {
    match (pair.state, to) {
        (from, to) if from == to => return Ok(()),
        (PairState::Stopped, _) => {
            return Err(ApiError::Validation("stopped pairs cannot transition".into()));
        }
        (_, PairState::Stopped) => {}
        (PairState::Active, PairState::Paused) => {}
        (PairState::Paused | PairState::Error, PairState::Active) => {
            // Activation re-validates the backing session.
            let session = state.store.get_session(&pair.session_id).await?;
            if !session.active {
                return Err(ApiError::Validation(format!(
                    "session {} is not active; re-authenticate first",
                    session.id
                )));
            }
        }
        (from, to) => {
            return Err(ApiError::Validation(format!(
                "cannot transition pair from {} to {}",
                from.as_str(),
                to.as_str()
            )));
        }
    }

    state.store.set_pair_state(&pair.id, to).await?;
    pair.state = to;
    Ok(())
}

#[utoipa::path(
    post,
    path = "/api/pairs/{pair_id}/pause",
    tag = "pairs",
    params(("pair_id" = String, Path, description = "Pair id")),
    responses((status = 200, description = "Paused pair", body = Pair))
)]
pub async fn pause_pair(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pair_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    transition(&state, &headers, &pair_id, PairState::Paused).await
}

#[utoipa::path(
    post,
    path = "/api/pairs/{pair_id}/resume",
    tag = "pairs",
    params(("pair_id" = String, Path, description = "Pair id")),
    responses((status = 200, description = "Resumed pair", body = Pair))
)]
pub async fn resume_pair(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pair_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    transition(&state, &headers, &pair_id, PairState::Active).await
}

#[utoipa::path(
    post,
    path = "/api/pairs/{pair_id}/stop",
    tag = "pairs",
    params(("pair_id" = String, Path, description = "Pair id")),
    responses((status = 200, description = "Stopped pair", body = Pair))
)]
pub async fn stop_pair(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pair_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    transition(&state, &headers, &pair_id, PairState::Stopped).await
}

async fn bulk_transition(
    state: &AppState,
    headers: &HeaderMap,
    req: BulkPairRequest,
    to: PairState,
) -> Result<Json<serde_json::Value>> {
    let user_id = require_user(headers)?;
    let rid = request_id(headers);
    if let Some(cached) = state.replay(rid.as_deref()) {
        return Ok(cached);
    }

    let mut updated = 0;
    let mut skipped = Vec::new();
    for pair_id in req.pair_ids {
        let mut pair = match owned_pair(state, &user_id, &pair_id).await {
            Ok(pair) => pair,
            Err(_) => {
                skipped.push(pair_id);
                continue;
            }
        };
        match apply_transition(state, &mut pair, to).await {
            Ok(()) => updated += 1,
            Err(_) => skipped.push(pair_id),
        }
    }

    Ok(state.respond(rid.as_deref(), &BulkResponse { updated, skipped }))
}

#[utoipa::path(
    post,
    path = "/api/pairs/bulk/pause",
    tag = "pairs",
    request_body = BulkPairRequest,
    responses((status = 200, description = "Bulk pause result", body = BulkResponse))
)]
pub async fn bulk_pause(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BulkPairRequest>,
) -> Result<Json<serde_json::Value>> {
    bulk_transition(&state, &headers, req, PairState::Paused).await
}

#[utoipa::path(
    post,
    path = "/api/pairs/bulk/resume",
    tag = "pairs",
    request_body = BulkPairRequest,
    responses((status = 200, description = "Bulk resume result", body = BulkResponse))
)]
pub async fn bulk_resume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BulkPairRequest>,
) -> Result<Json<serde_json::Value>> {
    bulk_transition(&state, &headers, req, PairState::Active).await
}

#[utoipa::path(
    put,
    path = "/api/pairs/bulk",
    tag = "pairs",
    request_body = BulkUpdateRequest,
    responses((status = 200, description = "Bulk update result", body = BulkResponse))
)]
pub async fn bulk_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BulkUpdateRequest>,
) -> Result<Json<serde_json::Value>> {
    let user_id = require_user(&headers)?;
    let rid = request_id(&headers);
    if let Some(cached) = state.replay(rid.as_deref()) {
        return Ok(cached);
    }

    let mut updated = 0;
    let mut skipped = Vec::new();
    for pair_id in req.pair_ids {
        let mut pair = match owned_pair(&state, &user_id, &pair_id).await {
            Ok(pair) => pair,
            Err(_) => {
                skipped.push(pair_id);
                continue;
            }
        };
        req.options.apply_to(&mut pair);
        if !pair.delays_valid() || state.store.update_pair(&pair).await.is_err() {
            skipped.push(pair_id);
            continue;
        }
        updated += 1;
    }

    Ok(state.respond(rid.as_deref(), &BulkResponse { updated, skipped }))
}

#[utoipa::path(
    get,
    path = "/api/pairs/{pair_id}/failures",
    tag = "pairs",
    params(("pair_id" = String, Path, description = "Pair id")),
    responses((status = 200, description = "Recent failed deliveries", body = [QueueItem]))
)]
pub async fn pair_failures(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pair_id): Path<String>,
    Query(query): Query<FailuresQuery>,
) -> Result<Json<Vec<QueueItem>>> {
    let user_id = require_user(&headers)?;
    let pair = owned_pair(&state, &user_id, &pair_id).await?;
    let items = state
        .store
        .failed_items_for_pair(&pair.id, query.limit.unwrap_or(20))
        .await?;
    Ok(Json(items))
}
