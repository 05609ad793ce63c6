//! AutoForwardX control-plane HTTP API.
//!
//! Transport for the dashboard, admin tooling, and the bot. Caller
//! identity is verified upstream and arrives as headers: `X-User-Id`
//! for tenant routes and `X-Admin: true` for admin routes. Mutating
//! operations are idempotent under an `X-Request-Id` header; a repeated
//! id replays the stored response.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    http::HeaderMap,
    routing::{delete, get, post, put},
    Json, Router,
};
use dashmap::DashMap;
use serde::Serialize;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use afx_client::ClientPool;
use afx_engine::{AntiBanController, DeliveryQueue, ForwardingEngine, SessionSupervisor};
use afx_store::Store;

pub mod error;
pub mod model;
pub mod pairs;
pub mod sessions;
pub mod stats;

pub use error::{ApiError, ErrorBody};

/// Replayed responses are kept this long.
const IDEMPOTENCY_RETENTION: Duration = Duration::from_secs(600);

#[derive(Clone)]
struct CachedResponse {
    at: Instant,
    body: serde_json::Value,
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub pool: Arc<ClientPool>,
    pub delivery: Arc<DeliveryQueue>,
    pub supervisor: Arc<SessionSupervisor>,
    pub antiban: Arc<AntiBanController>,
    idempotency: Arc<DashMap<String, CachedResponse>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<ClientPool>,
        delivery: Arc<DeliveryQueue>,
        supervisor: Arc<SessionSupervisor>,
        antiban: Arc<AntiBanController>,
    ) -> Self {
        Self {
            store,
            pool,
            delivery,
            supervisor,
            antiban,
            idempotency: Arc::new(DashMap::new()),
        }
    }

    pub fn from_engine(engine: &ForwardingEngine) -> Self {
        Self::new(
            engine.store.clone(),
            engine.pool.clone(),
            engine.delivery.clone(),
            engine.supervisor.clone(),
            engine.antiban.clone(),
        )
    }

    /// Stored response for a repeated request id, if any.
    fn replay(&self, request_id: Option<&str>) -> Option<Json<serde_json::Value>> {
        let rid = request_id?;
        let cached = self.idempotency.get(rid)?;
        if cached.at.elapsed() > IDEMPOTENCY_RETENTION {
            drop(cached);
            self.idempotency.remove(rid);
            return None;
        }
        Some(Json(cached.body.clone()))
    }

    /// Serialize the response and remember it under the request id.
    fn respond<T: Serialize>(&self, request_id: Option<&str>, body: &T) -> Json<serde_json::Value> {
        let value = serde_json::to_value(body).unwrap_or(serde_json::Value::Null);
        if let Some(rid) = request_id {
            self.idempotency.insert(
                rid.to_string(),
                CachedResponse {
                    at: Instant::now(),
                    body: value.clone(),
                },
            );
        }
        Json(value)
    }
}

/// Verified caller identity, supplied by the upstream auth layer.
fn require_user(headers: &HeaderMap) -> error::Result<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or(ApiError::Unauthorized)
}

fn require_admin(headers: &HeaderMap) -> error::Result<()> {
    let is_admin = headers
        .get("x-admin")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if is_admin {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "AutoForwardX Control Plane API",
        version = "0.1.0",
        description = "Pair management, session lifecycle, stats, and admin queue controls"
    ),
    paths(
        stats::health,
        stats::liveness,
        stats::readiness,
        stats::dashboard,
        stats::activity,
        stats::admin_stats,
        stats::admin_queue_stats,
        stats::admin_pause_queue,
        stats::admin_resume_queue,
        stats::admin_clear_failed,
        stats::admin_trigger_health,
        pairs::create_pair,
        pairs::list_pairs,
        pairs::get_pair,
        pairs::update_pair,
        pairs::delete_pair,
        pairs::pause_pair,
        pairs::resume_pair,
        pairs::stop_pair,
        pairs::bulk_pause,
        pairs::bulk_resume,
        pairs::bulk_update,
        pairs::pair_failures,
        sessions::list_sessions,
        sessions::create_session,
        sessions::send_otp,
        sessions::verify_otp,
        sessions::trigger_health,
        sessions::disconnect_session,
        sessions::delete_session,
        sessions::list_dialogs,
    ),
    components(schemas(
        afx_common::Pair,
        afx_common::PairOptions,
        afx_common::PairStats,
        afx_common::PairState,
        afx_common::MessageTypeFilter,
        afx_common::QueueItem,
        afx_common::QueueItemStatus,
        afx_common::MessageSnapshot,
        afx_common::EventKind,
        afx_common::ActivityEntry,
        afx_common::ActivityKind,
        afx_common::DashboardStats,
        afx_common::AdminStats,
        afx_common::QueueStats,
        afx_common::SessionHealth,
        afx_common::RateStateSnapshot,
        afx_common::RateLevel,
        error::ErrorBody,
        model::CreatePairRequest,
        model::BulkPairRequest,
        model::BulkUpdateRequest,
        model::BulkResponse,
        model::CreateSessionRequest,
        model::OtpResponse,
        model::VerifyOtpRequest,
        model::SessionView,
        model::DialogView,
        model::ActivityQuery,
        model::MessageResponse,
        model::ClearFailedResponse,
        model::QueueControlResponse,
        model::ProbeResponse,
        pairs::FailuresQuery,
    )),
    tags(
        (name = "health", description = "Probes"),
        (name = "pairs", description = "Forwarding pair management"),
        (name = "sessions", description = "Platform session lifecycle"),
        (name = "stats", description = "Dashboards and activity"),
        (name = "admin", description = "Admin queue and session controls"),
    )
)]
pub struct ApiDoc;

/// Build the control-plane router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        // Probes
        .route("/health", get(stats::health))
        .route("/health/live", get(stats::liveness))
        .route("/health/ready", get(stats::readiness))
        // Pairs
        .route("/api/pairs", post(pairs::create_pair).get(pairs::list_pairs))
        .route("/api/pairs/bulk", put(pairs::bulk_update))
        .route("/api/pairs/bulk/pause", post(pairs::bulk_pause))
        .route("/api/pairs/bulk/resume", post(pairs::bulk_resume))
        .route(
            "/api/pairs/:pair_id",
            get(pairs::get_pair)
                .put(pairs::update_pair)
                .delete(pairs::delete_pair),
        )
        .route("/api/pairs/:pair_id/pause", post(pairs::pause_pair))
        .route("/api/pairs/:pair_id/resume", post(pairs::resume_pair))
        .route("/api/pairs/:pair_id/stop", post(pairs::stop_pair))
        .route("/api/pairs/:pair_id/failures", get(pairs::pair_failures))
        // Sessions
        .route(
            "/api/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/api/sessions/:session_id",
            delete(sessions::delete_session),
        )
        .route("/api/sessions/:session_id/otp", post(sessions::send_otp))
        .route("/api/sessions/:session_id/verify", post(sessions::verify_otp))
        .route("/api/sessions/:session_id/health", post(sessions::trigger_health))
        .route(
            "/api/sessions/:session_id/disconnect",
            post(sessions::disconnect_session),
        )
        .route("/api/sessions/:session_id/dialogs", get(sessions::list_dialogs))
        // Stats & activity
        .route("/api/dashboard", get(stats::dashboard))
        .route("/api/activity", get(stats::activity))
        // Admin
        .route("/api/admin/stats", get(stats::admin_stats))
        .route("/api/admin/queue", get(stats::admin_queue_stats))
        .route("/api/admin/queue/pause", post(stats::admin_pause_queue))
        .route("/api/admin/queue/resume", post(stats::admin_resume_queue))
        .route(
            "/api/admin/queue/clear-failed",
            post(stats::admin_clear_failed),
        )
        .route(
            "/api/admin/sessions/:session_id/health",
            post(stats::admin_trigger_health),
        )
        .with_state(state)
}
