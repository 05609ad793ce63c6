//! Control-plane request and response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use afx_common::{PairOptions, RateStateSnapshot, Session, SessionHealth};

/// Create a forwarding pair.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePairRequest {
    pub session_id: String,
    pub source_ref: String,
    pub destination_ref: String,
    #[serde(flatten)]
    pub options: PairOptions,
}

/// Bulk state transition for a set of pairs.
#[derive(Debug, Deserialize, ToSchema)]
pub struct BulkPairRequest {
    pub pair_ids: Vec<String>,
}

/// Bulk option update for a set of pairs.
#[derive(Debug, Deserialize, ToSchema)]
pub struct BulkUpdateRequest {
    pub pair_ids: Vec<String>,
    pub options: PairOptions,
}

/// Result of a bulk operation.
#[derive(Debug, Serialize, ToSchema)]
pub struct BulkResponse {
    pub updated: usize,
    pub skipped: Vec<String>,
}

/// Register a new platform account; authorization happens via the OTP
/// flow afterwards.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    pub phone: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OtpResponse {
    pub code_hash: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct VerifyOtpRequest {
    pub code: String,
    pub code_hash: String,
}

/// A session with its live health and rate projections.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionView {
    pub id: String,
    pub phone: String,
    pub display_name: Option<String>,
    pub active: bool,
    pub last_health_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub health: Option<SessionHealth>,
    pub rate: Option<RateStateSnapshot>,
}

impl SessionView {
    pub fn from_session(
        session: Session,
        health: Option<SessionHealth>,
        rate: Option<RateStateSnapshot>,
    ) -> Self {
        Self {
            id: session.id,
            phone: session.phone,
            display_name: session.display_name,
            active: session.active,
            last_health_at: session.last_health_at,
            created_at: session.created_at,
            health,
            rate,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DialogView {
    pub chat_ref: String,
    pub title: String,
    pub member_count: Option<u64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ActivityQuery {
    pub limit: Option<u32>,
}

/// Generic acknowledgement body.
#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClearFailedResponse {
    pub cleared: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QueueControlResponse {
    pub paused: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProbeResponse {
    pub status: String,
}
