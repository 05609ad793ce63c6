use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod logging;

// ============================================================================
// Plans & Users
// ============================================================================

/// Subscription plan for a user. Plan feature limits are a fixed mapping
/// supplied by the external billing component; the core only reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Business,
}

impl Plan {
    pub fn limits(&self) -> PlanLimits {
        match self {
            Plan::Free => PlanLimits {
                max_sessions: 1,
                max_pairs: 3,
                msgs_per_day: 100,
                advanced_filtering: false,
            },
            Plan::Pro => PlanLimits {
                max_sessions: 3,
                max_pairs: 15,
                msgs_per_day: 2_000,
                advanced_filtering: true,
            },
            Plan::Business => PlanLimits {
                max_sessions: 10,
                max_pairs: 100,
                msgs_per_day: 20_000,
                advanced_filtering: true,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Business => "business",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Some(Plan::Free),
            "pro" => Some(Plan::Pro),
            "business" => Some(Plan::Business),
            _ => None,
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature limits attached to a plan. Read-only inside the core.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct PlanLimits {
    pub max_sessions: u32,
    pub max_pairs: u32,
    pub msgs_per_day: u32,
    pub advanced_filtering: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: String,
    pub plan: Plan,
    pub plan_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<String>, plan: Plan) -> Self {
        Self {
            id: id.into(),
            plan,
            plan_expiry: None,
            created_at: Utc::now(),
        }
    }

    pub fn limits(&self) -> PlanLimits {
        self.plan.limits()
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// An authorized account on the messaging platform. The credential blob is
/// opaque outside the client crate and must never be logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub phone: String,
    #[serde(skip_serializing)]
    pub credential_blob: String,
    pub active: bool,
    pub last_health_at: Option<DateTime<Utc>>,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// A session may be opened only when it is active and has credentials.
    pub fn is_usable(&self) -> bool {
        self.active && !self.credential_blob.is_empty()
    }
}

/// In-memory health projection per session, rebuilt at startup.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionHealth {
    pub session_id: String,
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub recent_errors: Vec<String>,
}

impl SessionHealth {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            healthy: false,
            last_check: None,
            consecutive_failures: 0,
            recent_errors: Vec::new(),
        }
    }
}

// ============================================================================
// Forwarding pairs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PairState {
    Active,
    Paused,
    Stopped,
    Error,
}

impl PairState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairState::Active => "active",
            PairState::Paused => "paused",
            PairState::Stopped => "stopped",
            PairState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(PairState::Active),
            "paused" => Some(PairState::Paused),
            "stopped" => Some(PairState::Stopped),
            "error" => Some(PairState::Error),
            _ => None,
        }
    }
}

/// Which message kinds a pair accepts from its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageTypeFilter {
    All,
    Media,
    Text,
}

impl MessageTypeFilter {
    pub fn permits(&self, snapshot: &MessageSnapshot) -> bool {
        match self {
            MessageTypeFilter::All => true,
            MessageTypeFilter::Media => snapshot.has_media,
            MessageTypeFilter::Text => !snapshot.has_media,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageTypeFilter::All => "all",
            MessageTypeFilter::Media => "media",
            MessageTypeFilter::Text => "text",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(MessageTypeFilter::All),
            "media" => Some(MessageTypeFilter::Media),
            "text" => Some(MessageTypeFilter::Text),
            _ => None,
        }
    }
}

/// Per-pair delivery counters. `filtered` counts pipeline drops, which are
/// not failures.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema)]
pub struct PairStats {
    pub forwarded: u64,
    pub successful: u64,
    pub failed: u64,
    pub filtered: u64,
    pub last_at: Option<DateTime<Utc>>,
}

/// A directed forwarding configuration (source → destination) owned by a
/// user and bound to one of their sessions.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Pair {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub source_ref: String,
    pub destination_ref: String,
    pub state: PairState,
    pub delay_min_s: u32,
    pub delay_max_s: u32,
    pub copy_mode: bool,
    pub silent: bool,
    pub forward_edits: bool,
    pub forward_deletions: bool,
    pub message_type_filter: MessageTypeFilter,
    pub chain: bool,
    /// When set, at most one send for this pair is in flight at a time.
    pub serialized: bool,
    pub stats: PairStats,
    pub created_at: DateTime<Utc>,
}

pub const MAX_DELAY_SECS: u32 = 86_400;

impl Pair {
    pub fn delays_valid(&self) -> bool {
        self.delay_min_s <= self.delay_max_s && self.delay_max_s <= MAX_DELAY_SECS
    }
}

/// Partial update applied to a pair by the control plane.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct PairOptions {
    pub delay_min_s: Option<u32>,
    pub delay_max_s: Option<u32>,
    pub copy_mode: Option<bool>,
    pub silent: Option<bool>,
    pub forward_edits: Option<bool>,
    pub forward_deletions: Option<bool>,
    pub message_type_filter: Option<MessageTypeFilter>,
    pub chain: Option<bool>,
    pub serialized: Option<bool>,
}

impl PairOptions {
    pub fn apply_to(&self, pair: &mut Pair) {
        if let Some(v) = self.delay_min_s {
            pair.delay_min_s = v;
        }
        if let Some(v) = self.delay_max_s {
            pair.delay_max_s = v;
        }
        if let Some(v) = self.copy_mode {
            pair.copy_mode = v;
        }
        if let Some(v) = self.silent {
            pair.silent = v;
        }
        if let Some(v) = self.forward_edits {
            pair.forward_edits = v;
        }
        if let Some(v) = self.forward_deletions {
            pair.forward_deletions = v;
        }
        if let Some(v) = self.message_type_filter {
            pair.message_type_filter = v;
        }
        if let Some(v) = self.chain {
            pair.chain = v;
        }
        if let Some(v) = self.serialized {
            pair.serialized = v;
        }
    }
}

// ============================================================================
// Filter rules
// ============================================================================

/// Phrase blocklist entry. `pair_id = None` applies to every pair of the
/// user.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BlockedPhrase {
    pub id: String,
    pub user_id: String,
    pub pair_id: Option<String>,
    pub text: String,
    pub active: bool,
}

/// Image blocklist entry matched against the event's perceptual hash.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BlockedImage {
    pub id: String,
    pub user_id: String,
    pub pair_id: Option<String>,
    pub image_hash: String,
    pub active: bool,
}

// ============================================================================
// Queue items
// ============================================================================

/// Queue item statuses are stored as integer codes in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cleared,
}

impl QueueItemStatus {
    pub fn code(&self) -> i32 {
        match self {
            QueueItemStatus::Pending => 0,
            QueueItemStatus::Processing => 1,
            QueueItemStatus::Completed => 2,
            QueueItemStatus::Failed => 3,
            QueueItemStatus::Cleared => 4,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => QueueItemStatus::Processing,
            2 => QueueItemStatus::Completed,
            3 => QueueItemStatus::Failed,
            4 => QueueItemStatus::Cleared,
            _ => QueueItemStatus::Pending,
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueItemStatus::Completed | QueueItemStatus::Failed | QueueItemStatus::Cleared
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::Processing => "processing",
            QueueItemStatus::Completed => "completed",
            QueueItemStatus::Failed => "failed",
            QueueItemStatus::Cleared => "cleared",
        }
    }
}

/// Opaque snapshot of a source message, carried by queue items so the
/// destination send does not depend on the source still existing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MessageSnapshot {
    pub text: Option<String>,
    pub has_media: bool,
    pub image_hash: Option<String>,
}

impl MessageSnapshot {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            has_media: false,
            image_hash: None,
        }
    }

    pub fn media(image_hash: impl Into<String>) -> Self {
        Self {
            text: None,
            has_media: true,
            image_hash: Some(image_hash.into()),
        }
    }
}

/// A scheduled unit of work: one source message to be reproduced on one
/// destination.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QueueItem {
    pub id: String,
    pub pair_id: String,
    pub source_message_id: i64,
    pub source_ref: String,
    pub destination_ref: String,
    pub payload: MessageSnapshot,
    pub kind: EventKind,
    pub scheduled_at: DateTime<Utc>,
    pub status: QueueItemStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Inbound update events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    New,
    Edit,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::New => "new",
            EventKind::Edit => "edit",
            EventKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(EventKind::New),
            "edit" => Some(EventKind::Edit),
            "delete" => Some(EventKind::Delete),
            _ => None,
        }
    }
}

/// Inbound update observed on a session's source channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub session_id: String,
    pub kind: EventKind,
    pub source_ref: String,
    pub message_id: i64,
    pub snapshot: MessageSnapshot,
}

// ============================================================================
// Activity log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    MessageForwarded,
    MessageFiltered,
    DeliveryFailed,
    IngressOverflow,
    SessionConnected,
    SessionDeactivated,
    SessionReconnecting,
    RateWarning,
    EmergencyStop,
    PairCreated,
    PairUpdated,
    PairDeleted,
    QueueCleared,
    DailyCapReached,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::MessageForwarded => "message_forwarded",
            ActivityKind::MessageFiltered => "message_filtered",
            ActivityKind::DeliveryFailed => "delivery_failed",
            ActivityKind::IngressOverflow => "ingress_overflow",
            ActivityKind::SessionConnected => "session_connected",
            ActivityKind::SessionDeactivated => "session_deactivated",
            ActivityKind::SessionReconnecting => "session_reconnecting",
            ActivityKind::RateWarning => "rate_warning",
            ActivityKind::EmergencyStop => "emergency_stop",
            ActivityKind::PairCreated => "pair_created",
            ActivityKind::PairUpdated => "pair_updated",
            ActivityKind::PairDeleted => "pair_deleted",
            ActivityKind::QueueCleared => "queue_cleared",
            ActivityKind::DailyCapReached => "daily_cap_reached",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message_forwarded" => Some(ActivityKind::MessageForwarded),
            "message_filtered" => Some(ActivityKind::MessageFiltered),
            "delivery_failed" => Some(ActivityKind::DeliveryFailed),
            "ingress_overflow" => Some(ActivityKind::IngressOverflow),
            "session_connected" => Some(ActivityKind::SessionConnected),
            "session_deactivated" => Some(ActivityKind::SessionDeactivated),
            "session_reconnecting" => Some(ActivityKind::SessionReconnecting),
            "rate_warning" => Some(ActivityKind::RateWarning),
            "emergency_stop" => Some(ActivityKind::EmergencyStop),
            "pair_created" => Some(ActivityKind::PairCreated),
            "pair_updated" => Some(ActivityKind::PairUpdated),
            "pair_deleted" => Some(ActivityKind::PairDeleted),
            "queue_cleared" => Some(ActivityKind::QueueCleared),
            "daily_cap_reached" => Some(ActivityKind::DailyCapReached),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ActivityEntry {
    pub id: String,
    pub user_id: String,
    pub pair_id: Option<String>,
    pub session_id: Option<String>,
    pub kind: ActivityKind,
    pub message: String,
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(user_id: impl Into<String>, kind: ActivityKind, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            pair_id: None,
            session_id: None,
            kind,
            message: message.into(),
            metadata: serde_json::Value::Null,
            at: Utc::now(),
        }
    }

    pub fn with_pair(mut self, pair_id: impl Into<String>) -> Self {
        self.pair_id = Some(pair_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

// ============================================================================
// Rate levels (anti-ban)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RateLevel {
    Safe,
    Warning,
    Critical,
    Banned,
}

impl RateLevel {
    /// Factor applied to a pair's nominal delay. Zero halts dispatch.
    pub fn multiplier(&self) -> f64 {
        match self {
            RateLevel::Safe => 1.0,
            RateLevel::Warning => 2.0,
            RateLevel::Critical => 5.0,
            RateLevel::Banned => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RateLevel::Safe => "safe",
            RateLevel::Warning => "warning",
            RateLevel::Critical => "critical",
            RateLevel::Banned => "banned",
        }
    }
}

/// Read-only view of a session's rate state, exposed to the control plane.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RateStateSnapshot {
    pub session_id: String,
    pub msgs_this_minute: u32,
    pub msgs_this_hour: u32,
    pub level: RateLevel,
    pub throttle_multiplier: f64,
    pub warning_count: u32,
}

// ============================================================================
// Platform error taxonomy
// ============================================================================

/// Raw error markers that imply continued sends will harm the session.
pub const BAN_MARKERS: &[&str] = &[
    "PEER_FLOOD",
    "USER_DEACTIVATED",
    "USER_BLOCKED",
    "account restricted",
];

/// Semantic classification of platform failures. Downstream components
/// match on this and never inspect raw platform strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("session authorization expired")]
    AuthExpired,

    #[error("rate limited, retry after {wait_s}s")]
    RateLimited { wait_s: u64 },

    #[error("peer invalid: {0}")]
    PeerInvalid(String),

    #[error("content rejected: {0}")]
    ContentRejected(String),

    #[error("platform error: {0}")]
    Unknown(String),
}

impl PlatformError {
    /// Map a raw platform error string onto the taxonomy.
    pub fn classify(raw: &str) -> Self {
        let upper = raw.to_ascii_uppercase();

        if let Some(rest) = upper.strip_prefix("FLOOD_WAIT_") {
            let wait_s = rest
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap_or(60);
            return PlatformError::RateLimited { wait_s };
        }
        if upper.contains("AUTH_KEY")
            || upper.contains("SESSION_REVOKED")
            || upper.contains("SESSION_EXPIRED")
            || upper.contains("UNAUTHORIZED")
        {
            return PlatformError::AuthExpired;
        }
        if upper.contains("PEER_ID_INVALID")
            || upper.contains("CHANNEL_PRIVATE")
            || upper.contains("CHAT_WRITE_FORBIDDEN")
        {
            return PlatformError::PeerInvalid(raw.to_string());
        }
        if upper.contains("MESSAGE_TOO_LONG")
            || upper.contains("MEDIA_INVALID")
            || upper.contains("MESSAGE_DELETE_FORBIDDEN")
        {
            return PlatformError::ContentRejected(raw.to_string());
        }
        if upper.contains("TIMEOUT")
            || upper.contains("CONNECTION")
            || upper.contains("NETWORK")
            || upper.contains("DISCONNECT")
        {
            return PlatformError::TransientNetwork(raw.to_string());
        }
        PlatformError::Unknown(raw.to_string())
    }

    /// Whether a raw error string carries one of the ban markers.
    pub fn is_ban_indicator(raw: &str) -> bool {
        BAN_MARKERS
            .iter()
            .any(|marker| raw.to_ascii_lowercase().contains(&marker.to_ascii_lowercase()))
    }

    /// Whether this error's underlying platform string carries a ban
    /// marker.
    pub fn has_ban_marker(&self) -> bool {
        match self {
            PlatformError::TransientNetwork(s)
            | PlatformError::PeerInvalid(s)
            | PlatformError::ContentRejected(s)
            | PlatformError::Unknown(s) => Self::is_ban_indicator(s),
            _ => false,
        }
    }

    /// Retryable errors are rescheduled; terminal ones fail the item.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlatformError::TransientNetwork(_)
                | PlatformError::RateLimited { .. }
                | PlatformError::Unknown(_)
        )
    }
}

// ============================================================================
// Aggregate stats
// ============================================================================

/// Queue item counts by status.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cleared: u64,
}

/// Per-user dashboard aggregate.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DashboardStats {
    pub active_pairs: u64,
    pub total_pairs: u64,
    pub messages_today: u64,
    /// Fraction of attempted deliveries that succeeded, 0.0 - 1.0.
    pub success_rate: f64,
    pub connected_accounts: u64,
    pub queue: QueueStats,
}

/// Installation-wide aggregate for admin endpoints.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AdminStats {
    pub users_free: u64,
    pub users_pro: u64,
    pub users_business: u64,
    pub total_pairs: u64,
    pub total_sessions: u64,
    pub queue: QueueStats,
    pub unresolved_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_limits_are_monotonic() {
        let free = Plan::Free.limits();
        let pro = Plan::Pro.limits();
        let business = Plan::Business.limits();

        assert!(free.max_pairs < pro.max_pairs);
        assert!(pro.max_pairs < business.max_pairs);
        assert!(!free.advanced_filtering);
        assert!(pro.advanced_filtering);
    }

    #[test]
    fn type_filter_permits() {
        let text = MessageSnapshot::text("hello");
        let media = MessageSnapshot::media("abcd1234");

        assert!(MessageTypeFilter::All.permits(&text));
        assert!(MessageTypeFilter::All.permits(&media));
        assert!(MessageTypeFilter::Text.permits(&text));
        assert!(!MessageTypeFilter::Text.permits(&media));
        assert!(MessageTypeFilter::Media.permits(&media));
        assert!(!MessageTypeFilter::Media.permits(&text));
    }

    #[test]
    fn queue_status_codes_round_trip() {
        for status in [
            QueueItemStatus::Pending,
            QueueItemStatus::Processing,
            QueueItemStatus::Completed,
            QueueItemStatus::Failed,
            QueueItemStatus::Cleared,
        ] {
            assert_eq!(QueueItemStatus::from_code(status.code()), status);
        }
        assert_eq!(QueueItemStatus::from_code(99), QueueItemStatus::Pending);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!QueueItemStatus::Pending.is_terminal());
        assert!(!QueueItemStatus::Processing.is_terminal());
        assert!(QueueItemStatus::Completed.is_terminal());
        assert!(QueueItemStatus::Failed.is_terminal());
        assert!(QueueItemStatus::Cleared.is_terminal());
    }

    #[test]
    fn classify_flood_wait() {
        match PlatformError::classify("FLOOD_WAIT_42") {
            PlatformError::RateLimited { wait_s } => assert_eq!(wait_s, 42),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_auth_and_peer() {
        assert_eq!(
            PlatformError::classify("AUTH_KEY_UNREGISTERED"),
            PlatformError::AuthExpired
        );
        assert!(matches!(
            PlatformError::classify("PEER_ID_INVALID"),
            PlatformError::PeerInvalid(_)
        ));
        assert!(matches!(
            PlatformError::classify("connection reset by peer"),
            PlatformError::TransientNetwork(_)
        ));
        assert!(matches!(
            PlatformError::classify("something else entirely"),
            PlatformError::Unknown(_)
        ));
    }

    #[test]
    fn ban_indicators() {
        assert!(PlatformError::is_ban_indicator("PEER_FLOOD"));
        assert!(PlatformError::is_ban_indicator("your account restricted until further notice"));
        assert!(!PlatformError::is_ban_indicator("FLOOD_WAIT_10"));
    }

    #[test]
    fn rate_level_multipliers() {
        assert_eq!(RateLevel::Safe.multiplier(), 1.0);
        assert_eq!(RateLevel::Warning.multiplier(), 2.0);
        assert_eq!(RateLevel::Critical.multiplier(), 5.0);
        assert_eq!(RateLevel::Banned.multiplier(), 0.0);
    }

    #[test]
    fn pair_options_apply() {
        let mut pair = Pair {
            id: "p1".into(),
            user_id: "u1".into(),
            session_id: "s1".into(),
            source_ref: "src".into(),
            destination_ref: "dst".into(),
            state: PairState::Active,
            delay_min_s: 0,
            delay_max_s: 0,
            copy_mode: false,
            silent: false,
            forward_edits: true,
            forward_deletions: false,
            message_type_filter: MessageTypeFilter::All,
            chain: false,
            serialized: false,
            stats: PairStats::default(),
            created_at: Utc::now(),
        };

        let opts = PairOptions {
            delay_max_s: Some(30),
            copy_mode: Some(true),
            ..Default::default()
        };
        opts.apply_to(&mut pair);

        assert_eq!(pair.delay_max_s, 30);
        assert!(pair.copy_mode);
        assert!(!pair.silent);
    }
}
