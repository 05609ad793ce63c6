//! AutoForwardX durable store.
//!
//! Single source of truth for users, sessions, pairs, filter rules, the
//! delivery queue, and the activity log. All cross-task mutation goes
//! through this interface; `claim_due` is the only operation that
//! coordinates worker races and must be atomic on the backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use afx_common::{
    ActivityEntry, AdminStats, BlockedImage, BlockedPhrase, DashboardStats, EventKind,
    MessageSnapshot, Pair, PairState, QueueItem, QueueStats, Session, User,
};

pub mod sqlite;

pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Insert payload for a new queue item. The store assigns id and status.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub pair_id: String,
    pub source_message_id: i64,
    pub source_ref: String,
    pub destination_ref: String,
    pub payload: MessageSnapshot,
    pub kind: EventKind,
    pub scheduled_at: DateTime<Utc>,
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new item was persisted.
    Enqueued(String),
    /// A non-terminal item already exists for `(pair_id, source_message_id)`.
    Duplicate(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    // ========================================================================
    // Users
    // ========================================================================

    async fn create_user(&self, user: &User) -> Result<()>;
    async fn get_user(&self, user_id: &str) -> Result<User>;
    /// Deletes the user and cascades to sessions, pairs, filter rules and
    /// queue items in one transaction.
    async fn delete_user(&self, user_id: &str) -> Result<()>;

    // ========================================================================
    // Sessions
    // ========================================================================

    async fn create_session(&self, session: &Session) -> Result<()>;
    async fn get_session(&self, session_id: &str) -> Result<Session>;
    async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>>;
    /// Sessions with `active = true`, across all users. Used to rebuild
    /// in-memory projections at startup.
    async fn list_active_sessions(&self) -> Result<Vec<Session>>;
    async fn count_sessions(&self, user_id: &str) -> Result<u32>;
    /// Written by the client pool after OTP verification.
    async fn update_session_credentials(
        &self,
        session_id: &str,
        credential_blob: &str,
        display_name: Option<&str>,
    ) -> Result<()>;
    async fn set_session_active(&self, session_id: &str, active: bool) -> Result<()>;
    async fn touch_session_health(&self, session_id: &str, at: DateTime<Utc>) -> Result<()>;
    async fn delete_session(&self, session_id: &str) -> Result<()>;

    // ========================================================================
    // Pairs
    // ========================================================================

    async fn create_pair(&self, pair: &Pair) -> Result<()>;
    async fn get_pair(&self, pair_id: &str) -> Result<Pair>;
    async fn list_pairs(&self, user_id: &str) -> Result<Vec<Pair>>;
    /// Active pairs subscribed to `source_ref` on `session_id`.
    async fn pairs_for_source(&self, session_id: &str, source_ref: &str) -> Result<Vec<Pair>>;
    async fn count_pairs(&self, user_id: &str) -> Result<u32>;
    async fn update_pair(&self, pair: &Pair) -> Result<()>;
    async fn set_pair_state(&self, pair_id: &str, state: PairState) -> Result<()>;
    /// Transition every pair of a session currently in `from` to `to`.
    /// Returns the affected pair ids.
    async fn set_session_pairs_state(
        &self,
        session_id: &str,
        from: PairState,
        to: PairState,
    ) -> Result<Vec<String>>;
    /// Deletes the pair and transitions its non-terminal queue items to
    /// `cleared` within the same transaction.
    async fn delete_pair(&self, pair_id: &str) -> Result<()>;

    // Pair stats counters. `filtered` is not a failure.
    async fn record_pair_success(&self, pair_id: &str, at: DateTime<Utc>) -> Result<()>;
    async fn record_pair_failure(&self, pair_id: &str, at: DateTime<Utc>) -> Result<()>;
    async fn record_pair_filtered(&self, pair_id: &str) -> Result<()>;

    // ========================================================================
    // Filter rules
    // ========================================================================

    async fn create_blocked_phrase(&self, phrase: &BlockedPhrase) -> Result<()>;
    async fn delete_blocked_phrase(&self, phrase_id: &str) -> Result<()>;
    /// Active phrases applying to the pair: pair-scoped rules first, then
    /// user-wide rules.
    async fn phrases_for_pair(&self, user_id: &str, pair_id: &str) -> Result<Vec<BlockedPhrase>>;

    async fn create_blocked_image(&self, image: &BlockedImage) -> Result<()>;
    async fn delete_blocked_image(&self, image_id: &str) -> Result<()>;
    async fn images_for_pair(&self, user_id: &str, pair_id: &str) -> Result<Vec<BlockedImage>>;

    // ========================================================================
    // Delivery queue
    // ========================================================================

    /// Persists a new pending item, unless a non-terminal item already
    /// exists for the `(pair_id, source_message_id)` key.
    async fn enqueue(&self, item: NewQueueItem) -> Result<EnqueueOutcome>;

    /// Returns pending items with `scheduled_at <= now`, atomically
    /// transitioned to `processing`. No two callers ever receive the same
    /// item. Results are ordered by `scheduled_at`.
    async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<QueueItem>>;

    async fn get_item(&self, item_id: &str) -> Result<QueueItem>;
    async fn complete_item(&self, item_id: &str, at: DateTime<Utc>) -> Result<()>;
    /// Reschedule without consuming an attempt (throttle gate, rate budget,
    /// platform-imposed wait).
    async fn reschedule_item(&self, item_id: &str, at: DateTime<Utc>) -> Result<()>;
    /// Consume an attempt and reschedule for retry.
    async fn retry_item(&self, item_id: &str, error: &str, at: DateTime<Utc>) -> Result<()>;
    /// Terminal failure.
    async fn fail_item(&self, item_id: &str, error: &str, at: DateTime<Utc>) -> Result<()>;
    /// Roll a processing item back to pending with its original schedule.
    /// Used when a worker observes cancellation mid-flight.
    async fn release_item(&self, item_id: &str) -> Result<()>;
    /// Roll every processing item back to pending. Startup/shutdown
    /// recovery for items orphaned by a died or stopping worker.
    async fn release_all_processing(&self) -> Result<u64>;
    /// Transition all failed items to cleared. Returns the count.
    async fn clear_failed(&self) -> Result<u64>;
    async fn failed_items_for_pair(&self, pair_id: &str, limit: u32) -> Result<Vec<QueueItem>>;
    async fn queue_stats(&self) -> Result<QueueStats>;

    // ========================================================================
    // Activity log
    // ========================================================================

    async fn append_activity(&self, entry: &ActivityEntry) -> Result<()>;
    async fn recent_activity(&self, user_id: &str, limit: u32) -> Result<Vec<ActivityEntry>>;
    async fn cleanup_activity(&self, older_than: DateTime<Utc>) -> Result<u64>;

    // ========================================================================
    // Aggregates
    // ========================================================================

    /// Queue items created today for the user's pairs. Drives the optional
    /// daily soft cap and the dashboard counter.
    async fn count_events_today(&self, user_id: &str) -> Result<u64>;
    async fn dashboard_stats(&self, user_id: &str) -> Result<DashboardStats>;
    async fn admin_stats(&self) -> Result<AdminStats>;
}
