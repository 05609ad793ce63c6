//! SQLite store implementation.
//!
//! Raw parameterized queries over sqlx. Timestamps are stored as epoch
//! milliseconds; queue statuses as integer codes. SQLite serializes
//! writers, which makes the claim transaction in `claim_due` exclusive
//! across workers.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use afx_common::{
    ActivityEntry, ActivityKind, AdminStats, BlockedImage, BlockedPhrase, DashboardStats,
    EventKind, MessageTypeFilter, Pair, PairState, PairStats, Plan, QueueItem, QueueItemStatus,
    QueueStats, Session, User,
};

use crate::{EnqueueOutcome, NewQueueItem, Result, Store, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY,
    plan        TEXT NOT NULL,
    plan_expiry INTEGER,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS telegram_sessions (
    id              TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL,
    phone           TEXT NOT NULL,
    credential_blob TEXT NOT NULL DEFAULT '',
    active          INTEGER NOT NULL DEFAULT 0,
    last_health_at  INTEGER,
    display_name    TEXT,
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON telegram_sessions(user_id);

CREATE TABLE IF NOT EXISTS forwarding_pairs (
    id                  TEXT PRIMARY KEY,
    user_id             TEXT NOT NULL,
    session_id          TEXT NOT NULL,
    source_ref          TEXT NOT NULL,
    destination_ref     TEXT NOT NULL,
    state               TEXT NOT NULL,
    delay_min_s         INTEGER NOT NULL DEFAULT 0,
    delay_max_s         INTEGER NOT NULL DEFAULT 0,
    copy_mode           INTEGER NOT NULL DEFAULT 0,
    silent              INTEGER NOT NULL DEFAULT 0,
    forward_edits       INTEGER NOT NULL DEFAULT 1,
    forward_deletions   INTEGER NOT NULL DEFAULT 0,
    message_type_filter TEXT NOT NULL DEFAULT 'all',
    chain               INTEGER NOT NULL DEFAULT 0,
    serialized          INTEGER NOT NULL DEFAULT 0,
    stats_forwarded     INTEGER NOT NULL DEFAULT 0,
    stats_successful    INTEGER NOT NULL DEFAULT 0,
    stats_failed        INTEGER NOT NULL DEFAULT 0,
    stats_filtered      INTEGER NOT NULL DEFAULT 0,
    stats_last_at       INTEGER,
    created_at          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pairs_user ON forwarding_pairs(user_id);
CREATE INDEX IF NOT EXISTS idx_pairs_source ON forwarding_pairs(session_id, source_ref);

CREATE TABLE IF NOT EXISTS forwarding_queue (
    id                TEXT PRIMARY KEY,
    pair_id           TEXT NOT NULL,
    source_message_id INTEGER NOT NULL,
    source_ref        TEXT NOT NULL,
    destination_ref   TEXT NOT NULL,
    payload           TEXT NOT NULL,
    kind              TEXT NOT NULL DEFAULT 'new',
    scheduled_at      INTEGER NOT NULL,
    status            INTEGER NOT NULL DEFAULT 0,
    attempts          INTEGER NOT NULL DEFAULT 0,
    last_error        TEXT,
    created_at        INTEGER NOT NULL,
    processed_at      INTEGER
);
CREATE INDEX IF NOT EXISTS idx_queue_due ON forwarding_queue(status, scheduled_at);
CREATE INDEX IF NOT EXISTS idx_queue_pair_msg ON forwarding_queue(pair_id, source_message_id);

CREATE TABLE IF NOT EXISTS blocked_sentences (
    id      TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    pair_id TEXT,
    text    TEXT NOT NULL,
    active  INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_sentences_user ON blocked_sentences(user_id);

CREATE TABLE IF NOT EXISTS blocked_images (
    id         TEXT PRIMARY KEY,
    user_id    TEXT NOT NULL,
    pair_id    TEXT,
    image_hash TEXT NOT NULL,
    active     INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_images_user ON blocked_images(user_id);

CREATE TABLE IF NOT EXISTS activity_logs (
    id         TEXT PRIMARY KEY,
    user_id    TEXT NOT NULL,
    pair_id    TEXT,
    session_id TEXT,
    kind       TEXT NOT NULL,
    message    TEXT NOT NULL,
    metadata   TEXT NOT NULL DEFAULT 'null',
    at         INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_activity_user ON activity_logs(user_id, at);
"#;

/// SQLite-backed implementation of [`Store`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to the given database URL, creating the file if missing.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(StoreError::Unavailable)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. Uses a single connection so every
    /// query sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("Store schema initialized");
        Ok(())
    }

    fn build_in_clause(count: usize) -> String {
        let placeholders: Vec<&str> = (0..count).map(|_| "?").collect();
        placeholders.join(", ")
    }

    fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
        DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| StoreError::Corrupt(format!("invalid timestamp: {ms}")))
    }

    fn start_of_today() -> DateTime<Utc> {
        Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc()
    }

    fn map_write_err(e: sqlx::Error, what: &str) -> StoreError {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(what.to_string())
            }
            sqlx::Error::RowNotFound => StoreError::NotFound(what.to_string()),
            _ => StoreError::Unavailable(e),
        }
    }

    fn parse_user(row: &SqliteRow) -> Result<User> {
        let plan_str: String = row.get("plan");
        let plan = Plan::parse(&plan_str)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown plan: {plan_str}")))?;
        let plan_expiry = row
            .get::<Option<i64>, _>("plan_expiry")
            .map(Self::from_millis)
            .transpose()?;
        Ok(User {
            id: row.get("id"),
            plan,
            plan_expiry,
            created_at: Self::from_millis(row.get("created_at"))?,
        })
    }

    fn parse_session(row: &SqliteRow) -> Result<Session> {
        let last_health_at = row
            .get::<Option<i64>, _>("last_health_at")
            .map(Self::from_millis)
            .transpose()?;
        Ok(Session {
            id: row.get("id"),
            user_id: row.get("user_id"),
            phone: row.get("phone"),
            credential_blob: row.get("credential_blob"),
            active: row.get::<i64, _>("active") != 0,
            last_health_at,
            display_name: row.get("display_name"),
            created_at: Self::from_millis(row.get("created_at"))?,
        })
    }

    fn parse_pair(row: &SqliteRow) -> Result<Pair> {
        let state_str: String = row.get("state");
        let state = PairState::parse(&state_str)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown pair state: {state_str}")))?;
        let filter_str: String = row.get("message_type_filter");
        let message_type_filter = MessageTypeFilter::parse(&filter_str)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown type filter: {filter_str}")))?;
        let stats_last_at = row
            .get::<Option<i64>, _>("stats_last_at")
            .map(Self::from_millis)
            .transpose()?;
        Ok(Pair {
            id: row.get("id"),
            user_id: row.get("user_id"),
            session_id: row.get("session_id"),
            source_ref: row.get("source_ref"),
            destination_ref: row.get("destination_ref"),
            state,
            delay_min_s: row.get::<i64, _>("delay_min_s") as u32,
            delay_max_s: row.get::<i64, _>("delay_max_s") as u32,
            copy_mode: row.get::<i64, _>("copy_mode") != 0,
            silent: row.get::<i64, _>("silent") != 0,
            forward_edits: row.get::<i64, _>("forward_edits") != 0,
            forward_deletions: row.get::<i64, _>("forward_deletions") != 0,
            message_type_filter,
            chain: row.get::<i64, _>("chain") != 0,
            serialized: row.get::<i64, _>("serialized") != 0,
            stats: PairStats {
                forwarded: row.get::<i64, _>("stats_forwarded") as u64,
                successful: row.get::<i64, _>("stats_successful") as u64,
                failed: row.get::<i64, _>("stats_failed") as u64,
                filtered: row.get::<i64, _>("stats_filtered") as u64,
                last_at: stats_last_at,
            },
            created_at: Self::from_millis(row.get("created_at"))?,
        })
    }

    fn parse_item(row: &SqliteRow) -> Result<QueueItem> {
        let payload_str: String = row.get("payload");
        let payload = serde_json::from_str(&payload_str)
            .map_err(|e| StoreError::Corrupt(format!("queue payload: {e}")))?;
        let kind_str: String = row.get("kind");
        let kind = EventKind::parse(&kind_str)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown event kind: {kind_str}")))?;
        let processed_at = row
            .get::<Option<i64>, _>("processed_at")
            .map(Self::from_millis)
            .transpose()?;
        Ok(QueueItem {
            id: row.get("id"),
            pair_id: row.get("pair_id"),
            source_message_id: row.get("source_message_id"),
            source_ref: row.get("source_ref"),
            destination_ref: row.get("destination_ref"),
            payload,
            kind,
            scheduled_at: Self::from_millis(row.get("scheduled_at"))?,
            status: QueueItemStatus::from_code(row.get::<i64, _>("status") as i32),
            attempts: row.get::<i64, _>("attempts") as i32,
            last_error: row.get("last_error"),
            created_at: Self::from_millis(row.get("created_at"))?,
            processed_at,
        })
    }

    fn parse_phrase(row: &SqliteRow) -> BlockedPhrase {
        BlockedPhrase {
            id: row.get("id"),
            user_id: row.get("user_id"),
            pair_id: row.get("pair_id"),
            text: row.get("text"),
            active: row.get::<i64, _>("active") != 0,
        }
    }

    fn parse_image(row: &SqliteRow) -> BlockedImage {
        BlockedImage {
            id: row.get("id"),
            user_id: row.get("user_id"),
            pair_id: row.get("pair_id"),
            image_hash: row.get("image_hash"),
            active: row.get::<i64, _>("active") != 0,
        }
    }

    fn parse_activity(row: &SqliteRow) -> Result<ActivityEntry> {
        let kind_str: String = row.get("kind");
        let kind = ActivityKind::parse(&kind_str)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown activity kind: {kind_str}")))?;
        let metadata_str: String = row.get("metadata");
        let metadata = serde_json::from_str(&metadata_str)
            .map_err(|e| StoreError::Corrupt(format!("activity metadata: {e}")))?;
        Ok(ActivityEntry {
            id: row.get("id"),
            user_id: row.get("user_id"),
            pair_id: row.get("pair_id"),
            session_id: row.get("session_id"),
            kind,
            message: row.get("message"),
            metadata,
            at: Self::from_millis(row.get("at"))?,
        })
    }

    async fn scalar(&self, query: &str, binds: &[&str]) -> Result<i64> {
        let mut q = sqlx::query_scalar::<_, i64>(query);
        for b in binds {
            q = q.bind(*b);
        }
        Ok(q.fetch_one(&self.pool).await?)
    }

    async fn queue_counts(&self, where_user: Option<&str>) -> Result<QueueStats> {
        let (query, bind) = match where_user {
            Some(user_id) => (
                "SELECT q.status AS status, COUNT(*) AS n FROM forwarding_queue q \
                 JOIN forwarding_pairs p ON p.id = q.pair_id \
                 WHERE p.user_id = ? GROUP BY q.status",
                Some(user_id),
            ),
            None => (
                "SELECT status, COUNT(*) AS n FROM forwarding_queue GROUP BY status",
                None,
            ),
        };

        let mut q = sqlx::query(query);
        if let Some(user_id) = bind {
            q = q.bind(user_id);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut stats = QueueStats::default();
        for row in &rows {
            let count = row.get::<i64, _>("n") as u64;
            match QueueItemStatus::from_code(row.get::<i64, _>("status") as i32) {
                QueueItemStatus::Pending => stats.pending = count,
                QueueItemStatus::Processing => stats.processing = count,
                QueueItemStatus::Completed => stats.completed = count,
                QueueItemStatus::Failed => stats.failed = count,
                QueueItemStatus::Cleared => stats.cleared = count,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl Store for SqliteStore {
    // ========================================================================
    // Users
    // ========================================================================

    async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query("INSERT INTO users (id, plan, plan_expiry, created_at) VALUES (?, ?, ?, ?)")
            .bind(&user.id)
            .bind(user.plan.as_str())
            .bind(user.plan_expiry.map(|t| t.timestamp_millis()))
            .bind(user.created_at.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_write_err(e, "user"))?;
        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<User> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        Self::parse_user(&row)
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }

        sqlx::query(
            "UPDATE forwarding_queue SET status = ? WHERE status IN (?, ?) AND pair_id IN \
             (SELECT id FROM forwarding_pairs WHERE user_id = ?)",
        )
        .bind(QueueItemStatus::Cleared.code())
        .bind(QueueItemStatus::Pending.code())
        .bind(QueueItemStatus::Processing.code())
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM forwarding_pairs WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM telegram_sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM blocked_sentences WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM blocked_images WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    async fn create_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO telegram_sessions \
             (id, user_id, phone, credential_blob, active, last_health_at, display_name, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.phone)
        .bind(&session.credential_blob)
        .bind(session.active as i64)
        .bind(session.last_health_at.map(|t| t.timestamp_millis()))
        .bind(&session.display_name)
        .bind(session.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_write_err(e, "session"))?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Session> {
        let row = sqlx::query("SELECT * FROM telegram_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        Self::parse_session(&row)
    }

    async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let rows =
            sqlx::query("SELECT * FROM telegram_sessions WHERE user_id = ? ORDER BY created_at")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(Self::parse_session).collect()
    }

    async fn list_active_sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM telegram_sessions WHERE active = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::parse_session).collect()
    }

    async fn count_sessions(&self, user_id: &str) -> Result<u32> {
        let n = self
            .scalar(
                "SELECT COUNT(*) FROM telegram_sessions WHERE user_id = ?",
                &[user_id],
            )
            .await?;
        Ok(n as u32)
    }

    async fn update_session_credentials(
        &self,
        session_id: &str,
        credential_blob: &str,
        display_name: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE telegram_sessions SET credential_blob = ?, \
             display_name = COALESCE(?, display_name), active = 1 WHERE id = ?",
        )
        .bind(credential_blob)
        .bind(display_name)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    async fn set_session_active(&self, session_id: &str, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE telegram_sessions SET active = ? WHERE id = ?")
            .bind(active as i64)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    async fn touch_session_health(&self, session_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE telegram_sessions SET last_health_at = ? WHERE id = ?")
            .bind(at.timestamp_millis())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM telegram_sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    // ========================================================================
    // Pairs
    // ========================================================================

    async fn create_pair(&self, pair: &Pair) -> Result<()> {
        sqlx::query(
            "INSERT INTO forwarding_pairs \
             (id, user_id, session_id, source_ref, destination_ref, state, \
              delay_min_s, delay_max_s, copy_mode, silent, forward_edits, forward_deletions, \
              message_type_filter, chain, serialized, \
              stats_forwarded, stats_successful, stats_failed, stats_filtered, stats_last_at, \
              created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&pair.id)
        .bind(&pair.user_id)
        .bind(&pair.session_id)
        .bind(&pair.source_ref)
        .bind(&pair.destination_ref)
        .bind(pair.state.as_str())
        .bind(pair.delay_min_s as i64)
        .bind(pair.delay_max_s as i64)
        .bind(pair.copy_mode as i64)
        .bind(pair.silent as i64)
        .bind(pair.forward_edits as i64)
        .bind(pair.forward_deletions as i64)
        .bind(pair.message_type_filter.as_str())
        .bind(pair.chain as i64)
        .bind(pair.serialized as i64)
        .bind(pair.stats.forwarded as i64)
        .bind(pair.stats.successful as i64)
        .bind(pair.stats.failed as i64)
        .bind(pair.stats.filtered as i64)
        .bind(pair.stats.last_at.map(|t| t.timestamp_millis()))
        .bind(pair.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_write_err(e, "pair"))?;
        Ok(())
    }

    async fn get_pair(&self, pair_id: &str) -> Result<Pair> {
        let row = sqlx::query("SELECT * FROM forwarding_pairs WHERE id = ?")
            .bind(pair_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("pair {pair_id}")))?;
        Self::parse_pair(&row)
    }

    async fn list_pairs(&self, user_id: &str) -> Result<Vec<Pair>> {
        let rows =
            sqlx::query("SELECT * FROM forwarding_pairs WHERE user_id = ? ORDER BY created_at")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(Self::parse_pair).collect()
    }

    async fn pairs_for_source(&self, session_id: &str, source_ref: &str) -> Result<Vec<Pair>> {
        let rows = sqlx::query(
            "SELECT * FROM forwarding_pairs \
             WHERE session_id = ? AND source_ref = ? AND state = 'active'",
        )
        .bind(session_id)
        .bind(source_ref)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_pair).collect()
    }

    async fn count_pairs(&self, user_id: &str) -> Result<u32> {
        let n = self
            .scalar(
                "SELECT COUNT(*) FROM forwarding_pairs WHERE user_id = ?",
                &[user_id],
            )
            .await?;
        Ok(n as u32)
    }

    async fn update_pair(&self, pair: &Pair) -> Result<()> {
        let result = sqlx::query(
            "UPDATE forwarding_pairs SET \
             source_ref = ?, destination_ref = ?, state = ?, delay_min_s = ?, delay_max_s = ?, \
             copy_mode = ?, silent = ?, forward_edits = ?, forward_deletions = ?, \
             message_type_filter = ?, chain = ?, serialized = ? \
             WHERE id = ?",
        )
        .bind(&pair.source_ref)
        .bind(&pair.destination_ref)
        .bind(pair.state.as_str())
        .bind(pair.delay_min_s as i64)
        .bind(pair.delay_max_s as i64)
        .bind(pair.copy_mode as i64)
        .bind(pair.silent as i64)
        .bind(pair.forward_edits as i64)
        .bind(pair.forward_deletions as i64)
        .bind(pair.message_type_filter.as_str())
        .bind(pair.chain as i64)
        .bind(pair.serialized as i64)
        .bind(&pair.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("pair {}", pair.id)));
        }
        Ok(())
    }

    async fn set_pair_state(&self, pair_id: &str, state: PairState) -> Result<()> {
        let result = sqlx::query("UPDATE forwarding_pairs SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(pair_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("pair {pair_id}")));
        }
        Ok(())
    }

    async fn set_session_pairs_state(
        &self,
        session_id: &str,
        from: PairState,
        to: PairState,
    ) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT id FROM forwarding_pairs WHERE session_id = ? AND state = ?",
        )
        .bind(session_id)
        .bind(from.as_str())
        .fetch_all(&mut *tx)
        .await?;
        let ids: Vec<String> = rows.iter().map(|r| r.get("id")).collect();

        if !ids.is_empty() {
            let in_clause = Self::build_in_clause(ids.len());
            let query = format!(
                "UPDATE forwarding_pairs SET state = ? WHERE id IN ({in_clause})"
            );
            let mut q = sqlx::query(&query).bind(to.as_str());
            for id in &ids {
                q = q.bind(id);
            }
            q.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(session_id, count = ids.len(), from = from.as_str(), to = to.as_str(), "Transitioned session pairs");
        Ok(ids)
    }

    async fn delete_pair(&self, pair_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM forwarding_pairs WHERE id = ?")
            .bind(pair_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("pair {pair_id}")));
        }

        // Non-terminal queue items are cleared in the same transaction.
        sqlx::query(
            "UPDATE forwarding_queue SET status = ? WHERE pair_id = ? AND status IN (?, ?)",
        )
        .bind(QueueItemStatus::Cleared.code())
        .bind(pair_id)
        .bind(QueueItemStatus::Pending.code())
        .bind(QueueItemStatus::Processing.code())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM blocked_sentences WHERE pair_id = ?")
            .bind(pair_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM blocked_images WHERE pair_id = ?")
            .bind(pair_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_pair_success(&self, pair_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE forwarding_pairs SET stats_successful = stats_successful + 1, \
             stats_forwarded = stats_forwarded + 1, stats_last_at = ? WHERE id = ?",
        )
        .bind(at.timestamp_millis())
        .bind(pair_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_pair_failure(&self, pair_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE forwarding_pairs SET stats_failed = stats_failed + 1, stats_last_at = ? \
             WHERE id = ?",
        )
        .bind(at.timestamp_millis())
        .bind(pair_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_pair_filtered(&self, pair_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE forwarding_pairs SET stats_filtered = stats_filtered + 1 WHERE id = ?",
        )
        .bind(pair_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Filter rules
    // ========================================================================

    async fn create_blocked_phrase(&self, phrase: &BlockedPhrase) -> Result<()> {
        sqlx::query(
            "INSERT INTO blocked_sentences (id, user_id, pair_id, text, active) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&phrase.id)
        .bind(&phrase.user_id)
        .bind(&phrase.pair_id)
        .bind(&phrase.text)
        .bind(phrase.active as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_write_err(e, "blocked phrase"))?;
        Ok(())
    }

    async fn delete_blocked_phrase(&self, phrase_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM blocked_sentences WHERE id = ?")
            .bind(phrase_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("blocked phrase {phrase_id}")));
        }
        Ok(())
    }

    async fn phrases_for_pair(&self, user_id: &str, pair_id: &str) -> Result<Vec<BlockedPhrase>> {
        // Pair-scoped rules sort before user-wide ones.
        let rows = sqlx::query(
            "SELECT * FROM blocked_sentences \
             WHERE user_id = ? AND active = 1 AND (pair_id = ? OR pair_id IS NULL) \
             ORDER BY pair_id IS NULL",
        )
        .bind(user_id)
        .bind(pair_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::parse_phrase).collect())
    }

    async fn create_blocked_image(&self, image: &BlockedImage) -> Result<()> {
        sqlx::query(
            "INSERT INTO blocked_images (id, user_id, pair_id, image_hash, active) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&image.id)
        .bind(&image.user_id)
        .bind(&image.pair_id)
        .bind(&image.image_hash)
        .bind(image.active as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_write_err(e, "blocked image"))?;
        Ok(())
    }

    async fn delete_blocked_image(&self, image_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM blocked_images WHERE id = ?")
            .bind(image_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("blocked image {image_id}")));
        }
        Ok(())
    }

    async fn images_for_pair(&self, user_id: &str, pair_id: &str) -> Result<Vec<BlockedImage>> {
        let rows = sqlx::query(
            "SELECT * FROM blocked_images \
             WHERE user_id = ? AND active = 1 AND (pair_id = ? OR pair_id IS NULL) \
             ORDER BY pair_id IS NULL",
        )
        .bind(user_id)
        .bind(pair_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::parse_image).collect())
    }

    // ========================================================================
    // Delivery queue
    // ========================================================================

    async fn enqueue(&self, item: NewQueueItem) -> Result<EnqueueOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT id FROM forwarding_queue \
             WHERE pair_id = ? AND source_message_id = ? AND status IN (?, ?) LIMIT 1",
        )
        .bind(&item.pair_id)
        .bind(item.source_message_id)
        .bind(QueueItemStatus::Pending.code())
        .bind(QueueItemStatus::Processing.code())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            tx.commit().await?;
            return Ok(EnqueueOutcome::Duplicate(row.get("id")));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_string(&item.payload)
            .map_err(|e| StoreError::Corrupt(format!("queue payload: {e}")))?;

        sqlx::query(
            "INSERT INTO forwarding_queue \
             (id, pair_id, source_message_id, source_ref, destination_ref, payload, kind, \
              scheduled_at, status, attempts, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(&item.pair_id)
        .bind(item.source_message_id)
        .bind(&item.source_ref)
        .bind(&item.destination_ref)
        .bind(payload)
        .bind(item.kind.as_str())
        .bind(item.scheduled_at.timestamp_millis())
        .bind(QueueItemStatus::Pending.code())
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<QueueItem>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT id FROM forwarding_queue WHERE status = ? AND scheduled_at <= ? \
             ORDER BY scheduled_at ASC LIMIT ?",
        )
        .bind(QueueItemStatus::Pending.code())
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let ids: Vec<String> = rows.iter().map(|r| r.get("id")).collect();
        let in_clause = Self::build_in_clause(ids.len());

        let query = format!(
            "UPDATE forwarding_queue SET status = ? WHERE status = ? AND id IN ({in_clause})"
        );
        let mut q = sqlx::query(&query)
            .bind(QueueItemStatus::Processing.code())
            .bind(QueueItemStatus::Pending.code());
        for id in &ids {
            q = q.bind(id);
        }
        q.execute(&mut *tx).await?;

        let query = format!(
            "SELECT * FROM forwarding_queue WHERE id IN ({in_clause}) ORDER BY scheduled_at ASC"
        );
        let mut q = sqlx::query(&query);
        for id in &ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&mut *tx).await?;

        tx.commit().await?;

        rows.iter().map(Self::parse_item).collect()
    }

    async fn get_item(&self, item_id: &str) -> Result<QueueItem> {
        let row = sqlx::query("SELECT * FROM forwarding_queue WHERE id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("queue item {item_id}")))?;
        Self::parse_item(&row)
    }

    async fn complete_item(&self, item_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE forwarding_queue SET status = ?, processed_at = ?, last_error = NULL \
             WHERE id = ?",
        )
        .bind(QueueItemStatus::Completed.code())
        .bind(at.timestamp_millis())
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reschedule_item(&self, item_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE forwarding_queue SET status = ?, scheduled_at = ? WHERE id = ?")
            .bind(QueueItemStatus::Pending.code())
            .bind(at.timestamp_millis())
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry_item(&self, item_id: &str, error: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE forwarding_queue SET status = ?, scheduled_at = ?, \
             attempts = attempts + 1, last_error = ? WHERE id = ?",
        )
        .bind(QueueItemStatus::Pending.code())
        .bind(at.timestamp_millis())
        .bind(error)
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_item(&self, item_id: &str, error: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE forwarding_queue SET status = ?, attempts = attempts + 1, \
             last_error = ?, processed_at = ? WHERE id = ?",
        )
        .bind(QueueItemStatus::Failed.code())
        .bind(error)
        .bind(at.timestamp_millis())
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_item(&self, item_id: &str) -> Result<()> {
        sqlx::query("UPDATE forwarding_queue SET status = ? WHERE id = ? AND status = ?")
            .bind(QueueItemStatus::Pending.code())
            .bind(item_id)
            .bind(QueueItemStatus::Processing.code())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_all_processing(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE forwarding_queue SET status = ? WHERE status = ?")
            .bind(QueueItemStatus::Pending.code())
            .bind(QueueItemStatus::Processing.code())
            .execute(&self.pool)
            .await?;
        let count = result.rows_affected();
        if count > 0 {
            info!(count, "Released orphaned processing items back to pending");
        }
        Ok(count)
    }

    async fn clear_failed(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE forwarding_queue SET status = ? WHERE status = ?")
            .bind(QueueItemStatus::Cleared.code())
            .bind(QueueItemStatus::Failed.code())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn failed_items_for_pair(&self, pair_id: &str, limit: u32) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query(
            "SELECT * FROM forwarding_queue WHERE pair_id = ? AND status = ? \
             ORDER BY processed_at DESC LIMIT ?",
        )
        .bind(pair_id)
        .bind(QueueItemStatus::Failed.code())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_item).collect()
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        self.queue_counts(None).await
    }

    // ========================================================================
    // Activity log
    // ========================================================================

    async fn append_activity(&self, entry: &ActivityEntry) -> Result<()> {
        let metadata = serde_json::to_string(&entry.metadata)
            .map_err(|e| StoreError::Corrupt(format!("activity metadata: {e}")))?;
        sqlx::query(
            "INSERT INTO activity_logs (id, user_id, pair_id, session_id, kind, message, metadata, at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.user_id)
        .bind(&entry.pair_id)
        .bind(&entry.session_id)
        .bind(entry.kind.as_str())
        .bind(&entry.message)
        .bind(metadata)
        .bind(entry.at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_activity(&self, user_id: &str, limit: u32) -> Result<Vec<ActivityEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM activity_logs WHERE user_id = ? ORDER BY at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_activity).collect()
    }

    async fn cleanup_activity(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM activity_logs WHERE at < ?")
            .bind(older_than.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Aggregates
    // ========================================================================

    async fn count_events_today(&self, user_id: &str) -> Result<u64> {
        let start = Self::start_of_today().timestamp_millis();
        let n = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM forwarding_queue q \
             JOIN forwarding_pairs p ON p.id = q.pair_id \
             WHERE p.user_id = ? AND q.created_at >= ?",
        )
        .bind(user_id)
        .bind(start)
        .fetch_one(&self.pool)
        .await?;
        Ok(n as u64)
    }

    async fn dashboard_stats(&self, user_id: &str) -> Result<DashboardStats> {
        let total_pairs = self
            .scalar(
                "SELECT COUNT(*) FROM forwarding_pairs WHERE user_id = ?",
                &[user_id],
            )
            .await? as u64;
        let active_pairs = self
            .scalar(
                "SELECT COUNT(*) FROM forwarding_pairs WHERE user_id = ? AND state = 'active'",
                &[user_id],
            )
            .await? as u64;
        let connected_accounts = self
            .scalar(
                "SELECT COUNT(*) FROM telegram_sessions WHERE user_id = ? AND active = 1",
                &[user_id],
            )
            .await? as u64;

        let row = sqlx::query(
            "SELECT COALESCE(SUM(stats_successful), 0) AS ok, COALESCE(SUM(stats_failed), 0) AS ko \
             FROM forwarding_pairs WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        let successful = row.get::<i64, _>("ok") as f64;
        let failed = row.get::<i64, _>("ko") as f64;
        let attempted = successful + failed;
        let success_rate = if attempted > 0.0 {
            successful / attempted
        } else {
            1.0
        };

        Ok(DashboardStats {
            active_pairs,
            total_pairs,
            messages_today: self.count_events_today(user_id).await?,
            success_rate,
            connected_accounts,
            queue: self.queue_counts(Some(user_id)).await?,
        })
    }

    async fn admin_stats(&self) -> Result<AdminStats> {
        let mut users_free = 0;
        let mut users_pro = 0;
        let mut users_business = 0;

        let rows = sqlx::query("SELECT plan, COUNT(*) AS n FROM users GROUP BY plan")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let n = row.get::<i64, _>("n") as u64;
            match Plan::parse(row.get::<String, _>("plan").as_str()) {
                Some(Plan::Free) => users_free = n,
                Some(Plan::Pro) => users_pro = n,
                Some(Plan::Business) => users_business = n,
                None => {}
            }
        }

        let total_pairs = self.scalar("SELECT COUNT(*) FROM forwarding_pairs", &[]).await? as u64;
        let total_sessions = self
            .scalar("SELECT COUNT(*) FROM telegram_sessions", &[])
            .await? as u64;
        let queue = self.queue_counts(None).await?;

        Ok(AdminStats {
            users_free,
            users_pro,
            users_business,
            total_pairs,
            total_sessions,
            unresolved_errors: queue.failed,
            queue,
        })
    }
}
