//! Platform client pool.
//!
//! Owns one logical client per active session and the per-session inbound
//! update stream. The underlying platform library is consumed behind the
//! [`PlatformClient`] trait so a fake can drive the engine in tests; the
//! pool adds session bookkeeping, bounded ingress buffering with
//! oldest-first overflow drop, and credential persistence after OTP
//! verification. Credential blobs are readable only inside this crate's
//! callers of `open`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use afx_common::{ActivityEntry, ActivityKind, MessageSnapshot, PlatformError, Session, UpdateEvent};
use afx_store::Store;

pub mod mock;

pub use mock::MockPlatformClient;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("session {0} is not open")]
    SessionNotOpen(String),

    #[error("session {0} is not usable (inactive or missing credentials)")]
    SessionNotUsable(String),

    #[error("store error: {0}")]
    Store(#[from] afx_store::StoreError),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Credentials returned by a completed OTP verification.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub credential_blob: String,
    pub display_name: Option<String>,
}

/// A channel or group visible to a session.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub chat_ref: String,
    pub title: String,
    pub member_count: Option<u64>,
}

/// Interface to the external messaging platform. One implementation wraps
/// the real client library; [`MockPlatformClient`] drives tests.
///
/// Every operation fails with a [`PlatformError`] from the taxonomy; raw
/// platform strings never cross this boundary.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Dial the platform and resume the authenticated session. Returns the
    /// raw inbound update stream for the session.
    async fn open(
        &self,
        session: &Session,
    ) -> std::result::Result<mpsc::Receiver<UpdateEvent>, PlatformError>;

    /// Ask the platform to dispatch a one-time code. Returns the code hash
    /// to be combined with the user-entered code.
    async fn send_otp(
        &self,
        session: &Session,
        phone: &str,
    ) -> std::result::Result<String, PlatformError>;

    /// Finalize authentication with the user-entered code.
    async fn verify_otp(
        &self,
        session: &Session,
        code: &str,
        code_hash: &str,
    ) -> std::result::Result<AuthGrant, PlatformError>;

    async fn list_dialogs(
        &self,
        session_id: &str,
    ) -> std::result::Result<Vec<Dialog>, PlatformError>;

    /// Repost as a native forward, attribution preserved. Returns the
    /// destination message id.
    async fn forward(
        &self,
        session_id: &str,
        source_ref: &str,
        dest_ref: &str,
        source_msg_id: i64,
        silent: bool,
    ) -> std::result::Result<i64, PlatformError>;

    /// Post the snapshot as a new message, attribution stripped.
    async fn copy(
        &self,
        session_id: &str,
        dest_ref: &str,
        payload: &MessageSnapshot,
        silent: bool,
    ) -> std::result::Result<i64, PlatformError>;

    /// Lightweight liveness RPC.
    async fn health_ping(&self, session_id: &str) -> std::result::Result<(), PlatformError>;

    async fn close(&self, session_id: &str) -> std::result::Result<(), PlatformError>;
}

struct OpenSession {
    user_id: String,
    ingress_tx: broadcast::Sender<UpdateEvent>,
    pump: JoinHandle<()>,
}

/// Per-session client registry. One open client per usable session; the
/// ingress stream is re-published on a bounded broadcast buffer where the
/// oldest update is dropped on overflow, in preference to back-pressuring
/// the whole process for one stuck pair.
pub struct ClientPool {
    client: Arc<dyn PlatformClient>,
    store: Arc<dyn Store>,
    ingress_buffer: usize,
    sessions: DashMap<String, OpenSession>,
}

impl ClientPool {
    pub fn new(client: Arc<dyn PlatformClient>, store: Arc<dyn Store>, ingress_buffer: usize) -> Self {
        Self {
            client,
            store,
            ingress_buffer,
            sessions: DashMap::new(),
        }
    }

    pub fn client(&self) -> &Arc<dyn PlatformClient> {
        &self.client
    }

    /// Open a client for the session and start pumping its updates. A
    /// session must be active and hold credentials before it may be used.
    pub async fn open_session(&self, session: &Session) -> Result<()> {
        if !session.is_usable() {
            return Err(ClientError::SessionNotUsable(session.id.clone()));
        }
        if self.sessions.contains_key(&session.id) {
            debug!(session_id = %session.id, "Session already open");
            return Ok(());
        }

        let mut raw_rx = self.client.open(session).await?;
        let (ingress_tx, _) = broadcast::channel(self.ingress_buffer);

        let tx = ingress_tx.clone();
        let store = self.store.clone();
        let session_id = session.id.clone();
        let user_id = session.user_id.clone();
        let capacity = self.ingress_buffer;

        let pump = tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                if tx.len() >= capacity {
                    // The broadcast buffer evicts the oldest update.
                    warn!(session_id = %session_id, "Ingress buffer full, dropping oldest update");
                    metrics::counter!("afx.ingress.dropped_total").increment(1);
                    let entry = ActivityEntry::new(
                        &user_id,
                        ActivityKind::IngressOverflow,
                        "Ingress buffer full, oldest update dropped",
                    )
                    .with_session(&session_id);
                    if let Err(e) = store.append_activity(&entry).await {
                        warn!(error = %e, "Failed to record ingress overflow");
                    }
                }
                // No subscribers yet means the update is dropped; the
                // router subscribes immediately after open.
                let _ = tx.send(event);
            }
            debug!(session_id = %session_id, "Ingress pump exited");
        });

        self.sessions.insert(
            session.id.clone(),
            OpenSession {
                user_id: session.user_id.clone(),
                ingress_tx,
                pump,
            },
        );

        info!(session_id = %session.id, "Platform client opened");
        Ok(())
    }

    /// Subscribe to a session's update stream. A slow subscriber observes
    /// `Lagged` when the buffer wrapped.
    pub fn subscribe(&self, session_id: &str) -> Result<broadcast::Receiver<UpdateEvent>> {
        self.sessions
            .get(session_id)
            .map(|s| s.ingress_tx.subscribe())
            .ok_or_else(|| ClientError::SessionNotOpen(session_id.to_string()))
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn open_session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn owner_of(&self, session_id: &str) -> Option<String> {
        self.sessions.get(session_id).map(|s| s.user_id.clone())
    }

    /// Close the client and stop the ingress pump.
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        if let Some((_, open)) = self.sessions.remove(session_id) {
            open.pump.abort();
            self.client.close(session_id).await?;
            info!(session_id, "Platform client closed");
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        for session_id in self.open_session_ids() {
            if let Err(e) = self.close_session(&session_id).await {
                warn!(session_id = %session_id, error = %e, "Failed to close session");
            }
        }
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    pub async fn send_otp(&self, session: &Session, phone: &str) -> Result<String> {
        Ok(self.client.send_otp(session, phone).await?)
    }

    /// Verify the user-entered code and persist the resulting credentials.
    /// This is the only write path for `credential_blob`.
    pub async fn verify_otp(&self, session: &Session, code: &str, code_hash: &str) -> Result<AuthGrant> {
        let grant = self.client.verify_otp(session, code, code_hash).await?;
        self.store
            .update_session_credentials(
                &session.id,
                &grant.credential_blob,
                grant.display_name.as_deref(),
            )
            .await?;
        self.store
            .append_activity(
                &ActivityEntry::new(
                    &session.user_id,
                    ActivityKind::SessionConnected,
                    "Session authorized",
                )
                .with_session(&session.id),
            )
            .await?;
        Ok(grant)
    }

    // ========================================================================
    // Send primitives
    // ========================================================================

    pub async fn list_dialogs(&self, session_id: &str) -> Result<Vec<Dialog>> {
        self.require_open(session_id)?;
        Ok(self.client.list_dialogs(session_id).await?)
    }

    pub async fn forward(
        &self,
        session_id: &str,
        source_ref: &str,
        dest_ref: &str,
        source_msg_id: i64,
        silent: bool,
    ) -> Result<i64> {
        self.require_open(session_id)?;
        Ok(self
            .client
            .forward(session_id, source_ref, dest_ref, source_msg_id, silent)
            .await?)
    }

    pub async fn copy(
        &self,
        session_id: &str,
        dest_ref: &str,
        payload: &MessageSnapshot,
        silent: bool,
    ) -> Result<i64> {
        self.require_open(session_id)?;
        Ok(self.client.copy(session_id, dest_ref, payload, silent).await?)
    }

    pub async fn health_ping(&self, session_id: &str) -> Result<()> {
        self.require_open(session_id)?;
        Ok(self.client.health_ping(session_id).await?)
    }

    /// Record a successful probe time against the session row.
    pub async fn touch_health(&self, session_id: &str) -> Result<()> {
        self.store.touch_session_health(session_id, Utc::now()).await?;
        Ok(())
    }

    fn require_open(&self, session_id: &str) -> Result<()> {
        if self.sessions.contains_key(session_id) {
            Ok(())
        } else {
            Err(ClientError::SessionNotOpen(session_id.to_string()))
        }
    }
}
