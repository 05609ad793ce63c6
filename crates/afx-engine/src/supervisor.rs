//! Session supervisor.
//!
//! Keeps a platform client open for every active session, probes health
//! on an interval, reconnects with exponential backoff, and deactivates a
//! session after repeated failures or expired authorization. Deactivation
//! pauses all of the session's pairs and requires the user to
//! re-authenticate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use afx_client::{ClientError, ClientPool};
use afx_common::{ActivityEntry, ActivityKind, PairState, PlatformError, Session, SessionHealth};
use afx_store::Store;

use crate::antiban::AntiBanController;
use crate::router::IngressRouter;

const RECENT_ERRORS_KEPT: usize = 5;

/// Out-of-band nudges from other components.
#[derive(Debug, Clone)]
pub enum SessionSignal {
    /// A send failed with expired authorization.
    AuthExpired(String),
    /// Admin-driven immediate probe/reconnect.
    TriggerHealth(String),
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub health_interval: Duration,
    /// Failures tolerated before the next one deactivates the session.
    pub max_failures: u32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(300),
            max_failures: 3,
            reconnect_base: Duration::from_secs(30),
            reconnect_max: Duration::from_secs(15 * 60),
        }
    }
}

pub struct SessionSupervisor {
    store: Arc<dyn Store>,
    pool: Arc<ClientPool>,
    antiban: Arc<AntiBanController>,
    router: Arc<IngressRouter>,
    config: SupervisorConfig,
    health: DashMap<String, SessionHealth>,
    reconnect_at: DashMap<String, DateTime<Utc>>,
    ingress_tasks: DashMap<String, JoinHandle<()>>,
    signal_tx: mpsc::UnboundedSender<SessionSignal>,
    signal_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<SessionSignal>>>,
    running: AtomicBool,
}

impl SessionSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<ClientPool>,
        antiban: Arc<AntiBanController>,
        router: Arc<IngressRouter>,
        config: SupervisorConfig,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            store,
            pool,
            antiban,
            router,
            config,
            health: DashMap::new(),
            reconnect_at: DashMap::new(),
            ingress_tasks: DashMap::new(),
            signal_tx,
            signal_rx: parking_lot::Mutex::new(Some(signal_rx)),
            running: AtomicBool::new(false),
        }
    }

    /// Sender for components that need to nudge the supervisor.
    pub fn signal_sender(&self) -> mpsc::UnboundedSender<SessionSignal> {
        self.signal_tx.clone()
    }

    /// Rebuild health projections and open clients for every active
    /// session. Called once at startup.
    pub async fn bootstrap(&self) -> crate::Result<()> {
        let sessions = self.store.list_active_sessions().await?;
        info!(count = sessions.len(), "Bootstrapping sessions");
        for session in sessions {
            self.health
                .insert(session.id.clone(), SessionHealth::new(&session.id));
            self.try_open(&session).await;
        }
        Ok(())
    }

    /// Run the supervision loop until shutdown is signalled.
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let supervisor = Arc::clone(self);
        let mut signal_rx = supervisor
            .signal_rx
            .lock()
            .take()
            .expect("supervisor started twice");

        tokio::spawn(async move {
            let mut probe = tokio::time::interval(supervisor.config.health_interval);
            probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; bootstrap just probed.
            probe.tick().await;

            let mut reconnect = tokio::time::interval(Duration::from_secs(5));
            reconnect.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = probe.tick() => supervisor.probe_all().await,
                    _ = reconnect.tick() => supervisor.check_reconnects().await,
                    signal = signal_rx.recv() => match signal {
                        Some(signal) => supervisor.handle_signal(signal).await,
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
                if !supervisor.running.load(Ordering::SeqCst) {
                    break;
                }
            }
            debug!("Supervisor loop exited");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for entry in self.ingress_tasks.iter() {
            entry.value().abort();
        }
    }

    pub fn health_of(&self, session_id: &str) -> Option<SessionHealth> {
        self.health.get(session_id).map(|h| h.value().clone())
    }

    pub fn all_health(&self) -> Vec<SessionHealth> {
        self.health.iter().map(|h| h.value().clone()).collect()
    }

    /// Probe every supervised session that has an open client, and sweep
    /// closed-but-active sessions back into the reconnect schedule.
    pub async fn probe_all(&self) {
        let ids: Vec<String> = self.health.iter().map(|h| h.key().clone()).collect();
        for session_id in ids {
            if self.pool.is_open(&session_id) {
                self.probe_session(&session_id).await;
            } else if !self.reconnect_at.contains_key(&session_id) {
                if let Ok(session) = self.store.get_session(&session_id).await {
                    if session.is_usable() {
                        self.reconnect_at.insert(session_id, Utc::now());
                    }
                }
            }
        }
    }

    /// Probe one session now.
    pub async fn probe_session(&self, session_id: &str) {
        match self.pool.health_ping(session_id).await {
            Ok(()) => {
                self.mark_healthy(session_id).await;
            }
            Err(e) => self.handle_failure(session_id, e).await,
        }
    }

    async fn handle_signal(&self, signal: SessionSignal) {
        match signal {
            SessionSignal::AuthExpired(session_id) => {
                self.deactivate(&session_id, "session authorization expired")
                    .await;
            }
            SessionSignal::TriggerHealth(session_id) => {
                info!(session_id = %session_id, "Manual health trigger");
                if self.pool.is_open(&session_id) {
                    self.probe_session(&session_id).await;
                } else {
                    self.reconnect_at.insert(session_id.clone(), Utc::now());
                    self.check_reconnects().await;
                }
            }
        }
    }

    async fn check_reconnects(&self) {
        let now = Utc::now();
        let due: Vec<String> = self
            .reconnect_at
            .iter()
            .filter(|e| *e.value() <= now)
            .map(|e| e.key().clone())
            .collect();

        for session_id in due {
            self.reconnect_at.remove(&session_id);
            let session = match self.store.get_session(&session_id).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Session lookup failed for reconnect");
                    continue;
                }
            };
            if !session.is_usable() {
                debug!(session_id = %session_id, "Session no longer usable, dropping reconnect");
                continue;
            }
            info!(session_id = %session_id, "Reconnecting session");
            self.try_open(&session).await;
        }
    }

    async fn try_open(&self, session: &Session) {
        self.antiban.register_session(&session.id);
        match self.pool.open_session(session).await {
            Ok(()) => {
                self.spawn_ingress(&session.id);
                self.mark_healthy(&session.id).await;
                info!(session_id = %session.id, "Session connected");
            }
            Err(ClientError::Platform(PlatformError::AuthExpired)) => {
                self.deactivate(&session.id, "session authorization expired")
                    .await;
            }
            Err(e) => {
                self.handle_failure(&session.id, e).await;
            }
        }
    }

    /// Drain the session's update stream into the ingress router.
    fn spawn_ingress(&self, session_id: &str) {
        let mut rx = match self.pool.subscribe(session_id) {
            Ok(rx) => rx,
            Err(e) => {
                error!(session_id, error = %e, "Cannot subscribe to session updates");
                return;
            }
        };
        let router = Arc::clone(&self.router);
        let id = session_id.to_string();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = router.handle_event(&event).await {
                            warn!(session_id = %id, error = %e, "Failed to route update");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session_id = %id, skipped, "Ingress consumer lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(session_id = %id, "Ingress task exited");
        });

        if let Some(old) = self.ingress_tasks.insert(session_id.to_string(), task) {
            old.abort();
        }
    }

    async fn mark_healthy(&self, session_id: &str) {
        let mut entry = self
            .health
            .entry(session_id.to_string())
            .or_insert_with(|| SessionHealth::new(session_id));
        entry.healthy = true;
        entry.consecutive_failures = 0;
        entry.last_check = Some(Utc::now());
        drop(entry);

        if let Err(e) = self.pool.touch_health(session_id).await {
            warn!(session_id, error = %e, "Failed to persist health check time");
        }
    }

    async fn handle_failure(&self, session_id: &str, error: ClientError) {
        if matches!(
            error,
            ClientError::Platform(PlatformError::AuthExpired)
        ) {
            self.deactivate(session_id, "session authorization expired")
                .await;
            return;
        }

        let failures = {
            let mut entry = self
                .health
                .entry(session_id.to_string())
                .or_insert_with(|| SessionHealth::new(session_id));
            entry.healthy = false;
            entry.consecutive_failures += 1;
            entry.last_check = Some(Utc::now());
            entry.recent_errors.push(error.to_string());
            let overflow = entry.recent_errors.len().saturating_sub(RECENT_ERRORS_KEPT);
            if overflow > 0 {
                entry.recent_errors.drain(..overflow);
            }
            entry.consecutive_failures
        };

        // Tolerate max_failures; the failure after that deactivates.
        if failures > self.config.max_failures {
            self.deactivate(session_id, "health checks exhausted").await;
            return;
        }

        let backoff = self
            .config
            .reconnect_base
            .saturating_mul(1u32 << failures.min(16))
            .min(self.config.reconnect_max);
        warn!(
            session_id,
            failures,
            backoff_s = backoff.as_secs(),
            error = %error,
            "Session unhealthy, scheduling reconnect"
        );
        metrics::counter!("afx.supervisor.ping_failures_total").increment(1);

        // Tear the client down so the reconnect starts clean.
        if let Err(e) = self.pool.close_session(session_id).await {
            debug!(session_id, error = %e, "Close before reconnect failed");
        }
        self.reconnect_at.insert(
            session_id.to_string(),
            Utc::now() + ChronoDuration::from_std(backoff).unwrap_or(ChronoDuration::seconds(30)),
        );

        if let Ok(session) = self.store.get_session(session_id).await {
            let entry = ActivityEntry::new(
                &session.user_id,
                ActivityKind::SessionReconnecting,
                format!("Health check failed ({failures}), reconnect in {}s", backoff.as_secs()),
            )
            .with_session(session_id);
            if let Err(e) = self.store.append_activity(&entry).await {
                warn!(error = %e, "Failed to record reconnect activity");
            }
        }
    }

    /// Mark the session inactive, pause its pairs, and tear down the
    /// client. Requires user re-authentication to recover.
    pub async fn deactivate(&self, session_id: &str, reason: &str) {
        warn!(session_id, reason, "Deactivating session");
        metrics::counter!("afx.supervisor.deactivations_total").increment(1);

        let user_id = match self.store.get_session(session_id).await {
            Ok(session) => Some(session.user_id),
            Err(e) => {
                warn!(session_id, error = %e, "Session lookup failed during deactivation");
                None
            }
        };

        if let Err(e) = self.store.set_session_active(session_id, false).await {
            error!(session_id, error = %e, "Failed to mark session inactive");
        }
        let paused = match self
            .store
            .set_session_pairs_state(session_id, PairState::Active, PairState::Paused)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                error!(session_id, error = %e, "Failed to pause session pairs");
                Vec::new()
            }
        };

        if let Some(user_id) = user_id {
            let entry = ActivityEntry::new(
                &user_id,
                ActivityKind::SessionDeactivated,
                format!("Session deactivated: {reason}"),
            )
            .with_session(session_id)
            .with_metadata(serde_json::json!({ "paused_pairs": paused }));
            if let Err(e) = self.store.append_activity(&entry).await {
                warn!(error = %e, "Failed to record deactivation");
            }
        }

        if let Err(e) = self.pool.close_session(session_id).await {
            debug!(session_id, error = %e, "Close during deactivation failed");
        }
        if let Some(task) = self.ingress_tasks.remove(session_id) {
            task.1.abort();
        }
        self.reconnect_at.remove(session_id);

        if let Some(mut entry) = self.health.get_mut(session_id) {
            entry.healthy = false;
            entry.last_check = Some(Utc::now());
        }
    }

    /// Re-adopt a session after the user re-authenticated: clears any ban
    /// state and connects immediately.
    pub async fn adopt_session(&self, session_id: &str) {
        self.antiban.reset_session(session_id);
        self.health
            .insert(session_id.to_string(), SessionHealth::new(session_id));
        if let Ok(session) = self.store.get_session(session_id).await {
            if session.is_usable() {
                self.try_open(&session).await;
            }
        }
    }

    /// Stop supervising a session (control-plane disconnect/delete).
    pub async fn drop_session(&self, session_id: &str) {
        if let Some(task) = self.ingress_tasks.remove(session_id) {
            task.1.abort();
        }
        self.reconnect_at.remove(session_id);
        self.health.remove(session_id);
        self.antiban.remove_session(session_id);
        if let Err(e) = self.pool.close_session(session_id).await {
            debug!(session_id, error = %e, "Close on drop failed");
        }
    }
}
