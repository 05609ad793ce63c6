//! Delivery queue workers.
//!
//! A pool of workers repeatedly claims due queue items and dispatches
//! them through the client pool, gated by the anti-ban controller and the
//! per-session rate budget. Retries are explicit reschedules; a worker
//! never sleeps while holding an item.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use afx_client::{ClientError, ClientPool};
use afx_common::{ActivityEntry, ActivityKind, Pair, PairState, PlatformError, QueueItem};
use afx_store::{Store, StoreError};

use crate::antiban::{AntiBanController, SendGate};
use crate::router::IngressRouter;
use crate::supervisor::SessionSignal;

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub workers: u32,
    pub claim_batch: u32,
    pub max_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            claim_batch: 32,
            max_attempts: 3,
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct DeliveryQueue {
    store: Arc<dyn Store>,
    pool: Arc<ClientPool>,
    antiban: Arc<AntiBanController>,
    router: Arc<IngressRouter>,
    config: DeliveryConfig,
    supervisor_tx: mpsc::UnboundedSender<SessionSignal>,
    running: AtomicBool,
    paused: AtomicBool,
    in_flight: Arc<AtomicU32>,
    pair_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl DeliveryQueue {
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<ClientPool>,
        antiban: Arc<AntiBanController>,
        router: Arc<IngressRouter>,
        config: DeliveryConfig,
        supervisor_tx: mpsc::UnboundedSender<SessionSignal>,
    ) -> Self {
        Self {
            store,
            pool,
            antiban,
            router,
            config,
            supervisor_tx,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            in_flight: Arc::new(AtomicU32::new(0)),
            pair_locks: DashMap::new(),
            workers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            workers = self.config.workers,
            claim_batch = self.config.claim_batch,
            "Starting delivery workers"
        );
        let mut handles = self.workers.lock();
        for worker_id in 0..self.config.workers {
            let queue = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                queue.worker_loop(worker_id).await;
            }));
        }
    }

    /// Stop claiming new items. In-flight sends finish.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Delivery queue paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Delivery queue resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop workers and wait for in-flight sends within the budget, then
    /// roll any still-claimed items back to pending.
    pub async fn drain(&self, budget: Duration) {
        self.running.store(false, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + budget;

        loop {
            let busy = self.in_flight.load(Ordering::SeqCst);
            if busy == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(in_flight = busy, "Drain budget exhausted with sends in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }

        match self.store.release_all_processing().await {
            Ok(released) if released > 0 => {
                info!(released, "Rolled processing items back to pending on drain")
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to release processing items on drain"),
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: u32) {
        debug!(worker_id, "Delivery worker started");

        while self.running.load(Ordering::SeqCst) {
            if self.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            let items = match self
                .store
                .claim_due(Utc::now(), self.config.claim_batch)
                .await
            {
                Ok(items) => items,
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to claim due items");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if items.is_empty() {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            metrics::counter!("afx.queue.claimed_total").increment(items.len() as u64);

            // Claimed order is scheduled_at order; keep it.
            for item in items {
                if !self.running.load(Ordering::SeqCst) {
                    // Shutting down mid-batch: give the item back untouched.
                    if let Err(e) = self.store.release_item(&item.id).await {
                        warn!(error = %e, item_id = %item.id, "Failed to release item");
                    }
                    continue;
                }
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                self.process_item(item).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        }

        debug!(worker_id, "Delivery worker exited");
    }

    async fn process_item(&self, item: QueueItem) {
        let pair = match self.store.get_pair(&item.pair_id).await {
            Ok(pair) => pair,
            Err(StoreError::NotFound(_)) => {
                // Pair deleted after the claim; the cascade cleared its
                // items already.
                debug!(item_id = %item.id, "Pair gone, skipping claimed item");
                return;
            }
            Err(e) => {
                error!(error = %e, item_id = %item.id, "Pair lookup failed, releasing item");
                let _ = self.store.release_item(&item.id).await;
                return;
            }
        };

        if pair.state != PairState::Active {
            // The pair may be resumed later; check again in a minute.
            let _ = self
                .store
                .reschedule_item(&item.id, Utc::now() + ChronoDuration::seconds(60))
                .await;
            return;
        }

        match self.antiban.check_send(&pair.session_id) {
            SendGate::Allow => {}
            SendGate::Halted => {
                debug!(
                    item_id = %item.id,
                    session_id = %pair.session_id,
                    "Session halted, deferring item"
                );
                let _ = self
                    .store
                    .reschedule_item(&item.id, Utc::now() + ChronoDuration::seconds(60))
                    .await;
                return;
            }
            SendGate::RescheduleAt(at) => {
                debug!(
                    item_id = %item.id,
                    session_id = %pair.session_id,
                    at = %at,
                    "Rate budget exhausted, deferring item"
                );
                metrics::counter!("afx.delivery.deferred_total").increment(1);
                let _ = self.store.reschedule_item(&item.id, at).await;
                return;
            }
        }

        let result = if pair.serialized {
            let lock = self
                .pair_locks
                .entry(pair.id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            let _guard = lock.lock().await;
            self.send(&pair, &item).await
        } else {
            self.send(&pair, &item).await
        };

        match result {
            Ok(dest_msg_id) => self.handle_success(&pair, &item, dest_msg_id).await,
            Err(e) => self.handle_failure(&pair, &item, e).await,
        }
    }

    async fn send(&self, pair: &Pair, item: &QueueItem) -> Result<i64, ClientError> {
        if pair.copy_mode {
            self.pool
                .copy(&pair.session_id, &item.destination_ref, &item.payload, pair.silent)
                .await
        } else {
            self.pool
                .forward(
                    &pair.session_id,
                    &item.source_ref,
                    &item.destination_ref,
                    item.source_message_id,
                    pair.silent,
                )
                .await
        }
    }

    async fn handle_success(&self, pair: &Pair, item: &QueueItem, dest_msg_id: i64) {
        let now = Utc::now();
        self.antiban.record_send(&pair.session_id).await;

        if let Err(e) = self.store.complete_item(&item.id, now).await {
            error!(error = %e, item_id = %item.id, "Failed to complete item");
        }
        if let Err(e) = self.store.record_pair_success(&pair.id, now).await {
            warn!(error = %e, pair_id = %pair.id, "Failed to record success");
        }

        metrics::counter!("afx.delivery.sent_total").increment(1);
        info!(
            pair_id = %pair.id,
            item_id = %item.id,
            message_id = item.source_message_id,
            copied = pair.copy_mode,
            "Message forwarded"
        );

        let entry = ActivityEntry::new(
            &pair.user_id,
            ActivityKind::MessageForwarded,
            format!("Message {} delivered to {}", item.source_message_id, item.destination_ref),
        )
        .with_pair(&pair.id)
        .with_session(&pair.session_id);
        if let Err(e) = self.store.append_activity(&entry).await {
            warn!(error = %e, "Failed to record forward activity");
        }

        if pair.chain {
            match self
                .router
                .chain_republish(
                    &pair.session_id,
                    &pair.destination_ref,
                    dest_msg_id,
                    item.payload.clone(),
                )
                .await
            {
                Ok(true) => debug!(pair_id = %pair.id, "Chain event republished"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, pair_id = %pair.id, "Chain republish failed"),
            }
        }
    }

    async fn handle_failure(&self, pair: &Pair, item: &QueueItem, error: ClientError) {
        let now = Utc::now();

        let platform_error = match error {
            ClientError::Platform(e) => e,
            ClientError::SessionNotOpen(_) | ClientError::SessionNotUsable(_) => {
                // The supervisor is reconnecting; check back shortly
                // without consuming an attempt.
                debug!(item_id = %item.id, session_id = %pair.session_id, "Session not open, deferring");
                let _ = self
                    .store
                    .reschedule_item(&item.id, now + ChronoDuration::seconds(30))
                    .await;
                return;
            }
            ClientError::Store(e) => {
                error!(error = %e, item_id = %item.id, "Store failure during send, releasing item");
                let _ = self.store.release_item(&item.id).await;
                return;
            }
        };

        // Ban indicators pre-empt normal failure handling.
        if self.antiban.observe_error(&pair.session_id, &platform_error).await {
            self.fail_terminal(pair, item, &platform_error.to_string(), now).await;
            return;
        }

        match platform_error {
            PlatformError::RateLimited { wait_s } => {
                metrics::counter!("afx.delivery.rate_limited_total").increment(1);
                self.antiban
                    .record_rate_limited(&pair.session_id, wait_s)
                    .await;
                // Platform-imposed wait; the attempt is not consumed.
                let _ = self
                    .store
                    .reschedule_item(&item.id, now + ChronoDuration::seconds(wait_s as i64))
                    .await;
            }
            PlatformError::AuthExpired => {
                self.fail_terminal(pair, item, "session authorization expired", now)
                    .await;
                if self
                    .supervisor_tx
                    .send(SessionSignal::AuthExpired(pair.session_id.clone()))
                    .is_err()
                {
                    warn!(session_id = %pair.session_id, "Supervisor signal channel closed");
                }
            }
            PlatformError::PeerInvalid(ref reason) | PlatformError::ContentRejected(ref reason) => {
                self.fail_terminal(pair, item, reason, now).await;
            }
            PlatformError::TransientNetwork(ref reason) | PlatformError::Unknown(ref reason) => {
                self.retry_or_fail(pair, item, reason, now).await;
            }
        }
    }

    async fn retry_or_fail(
        &self,
        pair: &Pair,
        item: &QueueItem,
        reason: &str,
        now: chrono::DateTime<Utc>,
    ) {
        let attempts = item.attempts + 1;
        if attempts >= self.config.max_attempts as i32 {
            self.fail_terminal(pair, item, reason, now).await;
            return;
        }

        // Exponential backoff on the consumed attempt count.
        let backoff = ChronoDuration::seconds(60 * (1i64 << attempts));
        debug!(
            item_id = %item.id,
            attempts,
            backoff_s = backoff.num_seconds(),
            "Transient failure, retrying"
        );
        if let Err(e) = self.store.retry_item(&item.id, reason, now + backoff).await {
            error!(error = %e, item_id = %item.id, "Failed to schedule retry");
        }
    }

    async fn fail_terminal(
        &self,
        pair: &Pair,
        item: &QueueItem,
        reason: &str,
        now: chrono::DateTime<Utc>,
    ) {
        metrics::counter!("afx.delivery.failed_total").increment(1);
        warn!(
            item_id = %item.id,
            pair_id = %pair.id,
            reason,
            "Delivery failed terminally"
        );

        if let Err(e) = self.store.fail_item(&item.id, reason, now).await {
            error!(error = %e, item_id = %item.id, "Failed to mark item failed");
        }
        if let Err(e) = self.store.record_pair_failure(&pair.id, now).await {
            warn!(error = %e, pair_id = %pair.id, "Failed to record failure");
        }

        let entry = ActivityEntry::new(
            &pair.user_id,
            ActivityKind::DeliveryFailed,
            format!("Delivery of message {} failed: {reason}", item.source_message_id),
        )
        .with_pair(&pair.id)
        .with_session(&pair.session_id);
        if let Err(e) = self.store.append_activity(&entry).await {
            warn!(error = %e, "Failed to record delivery failure");
        }
    }
}
