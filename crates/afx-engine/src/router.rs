//! Ingress router.
//!
//! Resolves which pairs subscribe to an inbound update, runs the filter
//! pipeline per pair, and enqueues surviving work with the pair's random
//! delay. Chain forwarding re-enters here after a successful send, behind
//! a per-session LRU guard that rejects re-emission of a recently emitted
//! `(source_ref, message_id)` tuple.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use afx_common::{
    ActivityEntry, ActivityKind, MessageSnapshot, Pair, UpdateEvent, User,
};
use afx_store::{EnqueueOutcome, NewQueueItem, Store};

use crate::filter::{FilterPipeline, FilterVerdict};
use crate::Result;

/// Chain loop guard size per session.
const CHAIN_GUARD_CAPACITY: usize = 1024;
/// A tuple emitted within this window blocks re-emission.
const CHAIN_GUARD_WINDOW: StdDuration = StdDuration::from_secs(60);

#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    pub enforce_daily_cap: bool,
}

/// Accounting for one routed event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteSummary {
    pub matched_pairs: usize,
    pub enqueued: usize,
    pub filtered: usize,
    pub duplicates: usize,
}

type ChainGuard = Mutex<LruCache<(String, i64), Instant>>;

pub struct IngressRouter {
    store: Arc<dyn Store>,
    filters: FilterPipeline,
    options: RouterOptions,
    chain_guards: DashMap<String, Arc<ChainGuard>>,
}

impl IngressRouter {
    pub fn new(store: Arc<dyn Store>, filters: FilterPipeline, options: RouterOptions) -> Self {
        Self {
            store,
            filters,
            options,
            chain_guards: DashMap::new(),
        }
    }

    /// Route one inbound update to every subscribed active pair.
    pub async fn handle_event(&self, event: &UpdateEvent) -> Result<RouteSummary> {
        metrics::counter!("afx.ingress.events_total").increment(1);

        let pairs = self
            .store
            .pairs_for_source(&event.session_id, &event.source_ref)
            .await?;

        let mut summary = RouteSummary {
            matched_pairs: pairs.len(),
            ..Default::default()
        };
        if pairs.is_empty() {
            return Ok(summary);
        }

        let mut users: HashMap<String, User> = HashMap::new();
        let mut daily_counts: HashMap<String, u64> = HashMap::new();

        for pair in &pairs {
            let user = match users.get(&pair.user_id) {
                Some(user) => user.clone(),
                None => {
                    let user = self.store.get_user(&pair.user_id).await?;
                    users.insert(pair.user_id.clone(), user.clone());
                    user
                }
            };

            if self.options.enforce_daily_cap {
                let count = match daily_counts.get(&user.id) {
                    Some(count) => *count,
                    None => {
                        let count = self.store.count_events_today(&user.id).await?;
                        daily_counts.insert(user.id.clone(), count);
                        count
                    }
                };
                if count >= user.limits().msgs_per_day as u64 {
                    self.drop_for_daily_cap(&user, pair).await?;
                    summary.filtered += 1;
                    continue;
                }
            }

            match self.filters.evaluate(&user, pair, event).await? {
                FilterVerdict::Drop(reason) => {
                    debug!(
                        pair_id = %pair.id,
                        message_id = event.message_id,
                        reason = reason.as_str(),
                        "Event dropped by filter"
                    );
                    metrics::counter!("afx.ingress.filtered_total").increment(1);
                    self.store.record_pair_filtered(&pair.id).await?;
                    summary.filtered += 1;
                }
                FilterVerdict::Accept(snapshot) => {
                    match self.enqueue_for_pair(pair, event, snapshot).await? {
                        EnqueueOutcome::Enqueued(_) => summary.enqueued += 1,
                        EnqueueOutcome::Duplicate(id) => {
                            debug!(
                                pair_id = %pair.id,
                                message_id = event.message_id,
                                existing = %id,
                                "Duplicate event, already queued"
                            );
                            summary.duplicates += 1;
                        }
                    }
                    // Daily counter advances with accepted work.
                    if let Some(count) = daily_counts.get_mut(&pair.user_id) {
                        *count += 1;
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Re-enter the router with a synthetic event observed on a chain
    /// pair's destination. Returns false when the loop guard rejected it.
    pub async fn chain_republish(
        &self,
        session_id: &str,
        source_ref: &str,
        message_id: i64,
        snapshot: MessageSnapshot,
    ) -> Result<bool> {
        let guard = self
            .chain_guards
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(LruCache::new(
                    NonZeroUsize::new(CHAIN_GUARD_CAPACITY).expect("non-zero capacity"),
                )))
            })
            .clone();

        {
            let mut cache = guard.lock();
            let key = (source_ref.to_string(), message_id);
            if let Some(emitted_at) = cache.get(&key) {
                if emitted_at.elapsed() < CHAIN_GUARD_WINDOW {
                    warn!(
                        session_id,
                        source_ref, message_id, "Chain re-emission rejected by loop guard"
                    );
                    metrics::counter!("afx.ingress.chain_loops_total").increment(1);
                    return Ok(false);
                }
            }
            cache.put(key, Instant::now());
        }

        let event = UpdateEvent {
            session_id: session_id.to_string(),
            kind: afx_common::EventKind::New,
            source_ref: source_ref.to_string(),
            message_id,
            snapshot,
        };
        self.handle_event(&event).await?;
        Ok(true)
    }

    async fn enqueue_for_pair(
        &self,
        pair: &Pair,
        event: &UpdateEvent,
        snapshot: MessageSnapshot,
    ) -> Result<EnqueueOutcome> {
        let delay_s = if pair.delay_max_s > pair.delay_min_s {
            rand::thread_rng().gen_range(pair.delay_min_s..=pair.delay_max_s)
        } else {
            pair.delay_min_s
        };

        let item = NewQueueItem {
            pair_id: pair.id.clone(),
            source_message_id: event.message_id,
            source_ref: event.source_ref.clone(),
            destination_ref: pair.destination_ref.clone(),
            payload: snapshot,
            kind: event.kind,
            scheduled_at: Utc::now() + ChronoDuration::seconds(delay_s as i64),
        };
        Ok(self.store.enqueue(item).await?)
    }

    async fn drop_for_daily_cap(&self, user: &User, pair: &Pair) -> Result<()> {
        debug!(pair_id = %pair.id, user_id = %user.id, "Event dropped, daily cap reached");
        metrics::counter!("afx.ingress.daily_cap_total").increment(1);
        self.store.record_pair_filtered(&pair.id).await?;
        let entry = ActivityEntry::new(
            &user.id,
            ActivityKind::DailyCapReached,
            format!(
                "Daily message cap of {} reached, event dropped",
                user.limits().msgs_per_day
            ),
        )
        .with_pair(&pair.id);
        self.store.append_activity(&entry).await?;
        Ok(())
    }
}
