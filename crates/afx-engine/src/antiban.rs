//! Anti-ban controller.
//!
//! Tracks per-session send counters against the configured minute/hour
//! budgets, derives a protection level from how much of the budget is
//! consumed, and turns that level into a throttle on outbound sends. Ban
//! indicators from the platform trigger an emergency stop that pauses
//! every pair of the session.
//!
//! Counters are per-session and never shared. The level can only worsen
//! from observed traffic; `banned` is sticky until the session is reset
//! after a successful re-authentication.

use std::num::NonZeroU32;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use afx_common::{ActivityEntry, ActivityKind, PairState, PlatformError, RateLevel, RateStateSnapshot};
use afx_store::Store;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// How long a rate-limit error keeps contributing to the adaptive
/// multiplier.
const RATE_LIMIT_MEMORY_SECS: i64 = 600;

#[derive(Debug, Clone)]
pub struct AntiBanConfig {
    pub per_minute: u32,
    pub per_hour: u32,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
}

impl Default for AntiBanConfig {
    fn default() -> Self {
        Self {
            per_minute: 20,
            per_hour: 300,
            warning_threshold: 0.80,
            critical_threshold: 0.95,
        }
    }
}

/// Decision for a send attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SendGate {
    /// Budget and pacing allow the send now.
    Allow,
    /// Try again at the given time (budget window exhausted or pacing).
    RescheduleAt(DateTime<Utc>),
    /// The session is halted (banned level); do not send.
    Halted,
}

struct RateState {
    msgs_this_minute: u32,
    msgs_this_hour: u32,
    minute_window_start: DateTime<Utc>,
    hour_window_start: DateTime<Utc>,
    level: RateLevel,
    throttle_multiplier: f64,
    warning_count: u32,
    recent_rate_limits: Vec<DateTime<Utc>>,
}

impl RateState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            msgs_this_minute: 0,
            msgs_this_hour: 0,
            minute_window_start: now,
            hour_window_start: now,
            level: RateLevel::Safe,
            throttle_multiplier: 1.0,
            warning_count: 0,
            recent_rate_limits: Vec::new(),
        }
    }

    fn roll_windows(&mut self, now: DateTime<Utc>) {
        if now - self.minute_window_start >= ChronoDuration::seconds(60) {
            self.msgs_this_minute = 0;
            self.minute_window_start = now;
        }
        if now - self.hour_window_start >= ChronoDuration::seconds(3600) {
            self.msgs_this_hour = 0;
            self.hour_window_start = now;
        }
        self.recent_rate_limits
            .retain(|t| now - *t < ChronoDuration::seconds(RATE_LIMIT_MEMORY_SECS));
    }
}

struct SessionRate {
    state: Mutex<RateState>,
    /// Pacing limiter at the effective per-minute rate. Swapped in place
    /// when the throttle multiplier changes.
    limiter: parking_lot::RwLock<Arc<DirectLimiter>>,
    limiter_rate: parking_lot::RwLock<u32>,
}

pub struct AntiBanController {
    config: AntiBanConfig,
    store: Arc<dyn Store>,
    sessions: DashMap<String, Arc<SessionRate>>,
    clock: DefaultClock,
}

impl AntiBanController {
    pub fn new(config: AntiBanConfig, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            store,
            sessions: DashMap::new(),
            clock: DefaultClock::default(),
        }
    }

    fn make_limiter(&self, per_minute: u32) -> Arc<DirectLimiter> {
        let rate = NonZeroU32::new(per_minute).unwrap_or(nonzero!(1u32));
        Arc::new(RateLimiter::direct_with_clock(
            Quota::per_minute(rate),
            &self.clock,
        ))
    }

    fn entry(&self, session_id: &str) -> Arc<SessionRate> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionRate {
                    state: Mutex::new(RateState::new(Utc::now())),
                    limiter: parking_lot::RwLock::new(self.make_limiter(self.config.per_minute)),
                    limiter_rate: parking_lot::RwLock::new(self.config.per_minute),
                })
            })
            .clone()
    }

    /// Track a session. Called when the supervisor opens it.
    pub fn register_session(&self, session_id: &str) {
        self.entry(session_id);
    }

    pub fn remove_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Forget a session's protection state after re-authentication. The
    /// only path out of `banned`.
    pub fn reset_session(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            info!(session_id, "Rate state reset");
        }
    }

    /// Gate a send: halted level, budget windows, then pacing.
    pub fn check_send(&self, session_id: &str) -> SendGate {
        let entry = self.entry(session_id);
        let now = Utc::now();

        {
            let mut state = entry.state.lock();
            state.roll_windows(now);

            if state.level == RateLevel::Banned {
                return SendGate::Halted;
            }
            if state.msgs_this_minute >= self.config.per_minute {
                // Next minute boundary, not a drop.
                return SendGate::RescheduleAt(
                    state.minute_window_start + ChronoDuration::seconds(60),
                );
            }
            if state.msgs_this_hour >= self.config.per_hour {
                return SendGate::RescheduleAt(
                    state.hour_window_start + ChronoDuration::seconds(3600),
                );
            }
        }

        // Pacing at the effective rate (budget / multiplier).
        let limiter = entry.limiter.read().clone();
        match limiter.check() {
            Ok(()) => SendGate::Allow,
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                let wait = ChronoDuration::from_std(wait).unwrap_or(ChronoDuration::seconds(1));
                SendGate::RescheduleAt(now + wait.max(ChronoDuration::seconds(1)))
            }
        }
    }

    /// Record a completed send and recompute the protection level.
    pub async fn record_send(&self, session_id: &str) {
        let entry = self.entry(session_id);
        let transition = {
            let mut state = entry.state.lock();
            let now = Utc::now();
            state.roll_windows(now);
            state.msgs_this_minute += 1;
            state.msgs_this_hour += 1;
            self.update_level(&mut state)
        };
        self.apply_transition(session_id, &entry, transition).await;
    }

    /// Record a platform rate-limit error; raises the adaptive multiplier.
    pub async fn record_rate_limited(&self, session_id: &str, wait_s: u64) {
        debug!(session_id, wait_s, "Platform rate limit observed");
        metrics::counter!("afx.antiban.rate_limited_total").increment(1);
        let entry = self.entry(session_id);
        let transition = {
            let mut state = entry.state.lock();
            let now = Utc::now();
            state.roll_windows(now);
            state.recent_rate_limits.push(now);
            self.update_level(&mut state)
        };
        self.apply_transition(session_id, &entry, transition).await;
    }

    /// Inspect a platform error for ban markers; on a hit, emergency-stop
    /// the session. Returns whether a ban was detected.
    pub async fn observe_error(&self, session_id: &str, error: &PlatformError) -> bool {
        if error.has_ban_marker() {
            self.emergency_stop(session_id, &error.to_string()).await;
            true
        } else {
            false
        }
    }

    /// Pause every pair of the session and halt its sends.
    pub async fn emergency_stop(&self, session_id: &str, reason: &str) {
        warn!(session_id, reason, "Ban indicator detected, emergency stop");
        metrics::counter!("afx.antiban.emergency_stops_total").increment(1);

        let entry = self.entry(session_id);
        {
            let mut state = entry.state.lock();
            state.level = RateLevel::Banned;
            state.throttle_multiplier = 0.0;
        }

        match self
            .store
            .set_session_pairs_state(session_id, PairState::Active, PairState::Paused)
            .await
        {
            Ok(paused) => {
                if let Ok(session) = self.store.get_session(session_id).await {
                    let entry = ActivityEntry::new(
                        &session.user_id,
                        ActivityKind::EmergencyStop,
                        format!("Session halted after ban indicator: {reason}"),
                    )
                    .with_session(session_id)
                    .with_metadata(serde_json::json!({ "paused_pairs": paused }));
                    if let Err(e) = self.store.append_activity(&entry).await {
                        warn!(error = %e, "Failed to record emergency stop");
                    }
                }
            }
            Err(e) => warn!(error = %e, session_id, "Failed to pause pairs on emergency stop"),
        }
    }

    pub fn level(&self, session_id: &str) -> RateLevel {
        self.entry(session_id).state.lock().level
    }

    pub fn throttle_multiplier(&self, session_id: &str) -> f64 {
        self.entry(session_id).state.lock().throttle_multiplier
    }

    pub fn snapshot(&self, session_id: &str) -> RateStateSnapshot {
        let entry = self.entry(session_id);
        let mut state = entry.state.lock();
        state.roll_windows(Utc::now());
        RateStateSnapshot {
            session_id: session_id.to_string(),
            msgs_this_minute: state.msgs_this_minute,
            msgs_this_hour: state.msgs_this_hour,
            level: state.level,
            throttle_multiplier: state.throttle_multiplier,
            warning_count: state.warning_count,
        }
    }

    pub fn snapshots(&self) -> Vec<RateStateSnapshot> {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.iter().map(|id| self.snapshot(id)).collect()
    }

    /// Roll windows for every session. Driven by the window-reset ticker
    /// so idle sessions decay back to `safe`.
    pub fn tick(&self) {
        let now = Utc::now();
        for entry in self.sessions.iter() {
            let mut state = entry.state.lock();
            state.roll_windows(now);
            // Do not recompute a lower level while banned.
            if state.level != RateLevel::Banned {
                state.level = self.compute_level(&state);
                state.throttle_multiplier = self.multiplier_for(&state);
            }
            drop(state);
            self.sync_limiter(entry.value());
        }
    }

    fn budget_fraction(&self, state: &RateState) -> f64 {
        let minute = state.msgs_this_minute as f64 / self.config.per_minute as f64;
        let hour = state.msgs_this_hour as f64 / self.config.per_hour as f64;
        minute.max(hour)
    }

    fn level_for(&self, fraction: f64) -> RateLevel {
        if fraction >= self.config.critical_threshold {
            RateLevel::Critical
        } else if fraction >= self.config.warning_threshold {
            RateLevel::Warning
        } else {
            RateLevel::Safe
        }
    }

    /// Budget consumption drives the level, with a floor of `warning`
    /// while the platform has rate-limited the session recently.
    fn compute_level(&self, state: &RateState) -> RateLevel {
        let from_budget = self.level_for(self.budget_fraction(state));
        if !state.recent_rate_limits.is_empty() {
            from_budget.max(RateLevel::Warning)
        } else {
            from_budget
        }
    }

    fn multiplier_for(&self, state: &RateState) -> f64 {
        let base = state.level.multiplier();
        if base == 0.0 {
            return 0.0;
        }
        let recent = state.recent_rate_limits.len() as f64;
        if recent >= 1.0 {
            base.max(1.5 * recent)
        } else {
            base
        }
    }

    /// Returns `Some((old, new))` when the level escalated.
    fn update_level(&self, state: &mut RateState) -> Option<(RateLevel, RateLevel)> {
        if state.level == RateLevel::Banned {
            return None;
        }
        let old = state.level;
        let new = self.compute_level(state);
        state.level = new;
        state.throttle_multiplier = self.multiplier_for(state);
        if new > old {
            state.warning_count += 1;
            Some((old, new))
        } else {
            None
        }
    }

    async fn apply_transition(
        &self,
        session_id: &str,
        entry: &Arc<SessionRate>,
        transition: Option<(RateLevel, RateLevel)>,
    ) {
        self.sync_limiter(entry);

        if let Some((old, new)) = transition {
            warn!(
                session_id,
                from = old.as_str(),
                to = new.as_str(),
                "Session rate level escalated"
            );
            if let Ok(session) = self.store.get_session(session_id).await {
                let entry = ActivityEntry::new(
                    &session.user_id,
                    ActivityKind::RateWarning,
                    format!("Send rate level escalated from {} to {}", old.as_str(), new.as_str()),
                )
                .with_session(session_id);
                if let Err(e) = self.store.append_activity(&entry).await {
                    warn!(error = %e, "Failed to record rate warning");
                }
            }
        }
    }

    /// Keep the pacing limiter at `per_minute / multiplier`.
    fn sync_limiter(&self, entry: &Arc<SessionRate>) {
        let multiplier = {
            let state = entry.state.lock();
            state.throttle_multiplier
        };
        if multiplier <= 0.0 {
            return; // Halted sessions never reach the limiter.
        }
        let effective = ((self.config.per_minute as f64 / multiplier).floor() as u32).max(1);
        let current = *entry.limiter_rate.read();
        if current != effective {
            *entry.limiter.write() = self.make_limiter(effective);
            *entry.limiter_rate.write() = effective;
            debug!(effective_per_minute = effective, "Pacing limiter replaced");
        }
    }
}
