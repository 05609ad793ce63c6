//! Anti-ban controller tests: level thresholds, throttle multipliers,
//! adaptive escalation, ban indicators, budget gating.

use std::sync::Arc;

use chrono::{Duration, Utc};

use afx_common::{
    MessageTypeFilter, Pair, PairState, PairStats, Plan, PlatformError, RateLevel, Session, User,
};
use afx_engine::{AntiBanConfig, AntiBanController, SendGate};
use afx_store::{SqliteStore, Store};

async fn seeded_store() -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    store.init_schema().await.unwrap();
    store.create_user(&User::new("u1", Plan::Free)).await.unwrap();
    store
        .create_session(&Session {
            id: "s1".into(),
            user_id: "u1".into(),
            phone: "+15550100".into(),
            credential_blob: "blob".into(),
            active: true,
            last_health_at: None,
            display_name: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    store
        .create_pair(&Pair {
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
        })
        .await
        .unwrap();
    store
}

fn config(per_minute: u32, per_hour: u32) -> AntiBanConfig {
    AntiBanConfig {
        per_minute,
        per_hour,
        warning_threshold: 0.80,
        critical_threshold: 0.95,
    }
}

#[tokio::test]
async fn level_starts_safe() {
    let store = seeded_store().await;
    let controller = AntiBanController::new(config(20, 300), store);

    controller.register_session("s1");
    assert_eq!(controller.level("s1"), RateLevel::Safe);
    assert_eq!(controller.throttle_multiplier("s1"), 1.0);
}

#[tokio::test]
async fn level_escalates_with_budget_consumption() {
    let store = seeded_store().await;
    let controller = AntiBanController::new(config(20, 300), store);

    // 15/20 = 0.75 < 0.80 -> still safe.
    for _ in 0..15 {
        controller.record_send("s1").await;
    }
    assert_eq!(controller.level("s1"), RateLevel::Safe);

    // 16/20 = 0.80 -> warning.
    controller.record_send("s1").await;
    assert_eq!(controller.level("s1"), RateLevel::Warning);
    assert_eq!(controller.throttle_multiplier("s1"), 2.0);

    // 19/20 = 0.95 -> critical.
    for _ in 0..3 {
        controller.record_send("s1").await;
    }
    assert_eq!(controller.level("s1"), RateLevel::Critical);
    assert_eq!(controller.throttle_multiplier("s1"), 5.0);

    let snapshot = controller.snapshot("s1");
    assert_eq!(snapshot.msgs_this_minute, 19);
    assert_eq!(snapshot.msgs_this_hour, 19);
    assert!(snapshot.warning_count >= 2);
}

#[tokio::test]
async fn rate_limit_errors_raise_floor_and_multiplier() {
    let store = seeded_store().await;
    let controller = AntiBanController::new(config(20, 300), store);

    controller.record_rate_limited("s1", 30).await;
    assert_eq!(controller.level("s1"), RateLevel::Warning);
    assert!(controller.throttle_multiplier("s1") >= 2.0);

    // Two recent errors: adaptive term 1.5 * 2 = 3.0 beats the warning base.
    controller.record_rate_limited("s1", 30).await;
    assert_eq!(controller.throttle_multiplier("s1"), 3.0);
}

#[tokio::test]
async fn minute_budget_defers_to_window_boundary() {
    let store = seeded_store().await;
    let controller = AntiBanController::new(config(2, 300), store);

    controller.record_send("s1").await;
    controller.record_send("s1").await;

    let before = Utc::now();
    match controller.check_send("s1") {
        SendGate::RescheduleAt(at) => {
            // Deferred to the next minute boundary, not dropped.
            assert!(at > before);
            assert!(at <= before + Duration::seconds(61));
        }
        other => panic!("expected reschedule, got {other:?}"),
    }
}

#[tokio::test]
async fn ban_indicator_triggers_emergency_stop() {
    let store = seeded_store().await;
    let controller = AntiBanController::new(config(20, 300), store.clone());
    controller.register_session("s1");

    let error = PlatformError::classify("PEER_FLOOD");
    assert!(controller.observe_error("s1", &error).await);

    assert_eq!(controller.level("s1"), RateLevel::Banned);
    assert_eq!(controller.throttle_multiplier("s1"), 0.0);
    assert_eq!(controller.check_send("s1"), SendGate::Halted);

    // Every pair of the session is paused.
    let pair = store.get_pair("p1").await.unwrap();
    assert_eq!(pair.state, PairState::Paused);

    let activity = store.recent_activity("u1", 10).await.unwrap();
    assert!(activity
        .iter()
        .any(|e| e.kind == afx_common::ActivityKind::EmergencyStop));
}

#[tokio::test]
async fn banned_is_sticky_until_reset() {
    let store = seeded_store().await;
    let controller = AntiBanController::new(config(20, 300), store);

    controller.emergency_stop("s1", "USER_DEACTIVATED").await;
    assert_eq!(controller.level("s1"), RateLevel::Banned);

    // Window ticks do not lift the ban.
    controller.tick();
    assert_eq!(controller.level("s1"), RateLevel::Banned);

    controller.reset_session("s1");
    assert_eq!(controller.level("s1"), RateLevel::Safe);
    assert_eq!(controller.check_send("s1"), SendGate::Allow);
}

#[tokio::test]
async fn non_ban_errors_do_not_stop_session() {
    let store = seeded_store().await;
    let controller = AntiBanController::new(config(20, 300), store.clone());

    let error = PlatformError::classify("connection timeout");
    assert!(!controller.observe_error("s1", &error).await);
    assert_eq!(controller.level("s1"), RateLevel::Safe);
    assert_eq!(
        store.get_pair("p1").await.unwrap().state,
        PairState::Active
    );
}

#[tokio::test]
async fn counters_are_per_session() {
    let store = seeded_store().await;
    let controller = AntiBanController::new(config(20, 300), store);

    for _ in 0..16 {
        controller.record_send("s1").await;
    }
    controller.record_send("other-session").await;

    assert_eq!(controller.level("s1"), RateLevel::Warning);
    assert_eq!(controller.level("other-session"), RateLevel::Safe);
    assert_eq!(controller.snapshot("other-session").msgs_this_minute, 1);
}
