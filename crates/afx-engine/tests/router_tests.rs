//! Ingress router and filter pipeline tests.

use std::sync::Arc;

use chrono::Utc;

use afx_common::{
    BlockedImage, BlockedPhrase, EventKind, MessageSnapshot, MessageTypeFilter, Pair, PairState,
    PairStats, Plan, Session, UpdateEvent, User,
};
use afx_engine::{FilterPipeline, IngressRouter, RouterOptions, TransformConfig};
use afx_store::{SqliteStore, Store};

async fn seeded_store(plan: Plan) -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    store.init_schema().await.unwrap();
    store.create_user(&User::new("u1", plan)).await.unwrap();
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
}

fn pair(id: &str) -> Pair {
    Pair {
        id: id.to_string(),
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
    }
}

fn event(message_id: i64, snapshot: MessageSnapshot) -> UpdateEvent {
    UpdateEvent {
        session_id: "s1".into(),
        kind: EventKind::New,
        source_ref: "src".into(),
        message_id,
        snapshot,
    }
}

fn router(store: Arc<SqliteStore>) -> IngressRouter {
    IngressRouter::new(
        store.clone(),
        FilterPipeline::new(store),
        RouterOptions::default(),
    )
}

#[tokio::test]
async fn new_message_is_enqueued_immediately() {
    let store = seeded_store(Plan::Free).await;
    store.create_pair(&pair("p1")).await.unwrap();
    let router = router(store.clone());

    let before = Utc::now();
    let summary = router
        .handle_event(&event(42, MessageSnapshot::text("hello")))
        .await
        .unwrap();

    assert_eq!(summary.matched_pairs, 1);
    assert_eq!(summary.enqueued, 1);
    assert_eq!(summary.filtered, 0);

    // delay = [0, 0] means scheduled immediately.
    let claimed = store.claim_due(Utc::now(), 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].source_message_id, 42);
    assert!(claimed[0].scheduled_at >= before - chrono::Duration::seconds(1));
    assert!(claimed[0].scheduled_at <= Utc::now());
}

#[tokio::test]
async fn random_delay_stays_within_bounds() {
    let store = seeded_store(Plan::Free).await;
    let mut delayed = pair("p1");
    delayed.delay_min_s = 10;
    delayed.delay_max_s = 30;
    store.create_pair(&delayed).await.unwrap();
    let router = router(store.clone());

    let before = Utc::now();
    router
        .handle_event(&event(1, MessageSnapshot::text("hi")))
        .await
        .unwrap();

    // Not yet due.
    assert!(store.claim_due(Utc::now(), 10).await.unwrap().is_empty());

    let item = &store
        .claim_due(Utc::now() + chrono::Duration::seconds(31), 10)
        .await
        .unwrap()[0];
    let delay = (item.scheduled_at - before).num_seconds();
    assert!((10..=31).contains(&delay), "delay out of range: {delay}");
}

#[tokio::test]
async fn blocked_phrase_is_case_insensitive() {
    let store = seeded_store(Plan::Free).await;
    store.create_pair(&pair("p1")).await.unwrap();
    store
        .create_blocked_phrase(&BlockedPhrase {
            id: "b1".into(),
            user_id: "u1".into(),
            pair_id: Some("p1".into()),
            text: "promo".into(),
            active: true,
        })
        .await
        .unwrap();
    let router = router(store.clone());

    let summary = router
        .handle_event(&event(1, MessageSnapshot::text("PROMO code inside")))
        .await
        .unwrap();

    assert_eq!(summary.enqueued, 0);
    assert_eq!(summary.filtered, 1);

    // No queue item; the drop counts as filtered, not failed.
    assert!(store.claim_due(Utc::now(), 10).await.unwrap().is_empty());
    let p = store.get_pair("p1").await.unwrap();
    assert_eq!(p.stats.filtered, 1);
    assert_eq!(p.stats.failed, 0);
}

#[tokio::test]
async fn user_wide_phrase_applies_to_all_pairs() {
    let store = seeded_store(Plan::Free).await;
    store.create_pair(&pair("p1")).await.unwrap();
    store.create_pair(&pair("p2")).await.unwrap();
    store
        .create_blocked_phrase(&BlockedPhrase {
            id: "b1".into(),
            user_id: "u1".into(),
            pair_id: None,
            text: "spam".into(),
            active: true,
        })
        .await
        .unwrap();
    let router = router(store.clone());

    let summary = router
        .handle_event(&event(1, MessageSnapshot::text("buy spam now")))
        .await
        .unwrap();
    assert_eq!(summary.matched_pairs, 2);
    assert_eq!(summary.filtered, 2);
}

#[tokio::test]
async fn blocked_image_hash_drops_event() {
    let store = seeded_store(Plan::Free).await;
    store.create_pair(&pair("p1")).await.unwrap();
    store
        .create_blocked_image(&BlockedImage {
            id: "i1".into(),
            user_id: "u1".into(),
            pair_id: None,
            image_hash: "deadbeef".into(),
            active: true,
        })
        .await
        .unwrap();
    let router = router(store.clone());

    let summary = router
        .handle_event(&event(1, MessageSnapshot::media("deadbeef")))
        .await
        .unwrap();
    assert_eq!(summary.filtered, 1);

    let summary = router
        .handle_event(&event(2, MessageSnapshot::media("cafebabe")))
        .await
        .unwrap();
    assert_eq!(summary.enqueued, 1);
}

#[tokio::test]
async fn type_filter_gates_media() {
    let store = seeded_store(Plan::Free).await;
    let mut text_only = pair("p1");
    text_only.message_type_filter = MessageTypeFilter::Text;
    store.create_pair(&text_only).await.unwrap();
    let router = router(store.clone());

    let summary = router
        .handle_event(&event(1, MessageSnapshot::media("abcd")))
        .await
        .unwrap();
    assert_eq!(summary.filtered, 1);

    let summary = router
        .handle_event(&event(2, MessageSnapshot::text("fine")))
        .await
        .unwrap();
    assert_eq!(summary.enqueued, 1);
}

#[tokio::test]
async fn edit_and_delete_gating() {
    let store = seeded_store(Plan::Free).await;
    // forward_edits = true, forward_deletions = false.
    store.create_pair(&pair("p1")).await.unwrap();
    let router = router(store.clone());

    let mut edit = event(1, MessageSnapshot::text("edited"));
    edit.kind = EventKind::Edit;
    assert_eq!(router.handle_event(&edit).await.unwrap().enqueued, 1);

    let mut delete = event(2, MessageSnapshot::default());
    delete.kind = EventKind::Delete;
    let summary = router.handle_event(&delete).await.unwrap();
    assert_eq!(summary.enqueued, 0);
    assert_eq!(summary.filtered, 1);
}

#[tokio::test]
async fn duplicate_event_is_not_requeued() {
    let store = seeded_store(Plan::Free).await;
    store.create_pair(&pair("p1")).await.unwrap();
    let router = router(store.clone());

    let e = event(7, MessageSnapshot::text("once"));
    assert_eq!(router.handle_event(&e).await.unwrap().enqueued, 1);

    let summary = router.handle_event(&e).await.unwrap();
    assert_eq!(summary.enqueued, 0);
    assert_eq!(summary.duplicates, 1);
}

#[tokio::test]
async fn paused_pairs_are_not_resolved() {
    let store = seeded_store(Plan::Free).await;
    let mut paused = pair("p1");
    paused.state = PairState::Paused;
    store.create_pair(&paused).await.unwrap();
    let router = router(store.clone());

    let summary = router
        .handle_event(&event(1, MessageSnapshot::text("hello")))
        .await
        .unwrap();
    assert_eq!(summary.matched_pairs, 0);
}

#[tokio::test]
async fn transforms_apply_only_with_advanced_filtering() {
    for (plan, expect_watermark) in [(Plan::Free, false), (Plan::Pro, true)] {
        let store = seeded_store(plan).await;
        store.create_pair(&pair("p1")).await.unwrap();

        let filters = FilterPipeline::new(store.clone()).with_transforms(TransformConfig {
            substitutions: vec![("join us".into(), "see more".into())],
            watermark: Some("via AutoForwardX".into()),
        });
        let router = IngressRouter::new(store.clone(), filters, RouterOptions::default());

        router
            .handle_event(&event(1, MessageSnapshot::text("join us today")))
            .await
            .unwrap();

        let item = &store.claim_due(Utc::now(), 1).await.unwrap()[0];
        let text = item.payload.text.as_deref().unwrap();
        if expect_watermark {
            assert!(text.starts_with("see more today"));
            assert!(text.ends_with("via AutoForwardX"));
        } else {
            assert_eq!(text, "join us today");
        }
    }
}

#[tokio::test]
async fn chain_republish_enqueues_on_destination_pair() {
    let store = seeded_store(Plan::Free).await;
    // Second hop listens on the first hop's destination.
    let mut second = pair("p2");
    second.source_ref = "dst".into();
    second.destination_ref = "final".into();
    store.create_pair(&second).await.unwrap();
    let router = router(store.clone());

    let accepted = router
        .chain_republish("s1", "dst", 900, MessageSnapshot::text("hop"))
        .await
        .unwrap();
    assert!(accepted);

    let claimed = store.claim_due(Utc::now(), 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].destination_ref, "final");
}

#[tokio::test]
async fn chain_loop_guard_rejects_re_emission() {
    let store = seeded_store(Plan::Free).await;
    let router = router(store.clone());

    assert!(router
        .chain_republish("s1", "dst", 900, MessageSnapshot::text("hop"))
        .await
        .unwrap());
    // Same tuple within the guard window is rejected.
    assert!(!router
        .chain_republish("s1", "dst", 900, MessageSnapshot::text("hop"))
        .await
        .unwrap());
    // A different message id passes.
    assert!(router
        .chain_republish("s1", "dst", 901, MessageSnapshot::text("hop"))
        .await
        .unwrap());
}

#[tokio::test]
async fn daily_cap_drops_when_enforced() {
    let store = seeded_store(Plan::Free).await;
    store.create_pair(&pair("p1")).await.unwrap();

    let router = IngressRouter::new(
        store.clone(),
        FilterPipeline::new(store.clone()),
        RouterOptions {
            enforce_daily_cap: true,
        },
    );

    // Free plan: 100 messages per day.
    for i in 0..100 {
        let summary = router
            .handle_event(&event(i, MessageSnapshot::text("ok")))
            .await
            .unwrap();
        assert_eq!(summary.enqueued, 1, "event {i} should enqueue");
    }

    let summary = router
        .handle_event(&event(100, MessageSnapshot::text("over")))
        .await
        .unwrap();
    assert_eq!(summary.enqueued, 0);
    assert_eq!(summary.filtered, 1);

    let activity = store.recent_activity("u1", 5).await.unwrap();
    assert!(activity
        .iter()
        .any(|e| e.kind == afx_common::ActivityKind::DailyCapReached));
}
