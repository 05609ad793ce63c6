//! Store integration tests against in-memory SQLite.

use chrono::{Duration, Utc};

use afx_common::{
    BlockedImage, BlockedPhrase, EventKind, MessageSnapshot, MessageTypeFilter, Pair, PairState,
    PairStats, Plan, QueueItemStatus, Session, User,
};
use afx_store::{EnqueueOutcome, NewQueueItem, SqliteStore, Store, StoreError};

async fn store() -> SqliteStore {
    let store = SqliteStore::in_memory().await.unwrap();
    store.init_schema().await.unwrap();
    store
}

fn user(id: &str, plan: Plan) -> User {
    User::new(id, plan)
}

fn session(id: &str, user_id: &str) -> Session {
    Session {
        id: id.to_string(),
        user_id: user_id.to_string(),
        phone: "+15550100".to_string(),
        credential_blob: "blob".to_string(),
        active: true,
        last_health_at: None,
        display_name: None,
        created_at: Utc::now(),
    }
}

fn pair(id: &str, user_id: &str, session_id: &str) -> Pair {
    Pair {
        id: id.to_string(),
        user_id: user_id.to_string(),
        session_id: session_id.to_string(),
        source_ref: "src".to_string(),
        destination_ref: "dst".to_string(),
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

fn new_item(pair_id: &str, msg_id: i64) -> NewQueueItem {
    NewQueueItem {
        pair_id: pair_id.to_string(),
        source_message_id: msg_id,
        source_ref: "src".to_string(),
        destination_ref: "dst".to_string(),
        payload: MessageSnapshot::text("hello"),
        kind: EventKind::New,
        scheduled_at: Utc::now(),
    }
}

async fn seed(store: &SqliteStore) {
    store.create_user(&user("u1", Plan::Free)).await.unwrap();
    store.create_session(&session("s1", "u1")).await.unwrap();
    store.create_pair(&pair("p1", "u1", "s1")).await.unwrap();
}

#[tokio::test]
async fn user_crud_round_trip() {
    let store = store().await;

    store.create_user(&user("u1", Plan::Pro)).await.unwrap();
    let loaded = store.get_user("u1").await.unwrap();
    assert_eq!(loaded.plan, Plan::Pro);

    assert!(matches!(
        store.get_user("missing").await,
        Err(StoreError::NotFound(_))
    ));

    // Duplicate primary key is a conflict.
    assert!(matches!(
        store.create_user(&user("u1", Plan::Free)).await,
        Err(StoreError::Conflict(_))
    ));
}

#[tokio::test]
async fn session_lifecycle() {
    let store = store().await;
    store.create_user(&user("u1", Plan::Free)).await.unwrap();
    store.create_session(&session("s1", "u1")).await.unwrap();

    store
        .update_session_credentials("s1", "new-blob", Some("Alice"))
        .await
        .unwrap();
    let loaded = store.get_session("s1").await.unwrap();
    assert_eq!(loaded.credential_blob, "new-blob");
    assert_eq!(loaded.display_name.as_deref(), Some("Alice"));
    assert!(loaded.active);

    store.set_session_active("s1", false).await.unwrap();
    assert!(!store.get_session("s1").await.unwrap().active);
    assert!(store.list_active_sessions().await.unwrap().is_empty());

    assert_eq!(store.count_sessions("u1").await.unwrap(), 1);
}

#[tokio::test]
async fn pairs_for_source_only_returns_active() {
    let store = store().await;
    seed(&store).await;

    let mut paused = pair("p2", "u1", "s1");
    paused.state = PairState::Paused;
    store.create_pair(&paused).await.unwrap();

    let mut other_source = pair("p3", "u1", "s1");
    other_source.source_ref = "elsewhere".to_string();
    store.create_pair(&other_source).await.unwrap();

    let found = store.pairs_for_source("s1", "src").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "p1");
}

#[tokio::test]
async fn claim_due_skips_future_items() {
    let store = store().await;
    seed(&store).await;

    let mut due = new_item("p1", 1);
    due.scheduled_at = Utc::now() - Duration::seconds(5);
    store.enqueue(due).await.unwrap();

    let mut future = new_item("p1", 2);
    future.scheduled_at = Utc::now() + Duration::seconds(3600);
    store.enqueue(future).await.unwrap();

    let claimed = store.claim_due(Utc::now(), 32).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].source_message_id, 1);
    assert_eq!(claimed[0].status, QueueItemStatus::Processing);

    // Already-claimed items are not handed out again.
    let again = store.claim_due(Utc::now(), 32).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn claim_due_orders_by_schedule() {
    let store = store().await;
    seed(&store).await;

    let base = Utc::now() - Duration::seconds(60);
    for (msg_id, offset) in [(1, 30), (2, 10), (3, 20)] {
        let mut item = new_item("p1", msg_id);
        item.scheduled_at = base + Duration::seconds(offset);
        store.enqueue(item).await.unwrap();
    }

    let claimed = store.claim_due(Utc::now(), 32).await.unwrap();
    let order: Vec<i64> = claimed.iter().map(|i| i.source_message_id).collect();
    assert_eq!(order, vec![2, 3, 1]);
}

#[tokio::test]
async fn enqueue_deduplicates_non_terminal() {
    let store = store().await;
    seed(&store).await;

    let first = store.enqueue(new_item("p1", 42)).await.unwrap();
    let id = match first {
        EnqueueOutcome::Enqueued(id) => id,
        other => panic!("unexpected: {other:?}"),
    };

    // Same key while pending: duplicate.
    assert_eq!(
        store.enqueue(new_item("p1", 42)).await.unwrap(),
        EnqueueOutcome::Duplicate(id.clone())
    );

    // After the item reaches a terminal status the key is free again.
    store.complete_item(&id, Utc::now()).await.unwrap();
    assert!(matches!(
        store.enqueue(new_item("p1", 42)).await.unwrap(),
        EnqueueOutcome::Enqueued(_)
    ));
}

#[tokio::test]
async fn retry_and_fail_transitions() {
    let store = store().await;
    seed(&store).await;

    let id = match store.enqueue(new_item("p1", 1)).await.unwrap() {
        EnqueueOutcome::Enqueued(id) => id,
        _ => unreachable!(),
    };
    store.claim_due(Utc::now(), 1).await.unwrap();

    let retry_at = Utc::now() + Duration::seconds(120);
    store.retry_item(&id, "timeout", retry_at).await.unwrap();
    let item = store.get_item(&id).await.unwrap();
    assert_eq!(item.status, QueueItemStatus::Pending);
    assert_eq!(item.attempts, 1);
    assert_eq!(item.last_error.as_deref(), Some("timeout"));

    store.fail_item(&id, "gone", Utc::now()).await.unwrap();
    let item = store.get_item(&id).await.unwrap();
    assert_eq!(item.status, QueueItemStatus::Failed);
    assert_eq!(item.attempts, 2);
    assert!(item.processed_at.is_some());
}

#[tokio::test]
async fn release_restores_pending_with_schedule() {
    let store = store().await;
    seed(&store).await;

    let mut item = new_item("p1", 1);
    let scheduled = Utc::now() - Duration::seconds(10);
    item.scheduled_at = scheduled;
    store.enqueue(item).await.unwrap();

    let claimed = store.claim_due(Utc::now(), 1).await.unwrap();
    store.release_item(&claimed[0].id).await.unwrap();

    let restored = store.get_item(&claimed[0].id).await.unwrap();
    assert_eq!(restored.status, QueueItemStatus::Pending);
    assert_eq!(
        restored.scheduled_at.timestamp_millis(),
        scheduled.timestamp_millis()
    );
}

#[tokio::test]
async fn release_all_processing_recovers_orphans() {
    let store = store().await;
    seed(&store).await;

    store.enqueue(new_item("p1", 1)).await.unwrap();
    store.enqueue(new_item("p1", 2)).await.unwrap();
    store.claim_due(Utc::now(), 32).await.unwrap();

    assert_eq!(store.release_all_processing().await.unwrap(), 2);
    assert_eq!(store.claim_due(Utc::now(), 32).await.unwrap().len(), 2);
}

#[tokio::test]
async fn delete_pair_clears_queue_items() {
    let store = store().await;
    seed(&store).await;

    store.enqueue(new_item("p1", 1)).await.unwrap();
    let processing = match store.enqueue(new_item("p1", 2)).await.unwrap() {
        EnqueueOutcome::Enqueued(id) => id,
        _ => unreachable!(),
    };
    let completed = match store.enqueue(new_item("p1", 3)).await.unwrap() {
        EnqueueOutcome::Enqueued(id) => id,
        _ => unreachable!(),
    };
    store.complete_item(&completed, Utc::now()).await.unwrap();

    store.delete_pair("p1").await.unwrap();

    assert!(matches!(
        store.get_pair("p1").await,
        Err(StoreError::NotFound(_))
    ));
    // Non-terminal items became cleared; the completed one is untouched.
    let stats = store.queue_stats().await.unwrap();
    assert_eq!(stats.cleared, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(
        store.get_item(&processing).await.unwrap().status,
        QueueItemStatus::Cleared
    );
}

#[tokio::test]
async fn clear_failed_is_idempotent() {
    let store = store().await;
    seed(&store).await;

    let id = match store.enqueue(new_item("p1", 1)).await.unwrap() {
        EnqueueOutcome::Enqueued(id) => id,
        _ => unreachable!(),
    };
    store.claim_due(Utc::now(), 1).await.unwrap();
    store.fail_item(&id, "boom", Utc::now()).await.unwrap();

    assert_eq!(store.clear_failed().await.unwrap(), 1);
    assert_eq!(store.clear_failed().await.unwrap(), 0);
}

#[tokio::test]
async fn phrase_scoping_pair_rules_first() {
    let store = store().await;
    seed(&store).await;

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
    store
        .create_blocked_phrase(&BlockedPhrase {
            id: "b2".into(),
            user_id: "u1".into(),
            pair_id: Some("p1".into()),
            text: "promo".into(),
            active: true,
        })
        .await
        .unwrap();
    store
        .create_blocked_phrase(&BlockedPhrase {
            id: "b3".into(),
            user_id: "u1".into(),
            pair_id: Some("p1".into()),
            text: "inactive".into(),
            active: false,
        })
        .await
        .unwrap();
    store
        .create_blocked_phrase(&BlockedPhrase {
            id: "b4".into(),
            user_id: "u1".into(),
            pair_id: Some("other-pair".into()),
            text: "elsewhere".into(),
            active: true,
        })
        .await
        .unwrap();

    let phrases = store.phrases_for_pair("u1", "p1").await.unwrap();
    let texts: Vec<&str> = phrases.iter().map(|p| p.text.as_str()).collect();
    assert_eq!(texts, vec!["promo", "spam"]);
}

#[tokio::test]
async fn image_rules_match_scope() {
    let store = store().await;
    seed(&store).await;

    store
        .create_blocked_image(&BlockedImage {
            id: "i1".into(),
            user_id: "u1".into(),
            pair_id: None,
            image_hash: "feedbeef".into(),
            active: true,
        })
        .await
        .unwrap();

    let images = store.images_for_pair("u1", "p1").await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].image_hash, "feedbeef");
}

#[tokio::test]
async fn session_pairs_state_transition() {
    let store = store().await;
    seed(&store).await;

    let mut stopped = pair("p2", "u1", "s1");
    stopped.state = PairState::Stopped;
    store.create_pair(&stopped).await.unwrap();

    let changed = store
        .set_session_pairs_state("s1", PairState::Active, PairState::Paused)
        .await
        .unwrap();
    assert_eq!(changed, vec!["p1".to_string()]);
    assert_eq!(
        store.get_pair("p1").await.unwrap().state,
        PairState::Paused
    );
    assert_eq!(
        store.get_pair("p2").await.unwrap().state,
        PairState::Stopped
    );
}

#[tokio::test]
async fn pair_stat_counters() {
    let store = store().await;
    seed(&store).await;

    store.record_pair_success("p1", Utc::now()).await.unwrap();
    store.record_pair_success("p1", Utc::now()).await.unwrap();
    store.record_pair_failure("p1", Utc::now()).await.unwrap();
    store.record_pair_filtered("p1").await.unwrap();

    let p = store.get_pair("p1").await.unwrap();
    assert_eq!(p.stats.successful, 2);
    assert_eq!(p.stats.forwarded, 2);
    assert_eq!(p.stats.failed, 1);
    assert_eq!(p.stats.filtered, 1);
    assert!(p.stats.last_at.is_some());
}

#[tokio::test]
async fn dashboard_and_admin_stats() {
    let store = store().await;
    seed(&store).await;
    store.create_user(&user("u2", Plan::Business)).await.unwrap();

    store.enqueue(new_item("p1", 1)).await.unwrap();
    store.record_pair_success("p1", Utc::now()).await.unwrap();

    let dash = store.dashboard_stats("u1").await.unwrap();
    assert_eq!(dash.active_pairs, 1);
    assert_eq!(dash.total_pairs, 1);
    assert_eq!(dash.connected_accounts, 1);
    assert_eq!(dash.messages_today, 1);
    assert_eq!(dash.queue.pending, 1);
    assert!((dash.success_rate - 1.0).abs() < f64::EPSILON);

    let admin = store.admin_stats().await.unwrap();
    assert_eq!(admin.users_free, 1);
    assert_eq!(admin.users_business, 1);
    assert_eq!(admin.total_pairs, 1);
    assert_eq!(admin.total_sessions, 1);
    assert_eq!(admin.queue.pending, 1);
}

#[tokio::test]
async fn delete_user_cascades() {
    let store = store().await;
    seed(&store).await;
    store.enqueue(new_item("p1", 1)).await.unwrap();

    store.delete_user("u1").await.unwrap();

    assert!(store.list_sessions("u1").await.unwrap().is_empty());
    assert!(store.list_pairs("u1").await.unwrap().is_empty());
    let stats = store.queue_stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.cleared, 1);
}
