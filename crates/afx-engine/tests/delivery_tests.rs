//! Delivery queue tests: dispatch, retries, rate limits, ban handling,
//! pause/drain.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use afx_client::{ClientPool, MockPlatformClient};
use afx_common::{
    EventKind, MessageSnapshot, MessageTypeFilter, Pair, PairState, PairStats, Plan, PlatformError,
    QueueItemStatus, Session, User,
};
use afx_engine::{
    AntiBanConfig, AntiBanController, DeliveryConfig, DeliveryQueue, FilterPipeline, IngressRouter,
    RouterOptions, SessionSignal,
};
use afx_store::{EnqueueOutcome, NewQueueItem, SqliteStore, Store};

struct Harness {
    store: Arc<SqliteStore>,
    client: Arc<MockPlatformClient>,
    antiban: Arc<AntiBanController>,
    delivery: Arc<DeliveryQueue>,
    signal_rx: mpsc::UnboundedReceiver<SessionSignal>,
}

async fn harness() -> Harness {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    store.init_schema().await.unwrap();
    store.create_user(&User::new("u1", Plan::Pro)).await.unwrap();

    let session = Session {
        id: "s1".into(),
        user_id: "u1".into(),
        phone: "+15550100".into(),
        credential_blob: "blob".into(),
        active: true,
        last_health_at: None,
        display_name: None,
        created_at: Utc::now(),
    };
    store.create_session(&session).await.unwrap();

    let client = Arc::new(MockPlatformClient::new());
    let pool = Arc::new(ClientPool::new(client.clone(), store.clone(), 64));
    pool.open_session(&session).await.unwrap();

    let antiban = Arc::new(AntiBanController::new(
        AntiBanConfig::default(),
        store.clone(),
    ));
    let router = Arc::new(IngressRouter::new(
        store.clone(),
        FilterPipeline::new(store.clone()),
        RouterOptions::default(),
    ));

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let delivery = Arc::new(DeliveryQueue::new(
        store.clone(),
        pool.clone(),
        antiban.clone(),
        router,
        DeliveryConfig {
            workers: 2,
            claim_batch: 8,
            max_attempts: 3,
            poll_interval: Duration::from_millis(50),
        },
        signal_tx,
    ));

    Harness {
        store,
        client,
        antiban,
        delivery,
        signal_rx,
    }
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

async fn enqueue(store: &SqliteStore, pair_id: &str, msg_id: i64) -> String {
    match store
        .enqueue(NewQueueItem {
            pair_id: pair_id.to_string(),
            source_message_id: msg_id,
            source_ref: "src".to_string(),
            destination_ref: "dst".to_string(),
            payload: MessageSnapshot::text("hello"),
            kind: EventKind::New,
            scheduled_at: Utc::now(),
        })
        .await
        .unwrap()
    {
        EnqueueOutcome::Enqueued(id) => id,
        EnqueueOutcome::Duplicate(id) => id,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn happy_path_forwards_and_completes() {
    let h = harness().await;
    h.store.create_pair(&pair("p1")).await.unwrap();
    let item_id = enqueue(&h.store, "p1", 42).await;

    h.delivery.start();
    settle().await;

    let item = h.store.get_item(&item_id).await.unwrap();
    assert_eq!(item.status, QueueItemStatus::Completed);

    let p = h.store.get_pair("p1").await.unwrap();
    assert_eq!(p.stats.successful, 1);
    assert_eq!(p.stats.forwarded, 1);
    assert!(p.stats.last_at.is_some());

    let sent = h.client.sent();
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].copied);
    assert_eq!(sent[0].source_msg_id, Some(42));

    h.delivery.drain(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn copy_mode_uses_copy_primitive() {
    let h = harness().await;
    let mut p = pair("p1");
    p.copy_mode = true;
    p.silent = true;
    h.store.create_pair(&p).await.unwrap();
    enqueue(&h.store, "p1", 1).await;

    h.delivery.start();
    settle().await;

    let sent = h.client.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].copied);
    assert!(sent[0].silent);
    assert_eq!(
        sent[0].payload.as_ref().unwrap().text.as_deref(),
        Some("hello")
    );

    h.delivery.drain(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn rate_limited_reschedules_without_attempt() {
    let h = harness().await;
    h.store.create_pair(&pair("p1")).await.unwrap();
    h.client
        .fail_next_send("s1", PlatformError::RateLimited { wait_s: 30 });
    let item_id = enqueue(&h.store, "p1", 1).await;

    h.delivery.start();
    settle().await;

    let item = h.store.get_item(&item_id).await.unwrap();
    assert_eq!(item.status, QueueItemStatus::Pending);
    assert_eq!(item.attempts, 0);
    // Rescheduled to roughly now + wait_s.
    let wait = (item.scheduled_at - Utc::now()).num_seconds();
    assert!((20..=31).contains(&wait), "unexpected wait: {wait}");

    // The controller escalated.
    assert!(h.antiban.throttle_multiplier("s1") >= 2.0);

    // Second attempt succeeds once due again.
    h.store
        .reschedule_item(&item_id, Utc::now())
        .await
        .unwrap();
    settle().await;
    assert_eq!(
        h.store.get_item(&item_id).await.unwrap().status,
        QueueItemStatus::Completed
    );
    assert_eq!(h.store.get_pair("p1").await.unwrap().stats.successful, 1);

    h.delivery.drain(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn transient_failures_retry_then_exhaust() {
    let h = harness().await;
    h.store.create_pair(&pair("p1")).await.unwrap();
    let item_id = enqueue(&h.store, "p1", 1).await;

    for _ in 0..3 {
        h.client
            .fail_next_send("s1", PlatformError::TransientNetwork("connection reset".into()));
    }

    h.delivery.start();

    // First failure: attempts = 1, backoff ~120s.
    settle().await;
    let item = h.store.get_item(&item_id).await.unwrap();
    assert_eq!(item.status, QueueItemStatus::Pending);
    assert_eq!(item.attempts, 1);
    let backoff = (item.scheduled_at - Utc::now()).num_seconds();
    assert!((110..=121).contains(&backoff), "backoff 1: {backoff}");

    // Second failure: attempts = 2, backoff ~240s.
    h.store.reschedule_item(&item_id, Utc::now()).await.unwrap();
    settle().await;
    let item = h.store.get_item(&item_id).await.unwrap();
    assert_eq!(item.attempts, 2);
    let backoff = (item.scheduled_at - Utc::now()).num_seconds();
    assert!((230..=241).contains(&backoff), "backoff 2: {backoff}");

    // Third failure exhausts the attempts.
    h.store.reschedule_item(&item_id, Utc::now()).await.unwrap();
    settle().await;
    let item = h.store.get_item(&item_id).await.unwrap();
    assert_eq!(item.status, QueueItemStatus::Failed);
    assert_eq!(item.last_error.as_deref(), Some("connection reset"));
    assert_eq!(h.store.get_pair("p1").await.unwrap().stats.failed, 1);
    assert_eq!(h.client.sent_count(), 0);

    h.delivery.drain(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn peer_invalid_is_terminal_without_retry() {
    let h = harness().await;
    h.store.create_pair(&pair("p1")).await.unwrap();
    h.client
        .fail_next_send("s1", PlatformError::PeerInvalid("PEER_ID_INVALID".into()));
    let item_id = enqueue(&h.store, "p1", 1).await;

    h.delivery.start();
    settle().await;

    let item = h.store.get_item(&item_id).await.unwrap();
    assert_eq!(item.status, QueueItemStatus::Failed);

    // The pair keeps running; a following item succeeds.
    let next = enqueue(&h.store, "p1", 2).await;
    settle().await;
    assert_eq!(
        h.store.get_item(&next).await.unwrap().status,
        QueueItemStatus::Completed
    );

    h.delivery.drain(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn auth_expired_fails_item_and_signals_supervisor() {
    let mut h = harness().await;
    h.store.create_pair(&pair("p1")).await.unwrap();
    h.client.fail_next_send("s1", PlatformError::AuthExpired);
    let item_id = enqueue(&h.store, "p1", 1).await;

    h.delivery.start();
    settle().await;

    assert_eq!(
        h.store.get_item(&item_id).await.unwrap().status,
        QueueItemStatus::Failed
    );
    match h.signal_rx.try_recv() {
        Ok(SessionSignal::AuthExpired(session_id)) => assert_eq!(session_id, "s1"),
        other => panic!("expected auth signal, got {other:?}"),
    }

    h.delivery.drain(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn ban_indicator_halts_session_and_pauses_pairs() {
    let h = harness().await;
    h.store.create_pair(&pair("p1")).await.unwrap();
    h.client
        .fail_next_send("s1", PlatformError::Unknown("PEER_FLOOD".into()));
    let first = enqueue(&h.store, "p1", 1).await;

    h.delivery.start();
    settle().await;

    assert_eq!(
        h.store.get_item(&first).await.unwrap().status,
        QueueItemStatus::Failed
    );
    assert_eq!(
        h.store.get_pair("p1").await.unwrap().state,
        PairState::Paused
    );

    // Items for the halted session's pairs are deferred, never sent.
    let second = enqueue(&h.store, "p1", 2).await;
    settle().await;
    let item = h.store.get_item(&second).await.unwrap();
    assert_eq!(item.status, QueueItemStatus::Pending);
    assert_eq!(h.client.sent_count(), 0);

    h.delivery.drain(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn paused_queue_defers_claims() {
    let h = harness().await;
    h.store.create_pair(&pair("p1")).await.unwrap();

    h.delivery.start();
    h.delivery.pause();
    let item_id = enqueue(&h.store, "p1", 1).await;
    settle().await;

    assert_eq!(
        h.store.get_item(&item_id).await.unwrap().status,
        QueueItemStatus::Pending
    );
    assert_eq!(h.client.sent_count(), 0);

    h.delivery.resume();
    settle().await;
    assert_eq!(
        h.store.get_item(&item_id).await.unwrap().status,
        QueueItemStatus::Completed
    );

    h.delivery.drain(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn items_for_paused_pairs_are_deferred() {
    let h = harness().await;
    let mut p = pair("p1");
    p.state = PairState::Paused;
    h.store.create_pair(&p).await.unwrap();
    let item_id = enqueue(&h.store, "p1", 1).await;

    h.delivery.start();
    settle().await;

    let item = h.store.get_item(&item_id).await.unwrap();
    assert_eq!(item.status, QueueItemStatus::Pending);
    assert!(item.scheduled_at > Utc::now());
    assert_eq!(h.client.sent_count(), 0);

    h.delivery.drain(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn chain_pair_republishes_to_next_hop() {
    let h = harness().await;
    let mut first = pair("p1");
    first.chain = true;
    h.store.create_pair(&first).await.unwrap();

    let mut second = pair("p2");
    second.source_ref = "dst".into();
    second.destination_ref = "final".into();
    h.store.create_pair(&second).await.unwrap();

    enqueue(&h.store, "p1", 1).await;

    h.delivery.start();
    tokio::time::sleep(Duration::from_millis(600)).await;

    // Both hops delivered.
    let sent = h.client.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().any(|s| s.dest_ref == "dst"));
    assert!(sent.iter().any(|s| s.dest_ref == "final"));
    assert_eq!(h.store.get_pair("p2").await.unwrap().stats.successful, 1);

    h.delivery.drain(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn drain_releases_claimed_items() {
    let h = harness().await;
    h.store.create_pair(&pair("p1")).await.unwrap();
    enqueue(&h.store, "p1", 1).await;

    // Never start the workers; claim manually to simulate an interrupted
    // worker, then drain.
    h.store.claim_due(Utc::now(), 8).await.unwrap();
    h.delivery.drain(Duration::from_millis(100)).await;

    let stats = h.store.queue_stats().await.unwrap();
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.pending, 1);
}
