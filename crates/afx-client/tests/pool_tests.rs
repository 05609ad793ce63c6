//! Client pool tests: session gating, ingress buffering, overflow drop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;

use afx_client::{ClientError, ClientPool, MockPlatformClient};
use afx_common::{ActivityKind, EventKind, MessageSnapshot, Session, UpdateEvent};
use afx_store::{SqliteStore, Store};

fn session(id: &str, user_id: &str, active: bool) -> Session {
    Session {
        id: id.to_string(),
        user_id: user_id.to_string(),
        phone: "+15550100".to_string(),
        credential_blob: if active { "blob".into() } else { String::new() },
        active,
        last_health_at: None,
        display_name: None,
        created_at: Utc::now(),
    }
}

fn update(session_id: &str, message_id: i64) -> UpdateEvent {
    UpdateEvent {
        session_id: session_id.to_string(),
        kind: EventKind::New,
        source_ref: "src".to_string(),
        message_id,
        snapshot: MessageSnapshot::text("hello"),
    }
}

async fn pool_with(
    buffer: usize,
) -> (Arc<ClientPool>, Arc<MockPlatformClient>, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    store.init_schema().await.unwrap();
    let client = Arc::new(MockPlatformClient::new());
    let pool = Arc::new(ClientPool::new(client.clone(), store.clone(), buffer));
    (pool, client, store)
}

#[tokio::test]
async fn open_rejects_unusable_session() {
    let (pool, _client, _store) = pool_with(16).await;

    let result = pool.open_session(&session("s1", "u1", false)).await;
    assert!(matches!(result, Err(ClientError::SessionNotUsable(_))));
    assert!(!pool.is_open("s1"));
}

#[tokio::test]
async fn subscriber_receives_injected_updates() {
    let (pool, client, _store) = pool_with(16).await;
    pool.open_session(&session("s1", "u1", true)).await.unwrap();

    let mut rx = pool.subscribe("s1").unwrap();
    assert!(client.inject_update("s1", update("s1", 1)).await);
    assert!(client.inject_update("s1", update("s1", 2)).await);

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.message_id, 1);
    assert_eq!(second.message_id, 2);
}

#[tokio::test]
async fn overflow_drops_oldest_and_logs() {
    let (pool, client, store) = pool_with(4).await;
    pool.open_session(&session("s1", "u1", true)).await.unwrap();

    let mut rx = pool.subscribe("s1").unwrap();

    // Six updates into a buffer of four without consuming any.
    for i in 1..=6 {
        client.inject_update("s1", update("s1", i)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The two oldest were evicted.
    match rx.recv().await {
        Err(RecvError::Lagged(skipped)) => assert_eq!(skipped, 2),
        other => panic!("expected lag, got {other:?}"),
    }
    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(rx.recv().await.unwrap().message_id);
    }
    assert_eq!(seen, vec![3, 4, 5, 6]);

    // Overflow was recorded in the activity log.
    let activity = store.recent_activity("u1", 10).await.unwrap();
    assert!(activity
        .iter()
        .any(|e| e.kind == ActivityKind::IngressOverflow));
}

#[tokio::test]
async fn verify_otp_persists_credentials() {
    let (pool, _client, store) = pool_with(16).await;
    store
        .create_user(&afx_common::User::new("u1", afx_common::Plan::Free))
        .await
        .unwrap();
    let mut s = session("s1", "u1", false);
    s.active = false;
    store.create_session(&s).await.unwrap();

    let hash = pool.send_otp(&s, "+15550100").await.unwrap();
    let grant = pool.verify_otp(&s, "12345", &hash).await.unwrap();
    assert!(!grant.credential_blob.is_empty());

    let stored = store.get_session("s1").await.unwrap();
    assert_eq!(stored.credential_blob, grant.credential_blob);
    assert!(stored.active);
    assert_eq!(stored.display_name.as_deref(), Some("Mock Account"));

    let activity = store.recent_activity("u1", 10).await.unwrap();
    assert!(activity
        .iter()
        .any(|e| e.kind == ActivityKind::SessionConnected));
}

#[tokio::test]
async fn close_session_stops_sends() {
    let (pool, client, _store) = pool_with(16).await;
    pool.open_session(&session("s1", "u1", true)).await.unwrap();

    pool.forward("s1", "src", "dst", 42, false).await.unwrap();
    assert_eq!(client.sent_count(), 1);

    pool.close_session("s1").await.unwrap();
    assert!(!pool.is_open("s1"));
    assert!(matches!(
        pool.forward("s1", "src", "dst", 43, false).await,
        Err(ClientError::SessionNotOpen(_))
    ));
}

#[tokio::test]
async fn scripted_send_failures_surface() {
    let (pool, client, _store) = pool_with(16).await;
    pool.open_session(&session("s1", "u1", true)).await.unwrap();

    client.fail_next_send(
        "s1",
        afx_common::PlatformError::RateLimited { wait_s: 30 },
    );

    match pool.copy("s1", "dst", &MessageSnapshot::text("x"), true).await {
        Err(ClientError::Platform(afx_common::PlatformError::RateLimited { wait_s })) => {
            assert_eq!(wait_s, 30)
        }
        other => panic!("unexpected: {other:?}"),
    }

    // Next send succeeds.
    pool.copy("s1", "dst", &MessageSnapshot::text("x"), true)
        .await
        .unwrap();
    assert_eq!(client.sent_count(), 1);
}
