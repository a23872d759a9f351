// tests/integration/connection_test.rs

//! Integration tests for the connection manager: single-flight connect,
//! authentication gating, handshake headers and disconnect semantics.

use super::test_helpers::{
    COOKIE_NAME, ConnectReply, MockServer, SETTLE, TEST_KEY, TEST_TOKEN, TestContext,
    init_tracing, now_ms, session_json, test_settings, wait_until,
};
use futures::future::join_all;
use orderfeed::core::credentials::{
    AesGcmDecryptor, CredentialProvider, MemorySessionStore, SessionStore,
};
use orderfeed::core::protocol::{HeartBeat, StompCommand};
use orderfeed::core::{ConnectionStatus, RealtimeClient, RealtimeError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

// ===== Single-flight connect =====

#[tokio::test]
async fn test_concurrent_connects_share_one_handshake() {
    let ctx = TestContext::new();
    ctx.server.set_open_delay(Duration::from_millis(50));

    let results = join_all((0..16).map(|_| ctx.client.connect())).await;

    assert_eq!(ctx.server.opens(), 1);
    let first = results[0].as_ref().unwrap();
    for result in &results {
        let conn = result.as_ref().unwrap();
        assert!(Arc::ptr_eq(first, conn));
    }
    assert!(ctx.client.is_connected());
}

#[tokio::test]
async fn test_concurrent_connects_share_one_rejection() {
    let ctx = TestContext::new();
    ctx.server.set_open_delay(Duration::from_millis(50));
    ctx.server.set_reply(ConnectReply::Error("Bad credentials".into()));

    let results = join_all((0..8).map(|_| ctx.client.connect())).await;

    assert_eq!(ctx.server.opens(), 1);
    let first = results[0].as_ref().unwrap_err().clone();
    assert!(matches!(first, RealtimeError::HandshakeFailed(ref m) if m.contains("Bad credentials")));
    for result in results {
        assert_eq!(result.unwrap_err(), first);
    }
    assert!(matches!(ctx.client.state(), ConnectionStatus::Failed(_)));
}

#[tokio::test]
async fn test_connect_when_connected_reuses_connection() {
    let ctx = TestContext::new();
    let first = ctx.client.connect().await.unwrap();
    let second = ctx.client.connect().await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(ctx.server.opens(), 1);
}

#[tokio::test]
async fn test_failed_handshake_allows_fresh_retry() {
    let ctx = TestContext::new();
    ctx.server.set_reply(ConnectReply::Error("try later".into()));
    assert!(ctx.client.connect().await.is_err());

    ctx.server.set_reply(ConnectReply::Connected);
    let conn = ctx.client.connect().await.unwrap();

    assert_eq!(ctx.server.opens(), 2);
    assert!(conn.is_open());
    assert_eq!(ctx.client.state(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_transport_refusal_is_handshake_failure() {
    let ctx = TestContext::new();
    ctx.server.refuse_transport(true);

    let err = ctx.client.connect().await.unwrap_err();
    assert!(matches!(err, RealtimeError::HandshakeFailed(_)));
    assert!(!ctx.client.is_connected());
}

#[tokio::test]
async fn test_handshake_times_out_without_connected_frame() {
    let mut settings = test_settings();
    settings.connect_timeout = Duration::from_millis(100);
    let ctx = TestContext::with_settings(settings);
    ctx.seed_session(TEST_TOKEN, now_ms() + 3_600_000);
    ctx.server.set_reply(ConnectReply::Silent);

    let err = ctx.client.connect().await.unwrap_err();
    assert!(matches!(err, RealtimeError::HandshakeFailed(ref m) if m.contains("CONNECTED")));
    // The half-open link is closed on failure.
    assert!(wait_until(SETTLE, || !ctx.server.is_link_open(0)).await);
}

// ===== Authentication =====

#[tokio::test]
async fn test_no_token_fails_without_opening_transport() {
    let ctx = TestContext::unauthenticated();

    let err = ctx.client.connect().await.unwrap_err();

    assert_eq!(err, RealtimeError::Unauthenticated);
    assert_eq!(ctx.server.opens(), 0);
    assert_eq!(
        ctx.client.state(),
        ConnectionStatus::Failed(RealtimeError::Unauthenticated)
    );
}

#[tokio::test]
async fn test_expired_token_is_unauthenticated() {
    let ctx = TestContext::unauthenticated();
    ctx.seed_session(TEST_TOKEN, now_ms() - 1_000);

    let err = ctx.client.connect().await.unwrap_err();

    assert_eq!(err, RealtimeError::Unauthenticated);
    assert_eq!(ctx.server.opens(), 0);
}

#[tokio::test]
async fn test_token_is_read_fresh_on_each_attempt() {
    let ctx = TestContext::unauthenticated();
    assert!(ctx.client.connect().await.is_err());

    ctx.seed_session("bmV3LXRva2Vu", now_ms() + 60_000);
    let conn = ctx.client.connect().await.unwrap();

    assert_eq!(conn.token().as_str(), "bmV3LXRva2Vu");
}

/// A session store that looks at the client every time it is read.
#[derive(Default)]
struct ObservingStore {
    inner: MemorySessionStore,
    client: OnceLock<RealtimeClient>,
    reads: AtomicUsize,
}

impl SessionStore for ObservingStore {
    fn read(&self, key: &str) -> Result<Option<String>, RealtimeError> {
        if let Some(client) = self.client.get() {
            let _ = client.is_connected();
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.read(key)
    }
}

#[tokio::test]
async fn test_session_store_may_query_the_client_while_connecting() {
    init_tracing();
    let server = MockServer::new();
    server.set_open_delay(Duration::from_millis(20));
    let cipher = AesGcmDecryptor::new(TEST_KEY).unwrap();
    let store = Arc::new(ObservingStore::default());
    store.inner.set(
        COOKIE_NAME,
        cipher
            .encrypt(&session_json(TEST_TOKEN, now_ms() + 3_600_000))
            .unwrap(),
    );
    let credentials = Arc::new(CredentialProvider::new(
        store.clone(),
        Arc::new(cipher),
        COOKIE_NAME,
    ));
    let client = RealtimeClient::new(test_settings(), credentials, server.connector());
    store.client.set(client.clone()).unwrap();

    let results = join_all((0..4).map(|_| client.connect())).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(server.opens(), 1);
    assert!(store.reads.load(Ordering::SeqCst) >= 1);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_token_sent_on_transport_and_connect_frame() {
    let ctx = TestContext::new();
    ctx.client.connect().await.unwrap();

    let requests = ctx.server.requests();
    assert_eq!(requests.len(), 1);
    let expected = format!("Bearer {TEST_TOKEN}");
    assert_eq!(requests[0].header("authorization"), Some(expected.as_str()));
    assert_eq!(requests[0].url.as_str(), "ws://mock.local/ws");

    let frames = ctx.server.frames(0);
    let connect = &frames[0];
    assert_eq!(connect.command, StompCommand::Connect);
    assert_eq!(connect.get_header("Authorization"), Some(expected.as_str()));
    assert_eq!(connect.get_header("accept-version"), Some("1.2,1.1,1.0"));
    assert_eq!(connect.get_header("host"), Some("mock.local"));
    assert_eq!(connect.get_header("heart-beat"), Some("0,0"));
}

#[tokio::test]
async fn test_connected_frame_details_are_exposed() {
    let ctx = TestContext::new();
    let conn = ctx.client.connect().await.unwrap();

    assert_eq!(conn.version(), "1.2");
    assert_eq!(conn.server(), Some("mock/1.0"));
    assert_eq!(conn.heartbeat().send_every, None);
    assert_eq!(conn.heartbeat().expect_every, None);
}

// ===== Disconnect =====

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let ctx = TestContext::new();
    ctx.client.disconnect();
    ctx.client.disconnect();
    assert_eq!(ctx.client.state(), ConnectionStatus::Disconnected);

    ctx.client.connect().await.unwrap();
    ctx.client.disconnect();
    ctx.client.disconnect();
    assert_eq!(ctx.client.state(), ConnectionStatus::Disconnected);
    assert!(!ctx.client.is_connected());
}

#[tokio::test]
async fn test_disconnect_sends_disconnect_frame_and_closes() {
    let ctx = TestContext::new();
    let conn = ctx.client.connect().await.unwrap();

    ctx.client.disconnect();
    tokio::time::timeout(SETTLE, conn.closed()).await.unwrap();

    let frames = ctx.server.frames(0);
    assert_eq!(frames.last().unwrap().command, StompCommand::Disconnect);
    assert!(!ctx.server.is_link_open(0));
    assert!(!conn.is_open());
}

#[tokio::test]
async fn test_disconnect_during_handshake_rejects_waiters() {
    let ctx = TestContext::new();
    ctx.server.set_open_delay(Duration::from_millis(100));

    let client = ctx.client.clone();
    let pending = tokio::spawn(async move { client.connect().await });
    assert!(wait_until(SETTLE, || ctx.server.opens() == 1).await);

    ctx.client.disconnect();
    let result = pending.await.unwrap();

    assert_eq!(result.unwrap_err(), RealtimeError::ConnectionClosed);
    assert_eq!(ctx.client.state(), ConnectionStatus::Disconnected);
    // The orphaned link is torn down once its handshake completes.
    assert!(wait_until(SETTLE, || ctx.server.link_count() == 1 && !ctx.server.is_link_open(0)).await);
    assert!(!ctx.client.is_connected());
}

#[tokio::test]
async fn test_connect_after_disconnect_opens_new_link() {
    let ctx = TestContext::new();
    let first = ctx.client.connect().await.unwrap();
    ctx.client.disconnect();
    let second = ctx.client.connect().await.unwrap();

    assert_ne!(first.id(), second.id());
    assert_eq!(ctx.server.opens(), 2);
}

// ===== State notifications =====

#[tokio::test]
async fn test_watch_state_reports_transitions() {
    let ctx = TestContext::new();
    let mut rx = ctx.client.watch_state();
    assert_eq!(*rx.borrow(), ConnectionStatus::Disconnected);

    ctx.client.connect().await.unwrap();
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), ConnectionStatus::Connected);

    ctx.client.disconnect();
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_link_lost_during_first_connect_is_not_retried_in_background() {
    let ctx = TestContext::new();
    ctx.server.set_reply(ConnectReply::ConnectedThenClose);

    match ctx.client.connect().await {
        Err(err) => {
            // Dropped before the connection was handed out: the caller owns the retry.
            assert_eq!(err, RealtimeError::ConnectionClosed);
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(ctx.server.opens(), 1);
            assert_eq!(
                ctx.client.state(),
                ConnectionStatus::Failed(RealtimeError::ConnectionClosed)
            );
        }
        Ok(_) => {
            // Handed out first, so the drop is an ordinary loss.
            assert!(wait_until(SETTLE, || ctx.server.opens() >= 2).await);
        }
    }

    ctx.server.set_reply(ConnectReply::Connected);
    ctx.client.connect().await.unwrap();
    assert!(ctx.client.is_connected());
}

// ===== Heart-beats =====

#[tokio::test]
async fn test_silent_server_is_detected_as_lost() {
    let mut settings = test_settings();
    settings.heartbeat = HeartBeat::new(Duration::ZERO, Duration::from_millis(40));
    settings.reconnect_delay = None;
    let ctx = TestContext::with_settings(settings);
    ctx.seed_session(TEST_TOKEN, now_ms() + 3_600_000);
    ctx.server.set_server_heartbeat("40,0");

    let conn = ctx.client.connect().await.unwrap();
    assert_eq!(conn.heartbeat().expect_every, Some(Duration::from_millis(40)));

    assert!(wait_until(SETTLE, || !ctx.client.is_connected()).await);
    assert!(matches!(
        ctx.client.state(),
        ConnectionStatus::Failed(RealtimeError::Transport(_))
    ));
}
