// tests/integration/subscription_test.rs

//! Integration tests for topic subscriptions: fan-out, listener isolation,
//! payload parsing and protocol subscription bookkeeping.

use super::test_helpers::{ConnectReply, Inbox, SETTLE, TEST_TOKEN, TestContext, wait_until};
use orderfeed::core::protocol::{StompCommand, StompFrame, StompItem};
use orderfeed::core::{InboundMessage, Payload, RealtimeError};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_subscribe_delivers_parsed_json() {
    let ctx = TestContext::new();
    ctx.client.connect().await.unwrap();

    let inbox = Inbox::new();
    let _handle = ctx
        .client
        .subscribe("/topic/chat/room1", inbox.listener())
        .await
        .unwrap();

    assert_eq!(
        ctx.publish("/topic/chat/room1", r#"{"content":"hi","sender":"Bob"}"#)
            .await,
        1
    );
    assert!(wait_until(SETTLE, || inbox.len() == 1).await);

    let message = &inbox.messages()[0];
    assert_eq!(message.topic, "/topic/chat/room1");
    assert_eq!(message.destination.as_deref(), Some("/topic/chat/room1"));
    assert!(message.message_id.is_some());
    assert_eq!(
        message.payload,
        Payload::Json(json!({"content": "hi", "sender": "Bob"}))
    );
}

#[tokio::test]
async fn test_payload_deserializes_into_caller_type() {
    #[derive(Deserialize, Debug, PartialEq)]
    struct ChatMessage {
        content: String,
        sender: String,
    }

    let ctx = TestContext::new();
    let inbox = Inbox::new();
    let _handle = ctx
        .client
        .subscribe("/topic/chat/room2", inbox.listener())
        .await
        .unwrap();

    ctx.publish("/topic/chat/room2", r#"{"content":"yo","sender":"Ann"}"#)
        .await;
    assert!(wait_until(SETTLE, || inbox.len() == 1).await);

    let parsed: ChatMessage = inbox.messages()[0].payload.json().unwrap();
    assert_eq!(
        parsed,
        ChatMessage {
            content: "yo".into(),
            sender: "Ann".into()
        }
    );
}

#[tokio::test]
async fn test_two_listeners_both_notified_once() {
    let ctx = TestContext::new();
    let a = Inbox::new();
    let b = Inbox::new();
    let _ha = ctx
        .client
        .subscribe("/topic/payment/P1", a.listener())
        .await
        .unwrap();
    let _hb = ctx
        .client
        .subscribe("/topic/payment/P1", b.listener())
        .await
        .unwrap();

    // One protocol subscription backs both listeners.
    assert_eq!(ctx.publish("/topic/payment/P1", r#"{"status":"completed"}"#).await, 1);
    assert_eq!(ctx.server.subscriptions(0).len(), 1);

    assert!(wait_until(SETTLE, || a.len() == 1 && b.len() == 1).await);
    let expected = Payload::Json(json!({"status": "completed"}));
    assert_eq!(a.messages()[0].payload, expected);
    assert_eq!(b.messages()[0].payload, expected);

    // A sentinel message proves no duplicate delivery is still in flight.
    let sentinel = Inbox::new();
    let _hs = ctx
        .client
        .subscribe("/topic/sentinel", sentinel.listener())
        .await
        .unwrap();
    ctx.publish("/topic/sentinel", "done").await;
    assert!(wait_until(SETTLE, || sentinel.len() == 1).await);
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
}

#[tokio::test]
async fn test_listeners_invoked_in_registration_order() {
    let ctx = TestContext::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for name in ["first", "second", "third"] {
        let order = order.clone();
        let handle = ctx
            .client
            .subscribe("/topic/order/T1/status", move |_msg: &InboundMessage| {
                order.lock().push(name)
            })
            .await
            .unwrap();
        handles.push(handle);
    }

    ctx.publish("/topic/order/T1/status", r#"{"status":"PAID"}"#).await;
    assert!(wait_until(SETTLE, || order.lock().len() == 3).await);
    assert_eq!(*order.lock(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_unsubscribe_one_listener_keeps_the_other() {
    let ctx = TestContext::new();
    let l1 = Inbox::new();
    let l2 = Inbox::new();
    let h1 = ctx.client.subscribe("/topic/T", l1.listener()).await.unwrap();
    let _h2 = ctx.client.subscribe("/topic/T", l2.listener()).await.unwrap();

    assert!(h1.unsubscribe());
    assert_eq!(ctx.client.registry().listener_count("/topic/T"), 1);

    // The protocol subscription survives while a listener remains.
    assert!(ctx.server.frames_of(StompCommand::Unsubscribe).is_empty());

    ctx.publish("/topic/T", r#"{"n":1}"#).await;
    assert!(wait_until(SETTLE, || l2.len() == 1).await);

    // Route a sentinel through the same connection; by the time it arrives
    // any frame for l1 would have arrived as well.
    let sentinel = Inbox::new();
    let _hs = ctx
        .client
        .subscribe("/topic/sentinel", sentinel.listener())
        .await
        .unwrap();
    ctx.publish("/topic/sentinel", "done").await;
    assert!(wait_until(SETTLE, || sentinel.len() == 1).await);
    assert_eq!(l1.len(), 0);
}

#[tokio::test]
async fn test_last_unsubscribe_cancels_protocol_subscription() {
    let ctx = TestContext::new();
    let l1 = Inbox::new();
    let l2 = Inbox::new();
    let h1 = ctx.client.subscribe("/topic/T", l1.listener()).await.unwrap();
    let h2 = ctx.client.subscribe("/topic/T", l2.listener()).await.unwrap();

    assert!(h1.unsubscribe());
    assert!(h2.unsubscribe());

    assert!(wait_until(SETTLE, || ctx.server.frames_of(StompCommand::Unsubscribe).len() == 1).await);
    assert!(ctx.server.subscriptions(0).is_empty());
    let unsubscribes = ctx.server.frames_of(StompCommand::Unsubscribe);
    assert_eq!(unsubscribes.len(), 1);
    let expected = format!("Bearer {TEST_TOKEN}");
    assert_eq!(
        unsubscribes[0].get_header("Authorization"),
        Some(expected.as_str())
    );

    // The empty entry is kept.
    assert_eq!(ctx.client.registry().topics(), vec!["/topic/T".to_string()]);
    assert_eq!(ctx.client.registry().listener_count("/topic/T"), 0);
    assert!(!ctx.client.registry().is_bound("/topic/T"));
}

#[tokio::test]
async fn test_resubscribing_empty_topic_issues_new_subscribe() {
    let ctx = TestContext::new();
    let l1 = Inbox::new();
    let h1 = ctx.client.subscribe("/topic/T", l1.listener()).await.unwrap();
    assert!(h1.unsubscribe());

    let l2 = Inbox::new();
    let _h2 = ctx.client.subscribe("/topic/T", l2.listener()).await.unwrap();

    assert!(wait_until(SETTLE, || ctx.server.frames_of(StompCommand::Subscribe).len() == 2).await);
    assert_eq!(ctx.server.subscriptions(0).len(), 1);

    ctx.publish("/topic/T", "again").await;
    assert!(wait_until(SETTLE, || l2.len() == 1).await);
    assert_eq!(l1.len(), 0);
}

#[tokio::test]
async fn test_unsubscribe_twice_is_harmless() {
    let ctx = TestContext::new();
    let inbox = Inbox::new();
    let handle = ctx.client.subscribe("/topic/T", inbox.listener()).await.unwrap();
    let topic = handle.topic().to_string();
    let listener_id = handle.listener_id();

    assert!(handle.unsubscribe());
    assert!(!ctx.client.registry().remove(&topic, listener_id));
}

#[tokio::test]
async fn test_non_json_body_is_delivered_raw() {
    let ctx = TestContext::new();
    let inbox = Inbox::new();
    let _handle = ctx
        .client
        .subscribe("/topic/chat/room1", inbox.listener())
        .await
        .unwrap();

    ctx.publish("/topic/chat/room1", "plain text, not json").await;
    assert!(wait_until(SETTLE, || inbox.len() == 1).await);

    let payload = &inbox.messages()[0].payload;
    assert_eq!(payload, &Payload::Raw("plain text, not json".to_string()));
    assert_eq!(payload.as_raw(), Some("plain text, not json"));
    assert!(payload.as_json().is_none());
}

#[tokio::test]
async fn test_subscribe_connects_on_demand() {
    let ctx = TestContext::new();
    assert!(!ctx.client.is_connected());

    let inbox = Inbox::new();
    let _handle = ctx.client.subscribe("/topic/T", inbox.listener()).await.unwrap();

    assert!(ctx.client.is_connected());
    assert_eq!(ctx.server.opens(), 1);
    assert!(wait_until(SETTLE, || ctx.server.subscriptions(0).len() == 1).await);

    let subscribe = &ctx.server.frames_of(StompCommand::Subscribe)[0];
    let expected = format!("Bearer {TEST_TOKEN}");
    assert_eq!(subscribe.get_header("destination"), Some("/topic/T"));
    assert_eq!(subscribe.get_header("Authorization"), Some(expected.as_str()));
    assert_eq!(subscribe.get_header("ack"), Some("auto"));
    assert!(subscribe.get_header("id").is_some());
}

#[tokio::test]
async fn test_subscribe_without_token_registers_nothing() {
    let ctx = TestContext::unauthenticated();
    let inbox = Inbox::new();

    let err = ctx
        .client
        .subscribe("/topic/T", inbox.listener())
        .await
        .unwrap_err();

    assert_eq!(err, RealtimeError::Unauthenticated);
    assert!(ctx.client.registry().topics().is_empty());
    assert_eq!(ctx.server.opens(), 0);
}

#[tokio::test]
async fn test_subscribe_with_failed_handshake_registers_nothing() {
    let ctx = TestContext::new();
    ctx.server.set_reply(ConnectReply::Error("forbidden".into()));
    let inbox = Inbox::new();

    let err = ctx
        .client
        .subscribe("/topic/T", inbox.listener())
        .await
        .unwrap_err();

    assert!(matches!(err, RealtimeError::HandshakeFailed(_)));
    assert_eq!(ctx.client.registry().listener_count("/topic/T"), 0);
}

#[tokio::test]
async fn test_failed_subscribe_write_registers_nothing() {
    let ctx = TestContext::new();
    ctx.client.connect().await.unwrap();
    ctx.server.fail_writes(StompCommand::Subscribe);
    let inbox = Inbox::new();

    let err = ctx
        .client
        .subscribe("/topic/order/T1/status", inbox.listener())
        .await
        .unwrap_err();

    assert!(
        matches!(err, RealtimeError::SubscriptionFailed(ref m) if m.contains("/topic/order/T1/status"))
    );
    assert_eq!(ctx.client.registry().listener_count("/topic/order/T1/status"), 0);
    assert!(!ctx.client.registry().is_bound("/topic/order/T1/status"));

    // Once writes go through again a fresh subscribe works end to end.
    ctx.server.allow_writes();
    assert!(wait_until(SETTLE, || ctx.client.is_connected()).await);
    let _handle = ctx
        .client
        .subscribe("/topic/order/T1/status", inbox.listener())
        .await
        .unwrap();
    ctx.publish("/topic/order/T1/status", "paid").await;
    assert!(wait_until(SETTLE, || inbox.len() == 1).await);
}

#[tokio::test]
async fn test_disconnect_clears_subscriptions() {
    let ctx = TestContext::new();
    let inbox = Inbox::new();
    let handle = ctx.client.subscribe("/topic/T", inbox.listener()).await.unwrap();

    ctx.client.disconnect();

    assert!(ctx.client.registry().topics().is_empty());
    assert!(!handle.unsubscribe());

    // A new connection starts with no protocol subscriptions.
    ctx.client.connect().await.unwrap();
    assert!(ctx.server.subscriptions(1).is_empty());
}

#[tokio::test]
async fn test_message_routed_by_destination_without_subscription_header() {
    let ctx = TestContext::new();
    let inbox = Inbox::new();
    let _handle = ctx.client.subscribe("/topic/T", inbox.listener()).await.unwrap();

    let frame = StompFrame::new(StompCommand::Message)
        .header("destination", "/topic/T")
        .header("message-id", "m-1")
        .with_body("42");
    assert!(ctx.server.push(0, StompItem::Frame(frame)));

    assert!(wait_until(SETTLE, || inbox.len() == 1).await);
    assert_eq!(inbox.messages()[0].payload, Payload::Json(json!(42)));
    assert_eq!(inbox.messages()[0].header("message-id"), Some("m-1"));
}

#[tokio::test]
async fn test_message_for_unknown_topic_is_dropped() {
    let ctx = TestContext::new();
    let inbox = Inbox::new();
    let _handle = ctx.client.subscribe("/topic/T", inbox.listener()).await.unwrap();

    let stray = StompFrame::new(StompCommand::Message)
        .header("subscription", "sub-999")
        .header("destination", "/topic/other")
        .with_body("x");
    assert!(ctx.server.push(0, stray));
    ctx.publish("/topic/T", "mine").await;

    assert!(wait_until(SETTLE, || inbox.len() == 1).await);
    assert_eq!(inbox.messages()[0].payload, Payload::Raw("mine".into()));
}

#[tokio::test]
async fn test_listener_may_unsubscribe_itself() {
    let ctx = TestContext::new();
    let slot: Arc<Mutex<Option<orderfeed::core::SubscriptionHandle>>> = Arc::new(Mutex::new(None));
    let hits = Arc::new(Mutex::new(0usize));

    let handle = {
        let slot = slot.clone();
        let hits = hits.clone();
        ctx.client
            .subscribe("/topic/once", move |_msg: &InboundMessage| {
                *hits.lock() += 1;
                if let Some(handle) = slot.lock().take() {
                    handle.unsubscribe();
                }
            })
            .await
            .unwrap()
    };
    *slot.lock() = Some(handle);

    ctx.publish("/topic/once", "1").await;
    assert!(wait_until(SETTLE, || ctx.client.registry().listener_count("/topic/once") == 0).await);
    assert_eq!(*hits.lock(), 1);
}

#[tokio::test]
async fn test_message_for_cancelled_subscription_is_dropped() {
    let ctx = TestContext::new();
    let old = Inbox::new();
    let handle = ctx.client.subscribe("/topic/T", old.listener()).await.unwrap();
    let (old_id, _) = ctx.server.subscriptions(0)[0].clone();
    assert!(handle.unsubscribe());

    let current = Inbox::new();
    let _handle = ctx.client.subscribe("/topic/T", current.listener()).await.unwrap();
    let (new_id, _) = ctx.server.subscriptions(0)[0].clone();
    assert_ne!(old_id, new_id);

    // In flight when the old subscription was cancelled.
    let late = StompFrame::new(StompCommand::Message)
        .header("subscription", old_id.as_str())
        .header("destination", "/topic/T")
        .with_body("late");
    assert!(ctx.server.push(0, late));
    ctx.publish("/topic/T", "fresh").await;

    assert!(wait_until(SETTLE, || current.len() == 1).await);
    assert_eq!(current.messages()[0].payload, Payload::Raw("fresh".into()));
    assert_eq!(current.messages()[0].header("subscription"), Some(new_id.as_str()));
    assert_eq!(old.len(), 0);
}
