//! Integration tests for the hub
//!
//! Drives the hub the way a transport does: accept connections, feed client
//! frames, drain outbound queues.

use cablecast::auth::{Grant, GrantSet, GrantType, SubToken};
use cablecast::server::{
    ChannelRoutes, ClientFrame, Connection, OutboundMessage, OutboundReceiver, ServerFrame,
    StreamHandler,
};
use cablecast::{
    AllowAll, HandshakeContext, Hub, HubConfig, HubError, TokenAuthorizer, TopicPattern,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const TEST_SECRET: &[u8] = b"test-secret-for-integration-tests";

fn create_token(client_id: &str, patterns: &[&str]) -> String {
    let mut grants = GrantSet::new();
    for pattern in patterns {
        let p = TopicPattern::parse(pattern).unwrap();
        grants.add(Grant::new(GrantType::Read, p.clone()));
        grants.add(Grant::new(GrantType::Write, p));
    }
    SubToken::create(client_id.to_string(), grants, None, TEST_SECRET)
        .unwrap()
        .to_string()
}

fn open_hub() -> Hub {
    Hub::new(
        HubConfig::new(),
        Arc::new(AllowAll),
        ChannelRoutes::catch_all(Arc::new(StreamHandler::republishing())),
    )
}

fn token_hub() -> Hub {
    Hub::new(
        HubConfig::new(),
        Arc::new(TokenAuthorizer::new(TEST_SECRET, None)),
        ChannelRoutes::catch_all(Arc::new(StreamHandler::republishing())),
    )
}

fn drain(rx: &mut OutboundReceiver) -> Vec<ServerFrame> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .map(OutboundMessage::into_frame)
        .collect()
}

fn messages(rx: &mut OutboundReceiver) -> Vec<Value> {
    drain(rx)
        .into_iter()
        .filter_map(|frame| match frame {
            ServerFrame::Message { payload, .. } => Some(payload),
            _ => None,
        })
        .collect()
}

async fn connect(hub: &Hub, ctx: HandshakeContext) -> (Arc<Connection>, OutboundReceiver) {
    let (conn, mut rx) = hub.multiplexer().accept_connection(ctx).await.unwrap();
    drain(&mut rx);
    (conn, rx)
}

async fn subscribe(hub: &Hub, conn: &Arc<Connection>, channel: &str) {
    hub.multiplexer()
        .handle_frame(
            conn,
            ClientFrame::Subscribe {
                channel: channel.to_string(),
                payload: Value::Null,
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_room_scenario() {
    let hub = open_hub();
    let (c1, mut rx1) = connect(&hub, HandshakeContext::default()).await;
    let (c2, mut rx2) = connect(&hub, HandshakeContext::default()).await;

    subscribe(&hub, &c1, "room:42").await;
    subscribe(&hub, &c2, "room:42").await;
    drain(&mut rx1);
    drain(&mut rx2);

    let report = hub.publish("room:42", json!({"text": "first"})).unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.delivered, 2);
    assert_eq!(messages(&mut rx1), vec![json!({"text": "first"})]);
    assert_eq!(messages(&mut rx2), vec![json!({"text": "first"})]);

    hub.multiplexer().close_connection(&c2, "gone").await;

    let report = hub.publish("room:42", json!({"text": "second"})).unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.delivered, 1);
    assert!(report.is_complete());
    assert_eq!(messages(&mut rx1), vec![json!({"text": "second"})]);
}

#[tokio::test]
async fn test_subscribe_twice_then_unsubscribe_once() {
    let hub = open_hub();
    let (conn, mut rx) = connect(&hub, HandshakeContext::default()).await;

    subscribe(&hub, &conn, "room:1").await;
    subscribe(&hub, &conn, "room:1").await;
    assert_eq!(hub.table().subscribers_of("room:1").len(), 1);

    hub.multiplexer()
        .handle_frame(&conn, ClientFrame::Unsubscribe { channel: "room:1".to_string() })
        .await
        .unwrap();
    assert!(!hub.table().is_active("room:1"));

    drain(&mut rx);
    let report = hub.publish("room:1", json!(1)).unwrap();
    assert_eq!(report.attempted, 0);
    assert!(messages(&mut rx).is_empty());
}

#[tokio::test]
async fn test_token_grants_limit_subscriptions() {
    let hub = token_hub();
    let token = create_token("alice", &["room:*"]);
    let (conn, mut rx) = connect(&hub, HandshakeContext::with_token(token)).await;
    assert_eq!(conn.identity().client_id.as_deref(), Some("alice"));

    subscribe(&hub, &conn, "room:1").await;
    let before = hub.table().active_topics();

    let err = hub
        .multiplexer()
        .open_channel(&conn, "admin:audit", Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::SubscriptionRejected { .. }));

    // Denial leaves the table as it was and the connection open
    assert_eq!(hub.table().active_topics(), before);
    assert!(conn.is_open());

    let frames = drain(&mut rx);
    assert!(frames.contains(&ServerFrame::ConfirmSubscription {
        channel: "room:1".to_string()
    }));
    assert!(frames.iter().any(|f| matches!(
        f,
        ServerFrame::RejectSubscription { channel, .. } if channel == "admin:audit"
    )));
}

#[tokio::test]
async fn test_handshake_rejected_without_token() {
    let hub = token_hub();

    let err = hub
        .multiplexer()
        .accept_connection(HandshakeContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::HandshakeRejected(_)));

    let err = hub
        .multiplexer()
        .accept_connection(HandshakeContext::with_token("sub-forged.token"))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::HandshakeRejected(_)));
    assert_eq!(hub.registry().count(), 0);
}

#[tokio::test]
async fn test_data_frame_republishes_to_room() {
    let hub = token_hub();
    let (alice, mut alice_rx) = connect(&hub, HandshakeContext::with_token(create_token("alice", &["chat:*"]))).await;
    let (bob, mut bob_rx) = connect(&hub, HandshakeContext::with_token(create_token("bob", &["chat:*"]))).await;

    subscribe(&hub, &alice, "chat:lobby").await;
    subscribe(&hub, &bob, "chat:lobby").await;
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    hub.multiplexer()
        .handle_frame(
            &alice,
            ClientFrame::Data {
                channel: "chat:lobby".to_string(),
                payload: json!({"text": "hello bob"}),
            },
        )
        .await
        .unwrap();

    assert_eq!(messages(&mut bob_rx), vec![json!({"text": "hello bob"})]);
    assert_eq!(messages(&mut alice_rx), vec![json!({"text": "hello bob"})]);
}

#[tokio::test]
async fn test_close_removes_connection_from_every_topic() {
    let hub = open_hub();
    let (conn, _rx) = connect(&hub, HandshakeContext::default()).await;
    let (other, _other_rx) = connect(&hub, HandshakeContext::default()).await;

    for topic in ["room:1", "room:2", "room:3"] {
        subscribe(&hub, &conn, topic).await;
    }
    subscribe(&hub, &other, "room:1").await;
    assert_eq!(hub.table().topic_count(), 3);

    hub.multiplexer().close_connection(&conn, "bye").await;

    assert_eq!(hub.table().topic_count(), 1);
    assert_eq!(hub.table().subscribers_of("room:1").len(), 1);
    assert_eq!(hub.registry().count(), 1);
    assert!(hub.registry().lookup(conn.id()).is_err());
}

#[tokio::test]
async fn test_concurrent_connections_and_subscriptions() {
    let hub = Arc::new(open_hub());
    let mut handles = vec![];

    for i in 0..100 {
        let hub = hub.clone();
        handles.push(tokio::spawn(async move {
            let (conn, _rx) = hub
                .multiplexer()
                .accept_connection(HandshakeContext::default())
                .await
                .unwrap();
            let topic = format!("room:{}", i % 10);
            hub.multiplexer()
                .open_channel(&conn, &topic, Value::Null)
                .await
                .unwrap();

            // Simulate some work
            tokio::time::sleep(Duration::from_micros(100)).await;

            hub.multiplexer().close_connection(&conn, "done").await;
        }));
    }

    for handle in handles {
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("task timed out")
            .unwrap();
    }

    assert_eq!(hub.registry().count(), 0);
    assert_eq!(hub.table().topic_count(), 0);
}

#[tokio::test]
async fn test_concurrent_publish_delivers_everything() {
    let hub = Arc::new(Hub::new(
        HubConfig::new().outbound_capacity(1000),
        Arc::new(AllowAll),
        ChannelRoutes::catch_all(Arc::new(StreamHandler::default())),
    ));

    let mut receivers = vec![];
    for _ in 0..10 {
        let (conn, rx) = connect(&hub, HandshakeContext::default()).await;
        subscribe(&hub, &conn, "events:all").await;
        receivers.push((conn, rx));
    }

    let mut publishers = vec![];
    for p in 0..5 {
        let hub = hub.clone();
        publishers.push(tokio::spawn(async move {
            for i in 0..20 {
                hub.publish("events:all", json!({"publisher": p, "seq": i})).unwrap();
            }
        }));
    }
    for publisher in publishers {
        publisher.await.unwrap();
    }

    for (_conn, mut rx) in receivers {
        assert_eq!(messages(&mut rx).len(), 100);
    }
}

#[tokio::test]
async fn test_undecodable_frame_reports_error() {
    let hub = open_hub();
    let (conn, mut rx) = connect(&hub, HandshakeContext::default()).await;

    let err = cablecast::server::frames::decode_frame(r#"{"type":"bogus"}"#).unwrap_err();
    hub.multiplexer().reject_frame(&conn, &err);

    assert!(matches!(
        drain(&mut rx).as_slice(),
        [ServerFrame::Error { channel: None, .. }]
    ));
    assert!(conn.is_open());
}
