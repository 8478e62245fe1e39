//! Change notification engine tests against the in-memory notification bus.
//!
//! Run with: cargo test -p searchgate-server --test notification_engine

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;

use searchgate_server::notification::{
    ChangeEvent, EngineConfig, EngineState, EventGate, NotificationEngine, NotificationError,
    Operation, Subscription, SubscriptionFilter,
};
use searchgate_storage::{MemoryNotificationSource, DEFAULT_NOTIFICATION_CHANNEL};

const CHANNEL: &str = DEFAULT_NOTIFICATION_CHANNEL;

fn config() -> EngineConfig {
    EngineConfig {
        channel: CHANNEL.to_string(),
        max_retries: 3,
        reconnect_delay: Duration::from_millis(100),
        queue_capacity: 10,
    }
}

fn engine_with(source: &MemoryNotificationSource, config: EngineConfig) -> NotificationEngine {
    NotificationEngine::new(Arc::new(source.clone()), config)
}

fn change(operation: &str, cluster: &str, kind: &str, name: &str) -> Value {
    let data = json!({"kind": kind, "name": name, "namespace": "ns-a"});
    let mut payload = json!({
        "operation": operation,
        "table": "resources",
        "uid": format!("{cluster}/{name}"),
        "cluster": cluster,
    });
    let field = if operation == "DELETE" { "old_data" } else { "new_data" };
    payload[field] = data;
    payload
}

fn kinds(kinds: &[&str]) -> SubscriptionFilter {
    SubscriptionFilter::builder().kinds(kinds.iter().copied()).build()
}

/// Next event, or `None` if nothing arrives within a second of virtual time.
async fn next(subscription: &mut Subscription) -> Option<ChangeEvent> {
    tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .ok()
        .flatten()
}

/// Lets every spawned task run until idle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn wait_for_state(engine: &NotificationEngine, state: EngineState) {
    let mut changes = engine.state_changes();
    let reached = tokio::time::timeout(Duration::from_secs(30), changes.wait_for(|s| *s == state))
        .await
        .is_ok_and(|result| result.is_ok());
    assert!(reached, "engine never reached {state:?}, stuck at {:?}", engine.state());
}

// =============================================================================
// Delivery and filtering
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_delete_event_reaches_only_matching_subscription() {
    // Arrange
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let mut pods = engine.subscribe("s1", kinds(&["Pod"])).await.unwrap();
    let mut deployments = engine.subscribe("s2", kinds(&["Deployment"])).await.unwrap();

    // Act
    source.publish_json(CHANNEL, &change("DELETE", "c1", "Pod", "pod-1"));

    // Assert
    let event = next(&mut pods).await.expect("S1 should receive the delete");
    assert_eq!(event.operation, Operation::Delete);
    assert_eq!(event.uid, "c1/pod-1");
    assert_eq!(event.kind(), Some("Pod"));

    settle().await;
    assert!(matches!(pods.try_recv(), Err(TryRecvError::Empty)));
    assert!(matches!(deployments.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_events_arrive_in_publish_order() {
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let mut all = engine.subscribe("all", SubscriptionFilter::default()).await.unwrap();

    for i in 0..5 {
        source.publish_json(CHANNEL, &change("INSERT", "c1", "Pod", &format!("pod-{i}")));
    }

    for i in 0..5 {
        let event = next(&mut all).await.unwrap();
        assert_eq!(event.uid, format!("c1/pod-{i}"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_operation_and_cluster_filters_apply() {
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let filter = SubscriptionFilter::builder()
        .operations([Operation::Update])
        .clusters(["c2"])
        .build();
    let mut updates = engine.subscribe("updates", filter).await.unwrap();

    source.publish_json(CHANNEL, &change("INSERT", "c2", "Pod", "a"));
    source.publish_json(CHANNEL, &change("UPDATE", "c1", "Pod", "b"));
    source.publish_json(CHANNEL, &change("UPDATE", "c2", "Pod", "c"));

    let event = next(&mut updates).await.unwrap();
    assert_eq!(event.uid, "c2/c");
    settle().await;
    assert!(updates.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payloads_are_skipped() {
    // Arrange
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let mut all = engine.subscribe("all", SubscriptionFilter::default()).await.unwrap();

    // Act
    source.publish(CHANNEL, "not json");
    source.publish(CHANNEL, r#"{"operation":"TRUNCATE","uid":"x"}"#);
    source.publish_json(CHANNEL, &change("INSERT", "c1", "Pod", "ok"));

    // Assert
    let event = next(&mut all).await.unwrap();
    assert_eq!(event.uid, "c1/ok");
    assert!(engine.is_listening().await);
}

// =============================================================================
// Backpressure
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_full_queue_drops_for_that_subscriber_only() {
    // Arrange
    let source = MemoryNotificationSource::new();
    let engine = engine_with(
        &source,
        EngineConfig {
            queue_capacity: 2,
            ..config()
        },
    );
    let mut slow = engine.subscribe("slow", SubscriptionFilter::default()).await.unwrap();
    let mut fast = engine.subscribe("fast", SubscriptionFilter::default()).await.unwrap();

    // Act
    let mut fast_seen = Vec::new();
    for i in 0..5 {
        source.publish_json(CHANNEL, &change("INSERT", "c1", "Pod", &format!("pod-{i}")));
        fast_seen.push(next(&mut fast).await.unwrap().uid);
    }
    settle().await;

    // Assert
    assert_eq!(fast_seen.len(), 5);
    assert_eq!(slow.try_recv().unwrap().uid, "c1/pod-0");
    assert_eq!(slow.try_recv().unwrap().uid, "c1/pod-1");
    assert!(matches!(slow.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(engine.subscription_count(), 2);
}

// =============================================================================
// Registration
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_duplicate_id_is_rejected() {
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let mut first = engine.subscribe("same", kinds(&["Pod"])).await.unwrap();

    let err = engine.subscribe("same", kinds(&["Deployment"])).await.unwrap_err();

    assert!(matches!(err, NotificationError::Duplicate { ref id } if id == "same"));
    assert_eq!(engine.subscription_count(), 1);
    source.publish_json(CHANNEL, &change("INSERT", "c1", "Pod", "p"));
    assert!(next(&mut first).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_filter_is_rejected_before_connecting() {
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let filter = SubscriptionFilter {
        operations: vec!["TRUNCATE".to_string()],
        ..Default::default()
    };

    let err = engine.subscribe("bad", filter).await.unwrap_err();

    assert!(matches!(err, NotificationError::InvalidFilter { .. }));
    assert_eq!(source.connect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_closes_stream_and_is_idempotent() {
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let mut sub = engine.subscribe("s", SubscriptionFilter::default()).await.unwrap();

    assert!(engine.unsubscribe("s").await);
    assert!(!engine.unsubscribe("s").await);
    assert!(!engine.unsubscribe("never-registered").await);

    assert!(sub.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_are_listed() {
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let id = NotificationEngine::generate_id();
    let _sub = engine.subscribe(id.clone(), kinds(&["Pod"])).await.unwrap();

    let listed = engine.subscriptions();

    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].filter, kinds(&["Pod"]));
}

// =============================================================================
// Lazy start and stop
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_listener_starts_on_first_and_stops_after_last_subscription() {
    // Arrange
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    assert_eq!(source.connect_count(), 0);
    assert_eq!(engine.state(), EngineState::Disconnected);

    // Act: first subscription connects, second reuses the connection
    let _a = engine.subscribe("a", SubscriptionFilter::default()).await.unwrap();
    let _b = engine.subscribe("b", SubscriptionFilter::default()).await.unwrap();
    wait_for_state(&engine, EngineState::Listening).await;

    // Assert
    assert_eq!(source.connect_count(), 1);
    assert_eq!(source.open_connections(), 1);

    engine.unsubscribe("a").await;
    settle().await;
    assert!(engine.is_listening().await);

    engine.unsubscribe("b").await;
    settle().await;
    assert!(!engine.is_listening().await);
    assert_eq!(source.open_connections(), 0);
    assert_eq!(engine.state(), EngineState::Disconnected);

    // A new subscription starts a fresh listener
    let mut c = engine.subscribe("c", SubscriptionFilter::default()).await.unwrap();
    assert_eq!(source.connect_count(), 2);
    source.publish_json(CHANNEL, &change("INSERT", "c1", "Pod", "after-restart"));
    assert_eq!(next(&mut c).await.unwrap().uid, "c1/after-restart");
}

#[tokio::test(start_paused = true)]
async fn test_first_subscription_fails_when_listen_cannot_start() {
    let source = MemoryNotificationSource::new();
    source.refuse_connections(true);
    let engine = engine_with(&source, config());

    let err = engine
        .subscribe("s", SubscriptionFilter::default())
        .await
        .unwrap_err();

    assert!(matches!(err, NotificationError::Connect { .. }));
    assert_eq!(engine.subscription_count(), 0);
    assert!(!engine.is_listening().await);

    source.refuse_connections(false);
    assert!(engine.subscribe("s", SubscriptionFilter::default()).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_receivers_are_removed() {
    // Arrange
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let gone = engine.subscribe("gone", SubscriptionFilter::default()).await.unwrap();
    let mut kept = engine.subscribe("kept", SubscriptionFilter::default()).await.unwrap();
    drop(gone);

    // Act
    source.publish_json(CHANNEL, &change("INSERT", "c1", "Pod", "p"));

    // Assert
    assert!(next(&mut kept).await.is_some());
    settle().await;
    assert_eq!(engine.subscription_count(), 1);
    assert_eq!(engine.subscriptions()[0].id, "kept");
}

#[tokio::test(start_paused = true)]
async fn test_listener_stops_when_every_receiver_is_dropped() {
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let only = engine.subscribe("only", SubscriptionFilter::default()).await.unwrap();
    drop(only);

    source.publish_json(CHANNEL, &change("INSERT", "c1", "Pod", "p"));
    settle().await;

    assert_eq!(engine.subscription_count(), 0);
    assert!(!engine.is_listening().await);
    assert_eq!(source.open_connections(), 0);
}

// =============================================================================
// Reconnect
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_connection_loss() {
    // Arrange
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let mut sub = engine.subscribe("s", SubscriptionFilter::default()).await.unwrap();
    wait_for_state(&engine, EngineState::Listening).await;

    // Act
    source.drop_connections();
    wait_for_state(&engine, EngineState::Reconnecting).await;
    wait_for_state(&engine, EngineState::Listening).await;

    // Assert
    assert_eq!(source.connect_count(), 2);
    source.publish_json(CHANNEL, &change("UPDATE", "c1", "Pod", "after-reconnect"));
    assert_eq!(next(&mut sub).await.unwrap().uid, "c1/after-reconnect");
}

#[tokio::test(start_paused = true)]
async fn test_failed_reconnect_attempts_are_retried() {
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let mut sub = engine.subscribe("s", SubscriptionFilter::default()).await.unwrap();
    wait_for_state(&engine, EngineState::Listening).await;

    source.fail_next_connects(2);
    source.drop_connections();
    wait_for_state(&engine, EngineState::Reconnecting).await;
    wait_for_state(&engine, EngineState::Listening).await;

    // One initial connect, two failures, one success
    assert_eq!(source.connect_count(), 4);
    source.publish_json(CHANNEL, &change("INSERT", "c1", "Pod", "p"));
    assert!(next(&mut sub).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_giving_up_closes_every_subscription() {
    // Arrange
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let mut a = engine.subscribe("a", SubscriptionFilter::default()).await.unwrap();
    let mut b = engine.subscribe("b", kinds(&["Pod"])).await.unwrap();
    wait_for_state(&engine, EngineState::Listening).await;

    // Act
    source.refuse_connections(true);
    source.drop_connections();
    wait_for_state(&engine, EngineState::Stopped).await;

    // Assert
    assert!(a.recv().await.is_none());
    assert!(b.recv().await.is_none());
    assert_eq!(engine.subscription_count(), 0);
    assert_eq!(source.connect_count(), 1 + config().max_retries as usize);
    assert!(!engine.is_listening().await);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_streams() {
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let mut sub = engine.subscribe("s", SubscriptionFilter::default()).await.unwrap();

    engine.shutdown().await;
    settle().await;

    assert!(sub.recv().await.is_none());
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(source.open_connections(), 0);
}

// =============================================================================
// Gated subscriptions
// =============================================================================

struct ClusterGate {
    allowed: &'static str,
}

#[async_trait]
impl EventGate for ClusterGate {
    async fn allows(&self, event: &ChangeEvent) -> bool {
        event.cluster == self.allowed
    }
}

#[tokio::test(start_paused = true)]
async fn test_gate_hides_events_it_rejects() {
    // Arrange
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let mut gated = engine
        .subscribe_with_gate(
            "gated",
            SubscriptionFilter::default(),
            Arc::new(ClusterGate { allowed: "c1" }),
        )
        .await
        .unwrap();

    // Act
    source.publish_json(CHANNEL, &change("INSERT", "c2", "Pod", "hidden"));
    source.publish_json(CHANNEL, &change("INSERT", "c1", "Pod", "visible"));

    // Assert
    assert_eq!(gated.id(), "gated");
    assert_eq!(next(&mut gated).await.unwrap().uid, "c1/visible");
    settle().await;
    assert!(gated.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribing_gated_subscription_ends_stream() {
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let mut gated = engine
        .subscribe_with_gate(
            "gated",
            SubscriptionFilter::default(),
            Arc::new(ClusterGate { allowed: "c1" }),
        )
        .await
        .unwrap();

    assert!(engine.unsubscribe("gated").await);

    assert!(gated.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_gated_subscription_is_removed_while_gate_denies() {
    // Arrange
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let gated = engine
        .subscribe_with_gate(
            "gated",
            SubscriptionFilter::default(),
            Arc::new(ClusterGate { allowed: "c1" }),
        )
        .await
        .unwrap();
    wait_for_state(&engine, EngineState::Listening).await;

    // Act: the consumer leaves and only denied events follow
    drop(gated);
    for i in 0..50 {
        source.publish_json(CHANNEL, &change("INSERT", "c2", "Pod", &format!("p{i}")));
    }
    settle().await;

    // Assert
    assert_eq!(engine.subscription_count(), 0);
    assert!(!engine.is_listening().await);
    assert_eq!(source.open_connections(), 0);
    assert_eq!(engine.state(), EngineState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_gated_subscription_is_removed_without_further_events() {
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let gated = engine
        .subscribe_with_gate(
            "gated",
            SubscriptionFilter::default(),
            Arc::new(ClusterGate { allowed: "c1" }),
        )
        .await
        .unwrap();

    drop(gated);
    settle().await;

    assert_eq!(engine.subscription_count(), 0);
    assert!(!engine.is_listening().await);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_one_gated_subscription_keeps_the_others() {
    // Arrange
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let gone = engine
        .subscribe_with_gate(
            "gone",
            SubscriptionFilter::default(),
            Arc::new(ClusterGate { allowed: "c1" }),
        )
        .await
        .unwrap();
    let mut kept = engine.subscribe("kept", SubscriptionFilter::default()).await.unwrap();

    // Act
    drop(gone);
    settle().await;
    source.publish_json(CHANNEL, &change("INSERT", "c1", "Pod", "p"));

    // Assert
    assert_eq!(next(&mut kept).await.unwrap().uid, "c1/p");
    assert_eq!(engine.subscription_count(), 1);
    assert!(engine.is_listening().await);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_ends_gated_stream_while_gate_denies() {
    // Arrange
    let source = MemoryNotificationSource::new();
    let engine = engine_with(&source, config());
    let mut gated = engine
        .subscribe_with_gate(
            "gated",
            SubscriptionFilter::default(),
            Arc::new(ClusterGate { allowed: "c1" }),
        )
        .await
        .unwrap();
    source.publish_json(CHANNEL, &change("INSERT", "c2", "Pod", "denied"));
    settle().await;

    // Act
    engine.shutdown().await;

    // Assert
    let closed = tokio::time::timeout(Duration::from_secs(1), gated.recv()).await;
    assert!(matches!(closed, Ok(None)), "gated stream must end on shutdown");
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.subscription_count(), 0);
}
