//! Realtime transport against the mock STOMP broker.

use std::time::Duration;

use hs_protocol::NotificationRecord;
use hs_test_utils::fixtures;
use hs_test_utils::{MockStompBroker, RefusingEndpoint};
use notifier::transport::{ConnectionState, Identity, TransportConfig, TransportManager};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

fn manager_for(base_url: &str, destination: &str, send_connection_test: bool) -> TransportManager {
    TransportManager::new(TransportConfig {
        url: format!("{base_url}/ws/websocket"),
        token: Some("test-token".to_owned()),
        destination: destination.to_owned(),
        reconnect_base_delay: Duration::from_millis(10),
        max_reconnect_attempts: 5,
        send_connection_test,
    })
}

fn identity(id: i64) -> Identity {
    Identity::new(id).unwrap()
}

async fn eventually(cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn wait_for_state(manager: &TransportManager, want: ConnectionState) -> bool {
    let mut rx = manager.subscribe_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == want))
        .await
        .is_ok_and(|r| r.is_ok())
}

async fn recv(rx: &mut mpsc::Receiver<NotificationRecord>) -> NotificationRecord {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("sink closed")
}

// ---------------------------------------------------------------------------
// Subscription lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_subscribes_with_expanded_destination() {
    let broker = MockStompBroker::start().await.unwrap();
    let manager = manager_for(&broker.base_url(), "/topic/users/{identity}/notifications", false);
    let (tx, _rx) = mpsc::channel(8);

    manager.connect(identity(42), tx).await;
    assert!(broker.wait_for_subscriptions(1, WAIT).await);
    assert!(wait_for_state(&manager, ConnectionState::Connected).await);

    let subs = broker.active_subscriptions();
    assert_eq!(subs[0].id, "sub-42");
    assert_eq!(subs[0].destination, "/topic/users/42/notifications");
    assert_eq!(manager.subscription_count(), 1);
    assert!(manager.is_connected());
    assert_eq!(broker.connect_frames().len(), 1);

    manager.disconnect().await;
}

#[tokio::test]
async fn second_connect_replaces_the_subscription() {
    let broker = MockStompBroker::start().await.unwrap();
    let manager = manager_for(&broker.base_url(), "/user/queue/notifications", false);

    let (tx1, _rx1) = mpsc::channel(8);
    manager.connect(identity(7), tx1).await;
    assert!(broker.wait_for_subscriptions(1, WAIT).await);

    let (tx2, _rx2) = mpsc::channel(8);
    manager.connect(identity(8), tx2).await;
    assert!(broker.wait_for_connections(2, WAIT).await);
    assert!(
        eventually(|| {
            let subs = broker.active_subscriptions();
            subs.len() == 1 && subs[0].id == "sub-8"
        })
        .await,
        "exactly one live subscription expected, got {:?}",
        broker.active_subscriptions()
    );
    assert!(wait_for_state(&manager, ConnectionState::Connected).await);
    assert_eq!(manager.subscription_count(), 1);

    manager.disconnect().await;
}

#[tokio::test]
async fn reconnecting_same_identity_keeps_one_registration() {
    let broker = MockStompBroker::start().await.unwrap();
    let manager = manager_for(&broker.base_url(), "/user/queue/notifications", false);

    let (tx1, mut rx1) = mpsc::channel(8);
    manager.connect(identity(7), tx1).await;
    assert!(broker.wait_for_subscriptions(1, WAIT).await);

    let (tx2, mut rx2) = mpsc::channel(8);
    manager.connect(identity(7), tx2).await;
    assert!(broker.wait_for_connections(2, WAIT).await);
    assert!(wait_for_state(&manager, ConnectionState::Connected).await);
    assert!(
        eventually(|| broker.active_subscriptions().len() == 1).await,
        "exactly one live subscription expected, got {:?}",
        broker.active_subscriptions()
    );
    assert_eq!(broker.active_subscriptions()[0].id, "sub-7");
    assert_eq!(manager.subscription_count(), 1);

    let expected = fixtures::unread(12);
    assert_eq!(broker.push(&fixtures::push_body(&expected)), 1);
    assert_eq!(recv(&mut rx2).await, expected);

    // The first sink was released with its session and saw nothing.
    assert!(matches!(
        rx1.try_recv(),
        Err(mpsc::error::TryRecvError::Disconnected)
    ));

    manager.disconnect().await;
}

#[tokio::test]
async fn disconnect_unsubscribes_and_resets() {
    let broker = MockStompBroker::start().await.unwrap();
    let manager = manager_for(&broker.base_url(), "/user/queue/notifications", false);
    let (tx, _rx) = mpsc::channel(8);

    manager.connect(identity(3), tx).await;
    assert!(broker.wait_for_subscriptions(1, WAIT).await);
    assert!(wait_for_state(&manager, ConnectionState::Connected).await);

    manager.disconnect().await;
    assert!(broker.wait_for_subscriptions(0, WAIT).await);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.subscription_count(), 0);
    assert_eq!(manager.reconnect_attempts(), 0);
    assert!(eventually(|| broker.open_connections() == 0).await);

    // A second disconnect is a no-op.
    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn push_reaches_the_sink() {
    let broker = MockStompBroker::start().await.unwrap();
    let manager = manager_for(&broker.base_url(), "/user/queue/notifications", false);
    let (tx, mut rx) = mpsc::channel(8);

    manager.connect(identity(11), tx).await;
    assert!(broker.wait_for_subscriptions(1, WAIT).await);

    let expected = fixtures::unread(5);
    assert_eq!(broker.push(&fixtures::push_body(&expected)), 1);
    assert_eq!(recv(&mut rx).await, expected);

    manager.disconnect().await;
}

#[tokio::test]
async fn malformed_payloads_are_dropped_and_the_session_survives() {
    let broker = MockStompBroker::start().await.unwrap();
    let manager = manager_for(&broker.base_url(), "/user/queue/notifications", false);
    let (tx, mut rx) = mpsc::channel(8);

    manager.connect(identity(11), tx).await;
    assert!(broker.wait_for_subscriptions(1, WAIT).await);

    broker.push("{not json");
    broker.push(r#"{"title":"missing id"}"#);
    broker.push_raw("garbage without a terminator");
    let good = fixtures::read(9);
    broker.push(&fixtures::push_body(&good));

    assert_eq!(recv(&mut rx).await, good);
    assert!(manager.is_connected());
    assert_eq!(broker.connections_accepted(), 1);

    manager.disconnect().await;
}

#[tokio::test]
async fn disconnect_completes_while_sink_is_full() {
    let broker = MockStompBroker::start().await.unwrap();
    let manager = manager_for(&broker.base_url(), "/user/queue/notifications", false);
    let (tx, _rx) = mpsc::channel(1);
    let watcher = tx.clone();

    manager.connect(identity(13), tx).await;
    assert!(broker.wait_for_subscriptions(1, WAIT).await);

    for id in 1..=3 {
        broker.push(&fixtures::push_body(&fixtures::unread(id)));
    }
    // The sink is full; later deliveries have to wait for room.
    assert!(eventually(|| watcher.capacity() == 0).await);

    let finished = tokio::time::timeout(WAIT, manager.disconnect()).await;
    assert!(finished.is_ok(), "disconnect hung while the sink was full");
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(broker.wait_for_subscriptions(0, WAIT).await);
}

// ---------------------------------------------------------------------------
// Reconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_close_triggers_reconnect() {
    let broker = MockStompBroker::start().await.unwrap();
    let manager = manager_for(&broker.base_url(), "/user/queue/notifications", false);
    let (tx, mut rx) = mpsc::channel(8);

    manager.connect(identity(21), tx).await;
    assert!(broker.wait_for_subscriptions(1, WAIT).await);

    broker.drop_all_connections();
    assert!(broker.wait_for_connections(2, WAIT).await);
    assert!(
        eventually(|| broker.active_subscriptions().len() == 1 && manager.is_connected()).await
    );
    assert_eq!(manager.reconnect_attempts(), 0);

    let after = fixtures::unread(30);
    broker.push(&fixtures::push_body(&after));
    assert_eq!(recv(&mut rx).await, after);

    manager.disconnect().await;
}

#[tokio::test]
async fn gives_up_after_retry_budget() {
    let endpoint = RefusingEndpoint::start().await.unwrap();
    let manager = manager_for(&endpoint.base_url(), "/user/queue/notifications", false);
    let (tx, _rx) = mpsc::channel(8);

    manager.connect(identity(5), tx).await;
    assert!(wait_for_state(&manager, ConnectionState::GivenUp).await);

    // Initial attempt plus five retries.
    assert_eq!(endpoint.attempts(), 6);
    assert_eq!(manager.reconnect_attempts(), 5);
    assert!(!manager.is_connected());

    // No further attempts once given up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(endpoint.attempts(), 6);

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.reconnect_attempts(), 0);
}

#[tokio::test]
async fn rejected_connect_counts_as_failed_attempt() {
    let broker = MockStompBroker::start().await.unwrap();
    broker.set_reject_connect(true);
    let manager = TransportManager::new(TransportConfig {
        url: format!("{}/ws/websocket", broker.base_url()),
        token: None,
        destination: "/user/queue/notifications".to_owned(),
        reconnect_base_delay: Duration::from_millis(5),
        max_reconnect_attempts: 2,
        send_connection_test: false,
    });
    let (tx, _rx) = mpsc::channel(8);

    manager.connect(identity(5), tx).await;
    assert!(wait_for_state(&manager, ConnectionState::GivenUp).await);
    assert_eq!(broker.connect_frames().len(), 3);
    assert!(broker.active_subscriptions().is_empty());
}

// ---------------------------------------------------------------------------
// Outbound diagnostics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connection_test_is_published_after_subscribing() {
    let broker = MockStompBroker::start().await.unwrap();
    let manager = manager_for(&broker.base_url(), "/user/queue/notifications", true);
    let (tx, _rx) = mpsc::channel(8);

    manager.connect(identity(42), tx).await;
    assert!(eventually(|| !broker.received_sends().is_empty()).await);

    let sends = broker.received_sends();
    assert_eq!(sends[0].header("destination"), Some("/app/test"));
    let body: serde_json::Value = serde_json::from_str(&sends[0].body).unwrap();
    assert_eq!(body["userId"], 42);

    manager.disconnect().await;
}

#[tokio::test]
async fn test_notification_is_published_to_notify() {
    let broker = MockStompBroker::start().await.unwrap();
    let manager = manager_for(&broker.base_url(), "/user/queue/notifications", false);
    let (tx, _rx) = mpsc::channel(8);

    assert!(!manager.send_test_notification("too early").await);

    manager.connect(identity(42), tx).await;
    assert!(wait_for_state(&manager, ConnectionState::Connected).await);
    assert!(manager.send_test_notification("hello from tests").await);

    assert!(
        eventually(|| broker
            .received_sends()
            .iter()
            .any(|f| f.header("destination") == Some("/app/notify")))
        .await
    );
    let frame = broker
        .received_sends()
        .into_iter()
        .find(|f| f.header("destination") == Some("/app/notify"))
        .unwrap();
    let body: serde_json::Value = serde_json::from_str(&frame.body).unwrap();
    assert_eq!(body["userId"], 42);
    assert_eq!(body["message"], "hello from tests");
    assert_eq!(body["type"], "APPOINTMENT_CONFIRMATION");

    manager.disconnect().await;
}
