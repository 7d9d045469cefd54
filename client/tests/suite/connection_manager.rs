use std::sync::Arc;
use std::time::Duration;

use brand_audit_client::ConnectionConfig;
use brand_audit_client::ConnectionManager;
use brand_audit_client::ConnectionQuality;
use brand_audit_client::ConnectionStatus;
use brand_audit_client::EventDispatcher;
use brand_audit_client::EventType;
use brand_audit_client::NoticeLevel;
use brand_audit_client::StreamEvent;
use brand_audit_protocol::ClientMessage;
use brand_audit_protocol::ConnectedInfo;
use brand_audit_protocol::ServerMessage;
use client_test_support::ConnectBehavior;
use client_test_support::MockConnector;
use client_test_support::RecordingNotifier;
use client_test_support::record_events;
use client_test_support::recorded;
use client_test_support::wait_for_snapshot;
use pretty_assertions::assert_eq;
use tokio::time::Instant;

struct Harness {
    connector: Arc<MockConnector>,
    sessions: tokio::sync::mpsc::UnboundedReceiver<client_test_support::ServerSide>,
    dispatcher: Arc<EventDispatcher>,
    notifier: Arc<RecordingNotifier>,
    manager: ConnectionManager,
}

fn harness(fallback: ConnectBehavior) -> Harness {
    let (connector, sessions) = MockConnector::new(fallback);
    let dispatcher = Arc::new(EventDispatcher::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = ConnectionManager::spawn(
        connector.clone(),
        Arc::clone(&dispatcher),
        notifier.clone(),
        ConnectionConfig::default(),
    );
    Harness {
        connector,
        sessions,
        dispatcher,
        notifier,
        manager,
    }
}

fn join(job_id: &str) -> ClientMessage {
    ClientMessage::JoinAnalysis {
        analysis_id: job_id.to_string(),
    }
}

fn leave(job_id: &str) -> ClientMessage {
    ClientMessage::LeaveAnalysis {
        analysis_id: job_id.to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn reconnects_stop_after_five_failures_until_resubscribe() {
    let mut h = harness(ConnectBehavior::Refuse);
    let failures = record_events(&h.dispatcher, EventType::ConnectionFailed);
    let started = Instant::now();

    h.manager.subscribe_to_job("job-1");
    let snapshot = wait_for_snapshot(&h.manager, |s| s.failed)
        .await
        .expect("gives up");

    // One initial attempt plus five reconnects, backing off 1+2+4+8+10 s.
    assert_eq!(h.connector.connect_count(), 6);
    assert_eq!(snapshot.reconnect_attempts, 5);
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(snapshot.subscribed_job_id.as_deref(), Some("job-1"));
    assert!(started.elapsed() >= Duration::from_secs(25));
    assert_eq!(
        recorded(&failures),
        vec![StreamEvent::ConnectionFailed { attempts: 5 }]
    );
    let notices = h.notifier.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Error);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.connect_count(), 6);

    h.connector.set_fallback(ConnectBehavior::Accept);
    h.manager.subscribe_to_job("job-1");
    let mut server = h.sessions.recv().await.expect("session");
    assert_eq!(server.next_message().await, Some(join("job-1")));

    let snapshot = wait_for_snapshot(&h.manager, |s| s.status == ConnectionStatus::Connected)
        .await
        .expect("connected");
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert!(!snapshot.failed);
    assert_eq!(h.connector.connect_count(), 7);
}

#[tokio::test(start_paused = true)]
async fn subscribe_during_connect_attempt_resets_reconnect_budget() {
    let h = harness(ConnectBehavior::Hang);
    h.connector
        .script([ConnectBehavior::Refuse, ConnectBehavior::Refuse]);

    h.manager.subscribe_to_job("job-1");
    wait_for_snapshot(&h.manager, |s| {
        s.status == ConnectionStatus::Connecting && s.reconnect_attempts == 2
    })
    .await
    .expect("third attempt in flight");
    assert_eq!(h.connector.connect_count(), 3);

    h.manager.subscribe_to_job("job-2");
    let snapshot = wait_for_snapshot(&h.manager, |s| {
        s.subscribed_job_id.as_deref() == Some("job-2")
    })
    .await
    .expect("job switched");
    assert_eq!(snapshot.status, ConnectionStatus::Connecting);
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert!(!snapshot.failed);
}

#[tokio::test(start_paused = true)]
async fn join_is_resent_after_unexpected_drop() {
    let mut h = harness(ConnectBehavior::Accept);
    let statuses = record_events(&h.dispatcher, EventType::StatusChanged);

    h.manager.subscribe_to_job("job-1");
    let mut server = h.sessions.recv().await.expect("first session");
    assert_eq!(server.next_message().await, Some(join("job-1")));

    drop(server);
    let mut server = h.sessions.recv().await.expect("second session");
    assert_eq!(server.next_message().await, Some(join("job-1")));
    assert_eq!(h.connector.connect_count(), 2);

    let snapshot = wait_for_snapshot(&h.manager, |s| s.status == ConnectionStatus::Connected)
        .await
        .expect("reconnected");
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert_eq!(
        recorded(&statuses),
        vec![
            StreamEvent::StatusChanged(ConnectionStatus::Connecting),
            StreamEvent::StatusChanged(ConnectionStatus::Connected),
            StreamEvent::StatusChanged(ConnectionStatus::Disconnected),
            StreamEvent::StatusChanged(ConnectionStatus::Connecting),
            StreamEvent::StatusChanged(ConnectionStatus::Connected),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn subscribing_to_a_new_job_leaves_the_previous_one() {
    let mut h = harness(ConnectBehavior::Accept);

    h.manager.subscribe_to_job("job-1");
    let mut server = h.sessions.recv().await.expect("session");
    assert_eq!(server.next_non_ping().await, Some(join("job-1")));

    h.manager.subscribe_to_job("job-2");
    assert_eq!(server.next_non_ping().await, Some(leave("job-1")));
    assert_eq!(server.next_non_ping().await, Some(join("job-2")));

    h.manager.unsubscribe_from_job("job-2");
    assert_eq!(server.next_non_ping().await, Some(leave("job-2")));
    let snapshot = wait_for_snapshot(&h.manager, |s| s.subscribed_job_id.is_none())
        .await
        .expect("cleared");
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert_eq!(h.connector.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_feeds_the_reconnect_policy() {
    let mut h = harness(ConnectBehavior::Accept);
    h.connector.script([ConnectBehavior::Hang]);
    let started = Instant::now();

    h.manager.subscribe_to_job("job-1");
    let mut server = h.sessions.recv().await.expect("session after timeout");

    // 20 s timeout, then the first 1 s backoff.
    assert!(started.elapsed() >= Duration::from_secs(21));
    assert_eq!(h.connector.connect_count(), 2);
    assert_eq!(server.next_message().await, Some(join("job-1")));
}

#[tokio::test(start_paused = true)]
async fn pong_latency_sets_quality() {
    let mut h = harness(ConnectBehavior::Accept);
    let pongs = record_events(&h.dispatcher, EventType::Pong);

    h.manager.subscribe_to_job("job-1");
    let mut server = h.sessions.recv().await.expect("session");
    assert_eq!(server.next_message().await, Some(join("job-1")));
    assert_eq!(h.manager.snapshot().quality, ConnectionQuality::Unknown);

    let Some(ClientMessage::Ping { timestamp }) = server.next_message().await else {
        panic!("expected a heartbeat ping");
    };
    tokio::time::advance(Duration::from_millis(150)).await;
    assert!(server.send(ServerMessage::Pong { timestamp }));

    let snapshot = wait_for_snapshot(&h.manager, |s| s.quality == ConnectionQuality::Good)
        .await
        .expect("quality measured");
    assert_eq!(snapshot.latency, Some(Duration::from_millis(150)));
    assert_eq!(
        recorded(&pongs),
        vec![StreamEvent::Pong {
            latency: Duration::from_millis(150)
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn silence_degrades_quality_then_presents_disconnected() {
    let mut h = harness(ConnectBehavior::Accept);
    let stale = record_events(&h.dispatcher, EventType::ConnectionStale);

    h.manager.subscribe_to_job("job-1");
    let server = h.sessions.recv().await.expect("session");
    let connected_at = Instant::now();

    let snapshot = wait_for_snapshot(&h.manager, |s| s.quality == ConnectionQuality::Poor)
        .await
        .expect("degraded");
    assert!(connected_at.elapsed() >= Duration::from_secs(30));
    assert_eq!(snapshot.presented_status, ConnectionStatus::Connected);

    let snapshot = wait_for_snapshot(&h.manager, |s| {
        s.presented_status == ConnectionStatus::Disconnected
    })
    .await
    .expect("stale");
    assert!(connected_at.elapsed() >= Duration::from_secs(60));
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert_eq!(recorded(&stale).len(), 2);

    // Any inbound traffic revives it.
    assert!(server.send(ServerMessage::Connected(ConnectedInfo::default())));
    let snapshot = wait_for_snapshot(&h.manager, |s| {
        s.presented_status == ConnectionStatus::Connected
    })
    .await
    .expect("fresh again");
    assert_eq!(snapshot.quality, ConnectionQuality::Unknown);
    assert_eq!(h.connector.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_leaves_and_suppresses_reconnects() {
    let mut h = harness(ConnectBehavior::Accept);

    h.manager.subscribe_to_job("job-1");
    let mut server = h.sessions.recv().await.expect("session");
    assert_eq!(server.next_message().await, Some(join("job-1")));

    h.manager.disconnect();
    assert_eq!(server.next_non_ping().await, Some(leave("job-1")));
    assert_eq!(server.next_non_ping().await, None);

    tokio::time::sleep(Duration::from_secs(60)).await;
    let snapshot = h.manager.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(snapshot.subscribed_job_id, None);
    assert_eq!(h.connector.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_backoff() {
    let h = harness(ConnectBehavior::Refuse);

    h.manager.subscribe_to_job("job-1");
    h.manager.disconnect();

    tokio::time::sleep(Duration::from_secs(60)).await;
    // The disconnect may land before the first attempt is even polled.
    assert!(h.connector.connect_count() <= 1);
    let snapshot = h.manager.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert!(!snapshot.failed);
}
