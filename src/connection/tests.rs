//! Lifecycle tests for the connection manager
//!
//! These drive the manager with scripted sessions and verify retries,
//! heartbeat nesting, reconnects and shutdown.

use super::*;
use crate::CameraError;
use crate::config::ConnectionConfig;
use crate::test_utils::MockSessionFactory;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

const WAIT: Duration = Duration::from_secs(5);

fn config(interval_ms: u64, max_attempts: u32) -> ConnectionConfig {
    ConnectionConfig::new("ws://control.local/camera")
        .with_identity("aa:bb:cc:dd:ee:ff", "client-1")
        .with_reconnect(Duration::from_millis(interval_ms), max_attempts)
        .with_heartbeat_interval(Duration::from_millis(5))
}

fn manager(config: ConnectionConfig, factory: &Arc<MockSessionFactory>) -> ConnectionManager {
    ConnectionManager::new(config, factory.clone())
}

async fn wait_for(manager: &ConnectionManager, target: ConnectionState) {
    let mut matching = Box::pin(
        manager.state_changes().filter(move |state| futures::future::ready(*state == target)),
    );
    let reached = tokio::time::timeout(WAIT, matching.next()).await;
    assert!(reached.is_ok(), "manager never reached {target:?}, stuck in {:?}", manager.state());
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_end_in_closed() {
    let _ = tracing_subscriber::fmt::try_init();

    let interval = Duration::from_millis(20);
    let factory = Arc::new(MockSessionFactory::failing());
    let manager = manager(config(interval.as_millis() as u64, 3), &factory);

    let started = tokio::time::Instant::now();
    manager.start().unwrap();
    wait_for(&manager, ConnectionState::Closed).await;
    let elapsed = started.elapsed();

    // Two backoff waits separate the three attempts
    assert!(elapsed >= interval * 2, "closed after {elapsed:?}");
    assert!(elapsed <= interval * 3 + Duration::from_millis(250), "closed after {elapsed:?}");
    assert_eq!(factory.connect_attempts(), 3);
    assert_eq!(manager.reconnect_attempts(), 3);
    assert!(!manager.is_connected());
    assert!(matches!(
        manager.send_control_message("status").await,
        Err(CameraError::RetriesExhausted { attempts: 3 })
    ));

    // No further attempts once closed
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(factory.connect_attempts(), 3);
    info!("Manager closed after {} attempts", factory.connect_attempts());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_server_url_stays_idle() {
    let factory = Arc::new(MockSessionFactory::succeeding());
    let manager = manager(ConnectionConfig::default(), &factory);

    let result = manager.start();

    assert!(matches!(result, Err(CameraError::Config { .. })));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.state(), ConnectionState::Idle);
    assert_eq!(factory.connect_attempts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeat_only_runs_while_established() {
    let factory = Arc::new(MockSessionFactory::succeeding());
    let manager = manager(config(1, 5), &factory);
    factory.observe_state(manager.subscribe_state());

    let connected = Arc::new(AtomicUsize::new(0));
    let disconnected = Arc::new(AtomicUsize::new(0));
    {
        let connected = Arc::clone(&connected);
        manager.on_connected(move || {
            connected.fetch_add(1, Ordering::SeqCst);
        });
        let disconnected = Arc::clone(&disconnected);
        manager.on_disconnected(move || {
            disconnected.fetch_add(1, Ordering::SeqCst);
        });
    }

    manager.start().unwrap();
    wait_for(&manager, ConnectionState::Established).await;
    wait_until(|| manager.heartbeat().sent_count() >= 3).await;

    let first = factory.last_session().unwrap();
    first.drop_connection();
    wait_until(|| factory.sessions().len() == 2 && manager.is_connected()).await;
    let before = manager.heartbeat().sent_count();
    wait_until(|| manager.heartbeat().sent_count() >= before + 3).await;

    manager.stop().await;
    assert!(!manager.heartbeat().is_active());

    for session in factory.sessions() {
        let states = session.states_at_send();
        assert!(!states.is_empty());
        assert!(states.iter().all(|s| *s == ConnectionState::Established), "{states:?}");
        for text in session.sent() {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["type"], "heartbeat");
            assert_eq!(value["device_id"], "aa:bb:cc:dd:ee:ff");
        }
    }
    assert_eq!(connected.load(Ordering::SeqCst), 2);
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    assert!(manager.last_heartbeat_at().is_some());
    assert!(manager.last_connected_at().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loss_reconnects_and_success_resets_counter() {
    let factory = Arc::new(MockSessionFactory::scripted([true, false, true]));
    let manager = manager(config(1, 5), &factory);

    manager.start().unwrap();
    wait_for(&manager, ConnectionState::Established).await;
    factory.last_session().unwrap().drop_connection();

    wait_until(|| factory.connect_attempts() == 3 && manager.is_connected()).await;
    assert_eq!(manager.reconnect_attempts(), 0);
    assert_eq!(manager.state(), ConnectionState::Established);

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_is_idempotent_and_closes_session() {
    let factory = Arc::new(MockSessionFactory::succeeding());
    let manager = manager(config(1, 5), &factory);
    let disconnected = Arc::new(AtomicUsize::new(0));
    {
        let disconnected = Arc::clone(&disconnected);
        manager.on_disconnected(move || {
            disconnected.fetch_add(1, Ordering::SeqCst);
        });
    }

    manager.start().unwrap();
    wait_for(&manager, ConnectionState::Established).await;

    manager.stop().await;
    manager.stop().await;

    assert_eq!(manager.state(), ConnectionState::Closed);
    assert!(!manager.is_connected());
    assert!(factory.last_session().unwrap().is_closed());
    assert_eq!(disconnected.load(Ordering::SeqCst), 0);
    assert_eq!(factory.connect_attempts(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_interrupts_backoff() {
    let factory = Arc::new(MockSessionFactory::failing());
    let manager = manager(config(60_000, 10), &factory);

    manager.start().unwrap();
    wait_until(|| factory.connect_attempts() == 1).await;

    tokio::time::timeout(Duration::from_secs(1), manager.stop())
        .await
        .expect("stop waited for the backoff interval");

    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(factory.connect_attempts(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_after_exhaustion_gets_fresh_budget() {
    let factory = Arc::new(MockSessionFactory::failing());
    let manager = manager(config(1, 2), &factory);

    manager.start().unwrap();
    wait_for(&manager, ConnectionState::Closed).await;
    manager.stop().await;

    manager.start().unwrap();
    wait_until(|| factory.connect_attempts() == 4).await;
    wait_for(&manager, ConnectionState::Closed).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn control_messages_flow_both_ways() {
    let factory = Arc::new(MockSessionFactory::succeeding());
    let manager = manager(config(1, 5).with_heartbeat_interval(Duration::from_secs(60)), &factory);
    let received = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        manager.on_message(move |text| received.lock().unwrap().push(text.to_string()));
    }

    assert!(matches!(
        manager.send_control_message("early").await,
        Err(CameraError::NotConnected)
    ));

    manager.start().unwrap();
    wait_for(&manager, ConnectionState::Established).await;

    manager.send_control_message(r#"{"type":"mcp"}"#).await.unwrap();
    let session = factory.last_session().unwrap();
    assert_eq!(session.sent(), vec![r#"{"type":"mcp"}"#.to_string()]);

    session.deliver(r#"{"type":"command"}"#);
    assert_eq!(*received.lock().unwrap(), vec![r#"{"type":"command"}"#.to_string()]);

    manager.stop().await;
    assert!(matches!(manager.send_control_message("late").await, Err(CameraError::NotConnected)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn state_stream_starts_with_current_and_ends_closed() {
    let factory = Arc::new(MockSessionFactory::scripted([false, true]));
    let manager = manager(config(1, 5), &factory);
    let mut states = Box::pin(manager.state_changes());

    assert_eq!(states.next().await, Some(ConnectionState::Idle));

    manager.start().unwrap();
    wait_for(&manager, ConnectionState::Established).await;
    assert_eq!(factory.connect_attempts(), 2);
    manager.stop().await;

    // Watch streams yield the latest value, so intermediate states may coalesce
    let last = tokio::time::timeout(WAIT, states.next()).await.unwrap();
    assert_eq!(last, Some(ConnectionState::Closed));
}
