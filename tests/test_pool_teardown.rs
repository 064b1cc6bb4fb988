//! Kill / KillAll tests


use amqp_worker::{ConnectionState, GetOptions, QueueError};
use serde_json::{json, Value};
use test_helpers::{mock_pool, ENDPOINT};

#[tokio::test]
async fn test_kill_closes_worker_and_connection() {
    let (pool, broker) = mock_pool();
    let worker = pool.get_client(ENDPOINT).await.unwrap();
    let connection = worker.connection().clone();

    pool.kill(ENDPOINT).await.unwrap();

    assert!(worker.is_closed());
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(pool.endpoints().is_empty());
    assert!(pool.registry().is_empty());
    assert_eq!(broker.live_connections(), 0);
    assert!(matches!(
        worker.put("jobs", &json!({})).await,
        Err(QueueError::Closed)
    ));
}

#[tokio::test]
async fn test_kill_is_idempotent() {
    let (pool, _broker) = mock_pool();
    pool.get_client(ENDPOINT).await.unwrap();

    pool.kill(ENDPOINT).await.unwrap();
    pool.kill(ENDPOINT).await.unwrap();
    pool.kill("amqp://unknown-endpoint").await.unwrap();
}

#[tokio::test]
async fn test_spawned_workers_fail_with_closed_after_kill() {
    let (pool, _broker) = mock_pool();
    let spawned = pool.spawn_worker(ENDPOINT).await.unwrap();

    pool.kill(ENDPOINT).await.unwrap();

    assert!(matches!(
        spawned.get::<Value>("jobs", GetOptions::default()).await,
        Err(QueueError::Closed)
    ));
}

#[tokio::test]
async fn test_get_client_after_kill_reconnects() {
    let (pool, broker) = mock_pool();
    let first = pool.get_client(ENDPOINT).await.unwrap();
    pool.kill(ENDPOINT).await.unwrap();

    let second = pool.get_client(ENDPOINT).await.unwrap();

    assert_ne!(first.connection().id(), second.connection().id());
    assert_eq!(broker.connect_attempts(), 2);
    second.put("jobs", &json!({"n": 1})).await.unwrap();
}

#[tokio::test]
async fn test_kill_all_reports_failures_without_aborting_others() {
    // Arrange: three endpoints, one of which fails to close cleanly
    let (pool, broker) = mock_pool();
    let endpoints = ["amqp://broker-a", "amqp://broker-b", "amqp://broker-c"];
    broker.fail_close_for("amqp://broker-b");
    let mut workers = Vec::new();
    for endpoint in endpoints {
        workers.push(pool.get_client(endpoint).await.unwrap());
    }
    assert_eq!(broker.live_connections(), 3);

    // Act
    let error = pool.kill_all().await.unwrap_err();

    // Assert: the one failure is reported, the other two were still closed
    assert_eq!(error.failures.len(), 1);
    assert_eq!(error.endpoints().collect::<Vec<_>>(), vec!["amqp://broker-b"]);
    assert!(matches!(error.failures[0].1, QueueError::Transport(_)));
    assert!(workers.iter().all(|worker| worker.is_closed()));
    assert_eq!(broker.live_connections(), 0);
    assert!(pool.registry().is_empty());
}

#[tokio::test]
async fn test_kill_all_covers_connections_without_pooled_workers() {
    let (pool, broker) = mock_pool();
    let spawned = pool.spawn_worker("amqp://only-spawned").await.unwrap();
    pool.get_client(ENDPOINT).await.unwrap();

    pool.kill_all().await.unwrap();

    assert_eq!(broker.live_connections(), 0);
    assert!(spawned.is_defunct());
}

#[tokio::test]
async fn test_kill_all_on_empty_pool_succeeds() {
    let (pool, _broker) = mock_pool();
    pool.kill_all().await.unwrap();
}
