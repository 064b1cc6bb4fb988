//! Reconnection behaviour seen through worker handles
//!
//! Uses tokio's paused clock so the 7 x 1 s retry budget runs instantly.


use amqp_worker::{ConnectionState, GetOptions, QueueError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{eventually, mock_pool, resize_task, ResizeTask, ENDPOINT};

#[tokio::test(start_paused = true)]
async fn test_worker_resumes_after_reconnect_without_reacquiring() {
    let (pool, broker) = mock_pool();
    let worker = pool.get_client(ENDPOINT).await.unwrap();
    worker.put("jobs", &json!({"n": 1})).await.unwrap();

    broker.sever_connections("connection reset by peer");
    let connection = worker.connection().clone();
    assert!(eventually(Duration::from_secs(10), || connection.generation() == 2).await);

    // Same handle, new channel
    worker.put("jobs", &json!({"n": 2})).await.unwrap();
    let again = pool.get_client(ENDPOINT).await.unwrap();
    assert!(Arc::ptr_eq(&worker, &again));
    assert_eq!(broker.queue_len("jobs"), 2);
    assert_eq!(broker.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_operation_waits_out_reconnection() {
    let (pool, broker) = mock_pool();
    let worker = pool.get_client(ENDPOINT).await.unwrap();
    let connection = worker.connection().clone();

    broker.refuse_connections(2);
    broker.sever_connections("broker restarting");
    assert!(
        eventually(Duration::from_secs(1), || connection.state() != ConnectionState::Ready).await
    );

    // Attempts at 0 s and 1 s are refused, the one at 2 s succeeds
    let started = tokio::time::Instant::now();
    worker.put("jobs", &resize_task("a.png", 1)).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(connection.generation(), 2);
    assert_eq!(broker.connect_attempts(), 1 + 3);
    assert_eq!(broker.queue_len("jobs"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_operation_racing_the_disconnect_fails_cleanly() {
    let (pool, broker) = mock_pool();
    let worker = pool.get_client(ENDPOINT).await.unwrap();

    // The supervisor has not observed the drop yet when the put starts
    broker.sever_connections("connection reset by peer");
    let result = worker.put("jobs", &json!({"n": 1})).await;

    match result {
        Ok(()) => {}
        Err(e) => assert!(e.is_retryable(), "unexpected error kind: {e:?}"),
    }

    let connection = worker.connection().clone();
    assert!(eventually(Duration::from_secs(10), || connection.generation() == 2).await);
    worker.put("jobs", &json!({"n": 2})).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_ack_from_previous_generation_is_channel_reset() {
    let (pool, broker) = mock_pool();
    let worker = pool.get_client(ENDPOINT).await.unwrap();
    worker.put("jobs", &resize_task("a.png", 1)).await.unwrap();
    let delivery = worker
        .get::<ResizeTask>("jobs", GetOptions::default())
        .await
        .unwrap();

    broker.sever_connections("connection reset by peer");
    let connection = worker.connection().clone();
    assert!(eventually(Duration::from_secs(10), || connection.generation() == 2).await);

    // The ack must not be replayed on the new channel
    let result = delivery.ack().await;
    assert!(matches!(result, Err(QueueError::ChannelReset { generation: 1 })));

    // The broker redelivers the unacknowledged task
    let redelivered = worker
        .get::<ResizeTask>("jobs", GetOptions::default())
        .await
        .unwrap();
    assert_eq!(redelivered.image, "a.png");
    redelivered.ack().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_surface_connection_lost_and_evict() {
    let (pool, broker) = mock_pool();
    let worker = pool.get_client(ENDPOINT).await.unwrap();
    let connection = worker.connection().clone();

    broker.refuse_all(true);
    let started = tokio::time::Instant::now();
    broker.sever_connections("broker gone");

    assert!(
        eventually(Duration::from_secs(30), || matches!(
            connection.state(),
            ConnectionState::Failed(_)
        ))
        .await
    );
    assert_eq!(broker.connect_attempts(), 1 + 7);
    assert!(started.elapsed() >= Duration::from_secs(6));

    // The next operation fails instead of hanging
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        worker.get::<Value>("jobs", GetOptions::default()),
    )
    .await
    .expect("operation on a failed connection must not hang");
    assert!(matches!(
        result,
        Err(QueueError::ConnectionLost { attempts: 7, .. })
    ));
    assert!(worker.is_defunct());
    assert!(!pool.registry().contains(ENDPOINT));

    // Re-acquiring after the broker is back yields a fresh worker
    broker.refuse_all(false);
    let fresh = pool.get_client(ENDPOINT).await.unwrap();
    assert!(!Arc::ptr_eq(&worker, &fresh));
    fresh.put("jobs", &json!({"n": 1})).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_repeated_blips_keep_bumping_generation() {
    let (pool, broker) = mock_pool();
    let worker = pool.get_client(ENDPOINT).await.unwrap();
    let connection = worker.connection().clone();

    for expected in 2..=4u64 {
        broker.sever_connections("flaky network");
        assert!(
            eventually(Duration::from_secs(10), || connection.generation() == expected).await
        );
        worker.put("jobs", &json!({"generation": expected})).await.unwrap();
    }

    assert_eq!(connection.health().reconnect_count, 3);
    assert_eq!(broker.queue_len("jobs"), 3);
}
