// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! Lifecycle and dial-policy tests that run without a broker.

use std::time::Duration;

use conveyor::{AmqpError, Broker, Client, ConnectionParams, Publication};

fn unreachable_params(max_retries: u32) -> ConnectionParams {
    ConnectionParams {
        host: "127.0.0.1".to_owned(),
        // Nothing listens on the discard port.
        port: 1,
        max_retries,
        retry_delay: Duration::from_millis(10),
        ..ConnectionParams::default()
    }
}

#[tokio::test]
async fn shutdown_before_connect_fails_with_precondition_error() {
    let broker = Broker::new(ConnectionParams::default());

    assert_eq!(broker.shutdown(100).await.unwrap_err(), AmqpError::NotRunning);
}

#[tokio::test]
async fn client_operations_before_connect_fail_with_precondition_error() {
    let client = Client::new(ConnectionParams::default());

    assert_eq!(
        client.shutdown(100).await.unwrap_err(),
        AmqpError::NotRunning
    );
    assert_eq!(
        client.pause_queue("q1").await.unwrap_err(),
        AmqpError::NotRunning
    );
    assert_eq!(
        client
            .broker()
            .publish(Publication::new("q1", b"{}".to_vec()))
            .await
            .unwrap_err(),
        AmqpError::NotRunning
    );
}

#[tokio::test]
async fn failed_connect_dials_max_retries_plus_one_times() {
    let broker = Broker::new(unreachable_params(2));

    let err = broker.connect().await.unwrap_err();

    // The attempt count is carried in the error: k retries mean k+1 dials.
    assert!(matches!(err, AmqpError::ConnectionError(3, _)));
    assert!(!broker.is_running());
}

#[tokio::test]
async fn failed_connect_without_retries_dials_once() {
    let broker = Broker::new(unreachable_params(0));

    let err = broker.connect().await.unwrap_err();

    assert!(matches!(err, AmqpError::ConnectionError(1, _)));
}

#[tokio::test]
async fn concurrent_connects_join_the_same_attempt() {
    let broker = Broker::new(unreachable_params(1));

    let (first, second) = tokio::join!(broker.connect(), broker.connect());

    // Both callers observe the outcome of the single in-flight dial.
    assert_eq!(first.unwrap_err(), second.unwrap_err());
    assert!(!broker.is_running());
}

#[tokio::test]
async fn broker_can_reconnect_after_a_failed_attempt() {
    let broker = Broker::new(unreachable_params(0));

    assert!(broker.connect().await.is_err());
    // The state machine returns to idle, a second connect dials again.
    let err = broker.connect().await.unwrap_err();
    assert!(matches!(err, AmqpError::ConnectionError(1, _)));
}
