// Copyright (c) 2025, The Conveyor Authors
// MIT License
// All rights reserved.

//! End-to-end scenarios against a real RabbitMQ broker.
//!
//! These tests are ignored by default; run them with a broker listening on
//! the address configured through the `AMQP_*` environment variables:
//!
//! ```sh
//! cargo test -- --ignored
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use conveyor::{
    AmqpError, Broker, Client, ConnectionParams, ConsumerEvent, ExchangeDefinition, JobInput,
    JobRequest, Publication, QueueBinding, QueueDefinition, WorkerOptions, WorkerStatus,
};

fn params() -> ConnectionParams {
    ConnectionParams {
        max_retries: 0,
        ..ConnectionParams::from_env()
    }
}

async fn connected_broker() -> Broker {
    let broker = Broker::new(params());
    broker.connect().await.expect("broker must be reachable");
    broker
}

async fn next_delivery(
    handle: &mut conveyor::ConsumerHandle,
    timeout: Duration,
) -> conveyor::Delivery {
    loop {
        let event = tokio::time::timeout(timeout, handle.next())
            .await
            .expect("timed out waiting for a delivery")
            .expect("consumer stream ended");
        match event {
            ConsumerEvent::Delivery(delivery) => return delivery,
            ConsumerEvent::Resumed { .. } => continue,
        }
    }
}

fn envelope_body(name: &str, args: Vec<Value>) -> Vec<u8> {
    JobRequest::new(name, args).encode().unwrap()
}

/// Deletes leftover queues from earlier runs, ignoring missing ones.
async fn reset_queues(names: &[&str]) {
    let raw = lapin::Connection::connect(&params().uri(), lapin::ConnectionProperties::default())
        .await
        .expect("broker must be reachable");
    for name in names {
        let channel = raw.create_channel().await.unwrap();
        let _ = channel
            .queue_delete(name, lapin::options::QueueDeleteOptions::default())
            .await;
    }
    raw.close(200, "done").await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn connect_opens_a_full_pool() {
    let broker = connected_broker().await;

    let pool = broker.pool().unwrap();
    assert!(pool.is_open());
    assert_eq!(pool.num_free_channels(), broker.params().pool_size);

    broker.shutdown(1000).await.unwrap();
    assert!(matches!(
        broker.pool().unwrap_err(),
        AmqpError::NotRunning | AmqpError::PoolNotInitialized
    ));
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn declare_publish_and_consume_on_default_exchange() {
    let broker = connected_broker().await;
    let queue = "conveyor-test-default-exchange";
    broker
        .queues(&[QueueDefinition::new(queue).auto_delete()])
        .await
        .unwrap();

    broker
        .publish(Publication::new(
            queue,
            envelope_body("greet", vec![json!({"username": "martianboy"})]),
        ))
        .await
        .unwrap();

    let mut handle = broker.consume(queue, None).await.unwrap();
    let delivery = next_delivery(&mut handle, Duration::from_secs(5)).await;

    let request = delivery.envelope.as_ref().unwrap();
    assert_eq!(request.args, vec![json!({"username": "martianboy"})]);
    delivery.ack().await.unwrap();

    handle.cancel().await.unwrap();
    broker.shutdown(1000).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn publish_through_a_named_exchange_and_binding() {
    let broker = connected_broker().await;
    let queue = "conveyor-test-named-exchange";
    broker
        .exchanges(&[ExchangeDefinition::new("conveyor-test-e1")])
        .await
        .unwrap();
    broker
        .queues(&[QueueDefinition::new(queue).auto_delete()])
        .await
        .unwrap();
    broker
        .bindings(&[QueueBinding::new(queue)
            .exchange("conveyor-test-e1")
            .routing_key("#")])
        .await
        .unwrap();

    broker
        .publish(
            Publication::new(
                "#",
                envelope_body("greet", vec![json!({"username": "martianboy"})]),
            )
            .exchange("conveyor-test-e1"),
        )
        .await
        .unwrap();

    let mut handle = broker.consume(queue, None).await.unwrap();
    let delivery = next_delivery(&mut handle, Duration::from_secs(5)).await;
    assert_eq!(
        delivery.envelope.as_ref().unwrap().args,
        vec![json!({"username": "martianboy"})]
    );
    delivery.ack().await.unwrap();

    handle.cancel().await.unwrap();
    broker.shutdown(1000).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn consumers_rewire_when_their_queue_channel_dies() {
    let broker = connected_broker().await;
    let queue = "conveyor-test-rewire";
    reset_queues(&[queue]).await;
    broker
        .queues(&[QueueDefinition::new(queue).durable()])
        .await
        .unwrap();

    let mut handles = broker
        .consume_over(vec![queue, queue, queue], None)
        .await
        .unwrap();

    // Severing the subscriptions server-side ends every consumer stream;
    // the broker must rewire each handle onto a fresh channel.
    {
        let raw = lapin::Connection::connect(
            &params().uri(),
            lapin::ConnectionProperties::default(),
        )
        .await
        .unwrap();
        let channel = raw.create_channel().await.unwrap();
        channel
            .queue_delete(queue, lapin::options::QueueDeleteOptions::default())
            .await
            .unwrap();
        channel
            .queue_declare(
                queue,
                lapin::options::QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                lapin::types::FieldTable::default(),
            )
            .await
            .unwrap();
        raw.close(200, "done").await.unwrap();
    }

    for handle in &mut handles {
        let event = tokio::time::timeout(Duration::from_secs(5), handle.next())
            .await
            .expect("timed out waiting for the resume signal")
            .expect("consumer stream ended without resuming");
        assert!(matches!(event, ConsumerEvent::Resumed { .. }));
        assert!(handle.is_active());
    }

    for handle in &handles {
        handle.cancel().await.unwrap();
    }
    broker.shutdown(1000).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn co_resident_consumers_respect_their_own_prefetch() {
    // A pool size of one forces every consumer onto a single shared channel.
    let broker = Broker::new(ConnectionParams {
        pool_size: 1,
        ..params()
    });
    broker.connect().await.unwrap();

    let queue = "conveyor-test-prefetch";
    broker
        .queues(&[QueueDefinition::new(queue).auto_delete()])
        .await
        .unwrap();
    for i in 0..5 {
        broker
            .publish_confirmed(Publication::new(queue, envelope_body("n", vec![json!(i)])))
            .await
            .unwrap();
    }

    let mut handles = vec![
        broker.consume(queue, Some(2)).await.unwrap(),
        broker.consume(queue, Some(1)).await.unwrap(),
        broker.consume(queue, Some(2)).await.unwrap(),
    ];

    // Without acking, each consumer receives exactly its prefetch budget.
    let mut received = vec![];
    for (handle, expected) in handles.iter_mut().zip([2usize, 1, 2]) {
        let mut deliveries = vec![];
        for _ in 0..expected {
            deliveries.push(next_delivery(handle, Duration::from_secs(5)).await);
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(300), handle.next())
                .await
                .is_err(),
            "consumer received more than its prefetch"
        );
        received.push(deliveries);
    }

    for deliveries in &received {
        for delivery in deliveries {
            delivery.ack().await.unwrap();
        }
    }
    for handle in &handles {
        handle.cancel().await.unwrap();
    }
    broker.shutdown(1000).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn back_pressure_is_observable_on_a_publish_burst() {
    let broker = connected_broker().await;
    let queue = "conveyor-test-backpressure";
    reset_queues(&[queue]).await;
    broker
        .queues(&[QueueDefinition::new(queue).durable()])
        .await
        .unwrap();

    let body = envelope_body("burst", vec![json!("x")]);
    let mut saw_back_pressure = false;
    for _ in 0..2500 {
        let accepted = broker
            .publish(Publication::new(queue, body.clone()))
            .await
            .unwrap();
        if !accepted {
            saw_back_pressure = true;
        }
    }
    assert!(
        saw_back_pressure,
        "a 2500 message burst must saturate the publish window at least once"
    );

    // The queue settles to the full count shortly after the burst.
    let mut count = 0;
    for _ in 0..200 {
        count = broker.check_queue(queue).await.unwrap();
        if count == 2500 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(count, 2500);

    // Drain the test queue.
    {
        let raw = lapin::Connection::connect(
            &params().uri(),
            lapin::ConnectionProperties::default(),
        )
        .await
        .unwrap();
        let channel = raw.create_channel().await.unwrap();
        channel
            .queue_delete(queue, lapin::options::QueueDeleteOptions::default())
            .await
            .unwrap();
        raw.close(200, "done").await.unwrap();
    }
    broker.shutdown(2000).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn jobs_retry_until_they_succeed() {
    let client = Client::new(params());
    let attempts = Arc::new(AtomicU32::new(0));

    let flaky = {
        let attempts = Arc::clone(&attempts);
        conveyor::handler_fn(move |request| {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                if request.attempt < 2 {
                    Err("first attempt always fails".into())
                } else {
                    Ok(Value::String("done".into()))
                }
            }
        })
    };

    let enqueuer = client
        .job(
            JobInput::new("conveyor-test-flaky", flaky)
                .max_retries(3)
                .retry_delay_ms(200),
        )
        .unwrap();

    reset_queues(&[
        "conveyor-test-flaky",
        "conveyor-test-flaky.retry",
        "conveyor-test-flaky.error",
        "conveyor-test-flaky.delayed",
    ])
    .await;
    client.connect().await.unwrap();
    client.declare_amq_resources().await.unwrap();
    let mut results = client.worker(WorkerOptions::default()).await.unwrap();

    enqueuer.enqueue(vec![json!("payload")]).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.status, WorkerStatus::Retried);

    let second = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.status, WorkerStatus::Success);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    client.shutdown(2000).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn committed_transactions_flush_and_rolled_back_ones_do_not() {
    let client = Client::new(params());
    let enqueuer = client
        .job(JobInput::new(
            "conveyor-test-transactor",
            conveyor::handler_fn(|_r| async { Ok(Value::Null) }),
        ))
        .unwrap();

    reset_queues(&[
        "conveyor-test-transactor",
        "conveyor-test-transactor.retry",
        "conveyor-test-transactor.error",
        "conveyor-test-transactor.delayed",
    ])
    .await;
    client.connect().await.unwrap();
    client.declare_amq_resources().await.unwrap();

    let committed = enqueuer.transaction().unwrap();
    committed.enqueue(vec![json!(1)]).unwrap();
    committed.enqueue(vec![json!(2)]).unwrap();
    committed.commit().await.unwrap();

    let rolled_back = enqueuer.transaction().unwrap();
    rolled_back.enqueue(vec![json!(3)]).unwrap();
    rolled_back.rollback().await.unwrap();

    let count = client
        .broker()
        .check_queue("conveyor-test-transactor")
        .await
        .unwrap();
    assert_eq!(count, 2);

    client.shutdown(2000).await.unwrap();
}
