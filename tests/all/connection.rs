use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use carrot_mux::amqp::options::{
    BasicConsumeOptions, BasicGetOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use carrot_mux::amqp::{configuration::BrokerSettings, BasicProperties, ExchangeKind};
use carrot_mux::{BrokerError, Connection, Error, PromiseNumber};
use fake::{Fake, Faker};
use tokio::sync::mpsc;

use crate::helpers::{
    body, connection_options, eventually, open_connection, temp_queue, Broker,
};

#[tokio::test]
async fn blocking_calls_return_the_broker_reply() {
    // Arrange
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    let queue = temp_queue(&connection).await;
    let payload: String = Faker.fake();

    // Act
    connection
        .exchange_declare(
            "orders",
            ExchangeKind::Direct,
            ExchangeDeclareOptions::default(),
            <_>::default(),
        )
        .await
        .unwrap();
    connection
        .queue_bind(
            &queue,
            "orders",
            "created",
            QueueBindOptions::default(),
            <_>::default(),
        )
        .await
        .unwrap();
    connection
        .publish("orders", "created", payload.clone(), BasicProperties::default())
        .await
        .unwrap();
    let message = connection
        .get(&queue, BasicGetOptions::default())
        .await
        .unwrap()
        .expect("The queue should not be empty");

    // Assert
    assert_eq!(body(&message), payload);
    assert_eq!(message.exchange(), "orders");
    assert_eq!(message.routing_key(), "created");
    assert!(message.consumer_tag().is_none());
    assert_eq!(broker.connects(), 1);
}

#[tokio::test]
async fn get_on_an_empty_queue_returns_none() {
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    let queue = temp_queue(&connection).await;

    let message = connection
        .get(&queue, BasicGetOptions::default())
        .await
        .unwrap();

    assert!(message.is_none());
}

#[tokio::test]
async fn queue_operations_report_message_counts() {
    // Arrange
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    let queue = temp_queue(&connection).await;
    for _ in 0..3 {
        connection
            .publish("", &queue, "hello", BasicProperties::default())
            .await
            .unwrap();
    }

    // Act
    let declared = connection
        .queue_declare(&queue, QueueDeclareOptions::default(), <_>::default())
        .await
        .unwrap();
    let purged = connection
        .queue_purge(&queue, QueuePurgeOptions::default())
        .await
        .unwrap();
    connection
        .publish("", &queue, "again", BasicProperties::default())
        .await
        .unwrap();
    let deleted = connection
        .queue_delete(&queue, QueueDeleteOptions::default())
        .await
        .unwrap();

    // Assert
    assert_eq!(declared.queue.as_str(), queue);
    assert_eq!(declared.message_count, 3);
    assert_eq!(purged, 3);
    assert_eq!(deleted, 1);
}

#[tokio::test]
async fn the_broker_names_anonymous_queues() {
    let broker = Broker::new();
    let connection = open_connection(&broker).await;

    let declared = connection
        .queue_declare("", QueueDeclareOptions::default(), <_>::default())
        .await
        .unwrap();

    assert!(declared.queue.as_str().starts_with("amq.gen-"));
}

#[tokio::test]
async fn get_and_ack_acknowledges_the_message() {
    // Arrange
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    let queue = temp_queue(&connection).await;
    connection
        .publish("", &queue, "to ack", BasicProperties::default())
        .await
        .unwrap();

    // Act
    let message = connection.get_and_ack(&queue).await.unwrap().unwrap();

    // Assert
    assert_eq!(body(&message), "to ack");
    eventually("the ack to reach the broker", || broker.unacked_count() == 0).await;
}

#[tokio::test]
async fn callback_calls_return_before_the_reply_and_run_the_callback_once() {
    // Arrange
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    let invocations = Arc::new(AtomicUsize::new(0));
    let (done, mut finished) = mpsc::unbounded_channel();

    // Act
    let callback_invocations = invocations.clone();
    let promise = connection
        .queue_declare("callbacks", QueueDeclareOptions::default(), <_>::default())
        .callback(move |declared| async move {
            callback_invocations.fetch_add(1, Ordering::SeqCst);
            done.send(declared.map(|q| q.queue)).unwrap();
        })
        .unwrap();

    // Assert
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert!(promise.get() > 0);
    let declared = tokio::time::timeout(Duration::from_secs(5), finished.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(declared.as_str(), "callbacks");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn broker_errors_reach_blocking_callers() {
    // Arrange
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    let queue = temp_queue(&connection).await;

    // Act
    let outcome = connection
        .queue_bind(
            &queue,
            "does-not-exist",
            "",
            QueueBindOptions::default(),
            <_>::default(),
        )
        .await;

    // Assert
    match outcome {
        Err(Error::Broker(BrokerError { code, .. })) => assert_eq!(code, 404),
        other => panic!("Expected a broker error, got {other:?}"),
    }
    // The connection is still usable.
    connection
        .publish("", &queue, "still alive", BasicProperties::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn broker_errors_reach_callbacks() {
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    let (done, mut finished) = mpsc::unbounded_channel();

    connection
        .publish("does-not-exist", "", "lost", BasicProperties::default())
        .callback(move |outcome| async move {
            done.send(outcome).unwrap();
        })
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), finished.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(Error::Broker(_))));
}

#[tokio::test]
async fn a_standing_consumer_receives_every_delivery_until_cancelled() {
    // Arrange
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    let queue = temp_queue(&connection).await;
    let (received, mut deliveries) = mpsc::unbounded_channel();

    let consumer = connection
        .consume(&queue, "", BasicConsumeOptions::default(), <_>::default())
        .callback(move |message| {
            let received = received.clone();
            async move {
                let message = message.unwrap();
                message.ack().unwrap();
                received.send(body(&message)).unwrap();
            }
        })
        .unwrap();

    // Act
    for i in 0..5 {
        connection
            .publish("", &queue, format!("message-{i}"), BasicProperties::default())
            .await
            .unwrap();
    }
    let mut bodies = Vec::new();
    for _ in 0..5 {
        let next = tokio::time::timeout(Duration::from_secs(5), deliveries.recv()).await;
        bodies.push(next.unwrap().unwrap());
    }
    connection.cancel(consumer).await.unwrap();
    connection
        .publish("", &queue, "after cancel", BasicProperties::default())
        .await
        .unwrap();

    // Assert
    let expected: Vec<String> = (0..5).map(|i| format!("message-{i}")).collect();
    assert_eq!(bodies, expected);
    assert_eq!(broker.consumer_count(&queue), 0);
    assert_eq!(broker.ready_count(&queue), 1);
    eventually("the consumer to be released", || connection.in_flight() == 0).await;
    assert!(deliveries.try_recv().is_err());
}

#[tokio::test]
async fn cancelling_an_unknown_consumer_fails() {
    let broker = Broker::new();
    let connection = open_connection(&broker).await;

    let outcome = connection.cancel(PromiseNumber::from(12345)).await;

    assert!(matches!(outcome, Err(Error::UnknownConsumer(p)) if p.get() == 12345));
}

#[tokio::test]
async fn a_blocking_consume_returns_a_single_message() {
    // Arrange
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    let queue = temp_queue(&connection).await;
    for text in ["first", "second"] {
        connection
            .publish("", &queue, text, BasicProperties::default())
            .await
            .unwrap();
    }

    // Act
    let message = connection
        .consume(&queue, "single", BasicConsumeOptions::default(), <_>::default())
        .await
        .unwrap();
    message.ack().unwrap();

    // Assert
    assert_eq!(body(&message), "first");
    assert_eq!(message.consumer_tag().map(|t| t.as_str()), Some("single"));
    eventually("the consumer to be cancelled", || {
        broker.consumer_count(&queue) == 0
    })
    .await;
    // Anything delivered past the first message went back to the queue.
    eventually("the second message to be ready", || {
        broker.ready_count(&queue) == 1 && broker.unacked_count() == 0
    })
    .await;
    let second = connection
        .get(&queue, BasicGetOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body(&second), "second");
}

#[tokio::test]
async fn a_blocking_consume_waits_for_a_message() {
    // Arrange
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    let queue = temp_queue(&connection).await;
    let publisher = connection.clone();
    let publish_queue = queue.clone();

    // Act
    let publish = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        publisher
            .publish("", &publish_queue, "late", BasicProperties::default())
            .await
            .unwrap();
    });
    let message = tokio::time::timeout(
        Duration::from_secs(5),
        connection.consume(&queue, "", BasicConsumeOptions::default(), <_>::default()),
    )
    .await
    .unwrap()
    .unwrap();

    // Assert
    assert_eq!(body(&message), "late");
    publish.await.unwrap();
}

#[tokio::test]
async fn a_blocking_consume_without_acks_keeps_the_other_messages_in_the_queue() {
    // Arrange
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    let queue = temp_queue(&connection).await;
    for text in ["first", "second", "third"] {
        connection
            .publish("", &queue, text, BasicProperties::default())
            .await
            .unwrap();
    }
    let options = BasicConsumeOptions {
        no_ack: true,
        ..Default::default()
    };

    // Act
    let message = connection
        .consume(&queue, "single", options, <_>::default())
        .await
        .unwrap();

    // Assert
    assert_eq!(body(&message), "first");
    eventually("the other messages to be back in the queue", || {
        broker.consumer_count(&queue) == 0
            && broker.ready_count(&queue) == 2
            && broker.unacked_count() == 0
    })
    .await;
    let mut left = Vec::new();
    while let Some(message) = connection.get_and_ack(&queue).await.unwrap() {
        left.push(body(&message));
    }
    left.sort();
    assert_eq!(left, vec!["second", "third"]);
}

#[tokio::test]
async fn a_caller_giving_up_on_a_blocking_call_frees_its_promise() {
    // Arrange
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    broker.hold_replies();

    // Act
    let outcome = tokio::time::timeout(
        Duration::from_millis(100),
        connection.queue_declare("late", QueueDeclareOptions::default(), <_>::default()),
    )
    .await;

    // Assert
    assert!(outcome.is_err());
    assert_eq!(connection.in_flight(), 0);
    // The reply showing up afterwards is dropped and the connection keeps working.
    broker.release_replies();
    let declared = connection
        .queue_declare(
            "late",
            QueueDeclareOptions {
                passive: true,
                ..Default::default()
            },
            <_>::default(),
        )
        .await
        .unwrap();
    assert_eq!(declared.queue.as_str(), "late");
    eventually("the promises to be released", || connection.in_flight() == 0).await;
}

#[tokio::test]
async fn a_caller_giving_up_on_a_blocking_consume_cancels_the_consumer() {
    // Arrange
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    let queue = temp_queue(&connection).await;

    // Act
    let outcome = tokio::time::timeout(
        Duration::from_millis(100),
        connection.consume(&queue, "", BasicConsumeOptions::default(), <_>::default()),
    )
    .await;

    // Assert
    assert!(outcome.is_err());
    eventually("the consumer to be cancelled", || {
        broker.consumer_count(&queue) == 0
    })
    .await;
    eventually("the promises to be released", || connection.in_flight() == 0).await;
}

#[tokio::test]
async fn a_broken_connection_fails_blocked_callers() {
    // Arrange
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    let queue = temp_queue(&connection).await;
    let waiting = connection.clone();
    let waiting_queue = queue.clone();
    let blocked = tokio::spawn(async move {
        waiting
            .consume(&waiting_queue, "", BasicConsumeOptions::default(), <_>::default())
            .await
    });
    eventually("the consumer to be registered", || {
        broker.consumer_count(&queue) == 1
    })
    .await;

    // Act
    broker.disconnect_all();

    // Assert
    let outcome = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(Error::ConnectionBroken(_))));
    assert!(connection.is_broken());
    let later = connection
        .publish("", &queue, "too late", BasicProperties::default())
        .await;
    assert!(matches!(later, Err(Error::ConnectionBroken(_))));
}

#[tokio::test]
async fn undecodable_data_breaks_the_connection() {
    let broker = Broker::new();
    let connection = open_connection(&broker).await;

    broker.send_raw_to_all(b"this is not json\n");

    eventually("the connection to break", || connection.is_broken()).await;
    let outcome = connection
        .queue_declare("", QueueDeclareOptions::default(), <_>::default())
        .await;
    match outcome {
        Err(Error::ConnectionBroken(reason)) => assert!(reason.contains("undecodable")),
        other => panic!("Expected a broken connection, got {other:?}"),
    }
}

#[tokio::test]
async fn rejected_messages_can_be_requeued() {
    // Arrange
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    let queue = temp_queue(&connection).await;
    connection
        .publish("", &queue, "boomerang", BasicProperties::default())
        .await
        .unwrap();
    let first = connection
        .get(&queue, BasicGetOptions::default())
        .await
        .unwrap()
        .unwrap();

    // Act
    first.reject(true).unwrap();
    let second = connection
        .get(&queue, BasicGetOptions::default())
        .await
        .unwrap()
        .unwrap();

    // Assert
    assert!(!first.redelivered());
    assert!(second.redelivered());
    assert_eq!(body(&second), "boomerang");
}

#[tokio::test]
async fn closing_is_idempotent_and_refuses_further_operations() {
    // Arrange
    let broker = Broker::new();
    let connection = open_connection(&broker).await;

    // Act
    connection.close().await;
    connection.close().await;

    // Assert
    assert!(connection.is_closed());
    assert!(!connection.is_broken());
    let outcome = connection
        .queue_declare("", QueueDeclareOptions::default(), <_>::default())
        .await;
    assert!(matches!(outcome, Err(Error::Closed)));
    assert!(matches!(connection.ack(1), Err(Error::Closed)));
    eventually("the broker to drop the session", || broker.sessions() == 0).await;
}

#[tokio::test]
async fn closing_fails_pending_callers() {
    // Arrange
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    let queue = temp_queue(&connection).await;
    let waiting = connection.clone();
    let blocked = tokio::spawn(async move {
        waiting
            .consume(&queue, "", BasicConsumeOptions::default(), <_>::default())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Act
    connection.close().await;

    // Assert
    let outcome = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(Error::Closed)));
    assert_eq!(connection.in_flight(), 0);
}

#[tokio::test]
async fn opening_fails_when_the_broker_refuses_connections() {
    let broker = Broker::new();
    broker.refuse_connections(true);

    let outcome = Connection::open(
        broker.connector().as_ref(),
        &BrokerSettings::default(),
        connection_options(),
    )
    .await;

    assert!(matches!(outcome, Err(Error::Connect(_))));
}

#[tokio::test]
async fn the_protocol_client_can_be_inspected() {
    let broker = Broker::new();
    let connection = open_connection(&broker).await;
    temp_queue(&connection).await;

    eventually("the outbound buffer to drain", || {
        connection.with_client(|client| !client.needs_write())
    })
    .await;

    let other = open_connection(&broker).await;
    assert!(connection.id() < other.id());
}
