use futures::StreamExt;
use lapin::ExchangeKind;
use resilient_rabbitmq::rabbitmq::publisher::with_exchange;
use resilient_rabbitmq::rabbitmq::queue::{
    with_consumer_auto_ack, with_exchange_kind, with_exchange_name, with_exchange_passive,
    with_qos_prefetch, with_queue_passive, with_routing_key,
};
use resilient_rabbitmq::rabbitmq::{
    clear_queue, delete_queue_msg, new_queue, Conn, DeclareStage, MemoryBroker, Operation,
    Publisher, PublisherOptions, RabbitMQError,
};
use std::sync::Arc;
use std::time::Duration;

use crate::support::{broker, fill_queue, ids, swap_channel};

fn topology(broker: &MemoryBroker, channel: u64) -> Vec<String> {
    broker
        .operations()
        .into_iter()
        .filter(|op| op.channel() == channel)
        .filter_map(|op| match op {
            Operation::Qos { prefetch_count, .. } => Some(format!("qos {}", prefetch_count)),
            Operation::ExchangeDeclare { name, .. } => Some(format!("exchange {}", name)),
            Operation::QueueDeclare { name, .. } => Some(format!("queue {}", name)),
            Operation::QueueBind { routing_key, .. } => Some(format!("bind {}", routing_key)),
            _ => None,
        })
        .collect()
}

fn orders_options() -> Vec<resilient_rabbitmq::rabbitmq::ConsumerOption> {
    vec![
        with_exchange_name("events"),
        with_exchange_kind(ExchangeKind::Topic),
        with_routing_key("order.*"),
        with_routing_key("refund.#"),
        with_qos_prefetch(4),
    ]
}

#[tokio::test]
async fn new_queue_declares_qos_exchange_queue_then_bindings() {
    let broker = broker();
    let conn = Conn::new(Arc::new(broker.clone()));

    let queue = new_queue(&conn, "orders", orders_options()).await.unwrap();

    assert_eq!(queue.name(), "orders");
    assert_eq!(
        topology(&broker, 1),
        ["qos 4", "exchange events", "queue orders", "bind order.*", "bind refund.#"]
    );
    assert!(broker.has_exchange("events"));
}

#[tokio::test]
async fn topology_is_replayed_in_order_after_recovery() {
    let broker = broker();
    let conn = Conn::new(Arc::new(broker.clone()));
    let queue = new_queue(&conn, "orders", orders_options()).await.unwrap();

    broker.clear_operations();
    swap_channel(&broker, &queue.channel_manager(), 2).await;

    assert_eq!(
        topology(&broker, 2),
        ["qos 4", "exchange events", "queue orders", "bind order.*", "bind refund.#"]
    );
}

#[tokio::test]
async fn declaration_failures_name_their_stage() {
    let broker = broker();
    let conn = Conn::new(Arc::new(broker.clone()));

    let err = new_queue(&conn, "orders", vec![with_exchange_name("missing"), with_exchange_passive()])
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RabbitMQError::Stage { stage: DeclareStage::Exchange, .. }));
    assert!(err.to_string().starts_with("declare exchange failed:"));

    let err = new_queue(&conn, "missing", vec![with_queue_passive()])
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RabbitMQError::Stage { stage: DeclareStage::Queue, .. }));

    // A binding without an exchange targets the default exchange, which refuses it.
    let err = new_queue(&conn, "orders", vec![with_routing_key("order.*")])
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RabbitMQError::Stage { stage: DeclareStage::Bindings, .. }));
    // Earlier stages are not rolled back.
    assert_eq!(broker.queue_len("orders"), Some(0));
}

#[tokio::test]
async fn closed_conn_is_rejected_before_any_channel_opens() {
    let broker = broker();
    let conn: Conn<MemoryBroker> = Conn::default();

    assert!(matches!(
        new_queue(&conn, "orders", vec![]).await.err(),
        Some(RabbitMQError::MissingConnectionManager)
    ));
    assert!(matches!(
        clear_queue(&conn, "orders", vec![]).await,
        Err(RabbitMQError::MissingConnectionManager)
    ));
    let err = delete_queue_msg(&conn, "orders", &["id-1"], vec![]).await.unwrap_err();
    assert_eq!(err.to_string(), "connection manager can't be nil");
    assert_eq!(broker.channels_opened(), 0);
}

#[tokio::test]
async fn clear_queue_reports_how_many_messages_were_purged() {
    let broker = broker();
    let conn = Conn::new(Arc::new(broker.clone()));
    fill_queue(&broker, "jobs", &["id-1", "id-2", "id-3"]);

    assert_eq!(clear_queue(&conn, "jobs", vec![]).await.unwrap(), 3);
    assert_eq!(broker.queue_len("jobs"), Some(0));
    assert_eq!(clear_queue(&conn, "jobs", vec![]).await.unwrap(), 0);
    assert_eq!(broker.open_channel_count(), 0);
}

#[tokio::test]
async fn delete_queue_msg_releases_scanned_messages_when_done() {
    let broker = broker();
    let conn = Conn::new(Arc::new(broker.clone()));
    fill_queue(&broker, "jobs", &["id-1", "id-2", "id-3"]);

    delete_queue_msg(&conn, "jobs", &["id-2"], vec![]).await.unwrap();

    // id-1 was scanned past and comes back once the short-lived channel closes.
    assert_eq!(broker.ready_message_ids("jobs"), ids(&["id-1", "id-3"]));
    assert!(broker.unacked_message_ids().is_empty());
}

#[tokio::test]
async fn queue_handle_consumes_what_a_publisher_sends() {
    let broker = broker();
    let conn = Conn::new(Arc::new(broker.clone()));
    let queue = new_queue(
        &conn,
        "orders",
        vec![
            with_exchange_name("events"),
            with_routing_key("order.created"),
            with_consumer_auto_ack(true),
        ],
    )
    .await
    .unwrap();
    let publisher = Publisher::new(queue.channel_manager(), PublisherOptions::default())
        .await
        .unwrap();

    let mut deliveries = queue.consume().await.unwrap();
    publisher
        .publish("order 42", &["order.created", "order.cancelled"], vec![with_exchange("events")])
        .await
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(1), deliveries.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delivery.payload, b"order 42".to_vec());
    assert_eq!(delivery.routing_key, "order.created");
    assert_eq!(delivery.exchange, "events");
}

#[tokio::test]
async fn queue_handle_clears_and_deletes() {
    let broker = broker();
    let conn = Conn::new(Arc::new(broker.clone()));
    let queue = new_queue(&conn, "jobs", vec![]).await.unwrap();

    fill_queue(&broker, "jobs", &["id-1", "id-2", "id-3", "id-4"]);
    queue.delete_msg("id-1").await.unwrap();
    assert_eq!(broker.ready_message_ids("jobs"), ids(&["id-2", "id-3", "id-4"]));

    queue.delete_msgs(&["id-3"]).await.unwrap();
    assert_eq!(broker.ready_message_ids("jobs"), ids(&["id-4"]));
    assert_eq!(broker.unacked_message_ids(), ids(&["id-2"]));

    assert_eq!(queue.clear().await.unwrap(), 1);
    queue.close().await;
    // Closing the channel hands the scanned-past message back.
    assert_eq!(broker.ready_message_ids("jobs"), ids(&["id-2"]));
}
