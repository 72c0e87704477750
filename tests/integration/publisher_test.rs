use lapin::{options::QueueDeclareOptions, types::FieldTable, BasicProperties};
use resilient_rabbitmq::message::{DeliveryMode, Publishing};
use resilient_rabbitmq::rabbitmq::publisher::{
    with_delivery_mode, with_mandatory, with_message_id, with_persistent_delivery,
};
use resilient_rabbitmq::rabbitmq::{
    BlockReason, ChannelManager, MemoryBroker, Operation, Publisher, PublisherOptions,
    RabbitMQError,
};
use std::sync::Arc;
use std::time::Duration;

use crate::support::{broker, eventually, manager, swap_channel};

async fn publisher_on(broker: &MemoryBroker, confirm: bool) -> Publisher<MemoryBroker> {
    let manager = manager(broker).await;
    manager
        .queue_declare_safe("events", QueueDeclareOptions::default(), FieldTable::default())
        .await
        .unwrap();
    Publisher::new(manager, PublisherOptions { confirm }).await.unwrap()
}

fn publishes(broker: &MemoryBroker) -> Vec<(String, Option<u8>, bool)> {
    broker
        .operations()
        .into_iter()
        .filter_map(|op| match op {
            Operation::Publish {
                routing_key,
                delivery_mode,
                accepted,
                ..
            } => Some((routing_key, delivery_mode, accepted)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn flow_control_blocks_publishing_until_lifted() {
    let broker = broker();
    let publisher = publisher_on(&broker, false).await;

    broker.set_flow(true);
    eventually("flow pause", || publisher.gate().is_flow_paused()).await;
    let err = publisher
        .publish("payload", &["events"], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::PublishBlocked(BlockReason::HighFlow)));
    assert_eq!(err.to_string(), "publishing blocked due to high flow on the server");
    assert!(publishes(&broker).is_empty());

    broker.set_flow(false);
    eventually("flow resume", || !publisher.gate().is_flow_paused()).await;
    publisher.publish("payload", &["events"], vec![]).await.unwrap();
    assert_eq!(broker.queue_len("events"), Some(1));
}

#[tokio::test]
async fn connection_block_is_checked_independently_of_flow() {
    let broker = broker();
    let publisher = publisher_on(&broker, false).await;

    broker.set_blocked(true);
    eventually("connection block", || publisher.gate().is_blocked()).await;
    assert!(!publisher.gate().is_flow_paused());

    let err = publisher
        .publish("payload", &["events"], vec![])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RabbitMQError::PublishBlocked(BlockReason::ConnectionBlocked)
    ));
    assert_eq!(err.to_string(), "publishing blocked due to TCP block on the server");
    assert!(publishes(&broker).is_empty());

    broker.set_blocked(false);
    eventually("connection unblock", || !publisher.gate().is_blocked()).await;
    publisher.publish("payload", &["events"], vec![]).await.unwrap();
}

#[tokio::test]
async fn flow_listener_is_reattached_after_recovery() {
    let broker = broker();
    let publisher = publisher_on(&broker, false).await;

    swap_channel(&broker, publisher.channel_manager(), 2).await;
    broker.set_flow(true);
    eventually("flow pause on the new channel", || publisher.gate().is_flow_paused()).await;
}

#[tokio::test]
async fn delivery_mode_defaults_to_transient_and_explicit_modes_survive() {
    let broker = broker();
    let publisher = publisher_on(&broker, false).await;

    publisher.publish("a", &["events"], vec![]).await.unwrap();
    publisher
        .publish("b", &["events"], vec![with_persistent_delivery()])
        .await
        .unwrap();
    let persistent = Publishing::new("c").with_properties(
        BasicProperties::default().with_delivery_mode(DeliveryMode::Persistent.as_u8()),
    );
    publisher
        .publish_with_msg(&persistent, &["events"], vec![with_delivery_mode(DeliveryMode::Transient)])
        .await
        .unwrap();

    let modes: Vec<Option<u8>> = publishes(&broker).into_iter().map(|(_, mode, _)| mode).collect();
    assert_eq!(modes, vec![Some(1), Some(2), Some(2)]);
}

#[tokio::test]
async fn publishing_stops_at_the_first_failing_key() {
    let broker = broker();
    let publisher = publisher_on(&broker, false).await;
    broker.fail_publish("k2", "k2 rejected by broker");

    let err = publisher
        .publish("fan", &["k1", "k2", "k3"], vec![])
        .await
        .unwrap_err();

    match err {
        RabbitMQError::ChannelError(reason) => assert_eq!(reason, "k2 rejected by broker"),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(
        publishes(&broker),
        vec![
            ("k1".to_string(), Some(1), true),
            ("k2".to_string(), Some(1), false),
        ]
    );
}

#[tokio::test]
async fn empty_key_list_publishes_nothing() {
    let broker = broker();
    let publisher = publisher_on(&broker, false).await;
    let keys: [&str; 0] = [];

    publisher.publish("nothing", &keys, vec![]).await.unwrap();
    assert!(publishes(&broker).is_empty());
}

#[tokio::test]
async fn unroutable_mandatory_publish_is_returned() {
    let broker = broker();
    let publisher = publisher_on(&broker, false).await;
    let mut returns = publisher.notify_return().await.unwrap();

    publisher
        .publish("lost", &["nowhere"], vec![with_mandatory(), with_message_id("m-1")])
        .await
        .unwrap();

    let returned = tokio::time::timeout(Duration::from_secs(1), returns.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(returned.reply_code, 312);
    assert_eq!(returned.routing_key, "nowhere");
    assert_eq!(returned.message.message_id(), Some("m-1"));
    assert_eq!(returned.message.payload, b"lost".to_vec());
}

#[tokio::test]
async fn confirms_follow_the_channel_across_recovery() {
    let broker = broker();
    let publisher = publisher_on(&broker, true).await;
    let mut confirms = publisher.notify_publish().await.unwrap();

    publisher.publish("1", &["events", "events"], vec![]).await.unwrap();
    let first = confirms.recv().await.unwrap();
    let second = confirms.recv().await.unwrap();
    assert_eq!((first.delivery_tag, second.delivery_tag), (1, 2));
    assert!(first.ack && second.ack);

    swap_channel(&broker, publisher.channel_manager(), 2).await;
    publisher.publish("2", &["events"], vec![]).await.unwrap();

    // Tags restart on the recovered channel.
    let third = tokio::time::timeout(Duration::from_secs(1), confirms.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(third.delivery_tag, 1);
    assert!(broker
        .operations()
        .contains(&Operation::ConfirmSelect { channel: 2 }));
}

#[tokio::test]
async fn close_shuts_the_channel_manager_down() {
    let broker = broker();
    let publisher = publisher_on(&broker, false).await;
    let manager: Arc<ChannelManager<MemoryBroker>> = Arc::clone(publisher.channel_manager());

    publisher.close().await;

    assert!(matches!(
        manager.publish_safe("", "events", false, false, Publishing::new("x")).await,
        Err(RabbitMQError::ManagerClosed)
    ));
}

#[tokio::test]
async fn dropped_publishers_stop_reconfiguring_recovered_channels() {
    let broker = broker();
    let manager = manager(&broker).await;
    for _ in 0..3 {
        let publisher = Publisher::new(Arc::clone(&manager), PublisherOptions { confirm: true })
            .await
            .unwrap();
        drop(publisher);
    }
    assert_eq!(manager.reconnect_hook_count(), 0);

    swap_channel(&broker, &manager, 2).await;

    let confirm_selects = broker
        .operations()
        .into_iter()
        .filter(|op| *op == Operation::ConfirmSelect { channel: 2 })
        .count();
    assert_eq!(confirm_selects, 0);
}
