// Requires a running RabbitMQ reachable with the fixture's URI.

use futures::StreamExt;
use resilient_rabbitmq::config::{load_config_from, RabbitConfig};
use resilient_rabbitmq::message::Publishing;
use resilient_rabbitmq::rabbitmq::publisher::{with_exchange, with_mandatory, with_message_id};
use resilient_rabbitmq::rabbitmq::queue::{with_channel_config, with_queue_auto_delete};
use resilient_rabbitmq::rabbitmq::{
    clear_queue, new_queue, ChannelConfig, ChannelManager, Conn, LapinConnectionManager, Publisher,
    PublisherOptions,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn load_test_config() -> RabbitConfig {
    load_config_from(Path::new("tests/fixtures/rabbitmq/configs/test_config.json"))
        .expect("Failed to load test config")
}

#[test]
fn fixture_config_is_valid() {
    let config = load_test_config();
    assert_eq!(config.queues.len(), 1);
    assert!(config.channel.publisher_confirms);
    assert_eq!(config.channel_config().max_recovery_attempts, Some(5));
}

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn publish_and_consume_against_rabbitmq() {
    let config = load_test_config();
    let queue_config = &config.queues[0];
    let manager = LapinConnectionManager::new(&config.connection.uri)
        .with_connect_timeout(config.connection.connection_timeout())
        .with_reconnect_interval(config.connection.reconnect_interval())
        .with_reconnect_policy(config.connection.max_connect_attempts, 200);
    let mut conn = Conn::new(Arc::new(manager));

    let mut options = queue_config.consumer_options().unwrap();
    options.push(with_queue_auto_delete());
    options.push(with_channel_config(config.channel_config()));
    let queue = new_queue(&conn, &queue_config.name, options).await.unwrap();
    queue.clear().await.unwrap();

    let publisher = Publisher::new(queue.channel_manager(), PublisherOptions { confirm: true })
        .await
        .unwrap();
    let mut confirms = publisher.notify_publish().await.unwrap();
    let mut deliveries = queue.consume().await.unwrap();

    let exchange = queue_config.exchange.clone().unwrap_or_default();
    publisher
        .publish_with_msg(
            &Publishing::new("live"),
            queue_config.routing_keys.as_slice(),
            vec![with_exchange(exchange), with_message_id("live-1")],
        )
        .await
        .unwrap();

    let confirmation = tokio::time::timeout(Duration::from_secs(5), confirms.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(confirmation.ack);

    let delivery = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delivery.message_id(), Some("live-1"));
    queue
        .channel_manager()
        .ack_safe(delivery.delivery_tag, false)
        .await
        .unwrap();

    assert_eq!(clear_queue(&conn, &queue_config.name, vec![]).await.unwrap(), 0);
    publisher.close().await;
    conn.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn unroutable_mandatory_publish_is_returned_without_confirms() {
    let config = load_test_config();
    let manager = LapinConnectionManager::new(&config.connection.uri)
        .with_connect_timeout(config.connection.connection_timeout());
    let chan_manager = ChannelManager::new(Arc::new(manager), ChannelConfig::default())
        .await
        .unwrap();
    let publisher = Publisher::new(Arc::new(chan_manager), PublisherOptions { confirm: false })
        .await
        .unwrap();
    let mut returns = publisher.notify_return().await.unwrap();

    let routing_key = format!("unroutable-{}", uuid::Uuid::new_v4());
    publisher
        .publish("nobody home", &[routing_key.as_str()], vec![with_mandatory()])
        .await
        .unwrap();

    let returned = tokio::time::timeout(Duration::from_secs(5), returns.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(returned.reply_code, 312);
    assert_eq!(returned.routing_key, routing_key);
    publisher.close().await;
}
