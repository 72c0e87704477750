use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use resilient_rabbitmq::config::{self, RabbitConfig};
use resilient_rabbitmq::message::Publishing;
use resilient_rabbitmq::rabbitmq::{
    new_queue, publisher::with_exchange, queue::with_channel_config, Conn, LapinConnectionManager,
    Publisher, PublisherOptions,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct Heartbeat {
    sequence: u64,
    sent_at: DateTime<Utc>,
}

fn load_or_create_config() -> Result<RabbitConfig> {
    match config::load_config() {
        Ok(config) => Ok(config),
        Err(e) => {
            warn!("{}", e);
            let path = Path::new(config::CONFIG_FILE_NAME);
            config::create_default_config_file(path)?;
            config::load_config_from(path)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = load_or_create_config()?;
    if let Ok(env_config) = resilient_rabbitmq::env::Config::load() {
        config.connection.uri = env_config.amqp_addr;
    }
    let queue_config = config
        .queues
        .first()
        .cloned()
        .context("Configuration lists no queues")?;

    let manager = LapinConnectionManager::new(&config.connection.uri)
        .with_connect_timeout(config.connection.connection_timeout())
        .with_reconnect_interval(config.connection.reconnect_interval())
        .with_reconnect_policy(config.connection.max_connect_attempts, 1000);
    let mut conn = Conn::new(Arc::new(manager));

    let mut consumer_options = queue_config.consumer_options()?;
    consumer_options.push(with_channel_config(config.channel_config()));
    let queue = new_queue(&conn, &queue_config.name, consumer_options).await?;

    let publisher = Publisher::new(
        queue.channel_manager(),
        PublisherOptions {
            confirm: config.channel.publisher_confirms,
        },
    )
    .await?;
    let mut returns = publisher.notify_return().await?;
    tokio::spawn(async move {
        while let Some(returned) = returns.recv().await {
            warn!(routing_key = %returned.routing_key, reply = %returned.reply_text, "Message returned");
        }
    });

    let mut deliveries = queue.consume().await?;
    let acker = queue.channel_manager();
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Ok(msg) => {
                    match msg.json::<Heartbeat>() {
                        Ok(beat) => info!(sequence = beat.sequence, sent_at = %beat.sent_at, "Received heartbeat"),
                        Err(e) => warn!("Undecodable message: {}", e),
                    }
                    if let Err(e) = acker.ack_safe(msg.delivery_tag, false).await {
                        error!("Ack failed: {}", e);
                    }
                }
                Err(e) => {
                    error!("Consumer stream error: {}", e);
                    break;
                }
            }
        }
        info!("Consumer stream ended");
    });

    let exchange = queue_config.exchange.clone().unwrap_or_default();
    let routing_keys = if queue_config.routing_keys.is_empty() {
        vec![queue_config.name.clone()]
    } else {
        queue_config.routing_keys.clone()
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    let mut sequence = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sequence += 1;
                let beat = Heartbeat { sequence, sent_at: Utc::now() };
                let msg = Publishing::json(&beat)?.with_message_id(Uuid::new_v4().to_string());
                if let Err(e) = publisher
                    .publish_with_msg(&msg, routing_keys.as_slice(), vec![with_exchange(exchange.clone())])
                    .await
                {
                    warn!(sequence, "Heartbeat not published: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    publisher.close().await;
    conn.close().await?;
    Ok(())
}
