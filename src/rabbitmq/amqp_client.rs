// src/rabbitmq/amqp_client.rs
// BrokerChannel over a lapin channel

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions,
    },
    publisher_confirm::{Confirmation as LapinConfirmation, PublisherConfirm},
    types::FieldTable,
    Channel, ExchangeKind,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use super::channel::{BrokerChannel, DeliveryStream, QueueInfo};
use super::errors::{RabbitMQError, Result};
use crate::message::{Confirmation, InboundMessage, Publishing, Return};

#[derive(Default)]
struct Listeners {
    returns: Mutex<Vec<UnboundedSender<Return>>>,
    confirms: Mutex<Vec<UnboundedSender<Confirmation>>>,
    flows: Mutex<Vec<UnboundedSender<bool>>>,
}

fn broadcast<T: Clone>(senders: &Mutex<Vec<UnboundedSender<T>>>, value: T) {
    senders
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|tx| tx.send(value.clone()).is_ok());
}

fn register<T>(senders: &Mutex<Vec<UnboundedSender<T>>>, tx: UnboundedSender<T>) {
    senders.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
}

fn has_live<T>(senders: &Mutex<Vec<UnboundedSender<T>>>) -> bool {
    senders
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .any(|tx| !tx.is_closed())
}

/// Awaits broker answers in publish order and fans them out, so listeners
/// see returns and confirm tags in the order the publishes went out.
async fn forward_confirms<F>(mut pending: UnboundedReceiver<(Option<u64>, F)>, listeners: Arc<Listeners>)
where
    F: Future<Output = lapin::Result<LapinConfirmation>>,
{
    while let Some((tag, confirm)) = pending.recv().await {
        match confirm.await {
            Ok(confirmation) => {
                let ack = confirmation.is_ack();
                if let Some(returned) = confirmation.take_message() {
                    broadcast(&listeners.returns, Return::from(returned));
                }
                if let Some(delivery_tag) = tag {
                    broadcast(&listeners.confirms, Confirmation { delivery_tag, ack });
                }
            }
            Err(e) => warn!(delivery_tag = ?tag, "Publisher confirm failed: {}", e),
        }
    }
}

// Outside confirm mode lapin parks returned messages until
// wait_for_confirms drains them.
async fn drain_returns(
    channel: Channel,
    listeners: Weak<Listeners>,
    confirm_mode: Arc<AtomicBool>,
    poll: Duration,
) {
    let mut ticker = tokio::time::interval(poll);
    loop {
        ticker.tick().await;
        let Some(listeners) = listeners.upgrade() else {
            return;
        };
        if !channel.status().connected() {
            return;
        }
        if confirm_mode.load(Ordering::Acquire) || !has_live(&listeners.returns) {
            continue;
        }
        match channel.wait_for_confirms().await {
            Ok(returned) => {
                for message in returned {
                    broadcast(&listeners.returns, Return::from(message));
                }
            }
            Err(e) => {
                debug!(channel = channel.id(), "Draining returned messages failed: {}", e);
                return;
            }
        }
    }
}

pub struct LapinChannel {
    channel: Channel,
    listeners: Arc<Listeners>,
    confirm_mode: Arc<AtomicBool>,
    next_publish_tag: AtomicU64,
    // Held across basic_publish so tag order matches wire order.
    publish_lock: tokio::sync::Mutex<()>,
    pending: UnboundedSender<(Option<u64>, PublisherConfirm)>,
    returns_drained: AtomicBool,
    status_poll_interval: Duration,
}

impl LapinChannel {
    /// Wraps `channel`. Must be called inside a Tokio runtime.
    pub fn new(channel: Channel, status_poll_interval: Duration) -> Self {
        let listeners = Arc::new(Listeners::default());
        let (pending, pending_rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_confirms(pending_rx, Arc::clone(&listeners)));
        Self {
            channel,
            listeners,
            confirm_mode: Arc::new(AtomicBool::new(false)),
            next_publish_tag: AtomicU64::new(0),
            publish_lock: tokio::sync::Mutex::new(()),
            pending,
            returns_drained: AtomicBool::new(false),
            status_poll_interval,
        }
    }

    /// The wrapped lapin channel.
    pub fn inner(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> String {
        self.channel.id().to_string()
    }

    async fn basic_qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()> {
        if prefetch_size > 0 {
            debug!(prefetch_size, "lapin does not send prefetch-size, ignoring it");
        }
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await?;
        Ok(())
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<()> {
        self.channel.exchange_declare(name, kind, options, args).await?;
        Ok(())
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<QueueInfo> {
        let queue = self.channel.queue_declare(name, options, args).await?;
        Ok(QueueInfo {
            name: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        options: QueueBindOptions,
        args: FieldTable,
    ) -> Result<()> {
        self.channel
            .queue_bind(queue, exchange, routing_key, options, args)
            .await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        message: Publishing,
    ) -> Result<()> {
        let _ordered = self.publish_lock.lock().await;
        let confirm = self
            .channel
            .basic_publish(exchange, routing_key, options, &message.payload, message.properties)
            .await?;

        let tag = self
            .confirm_mode
            .load(Ordering::Acquire)
            .then(|| self.next_publish_tag.fetch_add(1, Ordering::AcqRel) + 1);
        if self.pending.send((tag, confirm)).is_err() {
            warn!(%routing_key, "Confirm forwarder is gone, dropping publisher confirm");
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, args)
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(InboundMessage::from).map_err(RabbitMQError::from))
            .boxed())
    }

    async fn basic_get(&self, queue: &str, options: BasicGetOptions) -> Result<Option<InboundMessage>> {
        let message = self.channel.basic_get(queue, options).await?;
        Ok(message.map(InboundMessage::from))
    }

    async fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<()> {
        self.channel.basic_ack(delivery_tag, options).await?;
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, options: BasicNackOptions) -> Result<()> {
        self.channel.basic_nack(delivery_tag, options).await?;
        Ok(())
    }

    async fn queue_purge(&self, queue: &str, options: QueuePurgeOptions) -> Result<u32> {
        Ok(self.channel.queue_purge(queue, options).await?)
    }

    async fn confirm_select(&self, options: ConfirmSelectOptions) -> Result<()> {
        self.channel.confirm_select(options).await?;
        self.confirm_mode.store(true, Ordering::Release);
        Ok(())
    }

    fn notify_return(&self, tx: UnboundedSender<Return>) {
        register(&self.listeners.returns, tx);
        if !self.returns_drained.swap(true, Ordering::AcqRel) {
            tokio::spawn(drain_returns(
                self.channel.clone(),
                Arc::downgrade(&self.listeners),
                Arc::clone(&self.confirm_mode),
                self.status_poll_interval,
            ));
        }
    }

    fn notify_publish(&self, tx: UnboundedSender<Confirmation>) {
        register(&self.listeners.confirms, tx);
    }

    // lapin answers channel.flow itself and does not surface it, so these
    // senders only live as long as the channel does.
    fn notify_flow(&self, tx: UnboundedSender<bool>) {
        register(&self.listeners.flows, tx);
    }

    fn notify_close(&self, tx: UnboundedSender<String>) {
        let channel = self.channel.clone();
        let poll = self.status_poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    return;
                }
                if !channel.status().connected() {
                    let _ = tx.send(format!(
                        "channel {} is no longer connected ({:?})",
                        channel.id(),
                        channel.status().state()
                    ));
                    return;
                }
            }
        });
    }
}

impl Drop for LapinChannel {
    fn drop(&mut self) {
        if !self.channel.status().connected() {
            return;
        }
        // Closing releases anything still unacked on this channel.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let channel = self.channel.clone();
            handle.spawn(async move {
                if let Err(e) = channel.close(200, "channel released").await {
                    debug!(channel = channel.id(), "Channel close on release failed: {}", e);
                }
            });
        }
    }
}
