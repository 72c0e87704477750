//! In-process broker implementing [`ConnectionManager`] and [`BrokerChannel`].
//!
//! Routing follows AMQP 0-9-1 for the default, direct, fanout and topic
//! exchanges (headers exchanges route like fanout). Every channel operation is
//! recorded so callers can assert on exactly what reached the broker, and
//! faults (refused connections, failing publishes, dropped channels, flow and
//! blocked notifications) can be injected.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueuePurgeOptions,
    },
    types::FieldTable,
    ExchangeKind,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

use super::channel::{BrokerChannel, DeliveryStream, QueueInfo};
use super::connection::{ConnectionManager, DEFAULT_RECONNECT_INTERVAL};
use super::errors::{RabbitMQError, Result};
use crate::message::{Confirmation, InboundMessage, Publishing, Return};

const NO_ROUTE: u16 = 312;

/// One call that reached the broker, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Qos { channel: u64, prefetch_count: u16, global: bool },
    ExchangeDeclare { channel: u64, name: String, passive: bool },
    QueueDeclare { channel: u64, name: String, passive: bool },
    QueueBind { channel: u64, queue: String, routing_key: String, exchange: String },
    Publish {
        channel: u64,
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
        delivery_mode: Option<u8>,
        accepted: bool,
    },
    Consume { channel: u64, queue: String, consumer_tag: String },
    Get { channel: u64, queue: String, message_id: Option<String> },
    Ack { channel: u64, delivery_tag: u64 },
    Nack { channel: u64, delivery_tag: u64, requeue: bool, message_id: Option<String> },
    Purge { channel: u64, queue: String, count: u32 },
    ConfirmSelect { channel: u64 },
}

impl Operation {
    pub fn channel(&self) -> u64 {
        match self {
            Operation::Qos { channel, .. }
            | Operation::ExchangeDeclare { channel, .. }
            | Operation::QueueDeclare { channel, .. }
            | Operation::QueueBind { channel, .. }
            | Operation::Publish { channel, .. }
            | Operation::Consume { channel, .. }
            | Operation::Get { channel, .. }
            | Operation::Ack { channel, .. }
            | Operation::Nack { channel, .. }
            | Operation::Purge { channel, .. }
            | Operation::ConfirmSelect { channel } => *channel,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    message: Publishing,
}

#[derive(Debug, Clone)]
struct BindingRecord {
    queue: String,
    routing_key: String,
    exchange: String,
}

struct ConsumerRecord {
    channel: u64,
    auto_ack: bool,
    tx: UnboundedSender<Result<InboundMessage>>,
}

#[derive(Default)]
struct ChannelRecord {
    open: bool,
    next_delivery_tag: u64,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
    confirm_mode: bool,
    next_publish_tag: u64,
    close_listeners: Vec<UnboundedSender<String>>,
    return_listeners: Vec<UnboundedSender<Return>>,
    confirm_listeners: Vec<UnboundedSender<Confirmation>>,
    flow_listeners: Vec<UnboundedSender<bool>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    bindings: Vec<BindingRecord>,
    consumers: HashMap<String, Vec<ConsumerRecord>>,
    channels: BTreeMap<u64, ChannelRecord>,
    next_channel_id: u64,
    operations: Vec<Operation>,
    failing_opens: u32,
    publish_failures: HashMap<String, String>,
    blocked_listeners: Vec<UnboundedSender<bool>>,
    closed: bool,
}

impl BrokerState {
    fn open_channel(&mut self, id: u64) -> Result<&mut ChannelRecord> {
        match self.channels.get_mut(&id) {
            Some(record) if record.open => Ok(record),
            _ => Err(RabbitMQError::ChannelError(format!("channel {} is closed", id))),
        }
    }

    fn routes(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }
        let kind = self.exchanges.get(exchange).ok_or_else(|| {
            RabbitMQError::ChannelError(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;
        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind {
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                _ => binding.routing_key == routing_key,
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, queue: &str, stored: StoredMessage) {
        if let Some(consumers) = self.consumers.get_mut(queue) {
            consumers.retain(|c| !c.tx.is_closed());
            if !consumers.is_empty() {
                // Round-robin: serve the head consumer, then move it to the back.
                let consumer = consumers.remove(0);
                let delivery = match self.channels.get_mut(&consumer.channel) {
                    Some(record) => {
                        record.next_delivery_tag += 1;
                        let tag = record.next_delivery_tag;
                        if !consumer.auto_ack {
                            record.unacked.insert(tag, (queue.to_string(), stored.clone()));
                        }
                        Some(to_inbound(tag, &stored, None))
                    }
                    None => None,
                };
                if let Some(delivery) = delivery {
                    let _ = consumer.tx.send(Ok(delivery));
                    self.consumers
                        .entry(queue.to_string())
                        .or_default()
                        .push(consumer);
                    return;
                }
            }
        }
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_back(stored);
    }

    fn close_channel(&mut self, id: u64, reason: &str) {
        let Some(record) = self.channels.get_mut(&id) else { return };
        if !record.open {
            return;
        }
        record.open = false;
        let unacked = std::mem::take(&mut record.unacked);
        for tx in record.close_listeners.drain(..) {
            let _ = tx.send(reason.to_string());
        }
        record.return_listeners.clear();
        record.confirm_listeners.clear();
        record.flow_listeners.clear();

        for consumers in self.consumers.values_mut() {
            consumers.retain(|c| c.channel != id);
        }
        // Unsettled deliveries go back to the head of their queue.
        for (_, (queue, mut stored)) in unacked.into_iter().rev() {
            stored.redelivered = true;
            self.queues.entry(queue).or_default().push_front(stored);
        }
    }
}

fn to_inbound(delivery_tag: u64, stored: &StoredMessage, message_count: Option<u32>) -> InboundMessage {
    InboundMessage {
        delivery_tag,
        exchange: stored.exchange.clone(),
        routing_key: stored.routing_key.clone(),
        redelivered: stored.redelivered,
        properties: stored.message.properties.clone(),
        payload: stored.message.payload.clone(),
        message_count,
    }
}

fn kind_name(kind: &ExchangeKind) -> &str {
    match kind {
        ExchangeKind::Custom(name) => name,
        ExchangeKind::Direct => "direct",
        ExchangeKind::Fanout => "fanout",
        ExchangeKind::Headers => "headers",
        ExchangeKind::Topic => "topic",
    }
}

/// AMQP topic matching: `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Shared handle to an in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    reconnect_interval: Duration,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Puts a message straight into `queue`, declaring it if needed.
    pub fn enqueue(&self, queue: &str, message: Publishing) {
        let stored = StoredMessage {
            exchange: String::new(),
            routing_key: queue.to_string(),
            redelivered: false,
            message,
        };
        self.lock().enqueue(queue, stored);
    }

    /// Closes every open channel, as a dropped connection would.
    pub fn drop_channels(&self, reason: &str) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id, reason);
        }
    }

    /// Makes the next `count` channel opens fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.lock().failing_opens = count;
    }

    /// Publishes with this routing key fail with `reason` until cleared.
    pub fn fail_publish(&self, routing_key: &str, reason: &str) {
        self.lock()
            .publish_failures
            .insert(routing_key.to_string(), reason.to_string());
    }

    pub fn clear_publish_failures(&self) {
        self.lock().publish_failures.clear();
    }

    /// Sends `channel.flow` to every open channel; `true` asks publishers to pause.
    pub fn set_flow(&self, paused: bool) {
        let mut state = self.lock();
        for record in state.channels.values_mut().filter(|r| r.open) {
            record.flow_listeners.retain(|tx| tx.send(paused).is_ok());
        }
    }

    /// Sends `connection.blocked` (`true`) or `connection.unblocked` (`false`).
    pub fn set_blocked(&self, blocked: bool) {
        self.lock()
            .blocked_listeners
            .retain(|tx| tx.send(blocked).is_ok());
    }

    /// Closes the broker for good: open channels close and no new ones open.
    pub fn shutdown(&self) {
        self.lock().closed = true;
        self.drop_channels("connection closed");
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    /// Ids of ready messages in `queue`, head first.
    pub fn ready_message_ids(&self, queue: &str) -> Vec<Option<String>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| {
                q.iter()
                    .map(|m| m.message.message_id().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(VecDeque::len)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// Ids of delivered but unsettled messages across open channels.
    pub fn unacked_message_ids(&self) -> Vec<Option<String>> {
        self.lock()
            .channels
            .values()
            .filter(|r| r.open)
            .flat_map(|r| r.unacked.values())
            .map(|(_, m)| m.message.message_id().map(str::to_string))
            .collect()
    }

    /// Number of channels ever opened; also the id of the most recent one.
    pub fn channels_opened(&self) -> u64 {
        self.lock().next_channel_id
    }

    pub fn open_channel_count(&self) -> usize {
        self.lock().channels.values().filter(|r| r.open).count()
    }
}

#[async_trait]
impl ConnectionManager for MemoryBroker {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel> {
        let mut state = self.lock();
        if state.closed {
            return Err(RabbitMQError::ConnectionError("connection closed".to_string()));
        }
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(RabbitMQError::ConnectionError("connection refused".to_string()));
        }
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        state.channels.insert(
            id,
            ChannelRecord {
                open: true,
                ..ChannelRecord::default()
            },
        );
        debug!(channel = id, "Memory broker opened channel");
        Ok(MemoryChannel {
            id,
            broker: self.clone(),
        })
    }

    fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    fn notify_blocked(&self, tx: UnboundedSender<bool>) {
        self.lock().blocked_listeners.push(tx);
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

/// Channel on a [`MemoryBroker`].
pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
}

impl MemoryChannel {
    pub fn channel_id(&self) -> u64 {
        self.id
    }

    /// Closes only this channel, as a channel-level exception would.
    pub fn close(&self, reason: &str) {
        self.broker.lock().close_channel(self.id, reason);
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.close("channel dropped");
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> String {
        self.id.to_string()
    }

    async fn basic_qos(&self, prefetch_count: u16, _prefetch_size: u32, global: bool) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        state.operations.push(Operation::Qos {
            channel: self.id,
            prefetch_count,
            global,
        });
        Ok(())
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        _args: FieldTable,
    ) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        state.operations.push(Operation::ExchangeDeclare {
            channel: self.id,
            name: name.to_string(),
            passive: options.passive,
        });
        match state.exchanges.get(name) {
            Some(existing) if !options.passive && kind_name(existing) != kind_name(&kind) => {
                Err(RabbitMQError::ChannelError(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                    name
                )))
            }
            Some(_) => Ok(()),
            None if options.passive => Err(RabbitMQError::ChannelError(format!(
                "NOT_FOUND - no exchange '{}'",
                name
            ))),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        _args: FieldTable,
    ) -> Result<QueueInfo> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };
        state.operations.push(Operation::QueueDeclare {
            channel: self.id,
            name: name.clone(),
            passive: options.passive,
        });
        if options.passive && !state.queues.contains_key(&name) {
            return Err(RabbitMQError::ChannelError(format!(
                "NOT_FOUND - no queue '{}'",
                name
            )));
        }
        let message_count = state.queues.entry(name.clone()).or_default().len() as u32;
        let consumer_count = state.consumers.get(&name).map_or(0, Vec::len) as u32;
        Ok(QueueInfo {
            name,
            message_count,
            consumer_count,
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        _options: QueueBindOptions,
        _args: FieldTable,
    ) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        state.operations.push(Operation::QueueBind {
            channel: self.id,
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            exchange: exchange.to_string(),
        });
        if exchange.is_empty() {
            return Err(RabbitMQError::ChannelError(
                "ACCESS_REFUSED - operation not permitted on the default exchange".to_string(),
            ));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(RabbitMQError::ChannelError(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(RabbitMQError::ChannelError(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        }
        let exists = state.bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        });
        if !exists {
            state.bindings.push(BindingRecord {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
                exchange: exchange.to_string(),
            });
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        message: Publishing,
    ) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        let failure = state.publish_failures.get(routing_key).cloned();
        let routes = match failure {
            Some(reason) => Err(RabbitMQError::ChannelError(reason)),
            None => state.routes(exchange, routing_key),
        };
        state.operations.push(Operation::Publish {
            channel: self.id,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory: options.mandatory,
            immediate: options.immediate,
            delivery_mode: *message.properties.delivery_mode(),
            accepted: routes.is_ok(),
        });
        let routes = routes?;

        let stored = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
            message,
        };
        if routes.is_empty() && options.mandatory {
            let returned = Return {
                reply_code: NO_ROUTE,
                reply_text: "NO_ROUTE".to_string(),
                exchange: stored.exchange.clone(),
                routing_key: stored.routing_key.clone(),
                message: stored.message.clone(),
            };
            let record = state.open_channel(self.id)?;
            record
                .return_listeners
                .retain(|tx| tx.send(returned.clone()).is_ok());
        }
        for queue in routes {
            state.enqueue(&queue, stored.clone());
        }

        let record = state.open_channel(self.id)?;
        if record.confirm_mode {
            record.next_publish_tag += 1;
            let confirmation = Confirmation {
                delivery_tag: record.next_publish_tag,
                ack: true,
            };
            record
                .confirm_listeners
                .retain(|tx| tx.send(confirmation).is_ok());
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        _args: FieldTable,
    ) -> Result<DeliveryStream> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(RabbitMQError::ChannelError(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        }
        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4())
        } else {
            consumer_tag.to_string()
        };
        state.operations.push(Operation::Consume {
            channel: self.id,
            queue: queue.to_string(),
            consumer_tag: tag,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        state
            .consumers
            .entry(queue.to_string())
            .or_default()
            .push(ConsumerRecord {
                channel: self.id,
                auto_ack: options.no_ack,
                tx,
            });
        let ready: Vec<StoredMessage> = state
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default();
        for stored in ready {
            state.enqueue(queue, stored);
        }

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn basic_get(&self, queue: &str, options: BasicGetOptions) -> Result<Option<InboundMessage>> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        let Some(ready) = state.queues.get_mut(queue) else {
            return Err(RabbitMQError::ChannelError(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        };
        let Some(stored) = ready.pop_front() else {
            state.operations.push(Operation::Get {
                channel: self.id,
                queue: queue.to_string(),
                message_id: None,
            });
            return Ok(None);
        };
        let remaining = ready.len() as u32;
        state.operations.push(Operation::Get {
            channel: self.id,
            queue: queue.to_string(),
            message_id: stored.message.message_id().map(str::to_string),
        });

        let record = state.open_channel(self.id)?;
        record.next_delivery_tag += 1;
        let tag = record.next_delivery_tag;
        let inbound = to_inbound(tag, &stored, Some(remaining));
        if !options.no_ack {
            record.unacked.insert(tag, (queue.to_string(), stored));
        }
        Ok(Some(inbound))
    }

    async fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<()> {
        let mut state = self.broker.lock();
        let record = state.open_channel(self.id)?;
        let settled = settle(record, delivery_tag, options.multiple)?;
        for (tag, _) in settled {
            state.operations.push(Operation::Ack {
                channel: self.id,
                delivery_tag: tag,
            });
        }
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, options: BasicNackOptions) -> Result<()> {
        let mut state = self.broker.lock();
        let record = state.open_channel(self.id)?;
        let settled = settle(record, delivery_tag, options.multiple)?;
        for (tag, (queue, mut stored)) in settled.into_iter().rev() {
            state.operations.push(Operation::Nack {
                channel: self.id,
                delivery_tag: tag,
                requeue: options.requeue,
                message_id: stored.message.message_id().map(str::to_string),
            });
            if options.requeue {
                stored.redelivered = true;
                state.queues.entry(queue).or_default().push_front(stored);
            }
        }
        Ok(())
    }

    async fn queue_purge(&self, queue: &str, _options: QueuePurgeOptions) -> Result<u32> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        let Some(ready) = state.queues.get_mut(queue) else {
            return Err(RabbitMQError::ChannelError(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        };
        let count = ready.len() as u32;
        ready.clear();
        state.operations.push(Operation::Purge {
            channel: self.id,
            queue: queue.to_string(),
            count,
        });
        Ok(count)
    }

    async fn confirm_select(&self, _options: ConfirmSelectOptions) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?.confirm_mode = true;
        state
            .operations
            .push(Operation::ConfirmSelect { channel: self.id });
        Ok(())
    }

    fn notify_return(&self, tx: UnboundedSender<Return>) {
        if let Ok(record) = self.broker.lock().open_channel(self.id) {
            record.return_listeners.push(tx);
        }
    }

    fn notify_publish(&self, tx: UnboundedSender<Confirmation>) {
        if let Ok(record) = self.broker.lock().open_channel(self.id) {
            record.confirm_listeners.push(tx);
        }
    }

    fn notify_flow(&self, tx: UnboundedSender<bool>) {
        if let Ok(record) = self.broker.lock().open_channel(self.id) {
            record.flow_listeners.push(tx);
        }
    }

    fn notify_close(&self, tx: UnboundedSender<String>) {
        match self.broker.lock().open_channel(self.id) {
            Ok(record) => record.close_listeners.push(tx),
            Err(_) => {
                let _ = tx.send(format!("channel {} is closed", self.id));
            }
        }
    }
}

/// Removes `delivery_tag` (and, with `multiple`, every earlier tag) from the
/// channel's unacked set.
fn settle(
    record: &mut ChannelRecord,
    delivery_tag: u64,
    multiple: bool,
) -> Result<Vec<(u64, (String, StoredMessage))>> {
    if multiple {
        // Everything up to and including the tag; the top tag takes all.
        let rest = match delivery_tag.checked_add(1) {
            Some(next) => record.unacked.split_off(&next),
            None => BTreeMap::new(),
        };
        let settled = std::mem::replace(&mut record.unacked, rest);
        return Ok(settled.into_iter().collect());
    }
    record
        .unacked
        .remove(&delivery_tag)
        .map(|entry| vec![(delivery_tag, entry)])
        .ok_or_else(|| {
            RabbitMQError::ChannelError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))
        })
}
