// src/rabbitmq/channel.rs
// The narrow operation set the channel manager needs from a broker channel

use async_trait::async_trait;
use futures::stream::BoxStream;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueuePurgeOptions,
    },
    types::FieldTable,
    ExchangeKind,
};
use tokio::sync::mpsc::UnboundedSender;

use super::errors::Result;
use crate::message::{Confirmation, InboundMessage, Publishing, Return};

/// Stream of deliveries produced by `basic.consume`.
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage>>;

/// Result of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// One open AMQP channel.
///
/// Implementations forward every call to the broker and report broker
/// failures unchanged. Notification registrations attach to this channel only;
/// once it closes, registered senders stop receiving.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Identifier used in log fields.
    fn id(&self) -> String;

    async fn basic_qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()>;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<()>;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<QueueInfo>;

    async fn queue_bind(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        options: QueueBindOptions,
        args: FieldTable,
    ) -> Result<()>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        message: Publishing,
    ) -> Result<()>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<DeliveryStream>;

    /// Pulls one message; `Ok(None)` when the queue is empty.
    async fn basic_get(&self, queue: &str, options: BasicGetOptions) -> Result<Option<InboundMessage>>;

    async fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<()>;

    async fn basic_nack(&self, delivery_tag: u64, options: BasicNackOptions) -> Result<()>;

    /// Returns the number of messages removed.
    async fn queue_purge(&self, queue: &str, options: QueuePurgeOptions) -> Result<u32>;

    async fn confirm_select(&self, options: ConfirmSelectOptions) -> Result<()>;

    fn notify_return(&self, tx: UnboundedSender<Return>);

    fn notify_publish(&self, tx: UnboundedSender<Confirmation>);

    /// `true` is sent when the broker asks the client to pause publishing,
    /// `false` when it may resume.
    fn notify_flow(&self, tx: UnboundedSender<bool>);

    /// Receives one reason string when the channel closes or errors.
    fn notify_close(&self, tx: UnboundedSender<String>);
}
