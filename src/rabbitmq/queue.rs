// src/rabbitmq/queue.rs
// Queue/exchange/binding declaration on top of a channel manager

use async_trait::async_trait;
use lapin::{
    options::{
        BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    ExchangeKind,
};
use std::sync::Arc;
use tracing::{debug, info};

use super::channel::{BrokerChannel, DeliveryStream};
use super::channel_manager::{ChannelConfig, ChannelManager, ReconnectHook};
use super::connection::ConnectionManager;
use super::errors::{DeclareStage, RabbitMQError, Result};

/// Handle to a shared connection manager. Empty once closed.
pub struct Conn<M: ConnectionManager> {
    connection_manager: Option<Arc<M>>,
}

impl<M: ConnectionManager> Conn<M> {
    pub fn new(connection_manager: Arc<M>) -> Self {
        Self {
            connection_manager: Some(connection_manager),
        }
    }

    pub fn connection_manager(&self) -> Result<Arc<M>> {
        self.connection_manager
            .clone()
            .ok_or(RabbitMQError::MissingConnectionManager)
    }

    pub fn is_closed(&self) -> bool {
        self.connection_manager.is_none()
    }

    /// Takes the connection manager out and closes it. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        match self.connection_manager.take() {
            Some(manager) => manager.close().await,
            None => Ok(()),
        }
    }
}

impl<M: ConnectionManager> Default for Conn<M> {
    fn default() -> Self {
        Self {
            connection_manager: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub passive: bool,
    pub args: FieldTable,
    /// Skip the declaration entirely when false.
    pub declare: bool,
}

#[derive(Debug, Clone)]
pub struct ExchangeOptions {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub passive: bool,
    pub args: FieldTable,
    pub declare: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: false,
            internal: false,
            no_wait: false,
            passive: false,
            args: FieldTable::default(),
            declare: false,
        }
    }
}

/// Binds the consumer queue to the configured exchange.
#[derive(Debug, Clone)]
pub struct Binding {
    pub routing_key: String,
    pub no_wait: bool,
    pub args: FieldTable,
    pub declare: bool,
}

impl Binding {
    pub fn new(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            no_wait: false,
            args: FieldTable::default(),
            declare: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsumerSettings {
    pub name: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub no_local: bool,
    pub args: FieldTable,
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub queue: QueueOptions,
    pub exchange: ExchangeOptions,
    pub bindings: Vec<Binding>,
    pub qos_prefetch: u16,
    pub qos_global: bool,
    pub consumer: ConsumerSettings,
    pub channel: ChannelConfig,
}

/// Queue declared, exchange not, prefetch 10.
pub fn default_consumer_options(queue: &str) -> ConsumerOptions {
    ConsumerOptions {
        queue: QueueOptions {
            name: queue.to_string(),
            durable: false,
            auto_delete: false,
            exclusive: false,
            no_wait: false,
            passive: false,
            args: FieldTable::default(),
            declare: true,
        },
        exchange: ExchangeOptions::default(),
        bindings: Vec::new(),
        qos_prefetch: 10,
        qos_global: false,
        consumer: ConsumerSettings::default(),
        channel: ChannelConfig::default(),
    }
}

pub type ConsumerOption = Box<dyn FnOnce(&mut ConsumerOptions) + Send>;

pub fn resolve_consumer_options(
    queue: &str,
    option_funcs: impl IntoIterator<Item = ConsumerOption>,
) -> ConsumerOptions {
    let mut options = default_consumer_options(queue);
    for option_func in option_funcs {
        option_func(&mut options);
    }
    options
}

pub fn with_queue_durable() -> ConsumerOption {
    Box::new(|options| options.queue.durable = true)
}

pub fn with_queue_auto_delete() -> ConsumerOption {
    Box::new(|options| options.queue.auto_delete = true)
}

pub fn with_queue_exclusive() -> ConsumerOption {
    Box::new(|options| options.queue.exclusive = true)
}

/// Only check that the queue exists.
pub fn with_queue_passive() -> ConsumerOption {
    Box::new(|options| options.queue.passive = true)
}

pub fn with_queue_no_declare() -> ConsumerOption {
    Box::new(|options| options.queue.declare = false)
}

pub fn with_queue_args(args: FieldTable) -> ConsumerOption {
    Box::new(move |options| options.queue.args = args)
}

/// Also turns exchange declaration on.
pub fn with_exchange_name(name: impl Into<String>) -> ConsumerOption {
    let name = name.into();
    Box::new(move |options| {
        options.exchange.name = name;
        options.exchange.declare = true;
    })
}

pub fn with_exchange_kind(kind: ExchangeKind) -> ConsumerOption {
    Box::new(move |options| options.exchange.kind = kind)
}

pub fn with_exchange_durable() -> ConsumerOption {
    Box::new(|options| options.exchange.durable = true)
}

pub fn with_exchange_auto_delete() -> ConsumerOption {
    Box::new(|options| options.exchange.auto_delete = true)
}

pub fn with_exchange_internal() -> ConsumerOption {
    Box::new(|options| options.exchange.internal = true)
}

pub fn with_exchange_passive() -> ConsumerOption {
    Box::new(|options| options.exchange.passive = true)
}

pub fn with_exchange_declare(declare: bool) -> ConsumerOption {
    Box::new(move |options| options.exchange.declare = declare)
}

pub fn with_exchange_args(args: FieldTable) -> ConsumerOption {
    Box::new(move |options| options.exchange.args = args)
}

/// Adds a declared binding from the queue to the exchange.
pub fn with_routing_key(routing_key: impl Into<String>) -> ConsumerOption {
    let binding = Binding::new(routing_key);
    Box::new(move |options| options.bindings.push(binding))
}

pub fn with_qos_prefetch(prefetch: u16) -> ConsumerOption {
    Box::new(move |options| options.qos_prefetch = prefetch)
}

pub fn with_qos_global() -> ConsumerOption {
    Box::new(|options| options.qos_global = true)
}

pub fn with_consumer_name(name: impl Into<String>) -> ConsumerOption {
    let name = name.into();
    Box::new(move |options| options.consumer.name = name)
}

pub fn with_consumer_auto_ack(auto_ack: bool) -> ConsumerOption {
    Box::new(move |options| options.consumer.auto_ack = auto_ack)
}

pub fn with_consumer_exclusive() -> ConsumerOption {
    Box::new(|options| options.consumer.exclusive = true)
}

pub fn with_channel_config(config: ChannelConfig) -> ConsumerOption {
    Box::new(move |options| options.channel = config)
}

/// Where topology is declared: through a manager's safe calls on first
/// declaration, straight on the fresh channel when replaying.
#[async_trait]
trait TopologyTarget: Sync {
    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<()>;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<()>;

    async fn queue_declare(&self, name: &str, options: QueueDeclareOptions, args: FieldTable) -> Result<()>;

    async fn queue_bind(&self, queue: &str, key: &str, exchange: &str, no_wait: bool, args: FieldTable) -> Result<()>;
}

#[async_trait]
impl<M: ConnectionManager> TopologyTarget for ChannelManager<M> {
    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<()> {
        self.qos_safe(prefetch_count, 0, global).await
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<()> {
        if options.passive {
            self.exchange_declare_passive_safe(name, kind, options, args).await
        } else {
            self.exchange_declare_safe(name, kind, options, args).await
        }
    }

    async fn queue_declare(&self, name: &str, options: QueueDeclareOptions, args: FieldTable) -> Result<()> {
        if options.passive {
            self.queue_declare_passive_safe(name, options, args).await?;
        } else {
            self.queue_declare_safe(name, options, args).await?;
        }
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, key: &str, exchange: &str, no_wait: bool, args: FieldTable) -> Result<()> {
        self.queue_bind_safe(queue, key, exchange, no_wait, args).await
    }
}

struct FreshChannel<'a, C>(&'a C);

#[async_trait]
impl<'a, C: BrokerChannel> TopologyTarget for FreshChannel<'a, C> {
    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<()> {
        self.0.basic_qos(prefetch_count, 0, global).await
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<()> {
        self.0.exchange_declare(name, kind, options, args).await
    }

    async fn queue_declare(&self, name: &str, options: QueueDeclareOptions, args: FieldTable) -> Result<()> {
        self.0.queue_declare(name, options, args).await?;
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, key: &str, exchange: &str, no_wait: bool, args: FieldTable) -> Result<()> {
        self.0
            .queue_bind(queue, key, exchange, QueueBindOptions { nowait: no_wait }, args)
            .await
    }
}

async fn declare_exchange<T: TopologyTarget + ?Sized>(target: &T, options: &ExchangeOptions) -> Result<()> {
    if !options.declare {
        return Ok(());
    }
    let declare_options = ExchangeDeclareOptions {
        passive: options.passive,
        durable: options.durable,
        auto_delete: options.auto_delete,
        internal: options.internal,
        nowait: options.no_wait,
    };
    target
        .exchange_declare(&options.name, options.kind.clone(), declare_options, options.args.clone())
        .await
}

async fn declare_queue<T: TopologyTarget + ?Sized>(target: &T, options: &QueueOptions) -> Result<()> {
    if !options.declare {
        return Ok(());
    }
    let declare_options = QueueDeclareOptions {
        passive: options.passive,
        durable: options.durable,
        exclusive: options.exclusive,
        auto_delete: options.auto_delete,
        nowait: options.no_wait,
    };
    target
        .queue_declare(&options.name, declare_options, options.args.clone())
        .await
}

async fn declare_bindings<T: TopologyTarget + ?Sized>(target: &T, options: &ConsumerOptions) -> Result<()> {
    for binding in options.bindings.iter().filter(|b| b.declare) {
        target
            .queue_bind(
                &options.queue.name,
                &binding.routing_key,
                &options.exchange.name,
                binding.no_wait,
                binding.args.clone(),
            )
            .await?;
    }
    Ok(())
}

/// QoS, exchange, queue, then bindings. Stops at the first failure; nothing
/// already declared is rolled back.
async fn declare_topology<T: TopologyTarget + ?Sized>(target: &T, options: &ConsumerOptions) -> Result<()> {
    target
        .qos(options.qos_prefetch, options.qos_global)
        .await
        .map_err(|e| RabbitMQError::stage(DeclareStage::Qos, e))?;
    declare_exchange(target, &options.exchange)
        .await
        .map_err(|e| RabbitMQError::stage(DeclareStage::Exchange, e))?;
    declare_queue(target, &options.queue)
        .await
        .map_err(|e| RabbitMQError::stage(DeclareStage::Queue, e))?;
    declare_bindings(target, options)
        .await
        .map_err(|e| RabbitMQError::stage(DeclareStage::Bindings, e))?;
    Ok(())
}

/// Redeclares a queue's topology on every recovered channel.
pub struct TopologyReplay {
    options: ConsumerOptions,
}

impl TopologyReplay {
    pub fn new(options: ConsumerOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl<C: BrokerChannel> ReconnectHook<C> for TopologyReplay {
    async fn on_reconnect(&self, channel: &C) -> Result<()> {
        declare_topology(&FreshChannel(channel), &self.options).await?;
        debug!(queue = %self.options.queue.name, broker_channel = %channel.id(), "Topology replayed");
        Ok(())
    }
}

/// A declared queue with its own channel manager.
pub struct Queue<M: ConnectionManager> {
    chan_manager: Arc<ChannelManager<M>>,
    options: ConsumerOptions,
}

impl<M: ConnectionManager> Queue<M> {
    pub fn name(&self) -> &str {
        &self.options.queue.name
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Shared with a `Publisher` to publish on the same channel.
    pub fn channel_manager(&self) -> Arc<ChannelManager<M>> {
        Arc::clone(&self.chan_manager)
    }

    /// Starts a consumer with the configured consumer settings.
    ///
    /// The stream belongs to the current channel and ends when that channel
    /// is lost; consume again once the manager is back to `Active`.
    pub async fn consume(&self) -> Result<DeliveryStream> {
        let consumer = &self.options.consumer;
        let options = BasicConsumeOptions {
            no_local: consumer.no_local,
            no_ack: consumer.auto_ack,
            exclusive: consumer.exclusive,
            nowait: consumer.no_wait,
        };
        self.chan_manager
            .consume_safe(self.name(), &consumer.name, options, consumer.args.clone())
            .await
    }

    pub async fn clear(&self) -> Result<u32> {
        self.chan_manager.queue_purge_safe(self.name(), false).await
    }

    pub async fn delete_msg(&self, msg_id: &str) -> Result<()> {
        self.chan_manager.ack_message_safe(self.name(), msg_id).await
    }

    pub async fn delete_msgs<S: AsRef<str> + Sync>(&self, msg_ids: &[S]) -> Result<()> {
        self.chan_manager.ack_messages_safe(self.name(), msg_ids).await
    }

    pub async fn close(&self) {
        self.chan_manager.close().await;
    }
}

/// Declares `queue` (and, per options, its exchange and bindings) on a new
/// channel manager. The topology is redeclared after every channel recovery.
pub async fn new_queue<M: ConnectionManager>(
    conn: &Conn<M>,
    queue: &str,
    option_funcs: impl IntoIterator<Item = ConsumerOption>,
) -> Result<Queue<M>> {
    let options = resolve_consumer_options(queue, option_funcs);
    let connection_manager = conn.connection_manager()?;

    let chan_manager = ChannelManager::new(connection_manager, options.channel.clone()).await?;
    chan_manager.add_reconnect_hook(Arc::new(TopologyReplay::new(options.clone())));
    declare_topology(&chan_manager, &options).await?;

    info!(
        channel_id = %chan_manager.id(),
        queue,
        exchange = %options.exchange.name,
        bindings = options.bindings.len(),
        "Queue declared"
    );
    Ok(Queue {
        chan_manager: Arc::new(chan_manager),
        options,
    })
}

/// Purges `queue` on a short-lived channel and returns the number of messages removed.
pub async fn clear_queue<M: ConnectionManager>(
    conn: &Conn<M>,
    queue: &str,
    option_funcs: impl IntoIterator<Item = ConsumerOption>,
) -> Result<u32> {
    let options = resolve_consumer_options(queue, option_funcs);
    let chan_manager = ChannelManager::new(conn.connection_manager()?, options.channel).await?;
    let result = chan_manager.queue_purge_safe(queue, false).await;
    chan_manager.close().await;

    let count = result?;
    info!(queue, count, "Queue cleared");
    Ok(count)
}

/// Rejects the first message in `queue` whose id is in `msg_ids`, on a
/// short-lived channel. Messages scanned past are released when that channel
/// closes.
pub async fn delete_queue_msg<M: ConnectionManager, S: AsRef<str> + Sync>(
    conn: &Conn<M>,
    queue: &str,
    msg_ids: &[S],
    option_funcs: impl IntoIterator<Item = ConsumerOption>,
) -> Result<()> {
    let options = resolve_consumer_options(queue, option_funcs);
    let chan_manager = ChannelManager::new(conn.connection_manager()?, options.channel).await?;
    let result = chan_manager.ack_messages_safe(queue, msg_ids).await;
    chan_manager.close().await;
    result
}
