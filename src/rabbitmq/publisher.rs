use async_trait::async_trait;
use lapin::{options::ConfirmSelectOptions, types::FieldTable, BasicProperties};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::BrokerChannel;
use super::channel_manager::{ChannelManager, HookId, ReconnectHook};
use super::connection::ConnectionManager;
use super::errors::{BlockReason, RabbitMQError, Result};
use crate::message::{Confirmation, DeliveryMode, Publishing, Return};

/// Per-call publish settings, rebuilt from option functions on every publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub exchange: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub delivery_mode: Option<DeliveryMode>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub expiration: Option<String>,
    pub priority: Option<u8>,
    pub app_id: Option<String>,
    pub headers: Option<FieldTable>,
}

impl PublishOptions {
    /// Fills in the properties `properties` leaves unset.
    fn apply_to(&self, mut properties: BasicProperties) -> BasicProperties {
        if properties.delivery_mode().is_none() {
            if let Some(mode) = self.delivery_mode {
                properties = properties.with_delivery_mode(mode.as_u8());
            }
        }
        if properties.content_type().is_none() {
            if let Some(content_type) = &self.content_type {
                properties = properties.with_content_type(content_type.clone().into());
            }
        }
        if properties.message_id().is_none() {
            if let Some(id) = &self.message_id {
                properties = properties.with_message_id(id.clone().into());
            }
        }
        if properties.correlation_id().is_none() {
            if let Some(id) = &self.correlation_id {
                properties = properties.with_correlation_id(id.clone().into());
            }
        }
        if properties.expiration().is_none() {
            if let Some(expiration) = &self.expiration {
                properties = properties.with_expiration(expiration.clone().into());
            }
        }
        if properties.priority().is_none() {
            if let Some(priority) = self.priority {
                properties = properties.with_priority(priority);
            }
        }
        if properties.app_id().is_none() {
            if let Some(app_id) = &self.app_id {
                properties = properties.with_app_id(app_id.clone().into());
            }
        }
        if properties.headers().is_none() {
            if let Some(headers) = &self.headers {
                properties = properties.with_headers(headers.clone());
            }
        }
        properties
    }
}

pub type PublishOption = Box<dyn FnOnce(&mut PublishOptions) + Send>;

pub fn with_exchange(name: impl Into<String>) -> PublishOption {
    let name = name.into();
    Box::new(move |options| options.exchange = name)
}

/// Ask the broker to return the message when no queue is bound to it.
pub fn with_mandatory() -> PublishOption {
    Box::new(|options| options.mandatory = true)
}

pub fn with_immediate() -> PublishOption {
    Box::new(|options| options.immediate = true)
}

pub fn with_delivery_mode(mode: DeliveryMode) -> PublishOption {
    Box::new(move |options| options.delivery_mode = Some(mode))
}

pub fn with_persistent_delivery() -> PublishOption {
    with_delivery_mode(DeliveryMode::Persistent)
}

pub fn with_content_type(content_type: impl Into<String>) -> PublishOption {
    let content_type = content_type.into();
    Box::new(move |options| options.content_type = Some(content_type))
}

pub fn with_message_id(id: impl Into<String>) -> PublishOption {
    let id = id.into();
    Box::new(move |options| options.message_id = Some(id))
}

pub fn with_correlation_id(id: impl Into<String>) -> PublishOption {
    let id = id.into();
    Box::new(move |options| options.correlation_id = Some(id))
}

/// Per-message TTL in milliseconds, as the broker expects it.
pub fn with_expiration(ttl_ms: impl Into<String>) -> PublishOption {
    let ttl_ms = ttl_ms.into();
    Box::new(move |options| options.expiration = Some(ttl_ms))
}

pub fn with_priority(priority: u8) -> PublishOption {
    Box::new(move |options| options.priority = Some(priority))
}

pub fn with_app_id(app_id: impl Into<String>) -> PublishOption {
    let app_id = app_id.into();
    Box::new(move |options| options.app_id = Some(app_id))
}

pub fn with_headers(headers: FieldTable) -> PublishOption {
    Box::new(move |options| options.headers = Some(headers))
}

/// Applies `option_funcs` in order to default options. An unset delivery mode
/// resolves to [`DeliveryMode::Transient`].
pub fn resolve_publish_options(option_funcs: impl IntoIterator<Item = PublishOption>) -> PublishOptions {
    let mut options = PublishOptions::default();
    for option_func in option_funcs {
        option_func(&mut options);
    }
    if options.delivery_mode.is_none() {
        options.delivery_mode = Some(DeliveryMode::Transient);
    }
    options
}

/// Flow and blocked flags, each toggled independently by its own listener.
#[derive(Debug, Default)]
pub struct PublishGate {
    flow: AtomicBool,
    blocked: AtomicBool,
}

impl PublishGate {
    pub fn set_flow(&self, paused: bool) {
        self.flow.store(paused, Ordering::Release);
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Release);
    }

    pub fn is_flow_paused(&self) -> bool {
        self.flow.load(Ordering::Acquire)
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    /// Flow is checked before blocked.
    pub fn check(&self) -> Result<()> {
        if self.is_flow_paused() {
            return Err(RabbitMQError::PublishBlocked(BlockReason::HighFlow));
        }
        if self.is_blocked() {
            return Err(RabbitMQError::PublishBlocked(BlockReason::ConnectionBlocked));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublisherOptions {
    /// Put the channel in confirm mode, at start and after every recovery.
    pub confirm: bool,
}

/// Listener senders to re-attach whenever the channel is replaced.
struct PublisherListeners {
    confirm: bool,
    flow: UnboundedSender<bool>,
    returns: Mutex<Vec<UnboundedSender<Return>>>,
    confirms: Mutex<Vec<UnboundedSender<Confirmation>>>,
}

#[async_trait]
impl<C: BrokerChannel> ReconnectHook<C> for PublisherListeners {
    async fn on_reconnect(&self, channel: &C) -> Result<()> {
        if self.confirm {
            channel.confirm_select(ConfirmSelectOptions::default()).await?;
        }
        channel.notify_flow(self.flow.clone());
        for tx in self.returns.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            channel.notify_return(tx.clone());
        }
        for tx in self.confirms.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            channel.notify_publish(tx.clone());
        }
        debug!(broker_channel = %channel.id(), "Publisher listeners re-registered");
        Ok(())
    }
}

/// Flow-gated publisher on top of a [`ChannelManager`].
pub struct Publisher<M: ConnectionManager> {
    chan_manager: Arc<ChannelManager<M>>,
    gate: Arc<PublishGate>,
    listeners: Arc<PublisherListeners>,
    hook: HookId,
    tasks: Vec<JoinHandle<()>>,
}

impl<M: ConnectionManager> Publisher<M> {
    /// Registers flow and blocked listeners and, when asked, enables confirms.
    pub async fn new(chan_manager: Arc<ChannelManager<M>>, options: PublisherOptions) -> Result<Self> {
        if options.confirm {
            chan_manager.confirm_safe(false).await?;
        }

        let gate = Arc::new(PublishGate::default());
        let (flow_tx, flow_rx) = mpsc::unbounded_channel();
        chan_manager.notify_flow_safe(flow_tx.clone()).await?;
        let (blocked_tx, blocked_rx) = mpsc::unbounded_channel();
        chan_manager.connection_manager().notify_blocked(blocked_tx);

        let listeners = Arc::new(PublisherListeners {
            confirm: options.confirm,
            flow: flow_tx,
            returns: Mutex::new(Vec::new()),
            confirms: Mutex::new(Vec::new()),
        });
        let hook = chan_manager.add_reconnect_hook(listeners.clone());

        let tasks = vec![
            tokio::spawn(handle_flow(Arc::clone(&gate), flow_rx, chan_manager.id().to_string())),
            tokio::spawn(handle_blocked(Arc::clone(&gate), blocked_rx, chan_manager.id().to_string())),
        ];
        info!(channel_id = %chan_manager.id(), confirm = options.confirm, "Publisher ready");

        Ok(Self {
            chan_manager,
            gate,
            listeners,
            hook,
            tasks,
        })
    }

    pub fn channel_manager(&self) -> &Arc<ChannelManager<M>> {
        &self.chan_manager
    }

    pub fn gate(&self) -> &PublishGate {
        &self.gate
    }

    /// Publishes `msg` once per routing key, in order.
    ///
    /// Refused without touching the broker while flow control or a connection
    /// block is in effect. Stops at the first failing key and returns its error;
    /// keys before it have already been published.
    pub async fn publish_with_msg<S: AsRef<str> + Sync>(
        &self,
        msg: &Publishing,
        routing_keys: &[S],
        option_funcs: impl IntoIterator<Item = PublishOption>,
    ) -> Result<()> {
        self.gate.check()?;

        let options = resolve_publish_options(option_funcs);
        let properties = options.apply_to(msg.properties.clone());

        for routing_key in routing_keys {
            let routing_key: &str = routing_key.as_ref();
            let message = Publishing {
                payload: msg.payload.clone(),
                properties: properties.clone(),
            };

            self.chan_manager
                .publish_safe(
                    &options.exchange,
                    routing_key,
                    options.mandatory,
                    options.immediate,
                    message,
                )
                .await
                .inspect_err(|e| {
                    warn!(
                        channel_id = %self.chan_manager.id(),
                        exchange = %options.exchange,
                        routing_key,
                        "Publish failed: {}", e
                    )
                })?;
        }
        Ok(())
    }

    /// [`publish_with_msg`](Self::publish_with_msg) for a bare payload.
    pub async fn publish<S: AsRef<str> + Sync>(
        &self,
        data: impl Into<Vec<u8>>,
        routing_keys: &[S],
        option_funcs: impl IntoIterator<Item = PublishOption>,
    ) -> Result<()> {
        self.publish_with_msg(&Publishing::new(data), routing_keys, option_funcs)
            .await
    }

    /// Messages returned by the broker for mandatory/immediate publishes.
    pub async fn notify_return(&self) -> Result<UnboundedReceiver<Return>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.chan_manager.notify_return_safe(tx.clone()).await?;
        self.listeners
            .returns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Ok(rx)
    }

    /// Publisher confirms. Only produces values when built with `confirm: true`;
    /// delivery tags restart at 1 on every recovered channel.
    pub async fn notify_publish(&self) -> Result<UnboundedReceiver<Confirmation>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.chan_manager.notify_publish_safe(tx.clone()).await?;
        self.listeners
            .confirms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Ok(rx)
    }

    /// Stops the listeners and shuts the channel manager down.
    pub async fn close(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.chan_manager.remove_reconnect_hook(self.hook);
        self.chan_manager.close().await;
    }
}

impl<M: ConnectionManager> Drop for Publisher<M> {
    fn drop(&mut self) {
        // The manager may be shared and outlive this publisher.
        self.chan_manager.remove_reconnect_hook(self.hook);
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn handle_flow(gate: Arc<PublishGate>, mut rx: UnboundedReceiver<bool>, channel_id: String) {
    while let Some(paused) = rx.recv().await {
        if paused {
            warn!(%channel_id, "Pausing publishing due to flow request from server");
        } else {
            info!(%channel_id, "Resuming publishing due to flow request from server");
        }
        gate.set_flow(paused);
    }
}

async fn handle_blocked(gate: Arc<PublishGate>, mut rx: UnboundedReceiver<bool>, channel_id: String) {
    while let Some(blocked) = rx.recv().await {
        if blocked {
            warn!(%channel_id, "Pausing publishing due to TCP blocking from server");
        } else {
            info!(%channel_id, "Resuming publishing due to TCP unblocking from server");
        }
        gate.set_blocked(blocked);
    }
}
