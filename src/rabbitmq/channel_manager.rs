use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueuePurgeOptions,
    },
    types::FieldTable,
    ExchangeKind,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{watch, RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::{BrokerChannel, DeliveryStream, QueueInfo};
use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use crate::message::{Confirmation, InboundMessage, Publishing, Return};

/// Configuration options for a managed channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel identifier for logging (defaults to a UUID)
    pub id: String,

    /// Delay between recovery attempts; the connection manager's interval when unset
    pub reconnect_interval: Option<Duration>,

    /// Give up after this many failed recovery attempts (retry forever when unset)
    pub max_recovery_attempts: Option<u32>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id: format!("channel-{}", &Uuid::new_v4().to_string()[..8]),
            reconnect_interval: None,
            max_recovery_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// A live channel is installed.
    Active,
    /// The channel was lost and a replacement is being opened.
    Recovering,
    /// Terminal: no channel, every safe call fails with `ManagerClosed`.
    Failed,
}

/// Work to redo on every freshly opened channel before it replaces the lost one.
///
/// Hooks run in registration order. An error discards the new channel and
/// counts as a failed recovery attempt.
#[async_trait]
pub trait ReconnectHook<C: BrokerChannel>: Send + Sync {
    async fn on_reconnect(&self, channel: &C) -> Result<()>;
}

/// Handle returned by [`ChannelManager::add_reconnect_hook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

struct Shared<M: ConnectionManager> {
    id: String,
    connection_manager: Arc<M>,
    channel: RwLock<Option<M::Channel>>,
    state: watch::Sender<ChannelState>,
    hooks: Mutex<Vec<(HookId, Arc<dyn ReconnectHook<M::Channel>>)>>,
    next_hook_id: AtomicU64,
    reconnect_interval: Duration,
    max_recovery_attempts: Option<u32>,
}

/// Owns one logical channel and keeps it alive across connection loss.
///
/// Every `*_safe` call holds the read side of the channel lock for its whole
/// duration, so the recovery task (the only writer) can never swap the channel
/// out from under an in-flight call.
pub struct ChannelManager<M: ConnectionManager> {
    shared: Arc<Shared<M>>,
    shutdown: watch::Sender<bool>,
}

impl<M: ConnectionManager> ChannelManager<M> {
    /// Opens the initial channel and starts the recovery task.
    pub async fn new(connection_manager: Arc<M>, config: ChannelConfig) -> Result<Self> {
        let channel = connection_manager.open_channel().await?;
        let reconnect_interval = config
            .reconnect_interval
            .unwrap_or_else(|| connection_manager.reconnect_interval());
        info!(
            channel_id = %config.id,
            broker_channel = %channel.id(),
            reconnect_interval_ms = reconnect_interval.as_millis() as u64,
            "Channel manager started"
        );

        let (state, _) = watch::channel(ChannelState::Active);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            id: config.id,
            connection_manager,
            channel: RwLock::new(Some(channel)),
            state,
            hooks: Mutex::new(Vec::new()),
            next_hook_id: AtomicU64::new(0),
            reconnect_interval,
            max_recovery_attempts: config.max_recovery_attempts,
        });
        tokio::spawn(run_recovery(Arc::clone(&shared), shutdown_rx));

        Ok(Self { shared, shutdown })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn connection_manager(&self) -> &Arc<M> {
        &self.shared.connection_manager
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    pub fn add_reconnect_hook(&self, hook: Arc<dyn ReconnectHook<M::Channel>>) -> HookId {
        let id = HookId(self.shared.next_hook_id.fetch_add(1, Ordering::Relaxed));
        self.shared
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, hook));
        id
    }

    /// Unregisters a hook. Returns false if it was already removed.
    pub fn remove_reconnect_hook(&self, id: HookId) -> bool {
        let mut hooks = self.shared.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    pub fn reconnect_hook_count(&self) -> usize {
        self.shared
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops recovery and drops the channel. Waits until the manager is `Failed`.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == ChannelState::Failed).await;
    }

    async fn channel(&self) -> Result<RwLockReadGuard<'_, M::Channel>> {
        let guard = self.shared.channel.read().await;
        RwLockReadGuard::try_map(guard, Option::as_ref).map_err(|_| RabbitMQError::ManagerClosed)
    }

    pub async fn consume_safe(
        &self,
        queue: &str,
        consumer: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<DeliveryStream> {
        let channel = self.channel().await?;
        channel.basic_consume(queue, consumer, options, args).await
    }

    pub async fn queue_declare_passive_safe(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<QueueInfo> {
        let channel = self.channel().await?;
        let options = QueueDeclareOptions {
            passive: true,
            ..options
        };
        channel.queue_declare(name, options, args).await
    }

    pub async fn queue_declare_safe(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<QueueInfo> {
        let channel = self.channel().await?;
        channel.queue_declare(name, options, args).await
    }

    pub async fn exchange_declare_passive_safe(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<()> {
        let channel = self.channel().await?;
        let options = ExchangeDeclareOptions {
            passive: true,
            ..options
        };
        channel.exchange_declare(name, kind, options, args).await
    }

    pub async fn exchange_declare_safe(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<()> {
        let channel = self.channel().await?;
        channel.exchange_declare(name, kind, options, args).await
    }

    pub async fn queue_bind_safe(
        &self,
        name: &str,
        key: &str,
        exchange: &str,
        no_wait: bool,
        args: FieldTable,
    ) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_bind(name, key, exchange, QueueBindOptions { nowait: no_wait }, args)
            .await
    }

    pub async fn qos_safe(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()> {
        let channel = self.channel().await?;
        channel.basic_qos(prefetch_count, prefetch_size, global).await
    }

    pub async fn publish_safe(
        &self,
        exchange: &str,
        key: &str,
        mandatory: bool,
        immediate: bool,
        msg: Publishing,
    ) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .basic_publish(exchange, key, BasicPublishOptions { mandatory, immediate }, msg)
            .await
    }

    pub async fn notify_return_safe(&self, tx: UnboundedSender<Return>) -> Result<()> {
        self.channel().await?.notify_return(tx);
        Ok(())
    }

    pub async fn confirm_safe(&self, no_wait: bool) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions { nowait: no_wait })
            .await
    }

    pub async fn notify_publish_safe(&self, tx: UnboundedSender<Confirmation>) -> Result<()> {
        self.channel().await?.notify_publish(tx);
        Ok(())
    }

    pub async fn notify_flow_safe(&self, tx: UnboundedSender<bool>) -> Result<()> {
        self.channel().await?.notify_flow(tx);
        Ok(())
    }

    pub async fn get_safe(&self, queue: &str, auto_ack: bool) -> Result<Option<InboundMessage>> {
        let channel = self.channel().await?;
        channel
            .basic_get(queue, BasicGetOptions { no_ack: auto_ack })
            .await
    }

    pub async fn ack_safe(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
    }

    pub async fn nack_safe(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
    }

    /// Rejects the first message in `queue` whose message id equals `msg_id`.
    ///
    /// AMQP has no delete-by-id, so this pulls messages one at a time until it
    /// finds the match, rejects it without requeue and stops. Messages pulled
    /// before the match are left unacknowledged on this channel: they are out
    /// of the queue until settled or until the channel closes. A queue without
    /// a match is drained this way and the call still succeeds.
    pub async fn ack_message_safe(&self, queue: &str, msg_id: &str) -> Result<()> {
        self.reject_first_match(queue, |id| id == msg_id).await
    }

    /// Like [`ack_message_safe`](Self::ack_message_safe), stopping at the first
    /// message whose id is any of `msg_ids`. Empty ids never match.
    pub async fn ack_messages_safe<S: AsRef<str> + Sync>(&self, queue: &str, msg_ids: &[S]) -> Result<()> {
        self.reject_first_match(queue, |id| {
            !id.is_empty() && msg_ids.iter().any(|target| target.as_ref() == id)
        })
        .await
    }

    async fn reject_first_match<F>(&self, queue: &str, matches: F) -> Result<()>
    where
        F: Fn(&str) -> bool + Send + Sync,
    {
        let channel = self.channel().await?;
        let mut scanned = 0usize;
        while let Some(msg) = channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await?
        {
            scanned += 1;
            let id = msg.message_id().unwrap_or_default();
            if matches(id) {
                debug!(channel_id = %self.shared.id, queue, message_id = id, scanned, "Rejecting matched message");
                channel
                    .basic_nack(
                        msg.delivery_tag,
                        BasicNackOptions {
                            multiple: false,
                            requeue: false,
                        },
                    )
                    .await?;
                return Ok(());
            }
        }
        debug!(channel_id = %self.shared.id, queue, scanned, "No message matched");
        Ok(())
    }

    /// Removes every ready message from `queue`, returning how many there were.
    pub async fn queue_purge_safe(&self, queue: &str, no_wait: bool) -> Result<u32> {
        let channel = self.channel().await?;
        channel
            .queue_purge(queue, QueuePurgeOptions { nowait: no_wait })
            .await
    }
}

impl<M: ConnectionManager> Drop for ChannelManager<M> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl<M: ConnectionManager> Shared<M> {
    async fn reopen(&self) -> Result<()> {
        let channel = self.connection_manager.open_channel().await?;
        let hooks: Vec<Arc<dyn ReconnectHook<M::Channel>>> = self
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        for hook in hooks {
            hook.on_reconnect(&channel).await?;
        }

        let broker_channel = channel.id();
        *self.channel.write().await = Some(channel);
        info!(channel_id = %self.id, %broker_channel, "Channel recovered");
        Ok(())
    }

    async fn fail(&self, reason: &str) {
        self.channel.write().await.take();
        self.state.send_replace(ChannelState::Failed);
        error!(channel_id = %self.id, reason, "Channel manager closed");
    }
}

async fn run_recovery<M: ConnectionManager>(shared: Arc<Shared<M>>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();
        match shared.channel.read().await.as_ref() {
            Some(channel) => channel.notify_close(close_tx),
            None => return,
        }

        let reason = tokio::select! {
            reason = close_rx.recv() => reason.unwrap_or_else(|| "close notifier dropped".to_string()),
            _ = shutdown.changed() => {
                shared.fail("shutdown requested").await;
                return;
            }
        };
        warn!(channel_id = %shared.id, %reason, "Channel lost, starting recovery");
        shared.state.send_replace(ChannelState::Recovering);

        if !recover(&shared, &mut shutdown).await {
            return;
        }
    }
}

/// Retries at the reconnect interval until a channel is installed. Returns
/// false once the manager has moved to `Failed`.
async fn recover<M: ConnectionManager>(shared: &Shared<M>, shutdown: &mut watch::Receiver<bool>) -> bool {
    let mut attempt: u32 = 0;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(shared.reconnect_interval) => {}
            _ = shutdown.changed() => {
                shared.fail("shutdown requested").await;
                return false;
            }
        }

        if shared.connection_manager.is_closed() {
            shared.fail("connection closed").await;
            return false;
        }
        if shared.max_recovery_attempts.is_some_and(|max| attempt >= max) {
            shared.fail("recovery attempts exhausted").await;
            return false;
        }
        attempt += 1;

        tokio::select! {
            result = shared.reopen() => match result {
                Ok(()) => {
                    shared.state.send_replace(ChannelState::Active);
                    return true;
                }
                Err(e) => warn!(channel_id = %shared.id, attempt, "Channel recovery failed: {}", e),
            },
            _ = shutdown.changed() => {
                shared.fail("shutdown requested").await;
                return false;
            }
        }
    }
}
