use async_trait::async_trait;
use lapin::{Connection, ConnectionProperties};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::amqp_client::LapinChannel;
use super::channel::BrokerChannel;
use super::errors::{RabbitMQError, Result};

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Owner of the physical broker connection.
///
/// Channel managers ask it for fresh channels, both at construction and each
/// time their channel is lost.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Opens a channel, re-establishing the connection first if it is down.
    async fn open_channel(&self) -> Result<Self::Channel>;

    /// Delay between channel recovery attempts.
    fn reconnect_interval(&self) -> Duration;

    /// `true` is sent on `connection.blocked`, `false` on `connection.unblocked`.
    fn notify_blocked(&self, tx: UnboundedSender<bool>);

    /// True once the connection has been shut down on purpose.
    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// `lapin` backed connection manager with bounded, jittered reconnects.
pub struct LapinConnectionManager {
    uri: String,
    properties: ConnectionProperties,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
    reconnect_interval: Duration,
    max_connect_attempts: u32,
    reconnect_delay_ms: u64,
    connect_timeout: Duration,
    status_poll_interval: Duration,
    blocked_listeners: Arc<Mutex<Vec<UnboundedSender<bool>>>>,
    closed: AtomicBool,
}

impl LapinConnectionManager {
    pub fn new(uri: &str) -> Self {
        LapinConnectionManager {
            uri: uri.to_string(),
            properties: ConnectionProperties::default(),
            connection: tokio::sync::Mutex::new(None),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_connect_attempts: 10,
            reconnect_delay_ms: 1000,
            connect_timeout: Duration::from_secs(10),
            status_poll_interval: Duration::from_secs(1),
            blocked_listeners: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        }
    }

    /// Attempts per connection establishment and the initial backoff delay.
    pub fn with_reconnect_policy(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.max_connect_attempts = max_attempts.max(1);
        self.reconnect_delay_ms = initial_delay_ms;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_properties(mut self, properties: ConnectionProperties) -> Self {
        self.properties = properties;
        self
    }

    /// How often channel and connection status is polled for close/blocked changes.
    pub fn with_status_poll_interval(mut self, interval: Duration) -> Self {
        self.status_poll_interval = interval;
        self
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.status().connected() {
                return Ok(Arc::clone(conn));
            }
        }

        let conn = Arc::new(self.establish_connection().await?);
        self.watch_blocked(Arc::downgrade(&conn));
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }

    async fn establish_connection(&self) -> Result<Connection> {
        let mut attempts = 0;
        let mut delay = self.reconnect_delay_ms;

        loop {
            if self.is_closed() {
                return Err(RabbitMQError::ConnectionError(
                    "connection manager is closed".to_string(),
                ));
            }
            info!("Attempting to connect to RabbitMQ");

            let result = match timeout(
                self.connect_timeout,
                Connection::connect(&self.uri, self.properties.clone()),
            )
            .await
            {
                Ok(result) => result.map_err(RabbitMQError::from),
                Err(elapsed) => Err(RabbitMQError::from(elapsed)),
            };

            match result {
                Ok(conn) => {
                    info!("Successfully connected to RabbitMQ");
                    return Ok(conn);
                }
                Err(err) => {
                    attempts += 1;
                    error!(
                        "Failed to connect to RabbitMQ (attempt {}/{}): {}",
                        attempts, self.max_connect_attempts, err
                    );

                    if attempts >= self.max_connect_attempts {
                        error!("Max reconnection attempts reached. Giving up.");
                        return Err(err);
                    }

                    // Exponential backoff with jitter
                    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
                    let sleep_time = (delay as i64 + jitter as i64).max(0) as u64;
                    info!("Waiting {}ms before next reconnect attempt", sleep_time);
                    sleep(Duration::from_millis(sleep_time)).await;

                    delay = std::cmp::min(delay * 2, 30000); // Cap at 30 seconds
                }
            }
        }
    }

    // lapin tracks connection.blocked in the connection status but has no
    // callback for it, so transitions are picked up by polling.
    fn watch_blocked(&self, conn: Weak<Connection>) {
        let listeners = Arc::clone(&self.blocked_listeners);
        let poll = self.status_poll_interval;
        tokio::spawn(async move {
            let mut blocked = false;
            let mut ticker = tokio::time::interval(poll);
            loop {
                ticker.tick().await;
                let Some(conn) = conn.upgrade() else { break };
                let status = conn.status();
                if !status.connected() {
                    break;
                }
                let now_blocked = status.blocked();
                if now_blocked != blocked {
                    blocked = now_blocked;
                    debug!(blocked, "Connection blocked state changed");
                    listeners
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .retain(|tx| tx.send(blocked).is_ok());
                }
            }
            // A dropped connection is no longer blocked.
            if blocked {
                listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|tx| tx.send(false).is_ok());
            }
        });
    }
}

#[async_trait]
impl ConnectionManager for LapinConnectionManager {
    type Channel = LapinChannel;

    async fn open_channel(&self) -> Result<LapinChannel> {
        let conn = self.connection().await?;
        let channel = conn.create_channel().await?;
        debug!(channel = channel.id(), "Opened channel");
        Ok(LapinChannel::new(channel, self.status_poll_interval))
    }

    fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    fn notify_blocked(&self, tx: UnboundedSender<bool>) {
        self.blocked_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if let Some(conn) = self.connection.lock().await.take() {
            info!("Closing RabbitMQ connection gracefully");
            conn.close(200, "Closing connection").await?;
        }
        Ok(())
    }
}
