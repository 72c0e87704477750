// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use std::fmt;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Why a publish was refused before reaching the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// The channel received `channel.flow(active = false)`.
    HighFlow,
    /// The connection received `connection.blocked`.
    ConnectionBlocked,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::HighFlow => write!(f, "publishing blocked due to high flow on the server"),
            BlockReason::ConnectionBlocked => {
                write!(f, "publishing blocked due to TCP block on the server")
            }
        }
    }
}

/// Topology declaration step that failed inside `new_queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclareStage {
    Qos,
    Exchange,
    Queue,
    Bindings,
}

impl fmt::Display for DeclareStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeclareStage::Qos => "qos",
            DeclareStage::Exchange => "exchange",
            DeclareStage::Queue => "queue",
            DeclareStage::Bindings => "bindings",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ broker error: {0}")]
    Broker(#[from] LapinError),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("{0}")]
    PublishBlocked(BlockReason),

    #[error("declare {stage} failed: {source}")]
    Stage {
        stage: DeclareStage,
        #[source]
        source: Box<RabbitMQError>,
    },

    #[error("channel manager is closed")]
    ManagerClosed,

    #[error("connection manager can't be nil")]
    MissingConnectionManager,

    #[error("Connection timeout: {0}")]
    TimeoutError(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    pub(crate) fn stage(stage: DeclareStage, source: RabbitMQError) -> Self {
        RabbitMQError::Stage {
            stage,
            source: Box::new(source),
        }
    }

    /// True for errors produced locally by the flow/blocked gate.
    pub fn is_publish_blocked(&self) -> bool {
        matches!(self, RabbitMQError::PublishBlocked(_))
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}
