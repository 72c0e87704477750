// src/rabbitmq/mod.rs
// Resilient channel management over RabbitMQ

pub mod errors;
pub mod connection;
pub mod channel;
pub mod channel_manager;
pub mod publisher;
pub mod queue;
pub mod memory;

mod amqp_client;

pub use amqp_client::LapinChannel;
pub use channel::{BrokerChannel, DeliveryStream, QueueInfo};
pub use channel_manager::{ChannelConfig, ChannelManager, ChannelState, HookId, ReconnectHook};
pub use connection::{ConnectionManager, LapinConnectionManager, DEFAULT_RECONNECT_INTERVAL};
pub use errors::{BlockReason, DeclareStage, RabbitMQError, Result};
pub use memory::{MemoryBroker, MemoryChannel, Operation};
pub use publisher::{
    resolve_publish_options, PublishGate, PublishOption, PublishOptions, Publisher,
    PublisherOptions,
};
pub use queue::{
    clear_queue, default_consumer_options, delete_queue_msg, new_queue, Conn, ConsumerOption,
    ConsumerOptions, Queue, TopologyReplay,
};
