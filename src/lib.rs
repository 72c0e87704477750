//! Resilient RabbitMQ channels.
//!
//! A [`ChannelManager`](rabbitmq::ChannelManager) keeps one logical channel
//! alive across connection loss and serializes every call against recovery.
//! [`Publisher`](rabbitmq::Publisher) adds flow-gated publishing on top, and
//! [`new_queue`](rabbitmq::new_queue) declares topology that is replayed on
//! every recovered channel.

pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;
