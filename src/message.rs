use lapin::message::{BasicGetMessage, BasicReturnMessage, Delivery};
use lapin::BasicProperties;
use serde::{de::DeserializeOwned, Serialize};

/// AMQP delivery mode carried in the `delivery-mode` basic property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryMode {
    /// Lost on broker restart.
    Transient = 1,
    /// Written to disk by the broker when routed to a durable queue.
    Persistent = 2,
}

impl DeliveryMode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// An outgoing message: body plus basic properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Publishing {
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
}

impl Publishing {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            properties: BasicProperties::default(),
        }
    }

    /// Serializes `value` as JSON and tags the content type accordingly.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self {
            payload,
            properties: BasicProperties::default().with_content_type("application/json".into()),
        })
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.properties = self.properties.with_message_id(id.into().into());
        self
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id().as_ref().map(|id| id.as_str())
    }
}

/// A message handed to the client, either pushed by a consumer or pulled by `basic.get`.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub payload: Vec<u8>,
    /// Messages still ready in the queue; only set for `basic.get` results.
    pub message_count: Option<u32>,
}

impl InboundMessage {
    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id().as_ref().map(|id| id.as_str())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

impl From<Delivery> for InboundMessage {
    fn from(delivery: Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            payload: delivery.data,
            message_count: None,
        }
    }
}

impl From<BasicGetMessage> for InboundMessage {
    fn from(message: BasicGetMessage) -> Self {
        let message_count = message.message_count;
        Self {
            message_count: Some(message_count),
            ..InboundMessage::from(message.delivery)
        }
    }
}

/// A mandatory or immediate publish the broker could not route.
#[derive(Debug, Clone, PartialEq)]
pub struct Return {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub message: Publishing,
}

impl From<BasicReturnMessage> for Return {
    fn from(returned: BasicReturnMessage) -> Self {
        Self {
            reply_code: returned.reply_code,
            reply_text: returned.reply_text.to_string(),
            exchange: returned.delivery.exchange.to_string(),
            routing_key: returned.delivery.routing_key.to_string(),
            message: Publishing {
                payload: returned.delivery.data,
                properties: returned.delivery.properties,
            },
        }
    }
}

impl From<Box<BasicReturnMessage>> for Return {
    fn from(returned: Box<BasicReturnMessage>) -> Self {
        Return::from(*returned)
    }
}

/// Publisher confirm for one publish on a channel in confirm mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub delivery_tag: u64,
    pub ack: bool,
}
