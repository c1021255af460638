use std::borrow::Cow;

use lapin::{
    options::{BasicCancelOptions, BasicPublishOptions},
    types::{AMQPValue, DeliveryTag, ShortString},
    BasicProperties,
};

use crate::{
    amqp::{convenience::BasicPropertiesExt, Frame, Operation},
    connection::{self, WeakConnection},
    Call, Error, PromiseNumber,
};

/// A message delivered by the broker, bound to the connection that received it.
///
/// `Message` does not keep its connection alive: once every [`Connection`](crate::Connection)
/// handle is gone, acknowledging or replying fails with [`Error::Closed`].
#[derive(Clone)]
pub struct Message {
    connection: WeakConnection,
    promise: PromiseNumber,
    frame: Frame,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("promise", &self.promise)
            .field("frame", &self.frame)
            .finish()
    }
}

impl Message {
    pub(crate) fn new(connection: WeakConnection, promise: PromiseNumber, frame: Frame) -> Self {
        Self {
            connection,
            promise,
            frame,
        }
    }

    /// The exchange the message was published to. Empty for the default exchange.
    pub fn exchange(&self) -> &str {
        self.frame.exchange.as_str()
    }

    pub fn routing_key(&self) -> &str {
        self.frame.routing_key.as_str()
    }

    pub fn body(&self) -> &[u8] {
        &self.frame.body
    }

    pub fn redelivered(&self) -> bool {
        self.frame.redelivered
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.frame.delivery_tag
    }

    /// `None` for messages fetched with [`Connection::get`](crate::Connection::get).
    pub fn consumer_tag(&self) -> Option<&ShortString> {
        self.frame.consumer_tag.as_ref()
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.frame.properties
    }

    /// The promise of the `consume` (or `get`) call that produced this message.
    pub fn promise(&self) -> PromiseNumber {
        self.promise
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Lookup a string header, see [`BasicPropertiesExt::get_header_str`].
    pub fn header(&self, name: &str) -> Option<Cow<'_, str>> {
        self.frame
            .properties
            .get_header_str(&ShortString::from(name))
    }

    /// Raw access to a field of the delivery by name.
    ///
    /// Known fields are `exchange`, `routing_key`, `body`, `redelivered`, `delivery_tag`,
    /// `consumer_tag` and `promise`. Any other name is looked up among the headers.
    pub fn get(&self, field: &str) -> Option<AMQPValue> {
        let value = match field {
            "exchange" => AMQPValue::ShortString(self.frame.exchange.clone()),
            "routing_key" => AMQPValue::ShortString(self.frame.routing_key.clone()),
            "body" => AMQPValue::ByteArray(self.frame.body.clone().into()),
            "redelivered" => AMQPValue::Boolean(self.frame.redelivered),
            "delivery_tag" => AMQPValue::LongLongInt(self.frame.delivery_tag as i64),
            "consumer_tag" => AMQPValue::ShortString(self.frame.consumer_tag.clone()?),
            "promise" => AMQPValue::LongLongInt(self.promise.get() as i64),
            header => {
                return self
                    .frame
                    .properties
                    .get_header(&ShortString::from(header))
                    .cloned()
            }
        };
        Some(value)
    }

    /// Acknowledge the message on the connection that received it.
    pub fn ack(&self) -> Result<(), Error> {
        match self.connection.upgrade() {
            Some(connection) => connection.ack(self.frame.delivery_tag),
            None => Err(Error::Closed),
        }
    }

    /// Reject the message.
    ///
    /// With `requeue`, the broker may deliver the very same message to this client again.
    pub fn reject(&self, requeue: bool) -> Result<(), Error> {
        match self.connection.upgrade() {
            Some(connection) => connection.reject(self.frame.delivery_tag, requeue),
            None => Err(Error::Closed),
        }
    }

    /// Publish a new message, by default to the exchange and routing key this one came from.
    pub fn reply(&self, reply: ReplyOptions) -> Call<()> {
        let ReplyOptions {
            exchange,
            routing_key,
            body,
            properties,
            options,
        } = reply;
        let exchange = exchange.unwrap_or_else(|| self.exchange().to_owned());
        let routing_key = routing_key.unwrap_or_else(|| self.routing_key().to_owned());
        match self.connection.upgrade() {
            Some(connection) => {
                connection.publish_with_options(&exchange, &routing_key, body, properties, options)
            }
            None => connection::refused(
                Error::Closed,
                Operation::Publish {
                    exchange: exchange.into(),
                    routing_key: routing_key.into(),
                    body,
                    properties,
                    options,
                },
            ),
        }
    }

    /// Cancel the standing consumer that delivered this message.
    pub fn cancel_consume(&self) -> Call<()> {
        match self.connection.upgrade() {
            Some(connection) => connection.cancel(self.promise),
            None => connection::refused(
                Error::Closed,
                Operation::Cancel {
                    consumer_tag: self
                        .frame
                        .consumer_tag
                        .clone()
                        .unwrap_or_else(|| ShortString::from("")),
                    options: BasicCancelOptions::default(),
                },
            ),
        }
    }
}

/// What to publish with [`Message::reply`]. Unset fields fall back to the original message.
#[derive(Debug, Clone, Default)]
pub struct ReplyOptions {
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
    pub options: BasicPublishOptions,
}

impl ReplyOptions {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    #[must_use]
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    #[must_use]
    pub fn properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: AMQPValue) -> Self {
        self.properties = crate::amqp::convenience::set_header(self.properties, name, value);
        self
    }
}
