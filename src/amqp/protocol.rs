//! The boundary between a [`Connection`](crate::Connection) and the codec that speaks the
//! broker's wire protocol.
//!
//! The codec is sans-IO: the connection owns the socket, feeds it the bytes it reads and
//! drains the bytes it wants written. Requests are correlated with their replies through
//! [`PromiseNumber`]s handed out by the connection.
use amq_protocol_types::{DeliveryTag, FieldTable, ShortString};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeBindOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
    BasicProperties, ExchangeKind,
};
use redact::Secret;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{BrokerError, PromiseNumber, ProtocolError};

/// The byte stream a [`ProtocolClient`] talks over, usually a TCP socket.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Encodes operations and decodes the broker's replies.
///
/// Implementations never touch the socket. They are only ever called while the owning
/// connection holds its lock, one call at a time.
pub trait ProtocolClient: Send + 'static {
    /// Encode `operation` into the outbound buffer.
    ///
    /// Replies to it must be resolved against `promise`. `promise` is `None` for
    /// operations the broker does not reply to (ack, reject).
    fn send(
        &mut self,
        promise: Option<PromiseNumber>,
        operation: &Operation,
    ) -> Result<(), ProtocolError>;

    /// Whether there are bytes waiting to be written to the socket.
    fn needs_write(&self) -> bool;

    /// The bytes waiting to be written, oldest first.
    fn write_buffer(&self) -> &[u8];

    /// `written` bytes from the front of [`ProtocolClient::write_buffer`] reached the socket.
    fn on_write(&mut self, written: usize);

    /// Decode freshly read bytes.
    ///
    /// Returns every promise resolution completed by `data`, in wire order.
    /// Incomplete frames must be buffered until the next call.
    /// An error here is treated as a broken connection.
    fn on_read(&mut self, data: &[u8]) -> Result<Vec<Resolution>, ProtocolError>;
}

/// A decoded reply for one outstanding promise.
#[derive(Debug)]
pub struct Resolution {
    pub promise: PromiseNumber,
    pub outcome: Result<Response, BrokerError>,
}

/// A broker operation, as issued by [`Connection`](crate::Connection).
#[derive(Debug, Clone)]
pub enum Operation {
    /// Post-connect handshake: protocol negotiation, authentication and vhost selection.
    Connect {
        vhost: String,
        username: String,
        password: Secret<String>,
    },
    ExchangeDeclare {
        exchange: ShortString,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    },
    ExchangeDelete {
        exchange: ShortString,
        options: ExchangeDeleteOptions,
    },
    ExchangeBind {
        destination: ShortString,
        source: ShortString,
        routing_key: ShortString,
        options: ExchangeBindOptions,
        arguments: FieldTable,
    },
    ExchangeUnbind {
        destination: ShortString,
        source: ShortString,
        routing_key: ShortString,
        options: ExchangeUnbindOptions,
        arguments: FieldTable,
    },
    QueueDeclare {
        queue: ShortString,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    },
    QueueDelete {
        queue: ShortString,
        options: QueueDeleteOptions,
    },
    QueuePurge {
        queue: ShortString,
        options: QueuePurgeOptions,
    },
    QueueBind {
        queue: ShortString,
        exchange: ShortString,
        routing_key: ShortString,
        options: QueueBindOptions,
        arguments: FieldTable,
    },
    QueueUnbind {
        queue: ShortString,
        exchange: ShortString,
        routing_key: ShortString,
        arguments: FieldTable,
    },
    Publish {
        exchange: ShortString,
        routing_key: ShortString,
        body: Vec<u8>,
        properties: BasicProperties,
        options: BasicPublishOptions,
    },
    Consume {
        queue: ShortString,
        consumer_tag: ShortString,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    },
    Get {
        queue: ShortString,
        options: BasicGetOptions,
    },
    Ack {
        delivery_tag: DeliveryTag,
        options: BasicAckOptions,
    },
    Reject {
        delivery_tag: DeliveryTag,
        options: BasicRejectOptions,
    },
    Cancel {
        consumer_tag: ShortString,
        options: BasicCancelOptions,
    },
    Qos {
        prefetch_count: u16,
        options: BasicQosOptions,
    },
    Close,
}

impl Operation {
    /// A short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Connect { .. } => "connect",
            Operation::ExchangeDeclare { .. } => "exchange_declare",
            Operation::ExchangeDelete { .. } => "exchange_delete",
            Operation::ExchangeBind { .. } => "exchange_bind",
            Operation::ExchangeUnbind { .. } => "exchange_unbind",
            Operation::QueueDeclare { .. } => "queue_declare",
            Operation::QueueDelete { .. } => "queue_delete",
            Operation::QueuePurge { .. } => "queue_purge",
            Operation::QueueBind { .. } => "queue_bind",
            Operation::QueueUnbind { .. } => "queue_unbind",
            Operation::Publish { .. } => "publish",
            Operation::Consume { .. } => "consume",
            Operation::Get { .. } => "get",
            Operation::Ack { .. } => "ack",
            Operation::Reject { .. } => "reject",
            Operation::Cancel { .. } => "cancel",
            Operation::Qos { .. } => "qos",
            Operation::Close => "close",
        }
    }
}

/// A successful reply from the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Replies without a payload: declare-ok, bind-ok, publish confirmations, qos-ok, ...
    Ok,
    QueueDeclared(QueueState),
    /// Purge-ok and delete-ok for queues.
    MessageCount(u32),
    /// The consumer is registered; deliveries follow under the same promise.
    ConsumeOk { consumer_tag: ShortString },
    Delivery(Frame),
    /// `get` found the queue empty.
    Empty,
}

/// The state of a queue as reported by the broker when it was declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueState {
    /// The queue name, useful when the broker picked it.
    pub queue: ShortString,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// One delivered message, as decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: ShortString,
    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: ShortString,
    /// The payload of the message in binary format.
    pub body: Vec<u8>,
    /// Whether this message was redelivered.
    pub redelivered: bool,
    pub delivery_tag: DeliveryTag,
    /// `None` for messages fetched with `get`.
    pub consumer_tag: Option<ShortString>,
    /// Contains the properties and the headers of the message.
    pub properties: BasicProperties,
}
