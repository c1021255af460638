use std::sync::Arc;

use crate::{amqp::Response, PromiseNumber};

/// Error returned by connection, pool and registry operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The socket broke (or the codec could not make sense of it).
    /// Every caller waiting on the same connection receives this error.
    #[error("The connection to the broker is broken: {0}")]
    ConnectionBroken(Arc<str>),
    #[error("The broker rejected the operation")]
    Broker(#[from] BrokerError),
    #[error("The connection is closed")]
    Closed,
    #[error("Failed to open a connection to the broker")]
    Connect(#[source] anyhow::Error),
    #[error("The pool `{0}` is closed")]
    PoolClosed(String),
    #[error("There is no consumer registered under promise {0}")]
    UnknownConsumer(PromiseNumber),
    #[error("Unexpected response from the broker: {0:?}")]
    UnexpectedResponse(Box<Response>),
    #[error("The protocol client failed")]
    Protocol(#[from] ProtocolError),
    #[error("Invalid configuration")]
    Configuration(#[source] anyhow::Error),
}

/// A protocol-level error reported by the broker, e.g. declaring a binding on an
/// exchange that does not exist.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{code} {text}")]
pub struct BrokerError {
    pub code: u16,
    pub text: String,
}

/// Failure raised by a [`ProtocolClient`](crate::amqp::ProtocolClient) while encoding or
/// decoding frames.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct ProtocolError(#[from] anyhow::Error);
