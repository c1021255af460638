//! `carrot-mux` shares a small, bounded set of AMQP connections between many concurrent
//! callers, built on top of [`tokio`].
//!
//! Every broker operation on a [`Connection`] can be used in two ways:
//! - awaited, like an ordinary blocking call that returns once the broker has replied;
//! - with a callback, returning a [`PromiseNumber`] immediately and delivering the result
//!   later on the connection's dispatcher task.
//!
//! [`Pool`](crate::pool::Pool) and [`PoolRegistry`](crate::pool::PoolRegistry) are the
//! best starting points: they open connections lazily and hand them out round robin.
//!
//! `carrot-mux` does not speak the AMQP wire format itself: a
//! [`ProtocolClient`](crate::amqp::ProtocolClient) implementation is plugged in through a
//! [`Connector`](crate::amqp::Connector).

pub mod amqp;
pub mod connection;
mod error;
pub mod message;
pub mod pool;

pub use connection::{Call, Connection, ConnectionId, Consume, PromiseNumber};
pub use error::{BrokerError, Error, ProtocolError};
pub use message::{Message, ReplyOptions};
