//! Helpers for connecting to an AMQP broker and the protocol boundary connections drive.

pub mod configuration;
pub mod convenience;
mod factory;
mod protocol;

pub use factory::{Connector, TcpConnector, Wire};
pub use protocol::{
    Frame, Operation, ProtocolClient, QueueState, Resolution, Response, Transport,
};

pub use lapin::{options, types, BasicProperties, ExchangeKind};
