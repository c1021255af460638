use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpStream;

use crate::amqp::{configuration::BrokerSettings, ProtocolClient, Transport};

/// A freshly opened link to a broker: the socket and the codec that will speak over it.
pub struct Wire {
    pub transport: Box<dyn Transport>,
    pub client: Box<dyn ProtocolClient>,
}

/// Opens physical links to a broker.
///
/// Pools call [`Connector::connect`] every time they grow. The handshake is performed
/// afterwards by [`Connection::open`](crate::Connection::open) over the returned [`Wire`].
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, settings: &BrokerSettings) -> Result<Wire, anyhow::Error>;
}

type CodecFactory = dyn Fn(&BrokerSettings) -> Box<dyn ProtocolClient> + Send + Sync;

/// Connects over plain TCP and pairs every socket with a fresh codec.
#[derive(Clone)]
pub struct TcpConnector {
    codec: Arc<CodecFactory>,
}

impl TcpConnector {
    /// `codec` builds the protocol client for each new socket.
    pub fn new<F>(codec: F) -> Self
    where
        F: Fn(&BrokerSettings) -> Box<dyn ProtocolClient> + Send + Sync + 'static,
    {
        Self {
            codec: Arc::new(codec),
        }
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    #[tracing::instrument(
        name = "amqp_tcp_connect",
        skip_all,
        fields(host = %settings.host, port = settings.port)
    )]
    async fn connect(&self, settings: &BrokerSettings) -> Result<Wire, anyhow::Error> {
        let stream = TcpStream::connect((settings.host.as_str(), settings.port))
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to the broker at {}:{}.",
                    settings.host, settings.port
                )
            })?;
        stream.set_nodelay(true)?;
        Ok(Wire {
            transport: Box::new(stream),
            client: (self.codec)(settings),
        })
    }
}
