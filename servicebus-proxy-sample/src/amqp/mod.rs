//! Queue clients speaking AMQP 1.0 over the WebSocket tunnel

use fe2o3_amqp::{connection::ConnectionHandle, sasl_profile::SaslProfile, Connection};

use crate::{
    client::QueueConnector,
    error::ClientError,
    settings::{ClientSettings, TransportType},
};

mod management;
mod sink;
mod source;

pub use sink::AmqpSink;
pub use source::{AmqpLock, AmqpSource};

/// Opens AMQP sinks and sources with the given settings
///
/// Every sink and every source owns its own connection.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    settings: ClientSettings,
}

impl AmqpConnector {
    /// Creates a new connector
    pub fn new(settings: ClientSettings) -> Self {
        Self { settings }
    }

    async fn open_connection(&self, role: &str) -> Result<ConnectionHandle<()>, ClientError> {
        let transport = self.settings.transport();
        if transport != TransportType::AmqpWebSockets {
            return Err(ClientError::UnsupportedTransport(transport));
        }

        let host = self.settings.host();
        tracing::debug!(host, role, proxy = ?self.settings.proxy(), "opening websocket");
        let ws_stream = amqp_ws_tunnel::connect(host, self.settings.proxy()).await?;

        let container_id = format!("servicebus-proxy-sample-{role}-{}", uuid::Uuid::new_v4());
        let connection = Connection::builder()
            .container_id(container_id)
            .hostname(host)
            .sasl_profile(SaslProfile::Plain {
                username: self.settings.key_name().to_string(),
                password: self.settings.key().to_string(),
            })
            .open_with_stream(ws_stream)
            .await?;
        tracing::info!(host, role, "connection opened");
        Ok(connection)
    }
}

impl QueueConnector for AmqpConnector {
    type Sink = AmqpSink;
    type Source = AmqpSource;

    async fn open_sink(&self, queue: &str) -> Result<AmqpSink, ClientError> {
        let connection = self.open_connection("sender").await?;
        AmqpSink::attach(connection, queue).await
    }

    async fn open_source(&self, queue: &str) -> Result<AmqpSource, ClientError> {
        let connection = self.open_connection("receiver").await?;
        AmqpSource::attach(connection, queue).await
    }
}

/// Closes `connection`
pub(crate) async fn close_connection(mut connection: ConnectionHandle<()>) -> Result<(), ClientError> {
    connection
        .close()
        .await
        .map_err(|err| ClientError::Close(err.to_string()))
}
