//! Client settings derived from the resolved configuration

use std::{fmt, str::FromStr};

use amqp_ws_tunnel::ProxyTarget;

use crate::{
    config::Configuration,
    connection_string::{ConnectionString, ConnectionStringError},
    error::ConfigError,
};

/// How the client reaches the namespace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// AMQP 1.0 over TLS on port 5671
    #[default]
    Amqp,

    /// AMQP 1.0 over a secure WebSocket on port 443
    AmqpWebSockets,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Amqp => f.write_str("Amqp"),
            TransportType::AmqpWebSockets => f.write_str("AmqpWebSockets"),
        }
    }
}

impl FromStr for TransportType {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("amqp") {
            Ok(TransportType::Amqp)
        } else if s.eq_ignore_ascii_case("amqpwebsockets") {
            Ok(TransportType::AmqpWebSockets)
        } else {
            Err(ConnectionStringError::InvalidTransportType(s.to_string()))
        }
    }
}

/// Where the proxy is installed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProxyStrategy {
    /// The proxy is carried by the [`ClientSettings`] and only affects clients built from them
    #[default]
    ClientScoped,

    /// The proxy becomes the default route of every tunnel connection made by this process
    ProcessWide,
}

impl FromStr for ProxyStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(ProxyStrategy::ClientScoped),
            "process" => Ok(ProxyStrategy::ProcessWide),
            _ => Err(format!("unknown proxy scope {s:?}")),
        }
    }
}

/// Everything a queue client needs to open a connection
#[derive(Debug, Clone)]
pub struct ClientSettings {
    connection_string: ConnectionString,
    proxy: Option<ProxyTarget>,
}

impl ClientSettings {
    /// Creates settings from a parsed connection string and an optional client-scoped proxy
    pub fn new(connection_string: ConnectionString, proxy: Option<ProxyTarget>) -> Self {
        Self {
            connection_string,
            proxy,
        }
    }

    /// Hostname of the namespace
    pub fn host(&self) -> &str {
        self.connection_string.host()
    }

    /// Name of the shared access policy
    pub fn key_name(&self) -> &str {
        self.connection_string.shared_access_key_name()
    }

    /// Key of the shared access policy
    pub fn key(&self) -> &str {
        self.connection_string.shared_access_key()
    }

    /// Transport the clients will use
    pub fn transport(&self) -> TransportType {
        self.connection_string.transport_type()
    }

    /// Client-scoped proxy, if any
    pub fn proxy(&self) -> Option<&ProxyTarget> {
        self.proxy.as_ref()
    }
}

/// Builds the client settings for `config`
///
/// A connection string scoped to an entity must name the configured queue. A connection string
/// asking for plain AMQP is switched to AMQP over WebSockets. A configured
/// proxy is either stored on the returned settings or installed for the whole process, depending
/// on `strategy`.
pub fn configure(
    config: &Configuration,
    strategy: ProxyStrategy,
) -> Result<ClientSettings, ConfigError> {
    let mut connection_string: ConnectionString = config.connection_string().parse()?;

    if let Some(entity_path) = connection_string.entity_path() {
        if entity_path != config.queue_name() {
            return Err(ConfigError::EntityPathMismatch {
                entity_path: entity_path.to_string(),
                queue: config.queue_name().to_string(),
            });
        }
    }

    if connection_string.transport_type() == TransportType::Amqp {
        tracing::debug!(
            from = %TransportType::Amqp,
            to = %TransportType::AmqpWebSockets,
            "upgrading transport"
        );
        connection_string.set_transport_type(TransportType::AmqpWebSockets);
    }

    let proxy = match (config.proxy(), strategy) {
        (Some(proxy), ProxyStrategy::ClientScoped) => {
            tracing::info!(%proxy, "routing client connections through proxy");
            Some(proxy.clone())
        }
        (Some(proxy), ProxyStrategy::ProcessWide) => {
            amqp_ws_tunnel::proxy::set_default_proxy(proxy.clone());
            None
        }
        (None, _) => None,
    };

    Ok(ClientSettings::new(connection_string, proxy))
}
