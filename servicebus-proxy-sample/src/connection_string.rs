//! Service Bus connection string
//!
//! A connection string is a `;` separated list of `key=value` pairs, for example
//!
//! ```text
//! Endpoint=sb://my-ns.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=c2VjcmV0;TransportType=AmqpWebSockets
//! ```
//!
//! Keys are matched case-insensitively and unknown keys are ignored.

use std::{fmt, str::FromStr};

use url::Url;

use crate::settings::TransportType;

const ENDPOINT: &str = "endpoint";
const SHARED_ACCESS_KEY_NAME: &str = "sharedaccesskeyname";
const SHARED_ACCESS_KEY: &str = "sharedaccesskey";
const ENTITY_PATH: &str = "entitypath";
const TRANSPORT_TYPE: &str = "transporttype";

/// Error parsing a connection string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionStringError {
    /// A segment is not of the form `key=value`
    #[error("Segment {0:?} is not a key=value pair")]
    MalformedSegment(String),

    /// The `Endpoint` key is missing
    #[error("Endpoint is missing")]
    MissingEndpoint,

    /// The `Endpoint` value is not a URL with a host
    #[error("Endpoint {0:?} is not a valid URL with a host")]
    InvalidEndpoint(String),

    /// `SharedAccessKeyName` or `SharedAccessKey` is missing
    #[error("SharedAccessKeyName and SharedAccessKey are required")]
    MissingSharedAccessKey,

    /// The `TransportType` value is not recognized
    #[error("Unknown transport type {0:?}")]
    InvalidTransportType(String),
}

/// Parsed connection string
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    endpoint: Url,
    shared_access_key_name: String,
    shared_access_key: String,
    entity_path: Option<String>,
    transport_type: TransportType,
}

impl ConnectionString {
    /// Endpoint URL, usually `sb://<namespace>.servicebus.windows.net/`
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Hostname of the namespace
    pub fn host(&self) -> &str {
        // Checked when parsing
        self.endpoint.host_str().unwrap_or_default()
    }

    /// Name of the shared access policy
    pub fn shared_access_key_name(&self) -> &str {
        &self.shared_access_key_name
    }

    /// Key of the shared access policy
    pub fn shared_access_key(&self) -> &str {
        &self.shared_access_key
    }

    /// Entity (queue) the connection string is scoped to, if any
    pub fn entity_path(&self) -> Option<&str> {
        self.entity_path.as_deref()
    }

    /// Declared transport. `Amqp` when the connection string does not name one.
    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    /// Replaces the transport type
    pub fn set_transport_type(&mut self, transport_type: TransportType) {
        self.transport_type = transport_type;
    }
}

impl FromStr for ConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut endpoint = None;
        let mut shared_access_key_name = None;
        let mut shared_access_key = None;
        let mut entity_path = None;
        let mut transport_type = TransportType::default();

        for segment in s.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| ConnectionStringError::MalformedSegment(segment.to_string()))?;
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                ENDPOINT => {
                    let url = Url::parse(value)
                        .map_err(|_| ConnectionStringError::InvalidEndpoint(value.to_string()))?;
                    if url.host_str().map_or(true, str::is_empty) {
                        return Err(ConnectionStringError::InvalidEndpoint(value.to_string()));
                    }
                    endpoint = Some(url);
                }
                SHARED_ACCESS_KEY_NAME => shared_access_key_name = Some(value.to_string()),
                SHARED_ACCESS_KEY => shared_access_key = Some(value.to_string()),
                ENTITY_PATH => entity_path = Some(value.to_string()),
                TRANSPORT_TYPE => transport_type = value.parse()?,
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or(ConnectionStringError::MissingEndpoint)?;
        let (shared_access_key_name, shared_access_key) =
            match (shared_access_key_name, shared_access_key) {
                (Some(name), Some(key)) if !name.is_empty() && !key.is_empty() => (name, key),
                _ => return Err(ConnectionStringError::MissingSharedAccessKey),
            };

        Ok(Self {
            endpoint,
            shared_access_key_name,
            shared_access_key,
            entity_path,
            transport_type,
        })
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint.as_str())
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("shared_access_key", &"<redacted>")
            .field("entity_path", &self.entity_path)
            .field("transport_type", &self.transport_type)
            .finish()
    }
}
