//! Errors

use crate::connection_string::ConnectionStringError;

/// Invalid or incomplete configuration
///
/// Every variant is fatal; the binaries print the usage text and exit with
/// [`ConfigError::EXIT_CODE`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required option was given neither as a flag nor as an environment variable
    #[error("Missing required configuration: {}", .0.join(", "))]
    MissingConfiguration(Vec<&'static str>),

    /// A numeric option could not be parsed
    #[error("{option} must be an integer between 1 and 65535, got {value:?}")]
    MalformedNumericOption {
        /// Name of the option
        option: &'static str,
        /// Raw value
        value: String,
    },

    /// Command line could not be parsed
    #[error(transparent)]
    InvalidArguments(#[from] clap::Error),

    /// The connection string is malformed
    #[error("Invalid connection string: {0}")]
    ConnectionString(#[from] ConnectionStringError),

    /// The connection string is scoped to another entity than the queue
    #[error("Connection string is scoped to {entity_path:?}, not to queue {queue:?}")]
    EntityPathMismatch {
        /// `EntityPath` of the connection string
        entity_path: String,
        /// Configured queue name
        queue: String,
    },
}

impl ConfigError {
    /// Exit status for configuration failures
    pub const EXIT_CODE: i32 = 1;
}

/// Error reported by a queue client
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Establishing the WebSocket transport (TCP, proxy tunnel, TLS or WebSocket handshake) failed
    #[error("Transport error: {0}")]
    Transport(#[from] amqp_ws_tunnel::Error),

    /// The connection string asks for a transport this client cannot open
    #[error("Transport {0} is not supported")]
    UnsupportedTransport(crate::settings::TransportType),

    /// Opening the AMQP connection failed
    #[error("Connection error: {0}")]
    Open(#[from] fe2o3_amqp::connection::OpenError),

    /// Beginning the AMQP session failed
    #[error("Session error: {0}")]
    Begin(#[from] fe2o3_amqp::session::BeginError),

    /// Attaching a sending link failed
    #[error("Sender attach error: {0}")]
    SenderAttach(#[from] fe2o3_amqp::link::SenderAttachError),

    /// Attaching a receiving link failed
    #[error("Receiver attach error: {0}")]
    ReceiverAttach(#[from] fe2o3_amqp::link::ReceiverAttachError),

    /// Sending a message failed
    #[error("Send error: {0}")]
    Send(#[from] fe2o3_amqp::link::SendError),

    /// Receiving a message failed
    #[error("Receive error: {0}")]
    Recv(#[from] fe2o3_amqp::link::RecvError),

    /// Settling a delivery failed
    #[error("Disposition error: {0}")]
    Disposition(#[from] fe2o3_amqp::link::DispositionError),

    /// The queue settled a sent message with an outcome other than accepted
    #[error("Message not accepted: {0}")]
    NotAccepted(String),

    /// The message body could not be encoded
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Attaching the management links failed
    #[error("Management attach error: {0}")]
    ManagementAttach(#[from] fe2o3_amqp_management::error::AttachError),

    /// A management request failed or was answered with a failure status
    #[error("Management error: {0}")]
    Management(#[from] fe2o3_amqp_management::error::Error),

    /// Opening the client did not finish in time
    #[error("Opening the client timed out after {0:?}")]
    OpenTimeout(std::time::Duration),

    /// Detaching links, ending the session or closing the connection failed
    #[error("Close error: {0}")]
    Close(String),

    /// The client has already been closed
    #[error("Client is closed")]
    Closed,
}

impl ClientError {
    /// Whether the link or connection behind the client is gone and has to be reopened
    pub fn is_disconnected(&self) -> bool {
        use fe2o3_amqp::link::RecvError;

        matches!(
            self,
            ClientError::Closed | ClientError::Recv(RecvError::LinkStateError(_))
        )
    }
}

/// Error that ends a run of the sample
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A queue client could not be opened
    #[error("Transport connection failed: {0}")]
    TransportConnection(#[source] ClientError),

    /// Some messages of the batch could not be sent
    #[error(transparent)]
    Send(#[from] crate::send::SendFailure),

    /// A spawned task panicked
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Exit status of the process for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => ConfigError::EXIT_CODE,
            Error::TransportConnection(_) | Error::Send(_) | Error::Join(_) => 1,
        }
    }
}
