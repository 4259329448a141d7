use std::io;

/// Error opening a tunnelled AMQP WebSocket
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error on the TCP stream or the proxy tunnel
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The WebSocket handshake failed or was not answered with the `amqp` subprotocol
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] fe2o3_amqp_ws::Error),

    /// The proxy answered the `CONNECT` request with a non-2xx status
    #[error("Proxy {proxy} refused tunnel: {status} {reason}")]
    ProxyRefused {
        /// Address of the proxy
        proxy: String,
        /// HTTP status code of the proxy response
        status: u16,
        /// Reason phrase of the proxy response
        reason: String,
    },

    /// The proxy response is not an HTTP response head
    #[error("Malformed response from proxy {proxy}")]
    MalformedProxyResponse {
        /// Address of the proxy
        proxy: String,
    },
}
