#![deny(missing_docs, missing_debug_implementations)]

//! AMQP 1.0 WebSocket binding that can be carried through an HTTP proxy
//!
//! Plain AMQP ports (5671/5672) are often blocked by corporate firewalls. The AMQP WebSocket
//! binding tunnels the protocol over port 443 instead, and a `CONNECT` proxy can carry that
//! connection further. The WebSocket itself is provided by [`fe2o3_amqp_ws::WebSocketStream`];
//! this crate adds the proxy tunnel underneath it.
//!
//! ```rust,ignore
//! let proxy = ProxyTarget::new("proxy.corp.example", 3128);
//! let ws_stream = amqp_ws_tunnel::connect("my-ns.servicebus.windows.net", Some(&proxy)).await?;
//! let connection = Connection::builder()
//!     .container_id("sample")
//!     .open_with_stream(ws_stream)
//!     .await?;
//! ```

use std::fmt::Debug;

use fe2o3_amqp_ws::WebSocketStream;
use tokio::io::{AsyncRead, AsyncWrite};

mod error;
pub mod proxy;

pub use error::Error;
pub use proxy::ProxyTarget;

/// Default port of the AMQP WebSocket endpoint
pub const WSS_PORT: u16 = 443;

/// Path of the Service Bus AMQP WebSocket endpoint
pub const SERVICE_BUS_WEBSOCKET_PATH: &str = "/$servicebus/websocket";

/// Returns the `wss://` URL of the AMQP WebSocket endpoint on `host`
pub fn websocket_url(host: &str) -> String {
    format!("wss://{host}:{WSS_PORT}{SERVICE_BUS_WEBSOCKET_PATH}")
}

/// Opens a TLS WebSocket to the AMQP endpoint on `host`
///
/// The TCP connection goes through `proxy` if one is given, otherwise through the process-wide
/// default proxy if one has been installed with [`proxy::set_default_proxy`], otherwise directly
/// to `host`. The handshake asks for the `amqp` subprotocol and fails unless the server answers
/// with status 101 and echoes it.
pub async fn connect(
    host: &str,
    proxy: Option<&ProxyTarget>,
) -> Result<impl AsyncRead + AsyncWrite + Debug + Send + Unpin + 'static, Error> {
    install_crypto_provider();
    let stream = proxy::connect_tcp(host, WSS_PORT, proxy).await?;

    let url = websocket_url(host);
    tracing::debug!(%url, "starting websocket handshake");
    let ws_stream = WebSocketStream::connect_tls_with_stream(url, stream).await?;
    Ok(ws_stream)
}

/// Performs a plain (`ws://`) AMQP WebSocket handshake over an established `stream`
pub async fn handshake<S>(
    url: &str,
    stream: S,
) -> Result<impl AsyncRead + AsyncWrite + Debug + Send + Unpin + 'static, Error>
where
    S: AsyncRead + AsyncWrite + Debug + Send + Unpin + 'static,
{
    let ws_stream = WebSocketStream::connect_with_stream(url, stream).await?;
    Ok(ws_stream)
}

/// Makes ring the rustls provider of this process unless one is installed already
fn install_crypto_provider() {
    let _ = librustls::crypto::ring::default_provider().install_default();
}
