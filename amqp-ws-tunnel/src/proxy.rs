//! HTTP `CONNECT` proxy tunnelling
//!
//! A proxy can be given per connection or installed once for the whole process with
//! [`set_default_proxy`]. A proxy passed to [`connect_tcp`] always takes precedence over the
//! process-wide default. A failed connection through the selected proxy is returned as is; there
//! is no fallback to a direct connection or to another proxy.

use std::fmt;

use parking_lot::RwLock;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::Error;

/// Upper bound on the size of the proxy response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

const MAX_RESPONSE_HEADERS: usize = 32;

static DEFAULT_PROXY: RwLock<Option<ProxyTarget>> = parking_lot::const_rwlock(None);

/// Address of an HTTP proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyTarget {
    host: String,
    port: u16,
}

impl ProxyTarget {
    /// Creates a new proxy address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Hostname of the proxy
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port of the proxy
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Installs `proxy` as the route for every tunnel connection of this process that does not name
/// its own proxy. Returns the previously installed default.
pub fn set_default_proxy(proxy: ProxyTarget) -> Option<ProxyTarget> {
    tracing::info!(%proxy, "installing process-wide proxy");
    DEFAULT_PROXY.write().replace(proxy)
}

/// Removes the process-wide default proxy
pub fn clear_default_proxy() -> Option<ProxyTarget> {
    DEFAULT_PROXY.write().take()
}

/// Returns the process-wide default proxy, if any
pub fn default_proxy() -> Option<ProxyTarget> {
    DEFAULT_PROXY.read().clone()
}

/// Picks the proxy a connection should use: `scoped` if given, else the process-wide default
pub fn select_proxy(scoped: Option<&ProxyTarget>) -> Option<ProxyTarget> {
    scoped.cloned().or_else(default_proxy)
}

/// Opens a TCP connection to `host:port`, through the selected proxy if there is one
pub async fn connect_tcp(
    host: &str,
    port: u16,
    scoped: Option<&ProxyTarget>,
) -> Result<TcpStream, Error> {
    match select_proxy(scoped) {
        Some(proxy) => open_tunnel(&proxy, host, port).await,
        None => {
            tracing::debug!(host, port, "connecting directly");
            Ok(TcpStream::connect((host, port)).await?)
        }
    }
}

/// Opens a tunnel to `host:port` through `proxy` with an HTTP `CONNECT` request
///
/// The returned stream is positioned right after the proxy response head, so the first byte read
/// from it comes from `host`.
pub async fn open_tunnel(proxy: &ProxyTarget, host: &str, port: u16) -> Result<TcpStream, Error> {
    tracing::debug!(%proxy, host, port, "opening proxy tunnel");
    let mut stream = TcpStream::connect((proxy.host(), proxy.port())).await?;

    let authority = format!("{host}:{port}");
    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let (status, reason) = read_response_head(&mut stream, proxy).await?;
    if (200..300).contains(&status) {
        tracing::debug!(%proxy, status, "proxy tunnel established");
        Ok(stream)
    } else {
        Err(Error::ProxyRefused {
            proxy: proxy.to_string(),
            status,
            reason,
        })
    }
}

/// Reads the proxy response head and returns its status code and reason phrase
///
/// Bytes are read one at a time so that nothing past the head is consumed. Lines may end with
/// `\r\n` or a bare `\n`.
async fn read_response_head(
    stream: &mut TcpStream,
    proxy: &ProxyTarget,
) -> Result<(u16, String), Error> {
    let malformed = || Error::MalformedProxyResponse {
        proxy: proxy.to_string(),
    };

    let mut head = Vec::with_capacity(128);
    loop {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(malformed());
        }
        let byte = match stream.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Err(malformed()),
            Err(err) => return Err(err.into()),
        };
        head.push(byte);
        if byte != b'\n' {
            continue;
        }

        match parse_response_head(&head) {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(_) => return Err(malformed()),
        }
    }
}

/// Parses a complete response head. `Ok(None)` means more bytes are needed.
fn parse_response_head(head: &[u8]) -> Result<Option<(u16, String)>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head)? {
        httparse::Status::Complete(_) => Ok(response
            .code
            .map(|code| (code, response.reason.unwrap_or_default().to_string()))),
        httparse::Status::Partial => Ok(None),
    }
}
