//! Broker dialers. Every transport ends up as a byte stream, except
//! WebSocket which keeps its framing and is unwrapped by the packet reader.

pub mod packet_io;

pub use packet_io::{PacketReader, PacketWriter};

use mqttkit_protocol::{MqttError, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::WebSocketStream;
use url::Url;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

const TCP_SCHEMES: [&str; 2] = ["tcp", "mqtt"];
const TLS_SCHEMES: [&str; 4] = ["ssl", "tls", "tcps", "mqtts"];

pub const DEFAULT_TCP_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

pub(crate) fn is_supported_scheme(scheme: &str) -> bool {
    TCP_SCHEMES.contains(&scheme)
        || TLS_SCHEMES.contains(&scheme)
        || matches!(scheme, "ws" | "wss" | "unix")
}

/// Port used when the broker URI does not name one.
#[must_use]
pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        s if TCP_SCHEMES.contains(&s) => Some(DEFAULT_TCP_PORT),
        s if TLS_SCHEMES.contains(&s) => Some(DEFAULT_TLS_PORT),
        "ws" => Some(80),
        "wss" => Some(443),
        _ => None,
    }
}

/// An open connection to a broker, before it is split for the I/O tasks.
pub enum Connection {
    Stream(BoxedStream),
    WebSocket(Box<WebSocketStream<BoxedStream>>),
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("Connection::Stream"),
            Self::WebSocket(_) => f.write_str("Connection::WebSocket"),
        }
    }
}

impl From<BoxedStream> for Connection {
    fn from(stream: BoxedStream) -> Self {
        Self::Stream(stream)
    }
}

fn host(url: &Url) -> Result<&str> {
    url.host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .filter(|h| !h.is_empty())
        .ok_or_else(|| MqttError::Configuration(format!("broker URI {url} has no host")))
}

async fn dial_tcp(url: &Url) -> Result<TcpStream> {
    let host = host(url)?;
    let port = url
        .port()
        .or_else(|| default_port(url.scheme()))
        .ok_or_else(|| MqttError::Configuration(format!("broker URI {url} has no port")))?;
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| MqttError::ConnectionError(format!("{host}:{port}: {e}")))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn wrap_tls(
    url: &Url,
    stream: TcpStream,
    tls_config: Option<Arc<rustls::ClientConfig>>,
) -> Result<BoxedStream> {
    let config = tls_config.ok_or_else(|| {
        MqttError::Configuration(format!("{url} requires a TLS client configuration"))
    })?;
    let server_name = rustls::pki_types::ServerName::try_from(host(url)?.to_string())
        .map_err(|e| MqttError::Tls(format!("invalid server name: {e}")))?;
    let stream = tokio_rustls::TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| MqttError::Tls(e.to_string()))?;
    Ok(Box::new(stream))
}

async fn upgrade_websocket(url: &Url, stream: BoxedStream) -> Result<Connection> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| MqttError::Configuration(format!("invalid WebSocket URI {url}: {e}")))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));
    let (ws, _response) = tokio_tungstenite::client_async(request, stream)
        .await
        .map_err(|e| MqttError::ConnectionError(format!("WebSocket handshake failed: {e}")))?;
    Ok(Connection::WebSocket(Box::new(ws)))
}

#[cfg(unix)]
async fn dial_unix(url: &Url) -> Result<BoxedStream> {
    let path = url.path();
    let stream = tokio::net::UnixStream::connect(path)
        .await
        .map_err(|e| MqttError::ConnectionError(format!("{path}: {e}")))?;
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn dial_unix(url: &Url) -> Result<BoxedStream> {
    Err(MqttError::Configuration(format!(
        "{url}: unix sockets are not available on this platform"
    )))
}

/// Opens a connection with the dialer matching the URI scheme.
pub async fn dial(url: &Url, tls_config: Option<Arc<rustls::ClientConfig>>) -> Result<Connection> {
    let scheme = url.scheme();
    tracing::debug!(broker = %url, "Dialing broker");
    match scheme {
        s if TCP_SCHEMES.contains(&s) => {
            let stream: BoxedStream = Box::new(dial_tcp(url).await?);
            Ok(stream.into())
        }
        s if TLS_SCHEMES.contains(&s) => {
            let tcp = dial_tcp(url).await?;
            Ok(wrap_tls(url, tcp, tls_config).await?.into())
        }
        "ws" => {
            let stream: BoxedStream = Box::new(dial_tcp(url).await?);
            upgrade_websocket(url, stream).await
        }
        "wss" => {
            let tcp = dial_tcp(url).await?;
            let stream = wrap_tls(url, tcp, tls_config).await?;
            upgrade_websocket(url, stream).await
        }
        "unix" => Ok(dial_unix(url).await?.into()),
        other => Err(MqttError::Configuration(format!(
            "unsupported broker scheme {other:?}"
        ))),
    }
}
