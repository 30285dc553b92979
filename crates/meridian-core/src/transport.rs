//! Byte-stream conduit underneath a pipeline.
//!
//! A [`Connector`] is the channel supplier run once per physical
//! connect; bootstrap steps such as an auth handshake live inside
//! connector implementations, not in the endpoint.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::error::EndpointError;

/// A bidirectional byte conduit between the client and one remote
/// service socket.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {}

/// Supplies a fresh channel for every connect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a channel to the remote. One call per attempt; the
    /// endpoint applies its own per-attempt deadline around it.
    async fn connect(&self) -> Result<Box<dyn Channel>, EndpointError>;
}

/// TCP channel for bidirectional communication.
#[derive(Debug)]
pub struct TcpChannel {
    inner: TcpStream,
}

impl TcpChannel {
    /// Connects to the given address.
    pub async fn connect(addr: SocketAddr) -> Result<Self, EndpointError> {
        let inner = TcpStream::connect(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                EndpointError::ConnectFailed(format!("connection refused: {addr}"))
            } else {
                EndpointError::Io(e)
            }
        })?;
        Ok(Self { inner })
    }
}

impl Channel for TcpChannel {}

impl AsyncRead for TcpChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Connector that dials a remote host and port over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    /// Creates a connector after validating the target.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, EndpointError> {
        let host = host.into();
        if host.is_empty() {
            return Err(EndpointError::Configuration(
                "remote host must not be empty".into(),
            ));
        }
        if port == 0 {
            return Err(EndpointError::Configuration(
                "remote port must not be zero".into(),
            ));
        }
        Ok(Self { host, port })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Channel>, EndpointError> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| EndpointError::ConnectFailed(format!("resolve {}: {e}", self.host)))?;
        let addr = addrs.next().ok_or_else(|| {
            EndpointError::ConnectFailed(format!("no addresses for {}", self.host))
        })?;
        Ok(Box::new(TcpChannel::connect(addr).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn rejects_invalid_targets() {
        assert!(matches!(
            TcpConnector::new("", 11210),
            Err(EndpointError::Configuration(_))
        ));
        assert!(matches!(
            TcpConnector::new("127.0.0.1", 0),
            Err(EndpointError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn tcp_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let connector = TcpConnector::new(addr.ip().to_string(), addr.port()).unwrap();
        let mut channel = connector.connect().await.unwrap();
        channel.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_maps_to_connect_failed() {
        // Bind then drop to learn a port that is very likely closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpChannel::connect(addr).await.unwrap_err();
        assert!(matches!(
            err,
            EndpointError::ConnectFailed(_) | EndpointError::Io(_)
        ));
    }
}
