//! Stream transport to the remote process and its length-prefixed framing.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Any bidirectional byte stream the session can run over.
pub trait RemoteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RemoteStream for T {}

/// A connected stream with 4-byte big-endian length framing applied.
pub type FramedTransport = Framed<Box<dyn RemoteStream>, LengthDelimitedCodec>;

/// Opens raw streams to the remote process.
///
/// The connection manager owns retries, timeouts and framing; a connector
/// only makes a single attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns the I/O error of the failed attempt.
    async fn connect(&self) -> io::Result<Box<dyn RemoteStream>>;

    /// Human-readable endpoint description for logs and error context.
    fn endpoint(&self) -> String;
}

/// Wraps `stream` in the wire framing.
#[must_use]
pub fn frame(stream: Box<dyn RemoteStream>, max_frame_len: usize) -> FramedTransport {
    let codec = LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_len)
        .new_codec();
    Framed::new(stream, codec)
}

// ---------------------------------------------------------------------------
// TcpConnector
// ---------------------------------------------------------------------------

/// Connects over TCP with `TCP_NODELAY` set.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<Box<dyn RemoteStream>> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        self.addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn frames_are_length_prefixed_big_endian() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut framed = frame(Box::new(client), 1024);
        framed.send(Bytes::from_static(b"{}")).await.unwrap();

        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0, 0, 0, 2, b'{', b'}']);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (client, server) = tokio::io::duplex(1024);
        let mut sender = frame(Box::new(client), 1024);
        let mut receiver = frame(Box::new(server), 4);

        sender.send(Bytes::from_static(b"too large")).await.unwrap();
        let err = receiver.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn tcp_connector_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let connector = TcpConnector::new(addr.clone());
        assert_eq!(connector.endpoint(), addr);
        connector.connect().await.unwrap();
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tcp_connector_reports_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(TcpConnector::new(addr).connect().await.is_err());
    }
}
