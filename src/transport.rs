//! Byte transport seam
//!
//! A [`Transport`] moves raw bytes; it knows nothing about frames. Whatever
//! it receives, and any change in its health, is pushed to the connection as
//! a [`TransportEvent`] over the channel handed to [`Transport::connect`].
//!
//! [`TcpTransport`] is a plain-TCP implementation for `ws://` URLs. TLS
//! transports are supplied by the application.

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::RECV_BUFFER_SIZE;
use crate::handshake::ClientRequest;

/// Notification from a transport to its connection
#[derive(Debug)]
pub enum TransportEvent {
    /// Bytes arrived, in order
    Received(Bytes),
    /// The network path became viable (`true`) or not (`false`)
    Viability(bool),
    /// A better network path is (or is no longer) available
    BetterPath(bool),
    /// The peer closed the stream cleanly
    Closed,
    /// The stream failed
    Failed(io::Error),
}

/// Bidirectional byte stream underneath a WebSocket connection
#[async_trait]
pub trait Transport: Send + 'static {
    /// Open the stream to `request`'s host. Once this returns `Ok`, events
    /// for the stream flow on `events` until `Closed` or `Failed`.
    async fn connect(
        &mut self,
        request: &ClientRequest,
        events: mpsc::Sender<TransportEvent>,
    ) -> io::Result<()>;

    /// Write all of `data`
    async fn write(&mut self, data: Bytes) -> io::Result<()>;

    /// Tear the stream down. No events are delivered afterwards.
    async fn disconnect(&mut self);

    /// DER certificates presented by the peer, for pinning
    fn peer_certificates(&self) -> Option<Vec<Bytes>> {
        None
    }
}

/// Plain TCP transport
#[derive(Debug, Default)]
pub struct TcpTransport {
    writer: Option<OwnedWriteHalf>,
    reader: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Create an unconnected transport
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(
        &mut self,
        request: &ClientRequest,
        events: mpsc::Sender<TransportEvent>,
    ) -> io::Result<()> {
        if request.secure {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TcpTransport does not speak TLS",
            ));
        }

        let stream = TcpStream::connect((request.host.as_str(), request.port)).await?;
        stream.set_nodelay(true)?;
        debug!(host = %request.host, port = request.port, "tcp connected");

        let (mut read_half, write_half) = stream.into_split();
        self.writer = Some(write_half);
        self.reader = Some(tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
            loop {
                let event = match read_half.read_buf(&mut buf).await {
                    Ok(0) => TransportEvent::Closed,
                    Ok(n) => {
                        trace!(bytes = n, "tcp read");
                        TransportEvent::Received(buf.split().freeze())
                    }
                    Err(e) => TransportEvent::Failed(e),
                };
                let last = !matches!(event, TransportEvent::Received(_));
                if events.send(event).await.is_err() || last {
                    break;
                }
                buf.reserve(RECV_BUFFER_SIZE);
            }
        }));
        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        writer.write_all(&data).await
    }

    async fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            // peer may already be gone
            let _ = writer.shutdown().await;
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let request = ClientRequest::parse(&format!("ws://127.0.0.1:{}/", port)).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let mut transport = TcpTransport::new();
        transport.connect(&request, tx).await.unwrap();
        transport.write(Bytes::from_static(b"ping")).await.unwrap();

        let mut echoed = Vec::new();
        while echoed.len() < 4 {
            match rx.recv().await.unwrap() {
                TransportEvent::Received(bytes) => echoed.extend_from_slice(&bytes),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(echoed, b"ping");

        server.await.unwrap();
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed)));
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_tls_refused() {
        let request = ClientRequest::parse("wss://127.0.0.1:1/").unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let err = TcpTransport::new().connect(&request, tx).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
