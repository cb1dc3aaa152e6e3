//! Frame transports: an in-memory loopback pair for tests and local
//! replication, and a length-delimited framing over any async byte stream
//! (the TCP binding; a WebSocket binding carries frames as binary messages
//! under the `BLIP_3` subprotocol).

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rivetdb_core::error::{NetworkError, Result, RivetError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// A bidirectional, ordered, frame-preserving byte channel.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()>;
    /// The next incoming frame, or `None` once the peer has closed.
    async fn receive(&mut self) -> Result<Option<Vec<u8>>>;
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        (**self).send(frame).await
    }

    async fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        (**self).receive().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}

// ---------------------------------------------------------------------------
// Loopback
// ---------------------------------------------------------------------------

/// One end of an in-memory transport pair.
pub struct LoopbackTransport {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Creates a connected pair of in-memory transports.
pub fn loopback() -> (LoopbackTransport, LoopbackTransport) {
    let (tx_a, rx_b) = mpsc::channel(64);
    let (tx_b, rx_a) = mpsc::channel(64);
    (
        LoopbackTransport {
            tx: Some(tx_a),
            rx: rx_a,
        },
        LoopbackTransport {
            tx: Some(tx_b),
            rx: rx_b,
        },
    )
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| RivetError::Network(NetworkError::ConnectionReset("closed".into())))?;
        tx.send(frame)
            .await
            .map_err(|_| RivetError::Network(NetworkError::ConnectionReset("peer gone".into())))
    }

    async fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Length-delimited stream framing
// ---------------------------------------------------------------------------

/// BLIP frames over any `AsyncRead + AsyncWrite` stream, each frame
/// preceded by a 4-byte big-endian length.
pub struct StreamTransport<S> {
    framed: Framed<S, LengthDelimitedCodec>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> StreamTransport<S> {
    pub fn new(stream: S) -> StreamTransport<S> {
        StreamTransport {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> Transport for StreamTransport<S> {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        self.framed
            .send(Bytes::from(frame))
            .await
            .map_err(|e| RivetError::Network(NetworkError::ConnectionReset(e.to_string())))
    }

    async fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        match self.framed.next().await {
            Some(Ok(bytes)) => Ok(Some(bytes.to_vec())),
            Some(Err(e)) => Err(RivetError::Network(NetworkError::ConnectionReset(
                e.to_string(),
            ))),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        SinkExt::<Bytes>::close(&mut self.framed)
            .await
            .map_err(|e| RivetError::Network(NetworkError::ConnectionReset(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_delivers_in_order() {
        let (mut a, mut b) = loopback();
        a.send(vec![1]).await.unwrap();
        a.send(vec![2, 3]).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), Some(vec![1]));
        assert_eq!(b.receive().await.unwrap(), Some(vec![2, 3]));

        a.close().await.unwrap();
        assert_eq!(b.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_transport_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut a = StreamTransport::new(client);
        let mut b = StreamTransport::new(server);

        a.send(b"hello frames".to_vec()).await.unwrap();
        a.send(vec![0u8; 1000]).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), Some(b"hello frames".to_vec()));
        assert_eq!(b.receive().await.unwrap(), Some(vec![0u8; 1000]));
    }
}
