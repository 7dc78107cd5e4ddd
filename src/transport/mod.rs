//! Byte-stream transports underneath [`Connection`](crate::Connection).
//!
//! The protocol only needs four primitives from a transport: write every
//! byte, read one chunk (with end-of-stream reported as `None`), half-close
//! the write direction and release the stream. [`StreamAdapter`] captures
//! those; [`Acceptor`] is the listening half.

use std::fmt;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::config::DEFAULT_CHUNK_SIZE;
use crate::errors::VsockError;

pub mod vsock;

/// One side of a virtual-socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    cid: u32,
    port: u32,
}

impl Endpoint {
    /// Reserved for the hypervisor.
    pub const CID_HYPERVISOR: u32 = 0;
    pub const CID_LOCAL: u32 = 1;
    /// The host, as seen from a guest or enclave.
    pub const CID_HOST: u32 = 2;
    /// Wildcard used when binding.
    pub const CID_ANY: u32 = u32::MAX;

    pub const fn new(cid: u32, port: u32) -> Self {
        Self { cid, port }
    }

    pub const fn any(port: u32) -> Self {
        Self::new(Self::CID_ANY, port)
    }

    pub const fn cid(&self) -> u32 {
        self.cid
    }

    pub const fn port(&self) -> u32 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cid, self.port)
    }
}

#[async_trait]
pub trait StreamAdapter: Send {
    /// Writes every byte of `data` or fails.
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), VsockError>;

    /// Reads the next available chunk. `Ok(None)` is end-of-stream.
    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, VsockError>;

    /// Shuts down the write direction only.
    async fn shutdown_write(&mut self) -> Result<(), VsockError>;

    /// Releases the stream. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), VsockError>;
}

#[async_trait]
impl<T> StreamAdapter for Box<T>
where
    T: StreamAdapter + ?Sized,
{
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), VsockError> {
        (**self).send_bytes(data).await
    }

    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, VsockError> {
        (**self).receive_bytes().await
    }

    async fn shutdown_write(&mut self) -> Result<(), VsockError> {
        (**self).shutdown_write().await
    }

    async fn close(&mut self) -> Result<(), VsockError> {
        (**self).close().await
    }
}

/// Adapts any tokio byte stream (vsock, TCP, in-memory duplex) to
/// [`StreamAdapter`].
pub struct IoStream<S> {
    inner: Option<S>,
    chunk_size: usize,
}

impl<S> IoStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(inner: S) -> Self {
        Self::with_chunk_size(inner, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(inner: S, chunk_size: usize) -> Self {
        Self {
            inner: Some(inner),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    fn inner_mut(&mut self) -> Result<&mut S, VsockError> {
        self.inner.as_mut().ok_or(VsockError::Closed)
    }
}

#[async_trait]
impl<S> StreamAdapter for IoStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), VsockError> {
        let inner = self.inner_mut()?;
        inner
            .write_all(&data)
            .await
            .map_err(|e| VsockError::WriteError(e.to_string()))?;
        inner
            .flush()
            .await
            .map_err(|e| VsockError::WriteError(e.to_string()))
    }

    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, VsockError> {
        let chunk_size = self.chunk_size;
        let inner = self.inner_mut()?;
        let mut buf = BytesMut::zeroed(chunk_size);
        let n = inner
            .read(&mut buf)
            .await
            .map_err(|e| VsockError::ReadError(e.to_string()))?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf.freeze()))
    }

    async fn shutdown_write(&mut self) -> Result<(), VsockError> {
        self.inner_mut()?
            .shutdown()
            .await
            .map_err(|e| VsockError::WriteError(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), VsockError> {
        if let Some(mut inner) = self.inner.take() {
            // The peer may already be gone; dropping the stream still releases it.
            let _ = inner.shutdown().await;
        }
        Ok(())
    }
}

/// A connection handed to the listener by an [`Acceptor`].
pub struct Accepted {
    pub stream: Box<dyn StreamAdapter>,
    pub peer: Endpoint,
}

impl Accepted {
    pub fn new(stream: Box<dyn StreamAdapter>, peer: Endpoint) -> Self {
        Self { stream, peer }
    }
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted").field("peer", &self.peer).finish()
    }
}

#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Waits for the next connection. `Ok(None)` means no more connections
    /// will ever arrive.
    async fn accept(&mut self) -> Result<Option<Accepted>, VsockError>;
}

/// Acceptor fed from a channel, for connections produced elsewhere (a
/// hypervisor API that hands out connected descriptors, or tests).
pub struct ChannelAcceptor {
    receiver: mpsc::Receiver<Accepted>,
}

impl ChannelAcceptor {
    pub fn new(receiver: mpsc::Receiver<Accepted>) -> Self {
        Self { receiver }
    }

    pub fn channel(buffer: usize) -> (mpsc::Sender<Accepted>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl Acceptor for ChannelAcceptor {
    async fn accept(&mut self) -> Result<Option<Accepted>, VsockError> {
        Ok(self.receiver.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_display_and_wildcard() {
        let endpoint = Endpoint::new(16, 5005);
        assert_eq!(endpoint.to_string(), "16:5005");
        assert_eq!(Endpoint::any(5005).cid(), u32::MAX);
        assert_eq!(Endpoint::any(5005).port(), 5005);
    }

    #[tokio::test]
    async fn io_stream_reads_in_bounded_chunks_until_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = IoStream::with_chunk_size(client, 4);

        server.write_all(b"abcdefghij").await.unwrap();
        server.shutdown().await.unwrap();

        let mut collected = Vec::new();
        while let Some(chunk) = stream.receive_bytes().await.unwrap() {
            assert!(chunk.len() <= 4);
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"abcdefghij");
    }

    #[tokio::test]
    async fn io_stream_half_close_is_seen_by_peer() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = IoStream::new(client);

        stream.send_bytes(Bytes::from_static(b"ping")).await.unwrap();
        stream.shutdown_write().await.unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");

        // Read direction stays open after the half-close.
        server.write_all(b"pong").await.unwrap();
        drop(server);
        assert_eq!(
            stream.receive_bytes().await.unwrap(),
            Some(Bytes::from_static(b"pong"))
        );
        assert_eq!(stream.receive_bytes().await.unwrap(), None);
    }

    #[tokio::test]
    async fn io_stream_close_is_idempotent() {
        let (client, _server) = tokio::io::duplex(64);
        let mut stream = IoStream::new(client);

        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert!(stream.is_closed());
        assert!(matches!(
            stream.send_bytes(Bytes::from_static(b"late")).await,
            Err(VsockError::Closed)
        ));
    }

    #[tokio::test]
    async fn channel_acceptor_ends_when_senders_drop() {
        let (tx, mut acceptor) = ChannelAcceptor::channel(1);
        let (client, _server) = tokio::io::duplex(8);
        tx.send(Accepted::new(Box::new(IoStream::new(client)), Endpoint::new(3, 99)))
            .await
            .unwrap();
        drop(tx);

        let accepted = acceptor.accept().await.unwrap().expect("one connection");
        assert_eq!(accepted.peer, Endpoint::new(3, 99));
        assert!(acceptor.accept().await.unwrap().is_none());
    }
}
