use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use tracing::{debug, warn};

use crate::errors::VsockError;
use crate::transport::{Accepted, Endpoint, StreamAdapter};

/// An open byte stream owned by exactly one side of the exchange.
///
/// The request and the reply are each delimited only by end-of-stream: the
/// client half-closes after writing its request, the server closes after
/// writing its reply. No length prefix is ever written.
pub struct Connection {
    stream: Option<Box<dyn StreamAdapter>>,
    peer: Endpoint,
    write_shut: bool,
}

impl Connection {
    pub fn new(stream: Box<dyn StreamAdapter>, peer: Endpoint) -> Self {
        Self {
            stream: Some(stream),
            peer,
            write_shut: false,
        }
    }

    pub fn peer(&self) -> Endpoint {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn stream_mut(&mut self) -> Result<&mut Box<dyn StreamAdapter>, VsockError> {
        self.stream.as_mut().ok_or(VsockError::Closed)
    }

    /// Writes every byte of `data` without touching the write direction.
    pub async fn write_all(&mut self, data: Bytes) -> Result<(), VsockError> {
        if self.write_shut {
            return Err(VsockError::WriteError("write side already shut down".to_string()));
        }
        let len = data.len();
        self.stream_mut()?.send_bytes(data).await?;
        debug!(peer = %self.peer, bytes = len, "wrote payload");
        Ok(())
    }

    /// Half-closes the write direction; the read direction stays open.
    pub async fn shutdown_write(&mut self) -> Result<(), VsockError> {
        if self.write_shut {
            return Ok(());
        }
        self.stream_mut()?.shutdown_write().await?;
        self.write_shut = true;
        Ok(())
    }

    /// Client side: writes the whole request and then half-closes so the
    /// peer's drain observes end-of-stream.
    pub async fn send_request(&mut self, payload: impl Into<Bytes>) -> Result<(), VsockError> {
        self.write_all(payload.into()).await?;
        self.shutdown_write().await
    }

    /// Client side: yields reply chunks as they arrive until the peer closes.
    ///
    /// The sequence is finite and cannot be restarted; transport errors end
    /// it with an `Err` item.
    pub fn receive_reply(&mut self) -> impl Stream<Item = Result<Bytes, VsockError>> + Send + '_ {
        let peer = self.peer;
        async_stream::try_stream! {
            let stream = self.stream.as_mut().ok_or(VsockError::Closed)?;
            while let Some(chunk) = stream.receive_bytes().await? {
                debug!(%peer, bytes = chunk.len(), "reply chunk");
                yield chunk;
            }
            debug!(%peer, "reply complete");
        }
    }

    /// Server side: reads until end-of-stream and returns everything received.
    ///
    /// A read failure counts as end-of-stream: a client that disconnects
    /// early yields whatever arrived before, possibly nothing.
    pub async fn drain_request(&mut self) -> Bytes {
        let peer = self.peer;
        let Some(stream) = self.stream.as_mut() else {
            return Bytes::new();
        };
        let mut request = BytesMut::new();
        loop {
            match stream.receive_bytes().await {
                Ok(Some(chunk)) => request.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(err) => {
                    warn!(%peer, error = %err, received = request.len(), "read failed, treating as end of request");
                    break;
                }
            }
        }
        request.freeze()
    }

    /// Releases the connection. Safe to call any number of times.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.close().await {
                debug!(peer = %self.peer, error = %err, "close reported an error");
            }
        }
    }
}

impl From<Accepted> for Connection {
    fn from(accepted: Accepted) -> Self {
        Self::new(accepted.stream, accepted.peer)
    }
}
