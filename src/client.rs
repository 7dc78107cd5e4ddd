use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::errors::VsockError;
use crate::transport::vsock::VsockStream;
use crate::transport::{Endpoint, IoStream};

/// Opens client connections. Each call yields one independent connection;
/// nothing is retried.
#[derive(Debug, Clone, Default)]
pub struct Connector {
    config: ClientConfig,
}

impl Connector {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Opens an AF_VSOCK connection to `endpoint`.
    pub async fn connect(&self, endpoint: Endpoint) -> Result<Connection, VsockError> {
        let chunk_size = self.config.chunk_size();
        let stream = connect_with(
            endpoint,
            self.config.connect_timeout(),
            VsockStream::connect(endpoint),
        )
        .await?;
        info!(%endpoint, "connected");
        Ok(Connection::new(
            Box::new(IoStream::with_chunk_size(stream, chunk_size)),
            endpoint,
        ))
    }
}

/// Awaits `establish` for at most `timeout`. The timeout covers connection
/// establishment only; the returned stream has none.
pub async fn connect_with<S, F>(endpoint: Endpoint, timeout: Duration, establish: F) -> Result<S, VsockError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    F: Future<Output = io::Result<S>>,
{
    match tokio::time::timeout(timeout, establish).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) if err.kind() == io::ErrorKind::TimedOut => {
            debug!(%endpoint, "transport reported a connect timeout");
            Err(VsockError::Timeout(timeout))
        }
        Ok(Err(err)) => Err(VsockError::ConnectionError(format!("{endpoint}: {err}"))),
        Err(_elapsed) => Err(VsockError::Timeout(timeout)),
    }
}

/// Best-effort incremental UTF-8 decoding of reply chunks.
///
/// A multi-byte character split across two chunks is held back until its
/// remaining bytes arrive; invalid sequences become U+FFFD instead of
/// failing the reply.
#[derive(Debug, Default)]
pub struct ReplyDecoder {
    pending: Vec<u8>,
}

impl ReplyDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Truncated sequence: wait for the next chunk.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let keep = rest.len();
        let drained = self.pending.len() - keep;
        self.pending.drain(..drained);
        out
    }

    /// Flushes a dangling partial character at end-of-stream.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}
