use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bytes requested from the transport per read.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_BACKLOG: i32 = 128;

pub const DEFAULT_MODEL_PATH: &str = "enclave/bloom";

pub const DEFAULT_MAX_LENGTH: usize = 100;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    connect_timeout: Duration,
    chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds connection establishment only; reads and writes never time out.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    port: u32,
    backlog: i32,
    chunk_size: usize,
    model_path: PathBuf,
    max_length: usize,
}

impl ServerConfig {
    pub fn new(port: u32) -> Self {
        Self {
            port,
            backlog: DEFAULT_BACKLOG,
            chunk_size: DEFAULT_CHUNK_SIZE,
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            max_length: DEFAULT_MAX_LENGTH,
        }
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn with_model_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.model_path = path.into();
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn backlog(&self) -> i32 {
        self.backlog
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_constants() {
        let client = ClientConfig::new();
        assert_eq!(client.connect_timeout(), Duration::from_secs(5));
        assert_eq!(client.chunk_size(), 1024);

        let server = ServerConfig::new(5005);
        assert_eq!(server.port(), 5005);
        assert_eq!(server.backlog(), 128);
        assert_eq!(server.model_path(), Path::new("enclave/bloom"));
        assert_eq!(server.max_length(), 100);
    }

    #[test]
    fn zero_chunk_size_is_clamped() {
        assert_eq!(ClientConfig::new().with_chunk_size(0).chunk_size(), 1);
        assert_eq!(ServerConfig::new(1).with_chunk_size(0).chunk_size(), 1);
    }
}
