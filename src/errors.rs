use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::generation::GenerationError;

// Transport and lifecycle error types
#[derive(Debug, Error)]
pub enum VsockError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Bind error: {0}")]
    BindError(String),

    #[error("Accept error: {0}")]
    AcceptError(#[source] io::Error),

    #[error("Read error: {0}")]
    ReadError(String),

    #[error("Write error: {0}")]
    WriteError(String),

    #[error("Connection closed")]
    Closed,

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl VsockError {
    /// Whether an accept failure only concerns the pending connection (or a
    /// momentary resource shortage) and the listener may keep accepting.
    pub fn is_transient(&self) -> bool {
        match self {
            VsockError::AcceptError(err) => is_transient_accept_error(err),
            _ => false,
        }
    }

    /// Accept failures caused by running out of descriptors or buffers.
    pub(crate) fn is_resource_exhaustion(&self) -> bool {
        match self {
            VsockError::AcceptError(err) => matches!(
                err.raw_os_error(),
                Some(code) if RESOURCE_ERRNOS.contains(&code)
            ),
            _ => false,
        }
    }
}

const RESOURCE_ERRNOS: [i32; 4] = [
    nix::libc::EMFILE,
    nix::libc::ENFILE,
    nix::libc::ENOBUFS,
    nix::libc::ENOMEM,
];

fn is_transient_accept_error(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => true,
        _ => matches!(
            err.raw_os_error(),
            Some(code) if RESOURCE_ERRNOS.contains(&code) || code == nix::libc::EPROTO
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_and_exhausted_accepts_are_transient() {
        let aborted = VsockError::AcceptError(io::Error::from(io::ErrorKind::ConnectionAborted));
        assert!(aborted.is_transient());
        assert!(!aborted.is_resource_exhaustion());

        let emfile = VsockError::AcceptError(io::Error::from_raw_os_error(nix::libc::EMFILE));
        assert!(emfile.is_transient());
        assert!(emfile.is_resource_exhaustion());
    }

    #[test]
    fn bad_descriptor_is_fatal() {
        let ebadf = VsockError::AcceptError(io::Error::from_raw_os_error(nix::libc::EBADF));
        assert!(!ebadf.is_transient());
        assert!(!VsockError::Closed.is_transient());
    }

    #[test]
    fn timeout_message_names_duration() {
        let err = VsockError::Timeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "Connection timed out after 5s");
    }
}
