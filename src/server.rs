use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::errors::VsockError;
use crate::generation::Generator;
use crate::transport::vsock::VsockListener;
use crate::transport::{Acceptor, Endpoint};

/// Pause before accepting again after descriptor or memory exhaustion.
const EXHAUSTION_BACKOFF: Duration = Duration::from_millis(100);

/// Per-connection lifecycle. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Accepted,
    Draining,
    Generating,
    Replying,
    Closed,
}

/// How a single connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Replied { request_bytes: usize, reply_bytes: usize },
    /// Empty request or no generator: closed without writing.
    NoReply { request_bytes: usize },
    /// Generator error: closed without writing.
    GenerationFailed { request_bytes: usize },
    WriteFailed { request_bytes: usize, reply_bytes: usize },
}

struct Tracked {
    conn: Connection,
    state: ConnectionState,
}

impl Tracked {
    fn new(conn: Connection) -> Self {
        Self {
            conn,
            state: ConnectionState::Accepted,
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        debug!(peer = %self.conn.peer(), from = ?self.state, to = ?next, "connection state");
        self.state = next;
    }

    async fn close(&mut self) {
        self.conn.close().await;
        self.advance(ConnectionState::Closed);
    }
}

/// Sequential request/response listener.
///
/// Connections are handled one at a time: drain, generate, reply, close,
/// and only then accept the next. The generator is therefore never called
/// concurrently and needs no locking.
pub struct Listener {
    acceptor: Box<dyn Acceptor>,
    generator: Option<Arc<dyn Generator>>,
}

impl Listener {
    pub fn new(acceptor: Box<dyn Acceptor>, generator: Option<Arc<dyn Generator>>) -> Self {
        Self {
            acceptor,
            generator,
        }
    }

    /// Binds the wildcard CID on the configured port.
    pub fn bind(
        config: &ServerConfig,
        generator: Option<Arc<dyn Generator>>,
    ) -> Result<Self, VsockError> {
        let listener = VsockListener::bind(config.port(), config.backlog())
            .map_err(|e| VsockError::BindError(format!("port {}: {}", config.port(), e)))?
            .with_chunk_size(config.chunk_size());
        info!(
            endpoint = %Endpoint::any(config.port()),
            backlog = config.backlog(),
            "listening"
        );
        Ok(Self::new(Box::new(listener), generator))
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    /// Runs the accept loop until the acceptor is exhausted (`Ok`) or fails
    /// in a way that is not transient (`Err`).
    pub async fn serve(&mut self) -> Result<(), VsockError> {
        while let Some(conn) = self.next_connection().await? {
            let outcome = self.handle_connection(conn).await;
            debug!(?outcome, "connection finished");
        }
        info!("acceptor closed, listener stopping");
        Ok(())
    }

    /// Writes `data` to every accepted connection and closes it, ignoring
    /// whatever the peer sends.
    pub async fn send_data(&mut self, data: Bytes) -> Result<(), VsockError> {
        while let Some(mut conn) = self.next_connection().await? {
            if let Err(err) = conn.write_all(data.clone()).await {
                warn!(peer = %conn.peer(), error = %err, "failed to send data");
            }
            conn.close().await;
        }
        Ok(())
    }

    async fn next_connection(&mut self) -> Result<Option<Connection>, VsockError> {
        loop {
            match self.acceptor.accept().await {
                Ok(Some(accepted)) => {
                    info!(
                        remote_cid = accepted.peer.cid(),
                        remote_port = accepted.peer.port(),
                        "accepted connection"
                    );
                    return Ok(Some(Connection::from(accepted)));
                }
                Ok(None) => return Ok(None),
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "transient accept failure");
                    if err.is_resource_exhaustion() {
                        tokio::time::sleep(EXHAUSTION_BACKOFF).await;
                    }
                }
                Err(err) => {
                    error!(error = %err, "accept failed");
                    return Err(err);
                }
            }
        }
    }

    /// Serves one connection to completion. The connection is closed on
    /// every path.
    pub async fn handle_connection(&self, conn: Connection) -> ConnectionOutcome {
        let mut tracked = Tracked::new(conn);

        tracked.advance(ConnectionState::Draining);
        let request = tracked.conn.drain_request().await;
        let request_bytes = request.len();
        debug!(peer = %tracked.conn.peer(), request_bytes, "request drained");

        let generator = match &self.generator {
            Some(generator) if !request.is_empty() => generator,
            _ => {
                tracked.advance(ConnectionState::Replying);
                tracked.close().await;
                return ConnectionOutcome::NoReply { request_bytes };
            }
        };

        tracked.advance(ConnectionState::Generating);
        let prompt = String::from_utf8_lossy(&request);
        let reply = match generator.generate(&prompt).await {
            Ok(reply) => reply,
            Err(err) => {
                error!(peer = %tracked.conn.peer(), error = %err, "generation failed, dropping connection");
                tracked.close().await;
                return ConnectionOutcome::GenerationFailed { request_bytes };
            }
        };

        tracked.advance(ConnectionState::Replying);
        let reply_bytes = reply.len();
        let write = tracked.conn.write_all(Bytes::from(reply)).await;
        tracked.close().await;

        match write {
            Ok(()) => {
                info!(request_bytes, reply_bytes, "replied");
                ConnectionOutcome::Replied {
                    request_bytes,
                    reply_bytes,
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to write reply");
                ConnectionOutcome::WriteFailed {
                    request_bytes,
                    reply_bytes,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::{MockStream, Op};
    use crate::generation::GenerationError;
    use crate::transport::Accepted;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;
    use tokio::sync::Mutex;

    struct UppercaseGenerator {
        prompts: Mutex<Vec<String>>,
    }

    impl UppercaseGenerator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Generator for UppercaseGenerator {
        async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
            self.prompts.lock().await.push(prompt.to_string());
            Ok(prompt.to_uppercase())
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl Generator for FailingGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
            Err(GenerationError::Failed {
                status: "exit status: 1".to_string(),
                stderr: "out of memory".to_string(),
            })
        }
    }

    struct MockAcceptor {
        plan: VecDeque<Result<Option<MockStream>, VsockError>>,
    }

    impl MockAcceptor {
        fn new(plan: Vec<Result<Option<MockStream>, VsockError>>) -> Self {
            Self { plan: plan.into() }
        }
    }

    #[async_trait]
    impl Acceptor for MockAcceptor {
        async fn accept(&mut self) -> Result<Option<Accepted>, VsockError> {
            match self.plan.pop_front() {
                Some(Ok(Some(stream))) => Ok(Some(Accepted::new(Box::new(stream), Endpoint::new(7, 1234)))),
                Some(Ok(None)) | None => Ok(None),
                Some(Err(err)) => Err(err),
            }
        }
    }

    fn listener(plan: Vec<Result<Option<MockStream>, VsockError>>, generator: Option<Arc<dyn Generator>>) -> Listener {
        Listener::new(Box::new(MockAcceptor::new(plan)), generator)
    }

    #[tokio::test]
    async fn reply_is_written_only_after_end_of_stream() {
        let stream = MockStream::request(&[b"hello ", b"there"]);
        let mut server = listener(vec![Ok(Some(stream.clone()))], Some(UppercaseGenerator::new()));

        server.serve().await.unwrap();

        let ops = stream.state.lock().await.ops.clone();
        assert_eq!(
            ops,
            vec![
                Op::Read(6),
                Op::Read(5),
                Op::Eof,
                Op::Write(b"HELLO THERE".to_vec()),
                Op::Close,
            ]
        );
    }

    #[tokio::test]
    async fn empty_request_gets_no_reply() {
        let stream = MockStream::request(&[]);
        let generator = UppercaseGenerator::new();
        let server = listener(vec![], Some(generator.clone()));

        let outcome = server
            .handle_connection(Connection::new(Box::new(stream.clone()), Endpoint::new(7, 1)))
            .await;

        assert_eq!(outcome, ConnectionOutcome::NoReply { request_bytes: 0 });
        assert_eq!(stream.state.lock().await.ops, vec![Op::Eof, Op::Close]);
        assert!(generator.prompts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn missing_generator_closes_without_reply() {
        let stream = MockStream::request(&[b"anyone home?"]);
        let server = listener(vec![], None);

        let outcome = server
            .handle_connection(Connection::new(Box::new(stream.clone()), Endpoint::new(7, 1)))
            .await;

        assert_eq!(outcome, ConnectionOutcome::NoReply { request_bytes: 12 });
        assert!(stream.state.lock().await.writes().is_empty());
    }

    #[tokio::test]
    async fn partial_request_after_reset_is_still_answered() {
        let stream = MockStream::with_reads(vec![
            Ok(Some(b"trunc".to_vec())),
            Err(VsockError::ReadError("connection reset by peer".to_string())),
        ]);
        let server = listener(vec![], Some(UppercaseGenerator::new()));

        let outcome = server
            .handle_connection(Connection::new(Box::new(stream.clone()), Endpoint::new(7, 1)))
            .await;

        assert_eq!(
            outcome,
            ConnectionOutcome::Replied {
                request_bytes: 5,
                reply_bytes: 5
            }
        );
        assert_eq!(stream.state.lock().await.writes(), b"TRUNC");
    }

    #[tokio::test]
    async fn generation_failure_drops_connection_and_keeps_serving() {
        let failing = MockStream::request(&[b"first"]);
        let next = MockStream::request(&[b"second"]);
        let mut server = listener(
            vec![Ok(Some(failing.clone())), Ok(Some(next.clone()))],
            Some(Arc::new(FailingGenerator)),
        );

        server.serve().await.unwrap();

        for stream in [failing, next] {
            let ops = stream.state.lock().await.ops.clone();
            assert_eq!(ops.last(), Some(&Op::Close));
            assert!(!ops.iter().any(|op| matches!(op, Op::Write(_))));
        }
    }

    #[tokio::test]
    async fn failed_write_still_closes() {
        let stream = MockStream::request(&[b"hi"]);
        stream.state.lock().await.fail_writes = true;
        let server = listener(vec![], Some(UppercaseGenerator::new()));

        let outcome = server
            .handle_connection(Connection::new(Box::new(stream.clone()), Endpoint::new(7, 1)))
            .await;

        assert_eq!(
            outcome,
            ConnectionOutcome::WriteFailed {
                request_bytes: 2,
                reply_bytes: 2
            }
        );
        assert_eq!(stream.state.lock().await.ops.last(), Some(&Op::Close));
    }

    #[tokio::test]
    async fn transient_accept_errors_do_not_stop_the_loop() {
        let stream = MockStream::request(&[b"ok"]);
        let mut server = listener(
            vec![
                Err(VsockError::AcceptError(io::Error::from(io::ErrorKind::ConnectionAborted))),
                Ok(Some(stream.clone())),
            ],
            Some(UppercaseGenerator::new()),
        );

        server.serve().await.unwrap();
        assert_eq!(stream.state.lock().await.writes(), b"OK");
    }

    #[tokio::test]
    async fn fatal_accept_error_ends_serve() {
        let mut server = listener(
            vec![Err(VsockError::AcceptError(io::Error::from_raw_os_error(nix::libc::EBADF)))],
            Some(UppercaseGenerator::new()),
        );

        assert!(matches!(server.serve().await, Err(VsockError::AcceptError(_))));
    }

    #[tokio::test]
    async fn connections_are_served_in_order_without_cross_talk() {
        let first = MockStream::request(&[b"alpha"]);
        let second = MockStream::request(&[b"beta"]);
        let generator = UppercaseGenerator::new();
        let mut server = listener(
            vec![Ok(Some(first.clone())), Ok(Some(second.clone()))],
            Some(generator.clone()),
        );

        server.serve().await.unwrap();

        assert_eq!(first.state.lock().await.writes(), b"ALPHA");
        assert_eq!(second.state.lock().await.writes(), b"BETA");
        assert_eq!(*generator.prompts.lock().await, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[tokio::test]
    async fn send_data_answers_every_connection_with_the_payload() {
        let first = MockStream::request(&[b"ignored"]);
        let second = MockStream::request(&[]);
        let mut server = listener(vec![Ok(Some(first.clone())), Ok(Some(second.clone()))], None);

        server.send_data(Bytes::from_static(b"banner")).await.unwrap();

        for stream in [first, second] {
            let ops = stream.state.lock().await.ops.clone();
            assert_eq!(ops, vec![Op::Write(b"banner".to_vec()), Op::Close]);
        }
    }
}
