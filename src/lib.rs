//! Prompt/reply exchange over AF_VSOCK.
//!
//! A client connects to a `(cid, port)` endpoint, writes its prompt,
//! half-closes, and reads the reply until the server closes. The server
//! accepts one connection at a time, drains the prompt to end-of-stream,
//! hands it to a [`Generator`], writes the reply and closes. End-of-stream
//! is the only framing in either direction.
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use vsock_sample::{ClientConfig, Connector, Endpoint};
//!
//! # async fn run() -> Result<(), vsock_sample::VsockError> {
//! let connector = Connector::new(ClientConfig::new());
//! let mut conn = connector.connect(Endpoint::new(16, 5005)).await?;
//! conn.send_request("Hello, world!").await?;
//! let mut reply = Box::pin(conn.receive_reply());
//! while let Some(chunk) = reply.next().await {
//!     print!("{}", String::from_utf8_lossy(&chunk?));
//! }
//! drop(reply);
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod generation;
pub mod server;
pub mod transport;

pub use client::{connect_with, Connector, ReplyDecoder};
pub use config::{ClientConfig, ServerConfig};
pub use connection::Connection;
pub use errors::VsockError;
pub use generation::{GenerationContext, GenerationError, Generator, LoadError};
pub use server::{ConnectionOutcome, ConnectionState, Listener};
pub use transport::vsock::{VsockListener, VsockStream};
pub use transport::{Accepted, Acceptor, ChannelAcceptor, Endpoint, IoStream, StreamAdapter};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
