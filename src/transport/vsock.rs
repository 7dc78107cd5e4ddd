//! AF_VSOCK stream sockets.
//!
//! Sockets are created non-blocking and registered with tokio through
//! [`AsyncFd`], so a single runtime thread can wait on accept, connect and
//! I/O readiness. Only Linux exposes AF_VSOCK to userspace; elsewhere every
//! constructor fails with [`io::ErrorKind::Unsupported`].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use super::{Accepted, Acceptor, Endpoint, IoStream};
use crate::errors::VsockError;

#[cfg(target_os = "linux")]
mod sys {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::task::{ready, Context, Poll};

    use nix::errno::Errno;
    use nix::sys::socket::{
        self, sockopt, AddressFamily, Backlog, MsgFlags, Shutdown, SockFlag, SockType, VsockAddr,
    };
    use tokio::io::unix::AsyncFd;
    use tokio::io::ReadBuf;

    use super::Endpoint;

    fn new_socket() -> io::Result<OwnedFd> {
        let fd = socket::socket(
            AddressFamily::Vsock,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        Ok(fd)
    }

    fn endpoint_of(addr: &VsockAddr) -> Endpoint {
        Endpoint::new(addr.cid(), addr.port())
    }

    pub struct Stream {
        inner: AsyncFd<OwnedFd>,
    }

    impl Stream {
        fn from_fd(fd: OwnedFd) -> io::Result<Self> {
            Ok(Self {
                inner: AsyncFd::new(fd)?,
            })
        }

        pub async fn connect(endpoint: Endpoint) -> io::Result<Self> {
            let fd = new_socket()?;
            let addr = VsockAddr::new(endpoint.cid(), endpoint.port());
            match socket::connect(fd.as_raw_fd(), &addr) {
                Ok(()) | Err(Errno::EINPROGRESS) => {}
                Err(err) => return Err(err.into()),
            }

            let stream = Self::from_fd(fd)?;
            loop {
                let connected = {
                    let mut guard = stream.inner.writable().await?;
                    let pending = socket::getsockopt(stream.inner.get_ref(), sockopt::SocketError)?;
                    if pending != 0 {
                        return Err(io::Error::from_raw_os_error(pending));
                    }
                    match socket::getpeername::<VsockAddr>(stream.inner.as_raw_fd()) {
                        Ok(_) => true,
                        // Spurious wakeup; the handshake is still in flight.
                        Err(Errno::ENOTCONN) => {
                            guard.clear_ready();
                            false
                        }
                        Err(err) => return Err(err.into()),
                    }
                };
                if connected {
                    return Ok(stream);
                }
            }
        }

        pub fn peer(&self) -> io::Result<Endpoint> {
            let addr = socket::getpeername::<VsockAddr>(self.inner.as_raw_fd())?;
            Ok(endpoint_of(&addr))
        }

        pub fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            loop {
                let mut guard = ready!(self.inner.poll_read_ready(cx))?;
                let unfilled = buf.initialize_unfilled();
                match guard.try_io(|inner| {
                    socket::recv(inner.as_raw_fd(), unfilled, MsgFlags::empty()).map_err(io::Error::from)
                }) {
                    Ok(Ok(n)) => {
                        buf.advance(n);
                        return Poll::Ready(Ok(()));
                    }
                    Ok(Err(err)) => return Poll::Ready(Err(err)),
                    Err(_would_block) => continue,
                }
            }
        }

        pub fn poll_write(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
            loop {
                let mut guard = ready!(self.inner.poll_write_ready(cx))?;
                match guard.try_io(|inner| {
                    socket::send(inner.as_raw_fd(), data, MsgFlags::MSG_NOSIGNAL).map_err(io::Error::from)
                }) {
                    Ok(result) => return Poll::Ready(result),
                    Err(_would_block) => continue,
                }
            }
        }

        pub fn shutdown_write(&self) -> io::Result<()> {
            match socket::shutdown(self.inner.as_raw_fd(), Shutdown::Write) {
                // Already torn down by the peer.
                Ok(()) | Err(Errno::ENOTCONN) => Ok(()),
                Err(err) => Err(err.into()),
            }
        }
    }

    pub struct Listener {
        inner: AsyncFd<OwnedFd>,
    }

    impl Listener {
        pub fn bind(endpoint: Endpoint, backlog: i32) -> io::Result<Self> {
            let fd = new_socket()?;
            let addr = VsockAddr::new(endpoint.cid(), endpoint.port());
            socket::bind(fd.as_raw_fd(), &addr)?;
            socket::listen(&fd, Backlog::new(backlog)?)?;
            Ok(Self {
                inner: AsyncFd::new(fd)?,
            })
        }

        pub fn local(&self) -> io::Result<Endpoint> {
            let addr = socket::getsockname::<VsockAddr>(self.inner.as_raw_fd())?;
            Ok(endpoint_of(&addr))
        }

        pub async fn accept(&self) -> io::Result<(Stream, Endpoint)> {
            loop {
                let mut guard = self.inner.readable().await?;
                let accepted = guard.try_io(|inner| {
                    socket::accept4(
                        inner.as_raw_fd(),
                        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
                    )
                    .map_err(io::Error::from)
                });
                match accepted {
                    Ok(result) => {
                        let raw = result?;
                        // SAFETY: accept4 returned a fresh descriptor that nothing else owns.
                        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                        let stream = Stream::from_fd(fd)?;
                        let peer = stream.peer()?;
                        return Ok((stream, peer));
                    }
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::io;
    use std::task::{Context, Poll};

    use tokio::io::ReadBuf;

    use super::Endpoint;

    fn unsupported() -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "AF_VSOCK is only available on Linux",
        )
    }

    pub enum Stream {}

    impl Stream {
        pub async fn connect(_endpoint: Endpoint) -> io::Result<Self> {
            Err(unsupported())
        }

        pub fn peer(&self) -> io::Result<Endpoint> {
            match *self {}
        }

        pub fn poll_read(&self, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            match *self {}
        }

        pub fn poll_write(&self, _cx: &mut Context<'_>, _data: &[u8]) -> Poll<io::Result<usize>> {
            match *self {}
        }

        pub fn shutdown_write(&self) -> io::Result<()> {
            match *self {}
        }
    }

    pub enum Listener {}

    impl Listener {
        pub fn bind(_endpoint: Endpoint, _backlog: i32) -> io::Result<Self> {
            Err(unsupported())
        }

        pub fn local(&self) -> io::Result<Endpoint> {
            match *self {}
        }

        pub async fn accept(&self) -> io::Result<(Stream, Endpoint)> {
            match *self {}
        }
    }
}

/// A connected AF_VSOCK stream socket.
pub struct VsockStream {
    inner: sys::Stream,
}

impl VsockStream {
    /// Connects to `endpoint`. Callers bound the wait with their own timeout.
    pub async fn connect(endpoint: Endpoint) -> io::Result<Self> {
        let inner = sys::Stream::connect(endpoint).await?;
        debug!(%endpoint, "vsock connected");
        Ok(Self { inner })
    }

    pub fn peer_endpoint(&self) -> io::Result<Endpoint> {
        self.inner.peer()
    }
}

impl AsyncRead for VsockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.inner.poll_read(cx, buf)
    }
}

impl AsyncWrite for VsockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.inner.shutdown_write())
    }
}

/// A bound, listening AF_VSOCK socket.
pub struct VsockListener {
    inner: sys::Listener,
    chunk_size: usize,
}

impl VsockListener {
    /// Binds the wildcard CID on `port` and starts listening.
    pub fn bind(port: u32, backlog: i32) -> io::Result<Self> {
        Self::bind_endpoint(Endpoint::any(port), backlog)
    }

    pub fn bind_endpoint(endpoint: Endpoint, backlog: i32) -> io::Result<Self> {
        let inner = sys::Listener::bind(endpoint, backlog)?;
        Ok(Self {
            inner,
            chunk_size: crate::config::DEFAULT_CHUNK_SIZE,
        })
    }

    /// Read size used for accepted connections.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.inner.local()
    }

    pub async fn accept(&self) -> io::Result<(VsockStream, Endpoint)> {
        let (inner, peer) = self.inner.accept().await?;
        Ok((VsockStream { inner }, peer))
    }
}

#[async_trait]
impl Acceptor for VsockListener {
    async fn accept(&mut self) -> Result<Option<Accepted>, VsockError> {
        let (stream, peer) = VsockListener::accept(self)
            .await
            .map_err(VsockError::AcceptError)?;
        let stream = IoStream::with_chunk_size(stream, self.chunk_size);
        Ok(Some(Accepted::new(Box::new(stream), peer)))
    }
}
