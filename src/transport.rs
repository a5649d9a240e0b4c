//! Local stream transports for the duplicator's connections.
//!
//! TCP listeners bind an ephemeral loopback port. Unix listeners bind
//! `sock0`, `sock1`, ... inside a private temporary directory that is removed
//! when the transport is dropped.

use crate::config::TransportKind;
use socket2::{Domain, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// A socket family plus whatever it needs to name listeners.
pub enum Transport {
    Tcp,
    Unix { dir: TempDir, next: AtomicUsize },
}

/// A bound, listening socket.
pub struct Listener {
    socket: Socket,
    addr: SockAddr,
    kind: TransportKind,
}

/// A connected stream socket.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Transport {
    pub fn new(kind: TransportKind) -> io::Result<Self> {
        match kind {
            TransportKind::Tcp => Ok(Self::tcp()),
            TransportKind::Unix => Self::unix(),
        }
    }

    pub fn tcp() -> Self {
        Transport::Tcp
    }

    /// Unix transport rooted in a fresh temporary directory.
    pub fn unix() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("stream-tee").tempdir()?;
        Ok(Transport::Unix {
            dir,
            next: AtomicUsize::new(0),
        })
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Tcp => TransportKind::Tcp,
            Transport::Unix { .. } => TransportKind::Unix,
        }
    }

    /// Bind and listen on a new local address.
    pub fn create_listener(&self, backlog: i32) -> io::Result<Listener> {
        let socket = match self {
            Transport::Tcp => {
                let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
                socket.set_reuse_address(true)?;
                let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
                socket.bind(&addr.into())?;
                socket
            }
            Transport::Unix { dir, next } => {
                let n = next.fetch_add(1, Ordering::Relaxed);
                let path = dir.path().join(format!("sock{n}"));
                let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
                socket.bind(&SockAddr::unix(&path)?)?;
                socket
            }
        };
        socket.listen(backlog)?;
        let addr = socket.local_addr()?;

        debug!(kind = ?self.kind(), addr = ?addr, "Listener created");

        Ok(Listener {
            socket,
            addr,
            kind: self.kind(),
        })
    }

    /// Connect a new client to `listener`.
    pub fn connect_to(&self, listener: &Listener) -> io::Result<Stream> {
        let domain = match listener.kind {
            TransportKind::Tcp => Domain::IPV4,
            TransportKind::Unix => Domain::UNIX,
        };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.connect(&listener.addr)?;
        Ok(Stream::from_socket(socket, listener.kind))
    }
}

impl Listener {
    /// Accept one connection, blocking until a client arrives.
    pub fn accept(&self) -> io::Result<Stream> {
        let (socket, _) = self.socket.accept()?;
        Ok(Stream::from_socket(socket, self.kind))
    }
}

impl Stream {
    fn from_socket(socket: Socket, kind: TransportKind) -> Self {
        match kind {
            TransportKind::Tcp => Stream::Tcp(socket.into()),
            TransportKind::Unix => Stream::Unix(socket.into()),
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown(how),
            Stream::Unix(s) => s.shutdown(how),
        }
    }

    pub fn try_clone(&self) -> io::Result<Stream> {
        Ok(match self {
            Stream::Tcp(s) => Stream::Tcp(s.try_clone()?),
            Stream::Unix(s) => Stream::Unix(s.try_clone()?),
        })
    }

    /// Switch to non-blocking mode and hand the socket to the current tokio
    /// runtime.
    pub fn into_tokio(self) -> io::Result<AsyncStream> {
        Ok(match self {
            Stream::Tcp(s) => {
                s.set_nonblocking(true)?;
                AsyncStream::Tcp(tokio::net::TcpStream::from_std(s)?)
            }
            Stream::Unix(s) => {
                s.set_nonblocking(true)?;
                AsyncStream::Unix(tokio::net::UnixStream::from_std(s)?)
            }
        })
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl AsFd for Stream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Stream::Tcp(s) => s.as_fd(),
            Stream::Unix(s) => s.as_fd(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

/// A [`Stream`] registered with tokio.
#[derive(Debug)]
pub enum AsyncStream {
    Tcp(tokio::net::TcpStream),
    Unix(tokio::net::UnixStream),
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            AsyncStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            AsyncStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            AsyncStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            AsyncStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    /// Half-closes the write side.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            AsyncStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
