//! # TCP Streams
//!
//! Socket implementation of [`Stream`] plus a listener for the stub side.
//!
//! The socket stays in blocking mode for writes. Reads switch to non-blocking
//! for the duration of the call, and readiness is probed with `peek` under a
//! read timeout, which is how a socket reports "readable" without consuming
//! anything.

use std::io::{self, Read, Write};
use std::net::{self, SocketAddrV4};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{SocketAddress, Stream};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn peer_closed() -> io::Error
{
    io::Error::new(io::ErrorKind::ConnectionAborted, "peer closed the connection")
}

/// Connected TCP socket.
#[derive(Debug)]
pub struct TcpStream
{
    inner: net::TcpStream,
}

impl TcpStream
{
    /// Connect to `address`.
    ///
    /// ## Errors
    ///
    /// Returns the socket error if the connection cannot be established.
    pub fn connect(address: SocketAddress) -> io::Result<Self>
    {
        let inner = net::TcpStream::connect(SocketAddrV4::from(address))?;
        debug!(%address, "Connected");
        Self::from_std(inner)
    }

    /// Connect to `address`, giving up after `timeout`.
    ///
    /// ## Errors
    ///
    /// Returns the socket error, or [`io::ErrorKind::TimedOut`].
    pub fn connect_timeout(address: SocketAddress, timeout: Duration) -> io::Result<Self>
    {
        let inner = net::TcpStream::connect_timeout(&SocketAddrV4::from(address).into(), timeout)?;
        debug!(%address, "Connected");
        Self::from_std(inner)
    }

    /// Wrap an already connected standard library socket.
    ///
    /// ## Errors
    ///
    /// Fails if the socket options cannot be applied.
    pub fn from_std(inner: net::TcpStream) -> io::Result<Self>
    {
        inner.set_nonblocking(false)?;
        inner.set_nodelay(true)?;
        Ok(Self { inner })
    }

    /// Address of the remote end, if it is IPv4.
    #[must_use]
    pub fn peer_address(&self) -> Option<SocketAddress>
    {
        match self.inner.peer_addr() {
            Ok(net::SocketAddr::V4(address)) => Some(address.into()),
            _ => None,
        }
    }
}

impl Stream for TcpStream
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        self.inner.set_nonblocking(true)?;
        let result = self.inner.read(buf);
        self.inner.set_nonblocking(false)?;
        match result {
            Ok(0) if !buf.is_empty() => Err(peer_closed()),
            Ok(count) => Ok(count),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>
    {
        let written = self.inner.write(buf)?;
        self.inner.flush()?;
        Ok(written)
    }

    fn poll_readable(&mut self, timeout: Duration) -> io::Result<bool>
    {
        let mut probe = [0u8; 1];
        let result = if timeout.is_zero() {
            self.inner.set_nonblocking(true)?;
            let result = self.inner.peek(&mut probe);
            self.inner.set_nonblocking(false)?;
            result
        } else {
            self.inner.set_read_timeout(Some(timeout))?;
            let result = self.inner.peek(&mut probe);
            self.inner.set_read_timeout(None)?;
            result
        };

        match result {
            Ok(0) => Err(peer_closed()),
            Ok(_) => Ok(true),
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Listening socket used by the stub to wait for a debugger.
///
/// The standard library listener is created with the platform's default
/// backlog.
#[derive(Debug)]
pub struct TcpServer
{
    listener: net::TcpListener,
}

impl TcpServer
{
    /// Bind and listen on `address`. Port `0` picks a free port.
    ///
    /// ## Errors
    ///
    /// Returns the socket error if the address cannot be bound.
    pub fn bind(address: SocketAddress) -> io::Result<Self>
    {
        let listener = net::TcpListener::bind(SocketAddrV4::from(address))?;
        debug!(address = %address, "Listening");
        Ok(Self { listener })
    }

    /// The bound address, useful after binding port `0`.
    ///
    /// ## Errors
    ///
    /// Fails if the socket cannot report its address or it is not IPv4.
    pub fn local_address(&self) -> io::Result<SocketAddress>
    {
        match self.listener.local_addr()? {
            net::SocketAddr::V4(address) => Ok(address.into()),
            net::SocketAddr::V6(_) => Err(io::Error::new(io::ErrorKind::Unsupported, "IPv6 listener")),
        }
    }

    /// Block until a client connects.
    ///
    /// ## Errors
    ///
    /// Returns the socket error from `accept`.
    pub fn accept(&self) -> io::Result<TcpStream>
    {
        self.listener.set_nonblocking(false)?;
        let (stream, peer) = self.listener.accept()?;
        debug!(%peer, "Accepted client");
        TcpStream::from_std(stream)
    }

    /// Wait up to `timeout` for a client, returning `None` if nobody connected.
    ///
    /// ## Errors
    ///
    /// Returns the socket error from `accept`.
    pub fn accept_timeout(&self, timeout: Duration) -> io::Result<Option<TcpStream>>
    {
        self.listener.set_nonblocking(true)?;
        let deadline = Instant::now() + timeout;
        let accepted = loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted client");
                    break Some(stream);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        break None;
                    }
                    thread::sleep(ACCEPT_POLL_INTERVAL.min(deadline - now));
                }
                Err(err) => {
                    self.listener.set_nonblocking(false)?;
                    return Err(err);
                }
            }
        };
        self.listener.set_nonblocking(false)?;
        accepted.map(TcpStream::from_std).transpose()
    }
}
