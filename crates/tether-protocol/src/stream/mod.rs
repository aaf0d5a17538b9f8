//! # Streams
//!
//! The byte-channel capability the transport is built on.
//!
//! A [`Stream`] is a duplex byte pipe with non-blocking reads and a timed
//! readiness poll. Concrete implementations are chosen when the connection is
//! built and handed to the transport as a `Box<dyn Stream>`:
//!
//! - [`TcpStream`] / [`TcpServer`]: sockets, for real debugger sessions
//! - [`MemoryStream`]: an in-process pipe pair, for embedding and tests
//!
//! ## Closed peers
//!
//! `read` returning `Ok(0)` only ever means "nothing buffered right now". A
//! peer that has gone away is reported as an `Err`, so the transport can tell
//! an idle line from a dead one.

pub mod address;
pub mod memory;
pub mod tcp;

use std::io;
use std::time::Duration;

pub use address::SocketAddress;
pub use memory::{memory_pair, MemoryStream};
pub use tcp::{TcpServer, TcpStream};

/// Poll interval used when a caller does not supply one.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Abstract duplex byte channel
///
/// Implementations must be `Send` so a connection can be handed to the thread
/// that services it.
pub trait Stream: Send
{
    /// Read up to `buf.len()` bytes without blocking.
    ///
    /// ## Returns
    ///
    /// The number of bytes copied into `buf`, `0` when nothing is waiting.
    ///
    /// ## Errors
    ///
    /// Any I/O failure, including the peer closing the connection.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write up to `buf.len()` bytes, returning how many were accepted.
    ///
    /// ## Errors
    ///
    /// Any I/O failure, including the peer closing the connection.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Wait up to `timeout` for data to become readable.
    ///
    /// A zero timeout is a pure probe.
    ///
    /// ## Errors
    ///
    /// Any I/O failure, including the peer closing the connection.
    fn poll_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Write all of `buf`, looping over short writes.
    ///
    /// ## Errors
    ///
    /// Propagates write failures. A write that accepts zero bytes is reported
    /// as [`io::ErrorKind::WriteZero`].
    fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()>
    {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(io::Error::new(io::ErrorKind::WriteZero, "stream accepted no bytes")),
                written => buf = &buf[written..],
            }
        }
        Ok(())
    }
}

impl<S: Stream + ?Sized> Stream for Box<S>
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>
    {
        (**self).write(buf)
    }

    fn poll_readable(&mut self, timeout: Duration) -> io::Result<bool>
    {
        (**self).poll_readable(timeout)
    }
}
