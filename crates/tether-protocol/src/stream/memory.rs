//! In-process duplex stream pair.
//!
//! Bytes written to one end become readable at the other. Dropping either end
//! closes the pair: the survivor can still drain what was already buffered,
//! after which reads, polls and writes fail with `ConnectionAborted`.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::Stream;

#[derive(Debug, Default)]
struct PipeState
{
    bytes: VecDeque<u8>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Pipe
{
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe
{
    fn lock(&self) -> MutexGuard<'_, PipeState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self)
    {
        self.lock().closed = true;
        self.readable.notify_all();
    }
}

fn closed_error() -> io::Error
{
    io::Error::new(io::ErrorKind::ConnectionAborted, "memory stream peer dropped")
}

/// One end of a [`memory_pair`].
#[derive(Debug)]
pub struct MemoryStream
{
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
}

/// Create two connected in-memory streams.
///
/// ## Example
///
/// ```rust
/// use std::time::Duration;
/// use tether_protocol::stream::{memory_pair, Stream};
///
/// let (mut left, mut right) = memory_pair();
/// left.write_all(b"+")?;
/// assert!(right.poll_readable(Duration::ZERO)?);
///
/// let mut buf = [0u8; 4];
/// assert_eq!(right.read(&mut buf)?, 1);
/// assert_eq!(buf[0], b'+');
/// # Ok::<(), std::io::Error>(())
/// ```
#[must_use]
pub fn memory_pair() -> (MemoryStream, MemoryStream)
{
    let left_to_right = Arc::new(Pipe::default());
    let right_to_left = Arc::new(Pipe::default());
    let left = MemoryStream {
        incoming: Arc::clone(&right_to_left),
        outgoing: Arc::clone(&left_to_right),
    };
    let right = MemoryStream {
        incoming: left_to_right,
        outgoing: right_to_left,
    };
    (left, right)
}

impl Stream for MemoryStream
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        let mut state = self.incoming.lock();
        if state.bytes.is_empty() {
            return if state.closed { Err(closed_error()) } else { Ok(0) };
        }
        let count = buf.len().min(state.bytes.len());
        for (slot, byte) in buf.iter_mut().zip(state.bytes.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>
    {
        let mut state = self.outgoing.lock();
        if state.closed {
            return Err(closed_error());
        }
        state.bytes.extend(buf);
        drop(state);
        self.outgoing.readable.notify_all();
        Ok(buf.len())
    }

    fn poll_readable(&mut self, timeout: Duration) -> io::Result<bool>
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.incoming.lock();
        loop {
            if !state.bytes.is_empty() {
                return Ok(true);
            }
            if state.closed {
                return Err(closed_error());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self
                .incoming
                .readable
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Drop for MemoryStream
{
    fn drop(&mut self)
    {
        self.incoming.close();
        self.outgoing.close();
    }
}
