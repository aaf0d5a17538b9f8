//! # Error Types
//!
//! Failures reported by the transport layer.
//!
//! Checksum mismatches are deliberately absent: the transport answers them with
//! a `-` and waits for the resend, so they never reach the caller.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Error returned by [`Transport`](crate::Transport) operations
///
/// ## Error Categories
///
/// 1. **Recoverable**: `Timeout`, `NoData`. The session is still usable and the
///    caller may retry or poll again.
/// 2. **Fatal**: `ConnectionLost`. The stream is gone; the caller must discard
///    the transport and build a new stream/transport pair.
#[derive(Error, Debug)]
pub enum TransportError
{
    /// Nothing usable arrived within the wait budget
    ///
    /// Any partially received frame is discarded. The connection itself is left
    /// intact.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// A non-blocking probe found no data waiting
    ///
    /// This is the normal result of polling an idle connection.
    #[error("No data available")]
    NoData,

    /// The underlying stream failed or the peer closed it
    #[error("Connection lost: {0}")]
    ConnectionLost(#[from] io::Error),
}

impl TransportError
{
    /// Whether the session must be torn down after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool
    {
        matches!(self, Self::ConnectionLost(_))
    }

    /// Whether the caller may simply try again on the same session.
    #[must_use]
    pub fn is_recoverable(&self) -> bool
    {
        !self.is_fatal()
    }
}

/// Result alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;
