//! # Error Types
//!
//! General error handling for the client, the stub and the breakpoint table.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.

use std::io;

use tether_protocol::TransportError;
use thiserror::Error;

use crate::types::{Address, ThreadId};

/// Main error type for debugging operations
///
/// ## Error Categories
///
/// 1. **Connection errors**: Transport (timeouts are recoverable, a lost
///    connection is not)
/// 2. **Remote errors**: Remote, MalformedReply
/// 3. **Breakpoint errors**: NoBreakpoint
/// 4. **Target access errors**: MemoryAccess, RegisterAccess, ThreadControl,
///    UnknownThread (raised by sandbox hosts)
/// 5. **Usage errors**: InvalidArgument
/// 6. **I/O errors**: Io (for sockets being set up, etc.)
#[derive(Error, Debug)]
pub enum DebugError
{
    /// The transport failed or timed out
    ///
    /// Use [`DebugError::is_connection_lost`] to tell a timeout, which leaves
    /// the session usable, from a dead connection.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The stub answered with an `E<code>` reply
    ///
    /// Codes used by the Tether stub:
    /// - `0x01`: malformed or unsupported request
    /// - `0x02`: unknown thread
    /// - `0x03`: memory or register access failed
    #[error("Remote error E{0:02x}")]
    Remote(u8),

    /// A reply arrived but did not have the expected shape
    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    /// No breakpoint found at the specified address
    #[error("No breakpoint at address {0}")]
    NoBreakpoint(Address),

    /// Target memory could not be read or written
    #[error("Cannot access {len} bytes at {address}")]
    MemoryAccess
    {
        /// First byte of the failed access
        address: Address,
        /// Length of the failed access
        len: usize,
    },

    /// A register blob could not be read or written
    #[error("Register access failed: {0}")]
    RegisterAccess(String),

    /// A thread could not be suspended or resumed
    #[error("Failed to {operation} thread {thread}")]
    ThreadControl
    {
        /// The thread being controlled
        thread: ThreadId,
        /// What was attempted (`suspend`, `resume`, ...)
        operation: &'static str,
    },

    /// The thread is not known to the host or the stub
    #[error("Unknown thread {0}")]
    UnknownThread(ThreadId),

    /// Invalid argument passed to a debugging function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DebugError
{
    /// Whether the connection is gone and the stack must be rebuilt.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool
    {
        matches!(self, Self::Transport(err) if err.is_fatal())
    }

    /// Whether this is a wait budget running out.
    #[must_use]
    pub fn is_timeout(&self) -> bool
    {
        matches!(self, Self::Transport(TransportError::Timeout(_)))
    }
}

/// Result type alias for debugging operations
pub type Result<T> = std::result::Result<T, DebugError>;
