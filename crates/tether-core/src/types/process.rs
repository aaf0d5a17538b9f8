//! Process, thread and signal types.

use std::fmt;

/// Process identifier (PID) of the debuggee
///
/// ## Example
///
/// ```rust
/// use tether_core::types::ProcessId;
///
/// let pid = ProcessId::from(4242);
/// assert_eq!(u32::from(pid), 4242);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier
///
/// The value is whatever the sandbox host uses to name a thread (a kernel
/// TID, a handle value, a simulator index). It travels on the wire as hex.
///
/// ## Example
///
/// ```rust
/// use tether_core::types::ThreadId;
///
/// let thread = ThreadId::from(7);
/// assert_eq!(thread.raw(), 7);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Get the raw `u64` representation of the thread identifier
    #[must_use]
    pub fn raw(&self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{:x}", self.0)
    }
}

/// Signal numbers that the stub reports itself.
///
/// Everything else is passed through from the sandbox host untouched.
pub mod signal
{
    /// Breakpoint or single-step trap.
    pub const SIGTRAP: u8 = 5;
    /// Invalid memory access.
    pub const SIGSEGV: u8 = 11;
    /// Reported for a break request when no thread had a real signal.
    pub const INTERRUPTED: u8 = 0xff;
}
