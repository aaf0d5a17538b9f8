//! # Sandbox Host Capability
//!
//! The operations the stub needs from whatever runs the target process.
//!
//! The stub never touches OS handles. Suspending a thread, copying its
//! registers or changing page protection is the host's business; the stub
//! only calls through [`SandboxHost`]. A real host wraps ptrace, Mach
//! exceptions or the Windows debug API. [`SimulatedHost`] keeps everything in
//! memory.
//!
//! [`SimulatedHost`]: crate::platform::SimulatedHost

use std::fmt;

use tracing::warn;

use crate::error::Result;
use crate::types::{Address, ProcessId, ThreadId};

/// Page protection bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Protection(u8);

impl Protection
{
    /// No access.
    pub const NONE: Self = Self(0);
    /// Readable.
    pub const READ: Self = Self(0b001);
    /// Writable.
    pub const WRITE: Self = Self(0b010);
    /// Executable.
    pub const EXECUTE: Self = Self(0b100);
    /// Readable and executable, the usual code protection.
    pub const READ_EXECUTE: Self = Self(0b101);
    /// Readable and writable, the usual data protection.
    pub const READ_WRITE: Self = Self(0b011);
    /// Everything; used while patching code.
    pub const ALL: Self = Self(0b111);

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool
    {
        self.0 & other.0 == other.0
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u8
    {
        self.0
    }
}

impl std::ops::BitOr for Protection
{
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output
    {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for Protection
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let flag = |bit: Self, c: char| if self.contains(bit) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Self::READ, 'r'),
            flag(Self::WRITE, 'w'),
            flag(Self::EXECUTE, 'x')
        )
    }
}

/// Capability set the stub consumes from the sandbox host
///
/// All methods take `&self`: the host is shared between the stub's pump thread
/// and whoever reports events about the target, so implementations provide
/// their own interior locking.
///
/// Methods are called from the pump thread while it holds the stub's table
/// lock, with the affected thread suspended wherever registers are involved.
pub trait SandboxHost: Send + Sync
{
    /// Copy `len` bytes out of the target.
    ///
    /// ## Errors
    ///
    /// [`DebugError::MemoryAccess`](crate::DebugError::MemoryAccess) if any byte
    /// is unmapped or unreadable.
    fn read_process_memory(&self, pid: ProcessId, address: Address, len: usize) -> Result<Vec<u8>>;

    /// Copy `data` into the target as a single write.
    ///
    /// ## Errors
    ///
    /// [`DebugError::MemoryAccess`](crate::DebugError::MemoryAccess) if any byte
    /// is unmapped or unwritable.
    fn write_process_memory(&self, pid: ProcessId, address: Address, data: &[u8]) -> Result<()>;

    /// Stop `thread` wherever it is.
    ///
    /// ## Errors
    ///
    /// [`DebugError::ThreadControl`](crate::DebugError::ThreadControl) or
    /// [`DebugError::UnknownThread`](crate::DebugError::UnknownThread).
    fn suspend_thread(&self, thread: ThreadId) -> Result<()>;

    /// Let `thread` run again.
    ///
    /// ## Errors
    ///
    /// [`DebugError::ThreadControl`](crate::DebugError::ThreadControl) or
    /// [`DebugError::UnknownThread`](crate::DebugError::UnknownThread).
    fn resume_thread(&self, thread: ThreadId) -> Result<()>;

    /// Read the architecture-defined register blob of a stopped thread.
    ///
    /// ## Errors
    ///
    /// [`DebugError::RegisterAccess`](crate::DebugError::RegisterAccess).
    fn get_register_blob(&self, thread: ThreadId) -> Result<Vec<u8>>;

    /// Replace the register blob of a stopped thread.
    ///
    /// ## Errors
    ///
    /// [`DebugError::RegisterAccess`](crate::DebugError::RegisterAccess).
    fn set_register_blob(&self, thread: ThreadId, blob: &[u8]) -> Result<()>;

    /// Threads currently alive in `pid`.
    ///
    /// ## Errors
    ///
    /// Host-specific.
    fn list_threads(&self, pid: ProcessId) -> Result<Vec<ThreadId>>;

    /// Change the protection of `[address, address + len)`.
    ///
    /// ## Returns
    ///
    /// The protection that was in effect before the change.
    ///
    /// ## Errors
    ///
    /// [`DebugError::MemoryAccess`](crate::DebugError::MemoryAccess) if the
    /// range is not mapped.
    fn reprotect(&self, address: Address, len: usize, protection: Protection) -> Result<Protection>;

    /// Arm or disarm hardware single-step for the next resume of `thread`.
    ///
    /// ## Errors
    ///
    /// [`DebugError::RegisterAccess`](crate::DebugError::RegisterAccess).
    fn set_single_step(&self, _thread: ThreadId, _enabled: bool) -> Result<()>
    {
        Ok(())
    }

    /// Tear `thread` down instead of resuming it.
    ///
    /// ## Errors
    ///
    /// [`DebugError::ThreadControl`](crate::DebugError::ThreadControl) by
    /// default; hosts that can kill threads override this.
    fn kill_thread(&self, thread: ThreadId) -> Result<()>
    {
        Err(crate::DebugError::ThreadControl {
            thread,
            operation: "kill",
        })
    }

    /// Make freshly written code visible to instruction fetch.
    ///
    /// ## Errors
    ///
    /// Host-specific. Hosts with coherent caches keep the default.
    fn flush_instruction_cache(&self, _address: Address, _len: usize) -> Result<()>
    {
        Ok(())
    }
}

/// RAII guard that widens page protection and restores it when dropped.
///
/// This guard ensures the original protection comes back even if the access
/// in between fails.
pub struct ProtectionGuard<'a>
{
    host: &'a dyn SandboxHost,
    address: Address,
    len: usize,
    previous: Protection,
}

impl<'a> ProtectionGuard<'a>
{
    /// Set `[address, address + len)` to `protection` until the guard drops.
    ///
    /// ## Errors
    ///
    /// The host's reprotect error; nothing needs restoring in that case.
    pub fn new(host: &'a dyn SandboxHost, address: Address, len: usize, protection: Protection) -> Result<Self>
    {
        let previous = host.reprotect(address, len, protection)?;
        Ok(Self {
            host,
            address,
            len,
            previous,
        })
    }

    /// Protection that will be restored.
    #[must_use]
    pub fn previous(&self) -> Protection
    {
        self.previous
    }
}

impl Drop for ProtectionGuard<'_>
{
    fn drop(&mut self)
    {
        if let Err(err) = self.host.reprotect(self.address, self.len, self.previous) {
            warn!(address = %self.address, len = self.len, error = %err, "Failed to restore page protection");
        }
    }
}
