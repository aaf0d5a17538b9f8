//! Raw target memory access for the stub.
//!
//! Every access widens the page protection to read/write/execute for the
//! duration of the copy and restores it afterwards, so code pages can be
//! patched. Writes are a single host call followed by an instruction-cache
//! flush while the pages are still writable.

use crate::breakpoints::PatchMemory;
use crate::error::{DebugError, Result};
use crate::host::{Protection, ProtectionGuard, SandboxHost};
use crate::types::{Address, ProcessId};

/// Target memory of one process, reached through the sandbox host.
pub struct TargetMemory<'a>
{
    host: &'a dyn SandboxHost,
    pid: ProcessId,
}

impl<'a> TargetMemory<'a>
{
    /// Access the memory of `pid` through `host`.
    #[must_use]
    pub fn new(host: &'a dyn SandboxHost, pid: ProcessId) -> Self
    {
        Self { host, pid }
    }

    /// Copy `len` bytes out of the target.
    ///
    /// ## Errors
    ///
    /// The host's reprotect or read error.
    pub fn read(&self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        if len == 0 {
            return Ok(Vec::new());
        }
        let _guard = ProtectionGuard::new(self.host, address, len, Protection::ALL)?;
        self.host.read_process_memory(self.pid, address, len)
    }

    /// Copy `data` into the target.
    ///
    /// ## Errors
    ///
    /// The host's reprotect, write or flush error.
    pub fn write(&self, address: Address, data: &[u8]) -> Result<()>
    {
        if data.is_empty() {
            return Ok(());
        }
        let _guard = ProtectionGuard::new(self.host, address, data.len(), Protection::ALL)?;
        self.host.write_process_memory(self.pid, address, data)?;
        self.host.flush_instruction_cache(address, data.len())
    }
}

impl PatchMemory for TargetMemory<'_>
{
    fn read_byte(&mut self, address: Address) -> Result<u8>
    {
        self.read(address, 1)?
            .first()
            .copied()
            .ok_or(DebugError::MemoryAccess { address, len: 1 })
    }

    fn write_byte(&mut self, address: Address, value: u8) -> Result<()>
    {
        self.write(address, &[value])
    }
}
