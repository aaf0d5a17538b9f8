//! # Simulated Sandbox Host
//!
//! An in-memory [`SandboxHost`]: mapped regions with page protection, threads
//! with register blobs and suspend counts, and a log of instruction-cache
//! flushes.
//!
//! Protection is enforced the way a real host would enforce it, so code
//! regions mapped read+execute can only be patched through a reprotect. This
//! makes the stub's reprotect/write/restore sequence observable in tests.
//!
//! ## Example
//!
//! ```rust
//! use tether_core::host::{Protection, SandboxHost};
//! use tether_core::platform::SimulatedHost;
//! use tether_core::types::{Address, ProcessId, ThreadId};
//!
//! let host = SimulatedHost::new(ProcessId::from(1));
//! host.map_region(Address::from(0x1000), vec![0xde, 0xad, 0xbe, 0xef], Protection::READ_EXECUTE);
//! host.spawn_thread(ThreadId::from(1), vec![0; 16]);
//!
//! let bytes = host.read_process_memory(ProcessId::from(1), Address::from(0x1000), 4)?;
//! assert_eq!(bytes, [0xde, 0xad, 0xbe, 0xef]);
//! assert!(host.write_process_memory(ProcessId::from(1), Address::from(0x1000), &[0]).is_err());
//! # Ok::<(), tether_core::DebugError>(())
//! ```

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::error::{DebugError, Result};
use crate::host::{Protection, SandboxHost};
use crate::types::{Address, ProcessId, ThreadId};

#[derive(Debug, Clone)]
struct Region
{
    base: Address,
    bytes: Vec<u8>,
    protection: Protection,
}

impl Region
{
    fn covers(&self, address: Address, len: usize) -> bool
    {
        let start = address.value();
        let Some(end) = start.checked_add(len as u64) else {
            return false;
        };
        start >= self.base.value() && end <= self.base.value() + self.bytes.len() as u64
    }

    #[allow(clippy::cast_possible_truncation)]
    fn offset(&self, address: Address) -> usize
    {
        (address.value() - self.base.value()) as usize
    }
}

#[derive(Debug, Clone, Default)]
struct SimThread
{
    registers: Vec<u8>,
    suspend_count: u32,
    single_step: bool,
    resumes: u32,
}

#[derive(Debug, Default)]
struct SimState
{
    regions: Vec<Region>,
    threads: BTreeMap<ThreadId, SimThread>,
    killed: Vec<ThreadId>,
    flushes: Vec<(Address, usize)>,
}

impl SimState
{
    fn region(&self, address: Address, len: usize) -> Option<&Region>
    {
        self.regions.iter().find(|region| region.covers(address, len))
    }

    fn region_mut(&mut self, address: Address, len: usize) -> Option<&mut Region>
    {
        self.regions.iter_mut().find(|region| region.covers(address, len))
    }

    fn thread_mut(&mut self, thread: ThreadId) -> Result<&mut SimThread>
    {
        self.threads.get_mut(&thread).ok_or(DebugError::UnknownThread(thread))
    }
}

/// In-memory target process.
#[derive(Debug)]
pub struct SimulatedHost
{
    pid: ProcessId,
    state: Mutex<SimState>,
}

impl SimulatedHost
{
    /// Create an empty process with id `pid`.
    #[must_use]
    pub fn new(pid: ProcessId) -> Self
    {
        Self {
            pid,
            state: Mutex::new(SimState::default()),
        }
    }

    /// The simulated process id.
    #[must_use]
    pub fn pid(&self) -> ProcessId
    {
        self.pid
    }

    fn lock(&self) -> MutexGuard<'_, SimState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_pid(&self, pid: ProcessId) -> Result<()>
    {
        if pid == self.pid {
            Ok(())
        } else {
            Err(DebugError::InvalidArgument(format!("unknown process {pid}")))
        }
    }

    /// Map `bytes` at `base` with the given protection.
    pub fn map_region(&self, base: Address, bytes: impl Into<Vec<u8>>, protection: Protection)
    {
        let bytes = bytes.into();
        debug!(%base, len = bytes.len(), %protection, "Mapping simulated region");
        self.lock().regions.push(Region {
            base,
            bytes,
            protection,
        });
    }

    /// Start a thread with an initial register blob.
    pub fn spawn_thread(&self, thread: ThreadId, registers: Vec<u8>)
    {
        self.lock().threads.insert(
            thread,
            SimThread {
                registers,
                ..SimThread::default()
            },
        );
    }

    /// Remove a thread as if it had exited.
    pub fn exit_thread(&self, thread: ThreadId)
    {
        self.lock().threads.remove(&thread);
    }

    /// Read memory regardless of protection.
    #[must_use]
    pub fn peek(&self, address: Address, len: usize) -> Option<Vec<u8>>
    {
        let state = self.lock();
        let region = state.region(address, len)?;
        let offset = region.offset(address);
        Some(region.bytes[offset..offset + len].to_vec())
    }

    /// Current protection of the region containing `address`.
    #[must_use]
    pub fn protection_at(&self, address: Address) -> Option<Protection>
    {
        self.lock().region(address, 1).map(|region| region.protection)
    }

    /// Whether `thread` is currently held by one or more suspends.
    #[must_use]
    pub fn is_suspended(&self, thread: ThreadId) -> bool
    {
        self.lock()
            .threads
            .get(&thread)
            .is_some_and(|sim| sim.suspend_count > 0)
    }

    /// Whether single-step is armed for `thread`.
    #[must_use]
    pub fn single_step_armed(&self, thread: ThreadId) -> bool
    {
        self.lock().threads.get(&thread).is_some_and(|sim| sim.single_step)
    }

    /// How many times `thread` has been resumed.
    #[must_use]
    pub fn resume_count(&self, thread: ThreadId) -> u32
    {
        self.lock().threads.get(&thread).map_or(0, |sim| sim.resumes)
    }

    /// Current register blob of `thread`.
    #[must_use]
    pub fn registers(&self, thread: ThreadId) -> Option<Vec<u8>>
    {
        self.lock().threads.get(&thread).map(|sim| sim.registers.clone())
    }

    /// Threads torn down through [`SandboxHost::kill_thread`].
    #[must_use]
    pub fn killed_threads(&self) -> Vec<ThreadId>
    {
        self.lock().killed.clone()
    }

    /// Number of instruction-cache flushes requested so far.
    #[must_use]
    pub fn flush_count(&self) -> usize
    {
        self.lock().flushes.len()
    }
}

impl SandboxHost for SimulatedHost
{
    fn read_process_memory(&self, pid: ProcessId, address: Address, len: usize) -> Result<Vec<u8>>
    {
        self.check_pid(pid)?;
        let state = self.lock();
        let region = state
            .region(address, len)
            .filter(|region| region.protection.contains(Protection::READ))
            .ok_or(DebugError::MemoryAccess { address, len })?;
        let offset = region.offset(address);
        Ok(region.bytes[offset..offset + len].to_vec())
    }

    fn write_process_memory(&self, pid: ProcessId, address: Address, data: &[u8]) -> Result<()>
    {
        self.check_pid(pid)?;
        let len = data.len();
        let mut state = self.lock();
        let region = state
            .region_mut(address, len)
            .filter(|region| region.protection.contains(Protection::WRITE))
            .ok_or(DebugError::MemoryAccess { address, len })?;
        let offset = region.offset(address);
        region.bytes[offset..offset + len].copy_from_slice(data);
        trace!(%address, len, "Simulated write");
        Ok(())
    }

    fn suspend_thread(&self, thread: ThreadId) -> Result<()>
    {
        let mut state = self.lock();
        let sim = state.thread_mut(thread)?;
        sim.suspend_count += 1;
        Ok(())
    }

    fn resume_thread(&self, thread: ThreadId) -> Result<()>
    {
        let mut state = self.lock();
        let sim = state.thread_mut(thread)?;
        sim.suspend_count = sim.suspend_count.saturating_sub(1);
        sim.resumes += 1;
        Ok(())
    }

    fn get_register_blob(&self, thread: ThreadId) -> Result<Vec<u8>>
    {
        let mut state = self.lock();
        Ok(state.thread_mut(thread)?.registers.clone())
    }

    fn set_register_blob(&self, thread: ThreadId, blob: &[u8]) -> Result<()>
    {
        let mut state = self.lock();
        let sim = state.thread_mut(thread)?;
        if sim.registers.len() != blob.len() {
            return Err(DebugError::RegisterAccess(format!(
                "thread {thread} expects {} register bytes, got {}",
                sim.registers.len(),
                blob.len()
            )));
        }
        sim.registers.copy_from_slice(blob);
        Ok(())
    }

    fn list_threads(&self, pid: ProcessId) -> Result<Vec<ThreadId>>
    {
        self.check_pid(pid)?;
        Ok(self.lock().threads.keys().copied().collect())
    }

    fn reprotect(&self, address: Address, len: usize, protection: Protection) -> Result<Protection>
    {
        let mut state = self.lock();
        let region = state
            .region_mut(address, len)
            .ok_or(DebugError::MemoryAccess { address, len })?;
        let previous = region.protection;
        region.protection = protection;
        Ok(previous)
    }

    fn set_single_step(&self, thread: ThreadId, enabled: bool) -> Result<()>
    {
        let mut state = self.lock();
        state.thread_mut(thread)?.single_step = enabled;
        Ok(())
    }

    fn kill_thread(&self, thread: ThreadId) -> Result<()>
    {
        let mut state = self.lock();
        state
            .threads
            .remove(&thread)
            .ok_or(DebugError::UnknownThread(thread))?;
        state.killed.push(thread);
        Ok(())
    }

    fn flush_instruction_cache(&self, address: Address, len: usize) -> Result<()>
    {
        self.lock().flushes.push((address, len));
        Ok(())
    }
}
