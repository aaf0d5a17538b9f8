//! Software breakpoint bookkeeping.
//!
//! A [`BreakpointTable`] remembers, per address, whether a breakpoint is
//! enabled, whether it is temporarily suspended, and the byte the trap
//! replaced. The byte that must be in memory is always a pure function of
//! that record:
//!
//! | enabled | suspended | memory holds |
//! |---------|-----------|--------------|
//! | yes     | no        | trap byte    |
//! | yes     | yes       | original     |
//! | no      | either    | original     |
//!
//! Every state change goes through one write of that byte, so repeating an
//! operation is harmless. The original byte is captured once, when the
//! address is first added, and never refreshed.
//!
//! The same table backs the client's local mirror (patching through `M`
//! packets) and the stub's own breakpoints (patching target memory directly);
//! the difference is the [`PatchMemory`] passed in.

mod patch;

use std::collections::BTreeMap;

use tracing::debug;

pub use patch::PatchMemory;

use crate::error::{DebugError, Result};
use crate::types::Address;

/// `int3`, the x86 software breakpoint instruction.
pub const X86_TRAP_BYTE: u8 = 0xcc;

/// State of one software breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointRecord
{
    /// Address of the patched instruction byte.
    pub address: Address,
    /// Requested by the user.
    pub enabled: bool,
    /// Temporarily lifted while still enabled.
    pub suspended: bool,
    /// The byte that was in memory before the trap was first installed.
    pub original: u8,
}

impl BreakpointRecord
{
    /// Whether the trap byte should currently be in memory.
    #[must_use]
    pub fn is_armed(&self) -> bool
    {
        self.enabled && !self.suspended
    }

    /// The byte memory should hold for this record.
    #[must_use]
    pub fn effective_byte(&self, trap: u8) -> u8
    {
        if self.is_armed() {
            trap
        } else {
            self.original
        }
    }
}

/// Software breakpoints keyed by address.
///
/// ## Example
///
/// ```rust
/// use std::collections::HashMap;
/// use tether_core::breakpoints::{BreakpointTable, PatchMemory};
/// use tether_core::types::Address;
///
/// struct Image(HashMap<Address, u8>);
///
/// impl PatchMemory for Image {
///     fn read_byte(&mut self, address: Address) -> tether_core::Result<u8> {
///         Ok(self.0[&address])
///     }
///     fn write_byte(&mut self, address: Address, value: u8) -> tether_core::Result<()> {
///         self.0.insert(address, value);
///         Ok(())
///     }
/// }
///
/// let addr = Address::from(0x2000);
/// let mut image = Image(HashMap::from([(addr, 0x90)]));
/// let mut table = BreakpointTable::new();
///
/// table.add(addr, &mut image)?;
/// assert_eq!(image.0[&addr], 0xcc);
/// table.disable(addr, &mut image)?;
/// assert_eq!(image.0[&addr], 0x90);
/// # Ok::<(), tether_core::DebugError>(())
/// ```
#[derive(Debug, Clone)]
pub struct BreakpointTable
{
    trap: u8,
    records: BTreeMap<Address, BreakpointRecord>,
}

impl Default for BreakpointTable
{
    fn default() -> Self
    {
        Self::with_trap_byte(X86_TRAP_BYTE)
    }
}

impl BreakpointTable
{
    /// Create an empty table using the x86 trap byte.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Create an empty table using a different trap byte.
    #[must_use]
    pub fn with_trap_byte(trap: u8) -> Self
    {
        Self {
            trap,
            records: BTreeMap::new(),
        }
    }

    /// The byte written for an armed breakpoint.
    #[must_use]
    pub fn trap_byte(&self) -> u8
    {
        self.trap
    }

    /// Add an enabled breakpoint at `address`.
    ///
    /// Adding an address that is already tracked changes nothing.
    ///
    /// ## Returns
    ///
    /// `true` if a new record was created.
    ///
    /// ## Errors
    ///
    /// Fails if the original byte cannot be read or the trap cannot be
    /// written. Nothing is recorded in that case.
    pub fn add<M: PatchMemory + ?Sized>(&mut self, address: Address, memory: &mut M) -> Result<bool>
    {
        if self.records.contains_key(&address) {
            return Ok(false);
        }
        let original = memory.read_byte(address)?;
        let record = BreakpointRecord {
            address,
            enabled: true,
            suspended: false,
            original,
        };
        memory.write_byte(address, record.effective_byte(self.trap))?;
        debug!(%address, original, "Breakpoint added");
        self.records.insert(address, record);
        Ok(true)
    }

    /// Disable the breakpoint at `address` and forget it.
    ///
    /// ## Errors
    ///
    /// [`DebugError::NoBreakpoint`] if the address is not tracked, or the
    /// memory error if the original byte cannot be restored (the record is
    /// kept in that case).
    pub fn remove<M: PatchMemory + ?Sized>(&mut self, address: Address, memory: &mut M) -> Result<BreakpointRecord>
    {
        self.disable(address, memory)?;
        let record = self.records.remove(&address).ok_or(DebugError::NoBreakpoint(address))?;
        debug!(%address, "Breakpoint removed");
        Ok(record)
    }

    /// Mark the breakpoint enabled and apply it.
    ///
    /// ## Errors
    ///
    /// [`DebugError::NoBreakpoint`] or the memory error.
    pub fn enable<M: PatchMemory + ?Sized>(&mut self, address: Address, memory: &mut M) -> Result<()>
    {
        self.transition(address, memory, |record| record.enabled = true)
    }

    /// Mark the breakpoint disabled and apply it.
    ///
    /// ## Errors
    ///
    /// [`DebugError::NoBreakpoint`] or the memory error.
    pub fn disable<M: PatchMemory + ?Sized>(&mut self, address: Address, memory: &mut M) -> Result<()>
    {
        self.transition(address, memory, |record| record.enabled = false)
    }

    /// Lift the trap without forgetting that the breakpoint is enabled.
    ///
    /// ## Errors
    ///
    /// [`DebugError::NoBreakpoint`] or the memory error.
    pub fn suspend<M: PatchMemory + ?Sized>(&mut self, address: Address, memory: &mut M) -> Result<()>
    {
        self.transition(address, memory, |record| record.suspended = true)
    }

    /// Undo [`suspend`](Self::suspend).
    ///
    /// ## Errors
    ///
    /// [`DebugError::NoBreakpoint`] or the memory error.
    pub fn resume<M: PatchMemory + ?Sized>(&mut self, address: Address, memory: &mut M) -> Result<()>
    {
        self.transition(address, memory, |record| record.suspended = false)
    }

    /// Write the byte the record calls for. Idempotent.
    ///
    /// ## Errors
    ///
    /// [`DebugError::NoBreakpoint`] or the memory error.
    pub fn apply<M: PatchMemory + ?Sized>(&self, address: Address, memory: &mut M) -> Result<()>
    {
        let record = self.records.get(&address).ok_or(DebugError::NoBreakpoint(address))?;
        memory.write_byte(address, record.effective_byte(self.trap))
    }

    /// Disable and forget every breakpoint, stopping at the first failure.
    ///
    /// ## Errors
    ///
    /// The first memory error. Records not yet processed are kept.
    pub fn remove_all<M: PatchMemory + ?Sized>(&mut self, memory: &mut M) -> Result<()>
    {
        let addresses: Vec<Address> = self.records.keys().copied().collect();
        for address in addresses {
            self.remove(address, memory)?;
        }
        Ok(())
    }

    /// The record at `address`, if tracked.
    #[must_use]
    pub fn get(&self, address: Address) -> Option<&BreakpointRecord>
    {
        self.records.get(&address)
    }

    /// Whether `address` is tracked.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        self.records.contains_key(&address)
    }

    /// All records in address order.
    pub fn iter(&self) -> impl Iterator<Item = &BreakpointRecord>
    {
        self.records.values()
    }

    /// Number of tracked breakpoints.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.records.len()
    }

    /// Whether no breakpoints are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.records.is_empty()
    }

    /// Apply `change` to a copy of the record, write the resulting byte, and
    /// only then store the copy. A failed write leaves the record untouched.
    fn transition<M, F>(&mut self, address: Address, memory: &mut M, change: F) -> Result<()>
    where
        M: PatchMemory + ?Sized,
        F: FnOnce(&mut BreakpointRecord),
    {
        let current = self.records.get(&address).ok_or(DebugError::NoBreakpoint(address))?;
        let mut next = *current;
        change(&mut next);
        memory.write_byte(address, next.effective_byte(self.trap))?;
        self.records.insert(address, next);
        Ok(())
    }
}
