//! Tests for the breakpoint table

use std::collections::HashMap;

use tether_core::breakpoints::{BreakpointTable, PatchMemory, X86_TRAP_BYTE};
use tether_core::types::Address;
use tether_core::{DebugError, Result};

/// Byte-addressed memory that counts writes and can refuse them.
#[derive(Default)]
struct FakeMemory
{
    bytes: HashMap<Address, u8>,
    writes: usize,
    read_only: bool,
}

impl FakeMemory
{
    fn with_byte(address: Address, value: u8) -> Self
    {
        let mut memory = Self::default();
        memory.bytes.insert(address, value);
        memory
    }

    fn byte(&self, address: Address) -> u8
    {
        self.bytes[&address]
    }
}

impl PatchMemory for FakeMemory
{
    fn read_byte(&mut self, address: Address) -> Result<u8>
    {
        self.bytes
            .get(&address)
            .copied()
            .ok_or(DebugError::MemoryAccess { address, len: 1 })
    }

    fn write_byte(&mut self, address: Address, value: u8) -> Result<()>
    {
        if self.read_only || !self.bytes.contains_key(&address) {
            return Err(DebugError::MemoryAccess { address, len: 1 });
        }
        self.bytes.insert(address, value);
        self.writes += 1;
        Ok(())
    }
}

const ADDR: Address = Address::new(0x2000);

#[test]
fn test_add_installs_trap_and_captures_original()
{
    let mut memory = FakeMemory::with_byte(ADDR, 0x90);
    let mut table = BreakpointTable::new();

    assert!(table.add(ADDR, &mut memory).unwrap());
    assert_eq!(memory.byte(ADDR), X86_TRAP_BYTE);

    let record = table.get(ADDR).unwrap();
    assert!(record.enabled);
    assert!(!record.suspended);
    assert_eq!(record.original, 0x90);
}

#[test]
fn test_add_twice_is_noop()
{
    let mut memory = FakeMemory::with_byte(ADDR, 0x90);
    let mut table = BreakpointTable::new();

    table.add(ADDR, &mut memory).unwrap();
    let writes = memory.writes;
    assert!(!table.add(ADDR, &mut memory).unwrap());
    assert_eq!(memory.writes, writes);
    assert_eq!(table.get(ADDR).unwrap().original, 0x90);
    assert_eq!(table.len(), 1);
}

#[test]
fn test_enable_is_idempotent()
{
    let mut memory = FakeMemory::with_byte(ADDR, 0x55);
    let mut table = BreakpointTable::new();
    table.add(ADDR, &mut memory).unwrap();

    table.enable(ADDR, &mut memory).unwrap();
    let once = memory.byte(ADDR);
    table.enable(ADDR, &mut memory).unwrap();
    assert_eq!(memory.byte(ADDR), once);
    assert_eq!(memory.byte(ADDR), X86_TRAP_BYTE);
}

#[test]
fn test_disable_restores_exact_original()
{
    let mut memory = FakeMemory::with_byte(ADDR, 0x48);
    let mut table = BreakpointTable::new();
    table.add(ADDR, &mut memory).unwrap();

    table.enable(ADDR, &mut memory).unwrap();
    table.disable(ADDR, &mut memory).unwrap();
    assert_eq!(memory.byte(ADDR), 0x48);

    // Re-enabling must not recapture the trap byte as the original.
    table.enable(ADDR, &mut memory).unwrap();
    table.disable(ADDR, &mut memory).unwrap();
    assert_eq!(memory.byte(ADDR), 0x48);
    assert_eq!(table.get(ADDR).unwrap().original, 0x48);
}

#[test]
fn test_suspend_and_resume()
{
    let mut memory = FakeMemory::with_byte(ADDR, 0x31);
    let mut table = BreakpointTable::new();
    table.add(ADDR, &mut memory).unwrap();

    table.suspend(ADDR, &mut memory).unwrap();
    assert_eq!(memory.byte(ADDR), 0x31);
    assert!(table.get(ADDR).unwrap().enabled);

    table.resume(ADDR, &mut memory).unwrap();
    assert_eq!(memory.byte(ADDR), X86_TRAP_BYTE);
}

#[test]
fn test_suspended_and_disabled_stays_original()
{
    let mut memory = FakeMemory::with_byte(ADDR, 0x31);
    let mut table = BreakpointTable::new();
    table.add(ADDR, &mut memory).unwrap();

    table.suspend(ADDR, &mut memory).unwrap();
    table.disable(ADDR, &mut memory).unwrap();
    table.resume(ADDR, &mut memory).unwrap();
    assert_eq!(memory.byte(ADDR), 0x31);

    table.enable(ADDR, &mut memory).unwrap();
    assert_eq!(memory.byte(ADDR), X86_TRAP_BYTE);
}

#[test]
fn test_remove_restores_and_forgets()
{
    let mut memory = FakeMemory::with_byte(ADDR, 0x90);
    let mut table = BreakpointTable::new();
    table.add(ADDR, &mut memory).unwrap();

    let record = table.remove(ADDR, &mut memory).unwrap();
    assert_eq!(record.original, 0x90);
    assert!(!record.enabled);
    assert_eq!(memory.byte(ADDR), 0x90);
    assert!(table.is_empty());
}

#[test]
fn test_unknown_address_errors()
{
    let mut memory = FakeMemory::with_byte(ADDR, 0x90);
    let mut table = BreakpointTable::new();

    assert!(matches!(
        table.enable(ADDR, &mut memory),
        Err(DebugError::NoBreakpoint(address)) if address == ADDR
    ));
    assert!(matches!(table.remove(ADDR, &mut memory), Err(DebugError::NoBreakpoint(_))));
    assert!(matches!(table.apply(ADDR, &mut memory), Err(DebugError::NoBreakpoint(_))));
}

#[test]
fn test_failed_write_leaves_record_unchanged()
{
    let mut memory = FakeMemory::with_byte(ADDR, 0x90);
    let mut table = BreakpointTable::new();
    table.add(ADDR, &mut memory).unwrap();

    memory.read_only = true;
    assert!(table.disable(ADDR, &mut memory).is_err());
    assert!(table.get(ADDR).unwrap().enabled);
}

#[test]
fn test_failed_add_records_nothing()
{
    let mut memory = FakeMemory::default();
    let mut table = BreakpointTable::new();

    assert!(table.add(ADDR, &mut memory).is_err());
    assert!(!table.contains(ADDR));
}

#[test]
fn test_custom_trap_byte()
{
    let mut memory = FakeMemory::with_byte(ADDR, 0x00);
    let mut table = BreakpointTable::with_trap_byte(0xd4);
    table.add(ADDR, &mut memory).unwrap();
    assert_eq!(table.trap_byte(), 0xd4);
    assert_eq!(memory.byte(ADDR), 0xd4);
}

#[test]
fn test_remove_all()
{
    let second = ADDR + 0x10;
    let mut memory = FakeMemory::with_byte(ADDR, 0x01);
    memory.bytes.insert(second, 0x02);
    let mut table = BreakpointTable::new();
    table.add(ADDR, &mut memory).unwrap();
    table.add(second, &mut memory).unwrap();

    table.remove_all(&mut memory).unwrap();
    assert!(table.is_empty());
    assert_eq!(memory.byte(ADDR), 0x01);
    assert_eq!(memory.byte(second), 0x02);
}

#[test]
fn test_iter_in_address_order()
{
    let low = Address::new(0x1000);
    let mut memory = FakeMemory::with_byte(ADDR, 0x01);
    memory.bytes.insert(low, 0x02);
    let mut table = BreakpointTable::new();
    table.add(ADDR, &mut memory).unwrap();
    table.add(low, &mut memory).unwrap();

    let addresses: Vec<Address> = table.iter().map(|record| record.address).collect();
    assert_eq!(addresses, vec![low, ADDR]);
}
