//! Byte-level memory access used to install and remove traps.

use crate::error::Result;
use crate::types::Address;

/// Trait for the memory a breakpoint table patches.
///
/// The client implements it by sending `m`/`M` packets to the stub; the stub
/// implements it on top of the sandbox host's reprotect/write sequence. The
/// table itself never knows which side it is running on.
pub trait PatchMemory
{
    /// Read the byte at `address`.
    ///
    /// ## Errors
    ///
    /// Whatever the backing store reports for an unreadable address.
    fn read_byte(&mut self, address: Address) -> Result<u8>;

    /// Write `value` at `address` as a single store.
    ///
    /// ## Errors
    ///
    /// Whatever the backing store reports for an unwritable address.
    fn write_byte(&mut self, address: Address, value: u8) -> Result<()>;
}
