//! # Types
//!
//! Small value types shared by the client and the stub.
//!
//! These keep addresses, process ids and thread ids apart from each other and
//! from plain lengths, even though all of them are integers on the wire.

pub mod address;
pub mod process;

// Re-export all public types
pub use address::Address;
pub use process::{signal, ProcessId, ThreadId};
