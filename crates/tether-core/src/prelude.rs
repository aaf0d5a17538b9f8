//! Common module for library exports

pub use crate::breakpoints::{BreakpointRecord, BreakpointTable, PatchMemory};
pub use crate::client::{ClientOptions, DebugClient};
pub use crate::error::{DebugError, Result};
pub use crate::events::{DebugEvent, DebugEventReceiver, ProcessState};
pub use crate::host::{Protection, SandboxHost};
pub use crate::platform::SimulatedHost;
pub use crate::stub::{ConnectionState, PumpStatus, Stub, StubConfig, StubEvent, StubHandle};
pub use crate::types::{signal, Address, ProcessId, ThreadId};
