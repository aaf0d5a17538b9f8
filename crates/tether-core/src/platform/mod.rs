//! # Platform-Specific Hosts
//!
//! Implementations of [`SandboxHost`](crate::host::SandboxHost).
//!
//! Real hosts (ptrace, Mach exceptions, the Windows debug API) belong to the
//! sandbox runtime that embeds the stub and are supplied by it. This crate
//! ships the simulated host used by tests and by `tether serve`.

pub mod simulated;

pub use simulated::SimulatedHost;
