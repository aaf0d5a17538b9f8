//! # tether-core
//!
//! Both endpoints of a Tether debugging session, and the bookkeeping they
//! share.
//!
//! This crate provides:
//! - [`client`]: the debugger side, a blocking request API with stop and
//!   output notifications delivered to handlers or channels
//! - [`stub`]: the target side, a command dispatcher embedded in the sandbox
//!   runtime that owns the thread and breakpoint tables
//! - [`breakpoints`]: the breakpoint table both sides use, over different
//!   memory backends
//! - [`host`]: the capability set the stub needs from the sandbox runtime,
//!   with a [`platform::SimulatedHost`] implementation
//!
//! Framing, checksums and sockets live in `tether-protocol`.
//!
//! ## Example
//!
//! A stub and a client joined by an in-memory stream:
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//! use std::thread;
//!
//! use tether_core::client::{ClientOptions, DebugClient};
//! use tether_core::host::Protection;
//! use tether_core::platform::SimulatedHost;
//! use tether_core::stub::{Stub, StubConfig};
//! use tether_core::types::{Address, ProcessId, ThreadId};
//! use tether_protocol::stream::memory_pair;
//! use tether_protocol::Transport;
//!
//! let host = Arc::new(SimulatedHost::new(ProcessId(1)));
//! host.map_region(Address::from(0x1000), vec![0xde, 0xad, 0xbe, 0xef], Protection::READ);
//! host.spawn_thread(ThreadId(1), vec![0; 8]);
//!
//! let stub = Stub::new(host, StubConfig::new(ProcessId(1))).unwrap();
//! let (debugger_end, target_end) = memory_pair();
//!
//! let server = thread::spawn(move || {
//!     let mut transport = Transport::new(Box::new(target_end));
//!     stub.serve_connection(&mut transport, &AtomicBool::new(false))
//! });
//!
//! let mut client = DebugClient::new(debugger_end, ClientOptions::default());
//! let bytes = client.read_memory(Address::from(0x1000), 4).unwrap();
//! assert_eq!(bytes, [0xde, 0xad, 0xbe, 0xef]);
//!
//! drop(client);
//! server.join().unwrap().unwrap();
//! ```

pub mod breakpoints;
pub mod client;
pub mod error;
pub mod events;
pub mod host;
pub mod platform;
pub mod prelude;
pub mod stub;
pub mod threads;
pub mod types;

pub use breakpoints::{BreakpointRecord, BreakpointTable};
pub use client::{ClientOptions, DebugClient};
pub use error::{DebugError, Result};
pub use events::{DebugEvent, ProcessState};
pub use host::SandboxHost;
pub use stub::{Stub, StubConfig, StubHandle};
pub use types::{Address, ProcessId, ThreadId};
