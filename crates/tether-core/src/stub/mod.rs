//! # In-Target Stub
//!
//! The remote side of a debugging session. The stub runs inside the sandbox
//! runtime next to the target process, answers debugger requests over a
//! [`Transport`], and reports thread stops as unsolicited `S<signal>`
//! notifications.
//!
//! ## Threads and locking
//!
//! The stub's tables (threads, breakpoints, stop state) sit behind one
//! mutex. The sandbox runtime reports thread creation, exit and exceptions
//! from its own threads through a [`StubHandle`], which only queues a
//! [`StubEvent`]. The serving thread applies queued events at the start of
//! every [`Stub::pump`].
//!
//! The lock is never held across network I/O: a pump builds its outgoing
//! packet under the lock and sends it after releasing it.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tether_core::platform::SimulatedHost;
//! use tether_core::stub::{Stub, StubConfig};
//! use tether_core::types::{ProcessId, ThreadId};
//!
//! let host = Arc::new(SimulatedHost::new(ProcessId(1)));
//! host.spawn_thread(ThreadId(7), vec![0; 16]);
//!
//! let stub = Stub::new(host, StubConfig::new(ProcessId(1))).unwrap();
//! assert_eq!(stub.threads(), vec![ThreadId(7)]);
//! assert!(!stub.is_broken());
//! ```

mod dispatch;
pub mod memory;
mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tether_protocol::stream::{TcpServer, TcpStream};
use tether_protocol::{Packet, Transport, TransportError, TransportFlags};
use tracing::{debug, info, warn};

pub use dispatch::{ErrorReply, MAX_MEMORY_TRANSFER};
pub use memory::TargetMemory;

use self::dispatch::Dispatcher;
use self::state::StubState;
use crate::breakpoints::BreakpointRecord;
use crate::error::{DebugError, Result};
use crate::host::SandboxHost;
use crate::types::{Address, ProcessId, ThreadId};

/// Something the sandbox runtime observed about the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubEvent
{
    /// A new thread started.
    ThreadCreated(ThreadId),
    /// A thread finished.
    ThreadExited(ThreadId),
    /// A thread stopped with a signal.
    ///
    /// The runtime leaves the thread stopped; the stub resumes it when the
    /// debugger continues.
    Exception
    {
        /// The stopped thread.
        thread: ThreadId,
        /// Signal number to report.
        signal: u8,
        /// Faulting instruction, when known.
        address: Option<Address>,
    },
}

/// Cloneable handle the sandbox runtime uses to report events.
#[derive(Debug, Clone)]
pub struct StubHandle
{
    sender: Sender<StubEvent>,
}

impl StubHandle
{
    /// Queue an event. Events posted after the stub is gone are dropped.
    pub fn post(&self, event: StubEvent)
    {
        if self.sender.send(event).is_err() {
            debug!("Stub is gone, dropping host event");
        }
    }

    /// Report a new thread.
    pub fn thread_created(&self, thread: ThreadId)
    {
        self.post(StubEvent::ThreadCreated(thread));
    }

    /// Report a finished thread.
    pub fn thread_exited(&self, thread: ThreadId)
    {
        self.post(StubEvent::ThreadExited(thread));
    }

    /// Report a thread that stopped with `signal`.
    pub fn exception(&self, thread: ThreadId, signal: u8, address: Option<Address>)
    {
        self.post(StubEvent::Exception {
            thread,
            signal,
            address,
        });
    }
}

/// Stub settings.
#[derive(Debug, Clone)]
pub struct StubConfig
{
    /// Process being debugged.
    pub pid: ProcessId,
    /// Answer to `qExecPath`.
    pub exec_path: String,
    /// Architecture named in the target description.
    pub architecture: String,
    /// Breakpoint installed at startup and removed on its first hit.
    pub break_at: Option<Address>,
    /// Acknowledgement budget for outgoing packets.
    pub timeout: Duration,
    /// Idle wait between pumps in [`Stub::serve_connection`].
    pub poll_interval: Duration,
    /// Flags for each accepted connection's transport.
    pub transport_flags: TransportFlags,
}

impl StubConfig
{
    /// Defaults for `pid`.
    #[must_use]
    pub fn new(pid: ProcessId) -> Self
    {
        Self {
            pid,
            ..Self::default()
        }
    }
}

impl Default for StubConfig
{
    fn default() -> Self
    {
        Self {
            pid: ProcessId(0),
            exec_path: String::new(),
            architecture: "i386:x86-64".to_string(),
            break_at: None,
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            transport_flags: TransportFlags::default(),
        }
    }
}

/// Whether a debugger is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState
{
    /// Not listening.
    #[default]
    Idle,
    /// Waiting for a debugger to connect.
    AcceptPending,
    /// A debugger is connected.
    Serving,
}

/// What one [`Stub::pump`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStatus
{
    /// Nothing to do.
    Idle,
    /// A stop notification was sent, no request was waiting.
    Notified,
    /// A request was handled.
    Processed,
}

/// The in-target debug stub.
pub struct Stub
{
    host: Arc<dyn SandboxHost>,
    config: StubConfig,
    state: Mutex<StubState>,
    sender: Sender<StubEvent>,
    connection: Mutex<ConnectionState>,
}

impl Stub
{
    /// Create a stub for `config.pid`.
    ///
    /// The thread table is seeded from the host, and the start breakpoint is
    /// installed when `config.break_at` is set.
    ///
    /// ## Errors
    ///
    /// The host's error when listing threads or patching the start breakpoint.
    pub fn new(host: Arc<dyn SandboxHost>, config: StubConfig) -> Result<Self>
    {
        let (sender, receiver) = mpsc::channel();
        let mut state = StubState::new(receiver);

        for thread in host.list_threads(config.pid)? {
            state.threads.insert(thread);
        }
        if let Some(address) = config.break_at {
            let mut memory = TargetMemory::new(host.as_ref(), config.pid);
            state.breakpoints.add(address, &mut memory)?;
            state.start_breakpoint = Some(address);
            info!(%address, "Start breakpoint installed");
        }
        info!(pid = %config.pid, threads = state.threads.len(), "Stub ready");

        Ok(Self {
            host,
            config,
            state: Mutex::new(state),
            sender,
            connection: Mutex::new(ConnectionState::Idle),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StubState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_connection(&self, connection: ConnectionState)
    {
        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = connection;
    }

    /// A handle for reporting host events.
    #[must_use]
    pub fn handle(&self) -> StubHandle
    {
        StubHandle {
            sender: self.sender.clone(),
        }
    }

    /// Stub settings.
    #[must_use]
    pub fn config(&self) -> &StubConfig
    {
        &self.config
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState
    {
        *self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ids of the tracked threads.
    #[must_use]
    pub fn threads(&self) -> Vec<ThreadId>
    {
        self.lock().threads.ids()
    }

    /// Snapshot of the breakpoint table.
    #[must_use]
    pub fn breakpoints(&self) -> Vec<BreakpointRecord>
    {
        self.lock().breakpoints.iter().copied().collect()
    }

    /// Whether a stop has been reported and the target is held.
    #[must_use]
    pub fn is_broken(&self) -> bool
    {
        self.lock().broken
    }

    /// Thread of the last reported stop.
    #[must_use]
    pub fn current_thread(&self) -> Option<ThreadId>
    {
        self.lock().current_thread
    }

    /// Insert a breakpoint from the target side.
    ///
    /// ## Errors
    ///
    /// The host's memory error.
    pub fn add_breakpoint(&self, address: Address) -> Result<bool>
    {
        let mut memory = TargetMemory::new(self.host.as_ref(), self.config.pid);
        self.lock().breakpoints.add(address, &mut memory)
    }

    /// Remove a breakpoint from the target side.
    ///
    /// ## Errors
    ///
    /// [`DebugError::NoBreakpoint`] or the host's memory error.
    pub fn remove_breakpoint(&self, address: Address) -> Result<()>
    {
        let mut memory = TargetMemory::new(self.host.as_ref(), self.config.pid);
        let mut state = self.lock();
        if state.start_breakpoint == Some(address) {
            state.start_breakpoint = None;
        }
        state.breakpoints.remove(address, &mut memory).map(|_| ())
    }

    /// Do one round of work.
    ///
    /// 1. Apply queued host events.
    /// 2. If a thread stopped and nothing is reported yet, hold the target
    ///    and send `S<signal>`.
    /// 3. If a request is waiting, handle it and send the reply.
    ///
    /// ## Errors
    ///
    /// Transport errors other than [`TransportError::NoData`].
    pub fn pump(&self, transport: &mut Transport) -> Result<PumpStatus>
    {
        let notification = {
            let mut state = self.lock();
            state.drain_events(self.host.as_ref(), self.config.pid);
            state.break_on_signal(self.host.as_ref()).map(|signal| {
                let mut packet = Packet::new();
                packet.put_raw(b'S');
                packet.put_hex_byte(signal);
                packet
            })
        };
        let notified = notification.is_some();
        if let Some(packet) = notification {
            transport.send(&packet, self.config.timeout)?;
        }

        let mut request = Packet::new();
        match transport.try_receive(&mut request) {
            Ok(()) => {}
            Err(TransportError::NoData) => {
                return Ok(if notified { PumpStatus::Notified } else { PumpStatus::Idle });
            }
            Err(err) => return Err(err.into()),
        }

        let reply = {
            let mut state = self.lock();
            let dispatcher = Dispatcher {
                host: self.host.as_ref(),
                config: &self.config,
            };
            dispatcher.handle(&mut state, &mut request)
        };
        if let Some(reply) = reply {
            transport.send(&reply, self.config.timeout)?;
        }
        Ok(PumpStatus::Processed)
    }

    /// Pump `transport` until the connection drops or `shutdown` is set.
    ///
    /// ## Errors
    ///
    /// Only non-fatal transport failures are returned; a lost connection
    /// ends the loop with `Ok`.
    pub fn serve_connection(&self, transport: &mut Transport, shutdown: &AtomicBool) -> Result<()>
    {
        self.set_connection(ConnectionState::Serving);
        let result = self.serve_loop(transport, shutdown);
        self.set_connection(ConnectionState::Idle);
        result
    }

    fn serve_loop(&self, transport: &mut Transport, shutdown: &AtomicBool) -> Result<()>
    {
        while !shutdown.load(Ordering::Relaxed) {
            let round = self.pump(transport).and_then(|status| {
                if status == PumpStatus::Idle {
                    transport.wait_readable(self.config.poll_interval)?;
                }
                Ok(())
            });
            match round {
                Ok(()) => {}
                Err(err) if err.is_connection_lost() => {
                    info!(error = %err, "Debugger disconnected");
                    return Ok(());
                }
                Err(err) if err.is_timeout() => {
                    warn!(error = %err, "Debugger did not acknowledge in time");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Accept debuggers on `listener` one at a time until `shutdown` is set.
    ///
    /// ## Errors
    ///
    /// [`DebugError::Io`] if accepting fails.
    pub fn serve(&self, listener: &TcpServer, shutdown: &AtomicBool) -> Result<()>
    {
        while !shutdown.load(Ordering::Relaxed) {
            self.set_connection(ConnectionState::AcceptPending);
            let accepted = listener.accept_timeout(self.config.poll_interval.max(Duration::from_millis(50)));
            let stream = match accepted {
                Ok(Some(stream)) => stream,
                Ok(None) => continue,
                Err(err) => {
                    self.set_connection(ConnectionState::Idle);
                    return Err(DebugError::Io(err));
                }
            };
            info!(peer = ?stream.peer_address().map(|peer| peer.to_string()), "Debugger connected");
            self.serve_stream(stream, shutdown)?;
        }
        self.set_connection(ConnectionState::Idle);
        Ok(())
    }

    fn serve_stream(&self, stream: TcpStream, shutdown: &AtomicBool) -> Result<()>
    {
        let mut transport = Transport::with_flags(Box::new(stream), self.config.transport_flags);
        self.serve_connection(&mut transport, shutdown)
    }
}
