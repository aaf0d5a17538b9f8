//! Debug event types and helpers.
//!
//! The client turns every stop notification (`S`, `T`, `W`, `X`) into a
//! [`DebugEvent`]. Front ends consume them either through a handler closure
//! or through the channel returned by
//! [`DebugClient::subscribe`](crate::client::DebugClient::subscribe), so they
//! can react to the target stopping without polling.

use std::sync::mpsc;

use crate::types::{signal, ProcessId, ThreadId};

/// Execution state reported for the debuggee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState
{
    /// Executing; no stop has been reported since the last resume.
    Running,
    /// Halted with a signal and can be resumed.
    Stopped,
    /// Killed by a signal.
    Terminated,
    /// Exited normally with a status code.
    Exited,
}

/// Snapshot of the last reported stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugEvent
{
    /// Process the stop belongs to, when the stub reported it.
    pub pid: Option<ProcessId>,
    /// New execution state.
    pub state: ProcessState,
    /// Signal number for `Stopped`/`Terminated`, exit status for `Exited`.
    pub signal: u8,
    /// Thread that stopped, when the stub reported it.
    pub context: Option<ThreadId>,
}

impl DebugEvent
{
    /// A `Stopped` event with only a signal.
    #[must_use]
    pub fn stopped(signal: u8) -> Self
    {
        Self {
            pid: None,
            state: ProcessState::Stopped,
            signal,
            context: None,
        }
    }

    /// Whether the process can no longer be resumed.
    #[must_use]
    pub fn is_final(&self) -> bool
    {
        matches!(self.state, ProcessState::Terminated | ProcessState::Exited)
    }

    /// Human-readable description of the event.
    #[must_use]
    pub fn describe(&self) -> String
    {
        let mut description = match self.state {
            ProcessState::Running => "Process is running".to_string(),
            ProcessState::Stopped if self.signal == signal::INTERRUPTED => "Stopped by break request".to_string(),
            ProcessState::Stopped => format!("Stopped by signal: {}", self.signal),
            ProcessState::Terminated => format!("Terminated by signal: {}", self.signal),
            ProcessState::Exited => format!("Process exited with code: {}", self.signal),
        };
        if let Some(pid) = self.pid {
            description.push_str(&format!(" (pid {pid})"));
        }
        if let Some(thread) = self.context {
            description.push_str(&format!(" (thread {thread})"));
        }
        description
    }
}

/// Sender side of the debug event channel.
pub type DebugEventSender = mpsc::Sender<DebugEvent>;
/// Receiver side of the debug event channel.
pub type DebugEventReceiver = mpsc::Receiver<DebugEvent>;

/// Create a new debug event channel.
#[must_use]
pub fn event_channel() -> (DebugEventSender, DebugEventReceiver)
{
    mpsc::channel()
}
