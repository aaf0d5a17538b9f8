//! Tables owned by the stub and the suspend/resume algorithms over them.
//!
//! Everything here runs with the stub's table lock held. Host calls made
//! from here (suspend, resume, register copies, memory patches) are local to
//! the target process; network I/O never happens under the lock.

use std::sync::mpsc::Receiver;

use tracing::{debug, info, warn};

use super::memory::TargetMemory;
use super::StubEvent;
use crate::breakpoints::BreakpointTable;
use crate::host::SandboxHost;
use crate::threads::{SignalState, ThreadAction, ThreadTable};
use crate::types::{Address, ProcessId, ThreadId};

pub(crate) struct StubState
{
    pub(crate) threads: ThreadTable,
    pub(crate) breakpoints: BreakpointTable,
    /// Thread the last stop was reported for; `g`/`G`/`s` act on it.
    pub(crate) current_thread: Option<ThreadId>,
    /// Signal of the last reported stop, `0` while running.
    pub(crate) stop_signal: u8,
    /// A stop has been reported and the target is held.
    pub(crate) broken: bool,
    /// Break-at-start trap, removed on its first hit.
    pub(crate) start_breakpoint: Option<Address>,
    pub(crate) events: Receiver<StubEvent>,
}

impl StubState
{
    pub(crate) fn new(events: Receiver<StubEvent>) -> Self
    {
        Self {
            threads: ThreadTable::new(),
            breakpoints: BreakpointTable::new(),
            current_thread: None,
            stop_signal: 0,
            broken: false,
            start_breakpoint: None,
            events,
        }
    }

    /// The thread register and step commands act on.
    pub(crate) fn selected_thread(&self) -> Option<ThreadId>
    {
        self.current_thread
            .filter(|thread| self.threads.contains(*thread))
            .or_else(|| self.threads.first())
    }

    /// Apply everything the host has posted since the last call.
    pub(crate) fn drain_events(&mut self, host: &dyn SandboxHost, pid: ProcessId)
    {
        while let Ok(event) = self.events.try_recv() {
            debug!(?event, "Host event");
            match event {
                StubEvent::ThreadCreated(thread) => {
                    self.threads.insert(thread);
                    if self.broken {
                        self.suspend_one(host, thread);
                    }
                }
                StubEvent::ThreadExited(thread) => {
                    self.threads.remove(thread);
                    if self.current_thread == Some(thread) {
                        self.current_thread = None;
                    }
                }
                StubEvent::Exception {
                    thread,
                    signal,
                    address,
                } => {
                    self.threads.insert(thread).state = SignalState::Signalled(signal);
                    if address.is_some() && address == self.start_breakpoint {
                        self.clear_start_breakpoint(host, pid);
                    }
                }
            }
        }
    }

    fn clear_start_breakpoint(&mut self, host: &dyn SandboxHost, pid: ProcessId)
    {
        let Some(address) = self.start_breakpoint.take() else {
            return;
        };
        let mut memory = TargetMemory::new(host, pid);
        match self.breakpoints.remove(address, &mut memory) {
            Ok(_) => info!(%address, "Start breakpoint reached and removed"),
            Err(err) => warn!(%address, error = %err, "Failed to remove start breakpoint"),
        }
    }

    fn suspend_one(&mut self, host: &dyn SandboxHost, thread: ThreadId)
    {
        let Some(record) = self.threads.get_mut(thread) else {
            return;
        };
        if record.state == SignalState::Running {
            if let Err(err) = host.suspend_thread(thread) {
                warn!(%thread, error = %err, "Failed to suspend thread");
                return;
            }
            record.state = SignalState::Suspended;
        }
        match host.get_register_blob(thread) {
            Ok(blob) => record.registers = blob,
            Err(err) => warn!(%thread, error = %err, "Failed to snapshot registers"),
        }
    }

    /// Hold every thread: running ones are suspended, and every register
    /// snapshot is refreshed.
    pub(crate) fn suspend_all(&mut self, host: &dyn SandboxHost)
    {
        for thread in self.threads.ids() {
            self.suspend_one(host, thread);
        }
    }

    /// Report the first signalled thread, if nothing is reported yet.
    ///
    /// Returns the signal to announce.
    pub(crate) fn break_on_signal(&mut self, host: &dyn SandboxHost) -> Option<u8>
    {
        if self.broken {
            return None;
        }
        let (thread, signal) = self.threads.first_signalled()?;
        self.current_thread = Some(thread);
        self.stop_signal = signal;
        self.suspend_all(host);
        self.broken = true;
        info!(%thread, signal, "Thread stopped");
        Some(signal)
    }

    /// Hold everything for a break request with no real signal behind it.
    pub(crate) fn break_on_request(&mut self, host: &dyn SandboxHost, signal: u8)
    {
        if self.broken {
            return;
        }
        self.suspend_all(host);
        self.current_thread = self.selected_thread();
        self.stop_signal = signal;
        self.broken = true;
        info!(thread = ?self.current_thread, "Target broken on request");
    }

    /// Release every held thread.
    ///
    /// Register snapshots are written back first. Only a thread whose action
    /// is `Step` gets single-step armed; all others have it cleared. Threads
    /// stopped with a signal that was never reported stay stopped so the next
    /// pump reports them.
    pub(crate) fn resume_all(&mut self, host: &dyn SandboxHost)
    {
        let reported = self.current_thread;

        for record in self.threads.iter_mut() {
            let held = match record.state {
                SignalState::Running => false,
                SignalState::Suspended => true,
                SignalState::Signalled(_) => Some(record.id) == reported,
            };
            if !held {
                record.action = ThreadAction::Wait;
                continue;
            }

            let thread = record.id;
            if !record.registers.is_empty() {
                if let Err(err) = host.set_register_blob(thread, &record.registers) {
                    warn!(%thread, error = %err, "Failed to write back registers");
                }
            }

            let step = record.action == ThreadAction::Step;
            let result = host
                .set_single_step(thread, step)
                .and_then(|()| host.resume_thread(thread));
            if let Err(err) = result {
                warn!(%thread, action = ?record.action, error = %err, "Failed to release thread");
            }

            record.state = SignalState::Running;
            record.action = ThreadAction::Wait;
        }

        self.stop_signal = 0;
        self.broken = false;
    }

    /// Tear down every thread, held or running, and forget them.
    pub(crate) fn kill_all(&mut self, host: &dyn SandboxHost)
    {
        for record in self.threads.iter_mut() {
            record.action = ThreadAction::Kill;
        }
        for thread in self.threads.ids() {
            if let Err(err) = host.kill_thread(thread) {
                warn!(%thread, error = %err, "Failed to kill thread");
            }
            self.threads.remove(thread);
        }
        info!("Target killed");
        self.current_thread = None;
        self.stop_signal = 0;
        self.broken = false;
    }
}
