//! Stub-side thread bookkeeping.
//!
//! Each thread the host reports gets a [`ThreadRecord`]. The stub's suspend
//! and resume algorithms drive two fields of it:
//!
//! - [`SignalState`]: running, parked by the debugger, or stopped with a
//!   signal the debugger has not been told about yet
//! - [`ThreadAction`]: what to do with the thread on the next resume

use std::collections::BTreeMap;

use crate::types::ThreadId;

/// Why a thread is, or is not, executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalState
{
    /// Executing normally.
    #[default]
    Running,
    /// Parked by the stub while the target is broken; no signal of its own.
    Suspended,
    /// Stopped by the host with this signal.
    Signalled(u8),
}

impl SignalState
{
    /// The signal number, if the thread stopped with one.
    #[must_use]
    pub fn signal(self) -> Option<u8>
    {
        match self {
            Self::Signalled(signal) => Some(signal),
            _ => None,
        }
    }
}

/// What the next resume should do with a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadAction
{
    /// No decision yet; stay as is.
    #[default]
    Wait,
    /// Execute one instruction, then trap.
    Step,
    /// Run freely.
    Continue,
    /// Terminate the thread.
    Kill,
}

/// One thread of the target as the stub sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord
{
    /// Host thread id.
    pub id: ThreadId,
    /// Register snapshot, refreshed on suspend and written back on resume.
    pub registers: Vec<u8>,
    /// Current stop state.
    pub state: SignalState,
    /// Pending resume decision.
    pub action: ThreadAction,
}

impl ThreadRecord
{
    /// A running thread with no register snapshot yet.
    #[must_use]
    pub fn new(id: ThreadId) -> Self
    {
        Self {
            id,
            registers: Vec::new(),
            state: SignalState::Running,
            action: ThreadAction::Wait,
        }
    }
}

/// Threads of the target in id order.
#[derive(Debug, Clone, Default)]
pub struct ThreadTable
{
    threads: BTreeMap<ThreadId, ThreadRecord>,
}

impl ThreadTable
{
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Track a new thread. Re-adding a known id keeps the existing record.
    pub fn insert(&mut self, id: ThreadId) -> &mut ThreadRecord
    {
        self.threads.entry(id).or_insert_with(|| ThreadRecord::new(id))
    }

    /// Stop tracking a thread.
    pub fn remove(&mut self, id: ThreadId) -> Option<ThreadRecord>
    {
        self.threads.remove(&id)
    }

    /// Look a thread up.
    #[must_use]
    pub fn get(&self, id: ThreadId) -> Option<&ThreadRecord>
    {
        self.threads.get(&id)
    }

    /// Look a thread up for modification.
    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut ThreadRecord>
    {
        self.threads.get_mut(&id)
    }

    /// Whether the thread is tracked.
    #[must_use]
    pub fn contains(&self, id: ThreadId) -> bool
    {
        self.threads.contains_key(&id)
    }

    /// Lowest thread id, used when no thread has been selected.
    #[must_use]
    pub fn first(&self) -> Option<ThreadId>
    {
        self.threads.keys().next().copied()
    }

    /// All thread ids in order.
    #[must_use]
    pub fn ids(&self) -> Vec<ThreadId>
    {
        self.threads.keys().copied().collect()
    }

    /// First thread (by id) stopped with a signal.
    #[must_use]
    pub fn first_signalled(&self) -> Option<(ThreadId, u8)>
    {
        self.threads
            .values()
            .find_map(|record| record.state.signal().map(|signal| (record.id, signal)))
    }

    /// Iterate over the records.
    pub fn iter(&self) -> impl Iterator<Item = &ThreadRecord>
    {
        self.threads.values()
    }

    /// Iterate over the records mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ThreadRecord>
    {
        self.threads.values_mut()
    }

    /// Number of tracked threads.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.threads.len()
    }

    /// Whether no threads are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.threads.is_empty()
    }
}
