//! Command handling for one request packet.
//!
//! Handlers decode their arguments from the request and write the answer
//! into the reply. Any decode failure or host failure turns into an
//! `E<code>` reply; a bad request never ends the session.

use std::fmt::Write as _;

use tether_protocol::transport::MAX_PACKET_SIZE;
use tether_protocol::{Packet, INTERRUPT};
use tracing::{debug, warn};

use super::memory::TargetMemory;
use super::state::StubState;
use super::StubConfig;
use crate::host::SandboxHost;
use crate::threads::ThreadAction;
use crate::types::{signal, Address, ThreadId};

/// Error codes sent as `E<code>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorReply
{
    /// Malformed or unsupported request.
    Malformed = 0x01,
    /// No such thread, or no threads at all.
    UnknownThread = 0x02,
    /// The host could not access memory or registers.
    Access = 0x03,
}

impl ErrorReply
{
    /// Wire code.
    #[must_use]
    pub fn code(self) -> u8
    {
        self as u8
    }
}

/// Largest memory transfer a single `m`/`M` may ask for.
pub const MAX_MEMORY_TRANSFER: usize = (MAX_PACKET_SIZE - 32) / 2;

const SUPPORTED_FEATURES: &str = "PacketSize=3fff;qXfer:features:read+;multiprocess+;qXfer:threads:read+";

enum Outcome
{
    Reply,
    NoReply,
}

type Handled = std::result::Result<Outcome, ErrorReply>;

pub(crate) struct Dispatcher<'a>
{
    pub(crate) host: &'a dyn SandboxHost,
    pub(crate) config: &'a StubConfig,
}

impl Dispatcher<'_>
{
    fn memory(&self) -> TargetMemory<'_>
    {
        TargetMemory::new(self.host, self.config.pid)
    }

    /// Execute `request` and build the reply, or `None` when the command
    /// answers later (continue, step, kill).
    pub(crate) fn handle(&self, state: &mut StubState, request: &mut Packet) -> Option<Packet>
    {
        let mut reply = Packet::new();
        if let Some(sequence) = request.sequence() {
            reply.set_sequence(sequence);
        }

        let outcome = match request.get_raw() {
            Some(INTERRUPT) => self.interrupt(state, &mut reply),
            Some(b'?') => Ok(stop_reply(&mut reply, state.stop_signal)),
            Some(b'g') => self.read_registers(state, &mut reply),
            Some(b'G') => write_registers(state, request, &mut reply),
            Some(b'm') => self.read_memory(request, &mut reply),
            Some(b'M') => self.write_memory(request, &mut reply),
            Some(b'H') => Err(ErrorReply::Malformed),
            Some(b'T') => thread_alive(state, request, &mut reply),
            Some(b'q') => Ok(self.query(state, request, &mut reply)),
            Some(b'Z') => self.insert_breakpoint(state, request, &mut reply),
            Some(b'z') => self.remove_breakpoint(state, request, &mut reply),
            Some(b'c') => Ok(self.resume(state)),
            Some(b's') => self.step(state),
            Some(b'k') => Ok(self.kill(state)),
            Some(other) => {
                debug!(command = %char::from(other), "Unsupported command");
                Err(ErrorReply::Malformed)
            }
            None => Err(ErrorReply::Malformed),
        };

        match outcome {
            Ok(Outcome::Reply) => Some(reply),
            Ok(Outcome::NoReply) => None,
            Err(error) => {
                let sequence = reply.sequence();
                reply.clear();
                if let Some(sequence) = sequence {
                    reply.set_sequence(sequence);
                }
                reply.put_raw(b'E');
                reply.put_hex_byte(error.code());
                Some(reply)
            }
        }
    }

    fn interrupt(&self, state: &mut StubState, reply: &mut Packet) -> Handled
    {
        state.break_on_request(self.host, signal::INTERRUPTED);
        Ok(stop_reply(reply, state.stop_signal))
    }

    fn read_registers(&self, state: &mut StubState, reply: &mut Packet) -> Handled
    {
        let thread = state.selected_thread().ok_or(ErrorReply::UnknownThread)?;
        let record = state.threads.get_mut(thread).ok_or(ErrorReply::UnknownThread)?;
        if record.registers.is_empty() {
            record.registers = self.host.get_register_blob(thread).map_err(|err| {
                warn!(%thread, error = %err, "Register read failed");
                ErrorReply::Access
            })?;
        }
        reply.put_hex_block(&record.registers);
        Ok(Outcome::Reply)
    }

    fn read_memory(&self, request: &mut Packet, reply: &mut Packet) -> Handled
    {
        let (address, len) = memory_range(request, 0)?;
        let bytes = self.memory().read(address, len).map_err(|err| {
            debug!(%address, len, error = %err, "Memory read failed");
            ErrorReply::Access
        })?;
        reply.put_hex_block(&bytes);
        Ok(Outcome::Reply)
    }

    fn write_memory(&self, request: &mut Packet, reply: &mut Packet) -> Handled
    {
        let (address, len) = memory_range(request, b':')?;
        let data = if len == 0 {
            Vec::new()
        } else {
            request.get_hex_block(len).ok_or(ErrorReply::Malformed)?
        };
        if !request.peek_remaining().is_empty() {
            return Err(ErrorReply::Malformed);
        }
        self.memory().write(address, &data).map_err(|err| {
            debug!(%address, len, error = %err, "Memory write failed");
            ErrorReply::Access
        })?;
        reply.put_string("OK");
        Ok(Outcome::Reply)
    }

    fn query(&self, state: &StubState, request: &mut Packet, reply: &mut Packet) -> Outcome
    {
        let name = request.get_string().unwrap_or_default();
        match name.as_str() {
            "Attached" => reply.put_string("1"),
            "C" => {
                reply.put_string("QC");
                if let Some(thread) = state.selected_thread() {
                    reply.put_number(thread.raw(), 0);
                }
            }
            "ExecPath" => reply.put_string(&self.config.exec_path),
            "fThreadInfo" => {
                let ids = state.threads.ids();
                if ids.is_empty() {
                    reply.put_raw(b'l');
                } else {
                    reply.put_raw(b'm');
                    for (index, thread) in ids.iter().enumerate() {
                        let separator = if index + 1 < ids.len() { b',' } else { 0 };
                        reply.put_number(thread.raw(), separator);
                    }
                }
            }
            "sThreadInfo" => reply.put_raw(b'l'),
            _ if name.starts_with("Supported") => reply.put_string(SUPPORTED_FEATURES),
            _ if name.starts_with("Xfer:features:read:target.xml:") => {
                reply.put_string(&format!(
                    "l<target><architecture>{}</architecture><osabi>GNU/Linux</osabi></target>",
                    self.config.architecture
                ));
            }
            _ if name.starts_with("Xfer:threads:read::") => {
                let mut document = String::from("l<threads>\n");
                for thread in state.threads.ids() {
                    let _ = writeln!(document, "<thread id=\"{:x}\" core=\"0\"/>", thread.raw());
                }
                document.push_str("</threads>\n");
                reply.put_string(&document);
            }
            _ => debug!(query = %name, "Unsupported query"),
        }
        Outcome::Reply
    }

    fn insert_breakpoint(&self, state: &mut StubState, request: &mut Packet, reply: &mut Packet) -> Handled
    {
        let Some(address) = software_breakpoint_address(request)? else {
            return Ok(Outcome::Reply);
        };
        state
            .breakpoints
            .add(address, &mut self.memory())
            .map_err(|err| {
                debug!(%address, error = %err, "Breakpoint insert failed");
                ErrorReply::Access
            })?;
        reply.put_string("OK");
        Ok(Outcome::Reply)
    }

    fn remove_breakpoint(&self, state: &mut StubState, request: &mut Packet, reply: &mut Packet) -> Handled
    {
        let Some(address) = software_breakpoint_address(request)? else {
            return Ok(Outcome::Reply);
        };
        if !state.breakpoints.contains(address) {
            return Err(ErrorReply::Malformed);
        }
        if state.start_breakpoint == Some(address) {
            state.start_breakpoint = None;
        }
        state
            .breakpoints
            .remove(address, &mut self.memory())
            .map_err(|err| {
                debug!(%address, error = %err, "Breakpoint removal failed");
                ErrorReply::Access
            })?;
        reply.put_string("OK");
        Ok(Outcome::Reply)
    }

    /// Release the held threads. The answer to a resume is the next stop
    /// notification, not a reply.
    fn resume(&self, state: &mut StubState) -> Outcome
    {
        state.resume_all(self.host);
        Outcome::NoReply
    }

    /// Resume with only the current thread single-stepping. `E01` when no
    /// thread has been reported as current.
    fn step(&self, state: &mut StubState) -> Handled
    {
        let thread = state
            .current_thread
            .filter(|thread| state.threads.contains(*thread))
            .ok_or(ErrorReply::Malformed)?;
        if let Some(record) = state.threads.get_mut(thread) {
            record.action = ThreadAction::Step;
        }
        Ok(self.resume(state))
    }

    /// Kill every thread, whether held or running. There is no reply.
    fn kill(&self, state: &mut StubState) -> Outcome
    {
        state.kill_all(self.host);
        Outcome::NoReply
    }
}

fn stop_reply(reply: &mut Packet, signal: u8) -> Outcome
{
    reply.put_raw(b'S');
    reply.put_hex_byte(signal);
    Outcome::Reply
}

fn write_registers(state: &mut StubState, request: &mut Packet, reply: &mut Packet) -> Handled
{
    let thread = state.selected_thread().ok_or(ErrorReply::UnknownThread)?;
    let record = state.threads.get_mut(thread).ok_or(ErrorReply::UnknownThread)?;
    let digits = request.peek_remaining().len();
    if digits % 2 != 0 || (!record.registers.is_empty() && digits / 2 != record.registers.len()) {
        return Err(ErrorReply::Malformed);
    }
    record.registers = request.get_hex_block(digits / 2).ok_or(ErrorReply::Malformed)?;
    reply.put_string("OK");
    Ok(Outcome::Reply)
}

fn thread_alive(state: &StubState, request: &mut Packet, reply: &mut Packet) -> Handled
{
    let (raw, _) = request.get_number().ok_or(ErrorReply::Malformed)?;
    if !state.threads.contains(ThreadId::from(raw)) {
        return Err(ErrorReply::UnknownThread);
    }
    reply.put_string("OK");
    Ok(Outcome::Reply)
}

/// Decode `<addr>,<len>` followed by `terminator` (`0` for end of packet).
fn memory_range(request: &mut Packet, terminator: u8) -> std::result::Result<(Address, usize), ErrorReply>
{
    let (address, separator) = request.get_number().ok_or(ErrorReply::Malformed)?;
    if separator != b',' {
        return Err(ErrorReply::Malformed);
    }
    let (len, separator) = request.get_number().ok_or(ErrorReply::Malformed)?;
    if separator != terminator {
        return Err(ErrorReply::Malformed);
    }
    let len = usize::try_from(len).map_err(|_| ErrorReply::Malformed)?;
    if len > MAX_MEMORY_TRANSFER || address.checked_add(len as u64).is_none() {
        return Err(ErrorReply::Malformed);
    }
    Ok((Address::from(address), len))
}

/// Decode `0,<addr>,<kind>` after `Z`/`z`. `None` for breakpoint types other
/// than software breakpoints, which get an empty (unsupported) reply.
fn software_breakpoint_address(request: &mut Packet) -> std::result::Result<Option<Address>, ErrorReply>
{
    let (kind, separator) = request.get_number().ok_or(ErrorReply::Malformed)?;
    if separator != b',' {
        return Err(ErrorReply::Malformed);
    }
    if kind != 0 {
        return Ok(None);
    }
    let (address, separator) = request.get_number().ok_or(ErrorReply::Malformed)?;
    if separator != b',' {
        return Err(ErrorReply::Malformed);
    }
    Ok(Some(Address::from(address)))
}
