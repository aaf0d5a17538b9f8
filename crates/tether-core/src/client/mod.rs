//! # Debugger-Side Client
//!
//! [`DebugClient`] talks to a stub over one [`Transport`]. Every request is
//! a blocking exchange: the packet is sent, then incoming packets are read
//! until the reply shows up. Stop notifications (`S`/`T`/`W`/`X`) and console
//! output (`O`) can arrive before the reply at any time; they are handed to
//! the registered handlers and to [`subscribe`](DebugClient::subscribe)d
//! channels, and the wait continues.
//!
//! The client also keeps its own breakpoint table. It patches the target
//! through ordinary memory requests and is independent of the stub's table.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tether_core::client::{ClientOptions, DebugClient};
//! use tether_core::types::Address;
//! use tether_protocol::SocketAddress;
//!
//! # fn main() -> tether_core::Result<()> {
//! let address = SocketAddress::parse("127.0.0.1:4014");
//! let mut client = DebugClient::connect(address, ClientOptions::default())?;
//!
//! let bytes = client.read_memory(Address::from(0x1000), 4)?;
//! println!("{bytes:02x?}");
//!
//! client.add_breakpoint(Address::from(0x2000))?;
//! let event = client.request_continue()?;
//! println!("{}", event.describe());
//! # Ok(())
//! # }
//! ```

mod session;
mod stop;

use std::time::Duration;

use tether_protocol::stream::TcpStream;
use tether_protocol::{Packet, SocketAddress, Stream, Transport, TransportFlags, INTERRUPT};
use tracing::{debug, info};

pub use stop::{classify, parse_error, parse_output, parse_stop, Incoming};

use self::session::{check_error, unexpected, Exchange, Session};
use crate::breakpoints::{BreakpointRecord, BreakpointTable};
use crate::error::{DebugError, Result};
use crate::events::{event_channel, DebugEvent, DebugEventReceiver};
use crate::types::{Address, ThreadId};

/// Largest memory transfer sent in one packet. Bigger requests are split.
pub const MEMORY_CHUNK: usize = 0x800;

/// Connection settings for a [`DebugClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions
{
    /// Wait budget for connecting, acknowledgements and each exchange.
    pub timeout: Duration,
    /// Transport behaviour.
    pub flags: TransportFlags,
}

impl Default for ClientOptions
{
    fn default() -> Self
    {
        Self {
            timeout: Duration::from_secs(5),
            flags: TransportFlags::default(),
        }
    }
}

/// Debugger-side endpoint of a session.
pub struct DebugClient
{
    session: Session,
    breakpoints: BreakpointTable,
}

impl DebugClient
{
    /// Connect to a stub listening at `address`.
    ///
    /// ## Errors
    ///
    /// [`DebugError::Io`] if the connection cannot be made within
    /// `options.timeout`.
    pub fn connect(address: SocketAddress, options: ClientOptions) -> Result<Self>
    {
        let stream = TcpStream::connect_timeout(address, options.timeout)?;
        info!(%address, "Connected to stub");
        Ok(Self::new(stream, options))
    }

    /// Run a session over an already connected stream.
    #[must_use]
    pub fn new(stream: impl Stream + 'static, options: ClientOptions) -> Self
    {
        let transport = Transport::with_flags(Box::new(stream), options.flags);
        Self {
            session: Session::new(transport, options.timeout),
            breakpoints: BreakpointTable::new(),
        }
    }

    /// Change the wait budget used by later requests.
    pub fn set_timeout(&mut self, timeout: Duration)
    {
        self.session.timeout = timeout;
    }

    /// Call `handler` for every stop notification.
    pub fn set_stop_handler(&mut self, handler: impl FnMut(&DebugEvent) + Send + 'static)
    {
        self.session.on_stop = Some(Box::new(handler));
    }

    /// Call `handler` with the decoded bytes of every console output packet.
    pub fn set_output_handler(&mut self, handler: impl FnMut(&[u8]) + Send + 'static)
    {
        self.session.on_output = Some(Box::new(handler));
    }

    /// Receive every later stop notification on a channel.
    ///
    /// Dropping the receiver unsubscribes it.
    #[must_use]
    pub fn subscribe(&mut self) -> DebugEventReceiver
    {
        let (sender, receiver) = event_channel();
        self.session.subscribers.push(sender);
        receiver
    }

    /// Whether a resume was sent and no stop has been seen since.
    #[must_use]
    pub fn is_running(&self) -> bool
    {
        self.session.running
    }

    /// The last stop notification received.
    #[must_use]
    pub fn last_event(&self) -> Option<&DebugEvent>
    {
        self.session.last_event.as_ref()
    }

    /// Signal of the current stop (`?`). `0` while the target runs.
    ///
    /// ## Errors
    ///
    /// Transport errors, or [`DebugError::MalformedReply`] if the reply is not
    /// a stop packet.
    pub fn last_signal(&mut self) -> Result<u8>
    {
        let reply = self.session.transact(&Packet::from_payload(*b"?"), Exchange::Status)?;
        parse_stop(reply.payload())
            .map(|event| event.signal)
            .ok_or_else(|| unexpected(reply.payload()))
    }

    /// Register blob of the current thread (`g`).
    ///
    /// ## Errors
    ///
    /// Transport errors, or [`DebugError::Remote`] (`E02` when the target has
    /// no threads).
    pub fn registers(&mut self) -> Result<Vec<u8>>
    {
        let mut reply = self.session.transact(&Packet::from_payload(*b"g"), Exchange::Query)?;
        check_error(&reply)?;
        let len = reply.peek_remaining().len() / 2;
        if len == 0 {
            return Ok(Vec::new());
        }
        reply.get_hex_block(len).ok_or_else(|| unexpected(reply.payload()))
    }

    /// Overwrite the register blob of the current thread (`G`).
    ///
    /// ## Errors
    ///
    /// Transport errors, or [`DebugError::Remote`] if the stub refuses the
    /// blob (`E01` for a size mismatch).
    pub fn set_registers(&mut self, blob: &[u8]) -> Result<()>
    {
        let mut request = Packet::new();
        request.put_raw(b'G');
        request.put_hex_block(blob);
        self.session.transact_ok(&request)
    }

    /// Read `len` bytes of target memory (`m`).
    ///
    /// Requests larger than [`MEMORY_CHUNK`] are split into several packets.
    ///
    /// ## Errors
    ///
    /// - [`DebugError::Remote`] (`E03`) if the stub cannot read the range
    /// - [`DebugError::InvalidArgument`] if the range wraps the address space
    pub fn read_memory(&mut self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        check_range(address, len)?;
        let mut bytes = Vec::with_capacity(len);
        let mut offset = 0;
        while offset < len {
            let chunk = (len - offset).min(MEMORY_CHUNK);
            bytes.extend(self.session.read_memory_chunk(address + offset as u64, chunk)?);
            offset += chunk;
        }
        Ok(bytes)
    }

    /// Write `data` to target memory (`M`), split like
    /// [`read_memory`](Self::read_memory).
    ///
    /// ## Errors
    ///
    /// - [`DebugError::Remote`] (`E03`) if the stub cannot write the range
    /// - [`DebugError::InvalidArgument`] if the range wraps the address space
    pub fn write_memory(&mut self, address: Address, data: &[u8]) -> Result<()>
    {
        check_range(address, data.len())?;
        for (index, chunk) in data.chunks(MEMORY_CHUNK).enumerate() {
            let offset = (index * MEMORY_CHUNK) as u64;
            self.session.write_memory_chunk(address + offset, chunk)?;
        }
        Ok(())
    }

    /// Ids of all target threads (`qfThreadInfo`, then `qsThreadInfo` until
    /// the list ends).
    ///
    /// ## Errors
    ///
    /// Transport errors, or [`DebugError::MalformedReply`].
    pub fn threads(&mut self) -> Result<Vec<ThreadId>>
    {
        let mut threads = Vec::new();
        let mut query = "qfThreadInfo";
        loop {
            let mut reply = self.session.transact(&Packet::from_payload(query), Exchange::Query)?;
            match reply.get_raw() {
                Some(b'm') => {
                    while let Some((id, separator)) = reply.get_number() {
                        threads.push(ThreadId(id));
                        if separator != b',' {
                            break;
                        }
                    }
                }
                Some(b'l') => return Ok(threads),
                _ => return Err(unexpected(reply.payload())),
            }
            query = "qsThreadInfo";
        }
    }

    /// Thread the stub acts on for register and step requests (`qC`).
    ///
    /// ## Errors
    ///
    /// Transport errors, or [`DebugError::MalformedReply`].
    pub fn current_thread(&mut self) -> Result<Option<ThreadId>>
    {
        let mut reply = self.session.transact(&Packet::from_payload(*b"qC"), Exchange::Query)?;
        if !reply.payload().starts_with(b"QC") {
            return Err(unexpected(reply.payload()));
        }
        reply.get_raw();
        reply.get_raw();
        Ok(reply.get_number().map(|(id, _)| ThreadId(id)))
    }

    /// Whether the stub still knows `thread` (`T`).
    ///
    /// ## Errors
    ///
    /// Transport errors, or [`DebugError::Remote`] for errors other than
    /// "unknown thread".
    pub fn thread_alive(&mut self, thread: ThreadId) -> Result<bool>
    {
        let mut request = Packet::new();
        request.put_raw(b'T');
        request.put_number(thread.raw(), 0);
        match self.session.transact_ok(&request) {
            Ok(()) => Ok(true),
            Err(DebugError::Remote(0x02)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Target description document (`qXfer:features:read:target.xml`).
    ///
    /// ## Errors
    ///
    /// Transport errors, or [`DebugError::MalformedReply`] if the stub does
    /// not support the query.
    pub fn target_description(&mut self) -> Result<String>
    {
        let request = Packet::from_payload("qXfer:features:read:target.xml:0,fff");
        let mut reply = self.session.transact(&request, Exchange::Query)?;
        match reply.get_raw() {
            Some(b'l' | b'm') => Ok(reply.get_string().unwrap_or_default()),
            _ => Err(unexpected(reply.payload())),
        }
    }

    /// Architecture name from the target description.
    ///
    /// ## Errors
    ///
    /// As [`target_description`](Self::target_description), plus
    /// [`DebugError::MalformedReply`] when the document names no
    /// architecture.
    pub fn architecture(&mut self) -> Result<String>
    {
        let document = self.target_description()?;
        element_text(&document, "architecture")
            .map(str::to_string)
            .ok_or(DebugError::MalformedReply(document))
    }

    /// Path of the target executable (`qExecPath`).
    ///
    /// ## Errors
    ///
    /// Transport errors.
    pub fn exec_path(&mut self) -> Result<String>
    {
        let mut reply = self.session.transact(&Packet::from_payload(*b"qExecPath"), Exchange::Verbatim)?;
        check_error(&reply)?;
        Ok(reply.get_string().unwrap_or_default())
    }

    /// Resume all threads (`c`) and block until the next stop.
    ///
    /// ## Errors
    ///
    /// [`TransportError::Timeout`](tether_protocol::TransportError::Timeout)
    /// if nothing stops within the wait budget; the target keeps running and
    /// [`wait_for_stop`](Self::wait_for_stop) can pick the stop up later.
    pub fn request_continue(&mut self) -> Result<DebugEvent>
    {
        self.resume_and_wait(b'c')
    }

    /// Single-step the current thread (`s`) and block until it stops.
    ///
    /// ## Errors
    ///
    /// As [`request_continue`](Self::request_continue).
    pub fn request_step(&mut self) -> Result<DebugEvent>
    {
        self.resume_and_wait(b's')
    }

    /// Resume all threads (`c`) without waiting for the stop.
    ///
    /// ## Errors
    ///
    /// Transport errors.
    pub fn request_continue_background(&mut self) -> Result<()>
    {
        self.resume(b'c')
    }

    /// Single-step the current thread (`s`) without waiting for the stop.
    ///
    /// ## Errors
    ///
    /// Transport errors.
    pub fn request_step_background(&mut self) -> Result<()>
    {
        self.resume(b's')
    }

    fn resume(&mut self, command: u8) -> Result<()>
    {
        self.session.post(&Packet::from_payload(vec![command]))?;
        self.session.running = true;
        debug!(command = %char::from(command), "Target resumed");
        Ok(())
    }

    fn resume_and_wait(&mut self, command: u8) -> Result<DebugEvent>
    {
        self.session.running = true;
        let reply = self.session.transact(&Packet::from_payload(vec![command]), Exchange::Control)?;
        parse_stop(reply.payload()).ok_or_else(|| unexpected(reply.payload()))
    }

    /// Ask the stub to stop the target (raw `0x03`). Does not wait; the stop
    /// arrives as a notification.
    ///
    /// ## Errors
    ///
    /// Transport errors.
    pub fn request_break(&mut self) -> Result<()>
    {
        debug!(byte = INTERRUPT, "Sending break request");
        self.session.transport.send_interrupt()?;
        Ok(())
    }

    /// Wait up to `timeout` for a stop notification.
    ///
    /// ## Errors
    ///
    /// [`TransportError::Timeout`](tether_protocol::TransportError::Timeout)
    /// if none arrives in time.
    pub fn wait_for_stop(&mut self, timeout: Duration) -> Result<DebugEvent>
    {
        self.session.wait_for_stop(timeout)
    }

    /// Handle every notification already waiting, without blocking.
    ///
    /// ## Returns
    ///
    /// The number of packets handled.
    ///
    /// ## Errors
    ///
    /// Transport errors other than "no data".
    pub fn poll_notifications(&mut self) -> Result<usize>
    {
        self.session.poll_notifications()
    }

    /// Kill the target (`k`). The stub does not answer.
    ///
    /// ## Errors
    ///
    /// Transport errors.
    pub fn kill(&mut self) -> Result<()>
    {
        self.session.post(&Packet::from_payload(*b"k"))?;
        self.session.running = false;
        Ok(())
    }

    /// Track a breakpoint at `address`, capturing the original byte.
    ///
    /// ## Returns
    ///
    /// `false` if the breakpoint was already tracked; nothing is touched then.
    ///
    /// ## Errors
    ///
    /// Memory request failures. The breakpoint is not tracked then.
    pub fn add_breakpoint(&mut self, address: Address) -> Result<bool>
    {
        self.breakpoints.add(address, &mut self.session)
    }

    /// Restore the original byte and forget the breakpoint.
    ///
    /// ## Errors
    ///
    /// [`DebugError::NoBreakpoint`] or memory request failures.
    pub fn remove_breakpoint(&mut self, address: Address) -> Result<BreakpointRecord>
    {
        self.breakpoints.remove(address, &mut self.session)
    }

    /// Enable a breakpoint.
    ///
    /// ## Errors
    ///
    /// [`DebugError::NoBreakpoint`] or memory request failures.
    pub fn enable_breakpoint(&mut self, address: Address) -> Result<()>
    {
        self.breakpoints.enable(address, &mut self.session)
    }

    /// Disable a breakpoint, restoring the original byte.
    ///
    /// ## Errors
    ///
    /// [`DebugError::NoBreakpoint`] or memory request failures.
    pub fn disable_breakpoint(&mut self, address: Address) -> Result<()>
    {
        self.breakpoints.disable(address, &mut self.session)
    }

    /// Suspend a breakpoint without changing its enabled flag.
    ///
    /// ## Errors
    ///
    /// [`DebugError::NoBreakpoint`] or memory request failures.
    pub fn suspend_breakpoint(&mut self, address: Address) -> Result<()>
    {
        self.breakpoints.suspend(address, &mut self.session)
    }

    /// Undo [`suspend_breakpoint`](Self::suspend_breakpoint).
    ///
    /// ## Errors
    ///
    /// [`DebugError::NoBreakpoint`] or memory request failures.
    pub fn resume_breakpoint(&mut self, address: Address) -> Result<()>
    {
        self.breakpoints.resume(address, &mut self.session)
    }

    /// The tracked breakpoint at `address`.
    #[must_use]
    pub fn breakpoint(&self, address: Address) -> Option<&BreakpointRecord>
    {
        self.breakpoints.get(address)
    }

    /// All tracked breakpoints in address order.
    pub fn breakpoints(&self) -> impl Iterator<Item = &BreakpointRecord>
    {
        self.breakpoints.iter()
    }
}

fn check_range(address: Address, len: usize) -> Result<()>
{
    if address.checked_add(len as u64).is_none() {
        return Err(DebugError::InvalidArgument(format!(
            "{len} bytes at {address} wrap the address space"
        )));
    }
    Ok(())
}

fn element_text<'a>(document: &'a str, element: &str) -> Option<&'a str>
{
    let open = format!("<{element}>");
    let close = format!("</{element}>");
    let start = document.find(&open)? + open.len();
    let end = start + document[start..].find(&close)?;
    Some(&document[start..end])
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_element_text()
    {
        let document = "<target><architecture>i386:x86-64</architecture></target>";
        assert_eq!(element_text(document, "architecture"), Some("i386:x86-64"));
        assert_eq!(element_text(document, "osabi"), None);
    }

    #[test]
    fn test_check_range_rejects_wrap()
    {
        assert!(check_range(Address::from(u64::MAX), 2).is_err());
        assert!(check_range(Address::from(0x1000), 0x800).is_ok());
    }
}
