//! Request/reply exchange with stop and output notifications mixed in.

use std::time::{Duration, Instant};

use tether_protocol::{Packet, Transport, TransportError};
use tracing::{debug, info};

use super::stop::{classify, parse_error, Incoming};
use crate::breakpoints::PatchMemory;
use crate::error::{DebugError, Result};
use crate::events::{DebugEvent, DebugEventSender, ProcessState};
use crate::types::Address;

pub(crate) type StopHandler = Box<dyn FnMut(&DebugEvent) + Send>;
pub(crate) type OutputHandler = Box<dyn FnMut(&[u8]) + Send>;

/// How the reply to a request is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exchange
{
    /// A plain reply; stop packets are notifications.
    Query,
    /// A resume request; the next stop packet is the answer.
    Control,
    /// A status request (`?`) whose reply looks like a stop packet but
    /// describes the current state instead of announcing a change.
    Status,
    /// A reply whose payload is free text and may look like a stop or output
    /// packet. It is taken as-is whenever it cannot be a notification.
    Verbatim,
}

pub(crate) struct Session
{
    pub(crate) transport: Transport,
    pub(crate) timeout: Duration,
    pub(crate) running: bool,
    pub(crate) last_event: Option<DebugEvent>,
    pub(crate) on_stop: Option<StopHandler>,
    pub(crate) on_output: Option<OutputHandler>,
    pub(crate) subscribers: Vec<DebugEventSender>,
}

impl Session
{
    pub(crate) fn new(transport: Transport, timeout: Duration) -> Self
    {
        Self {
            transport,
            timeout,
            running: false,
            last_event: None,
            on_stop: None,
            on_output: None,
            subscribers: Vec::new(),
        }
    }

    /// Send `request` and wait for its reply.
    ///
    /// Stop and output packets arriving first are dispatched to the
    /// handlers. With sequence numbers on, a reply carrying a different
    /// number than the request is stale and dropped.
    ///
    /// Without sequence numbers, a stop packet answering a status request
    /// while the target is running is also reported as a stop, since it
    /// cannot be told apart from a notification.
    pub(crate) fn transact(&mut self, request: &Packet, exchange: Exchange) -> Result<Packet>
    {
        let deadline = Instant::now() + self.timeout;
        let sent = self.transport.send(request, self.timeout)?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(self.timeout).into());
            }
            let mut reply = Packet::new();
            self.transport.receive(&mut reply, remaining)?;

            let echoed = sent.is_some() && reply.sequence() == sent;
            if exchange == Exchange::Verbatim && (echoed || (sent.is_none() && !self.running)) {
                return Ok(reply);
            }
            match classify(&reply) {
                Incoming::Stop(event) if exchange == Exchange::Status && (sent.is_none() || echoed) => {
                    // Unnumbered, a stop while running may be a notification
                    // that crossed the request.
                    if sent.is_none() && self.running {
                        self.record_stop(event);
                    }
                    return Ok(reply);
                }
                Incoming::Stop(event) => {
                    self.record_stop(event);
                    if exchange == Exchange::Control {
                        return Ok(reply);
                    }
                }
                Incoming::Output(bytes) => self.emit_output(&bytes),
                Incoming::Reply => {
                    if let (Some(sent), Some(received)) = (sent, reply.sequence()) {
                        if sent != received {
                            debug!(sent, received, payload = %reply.payload().escape_ascii(), "Dropping stale reply");
                            continue;
                        }
                    }
                    return Ok(reply);
                }
            }
        }
    }

    /// [`transact`](Self::transact) for requests answered with `OK`.
    pub(crate) fn transact_ok(&mut self, request: &Packet) -> Result<()>
    {
        let reply = self.transact(request, Exchange::Query)?;
        match reply.payload() {
            b"OK" => Ok(()),
            payload => Err(unexpected(payload)),
        }
    }

    /// Send a request the stub does not answer.
    pub(crate) fn post(&mut self, request: &Packet) -> Result<()>
    {
        self.transport.send(request, self.timeout)?;
        Ok(())
    }

    /// Wait up to `timeout` for the next stop notification.
    pub(crate) fn wait_for_stop(&mut self, timeout: Duration) -> Result<DebugEvent>
    {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(timeout).into());
            }
            let mut packet = Packet::new();
            self.transport.receive(&mut packet, remaining)?;
            if let Some(event) = self.dispatch_unsolicited(&packet) {
                return Ok(event);
            }
        }
    }

    /// Handle every packet already waiting. Returns how many arrived.
    pub(crate) fn poll_notifications(&mut self) -> Result<usize>
    {
        let mut handled = 0;
        loop {
            let mut packet = Packet::new();
            match self.transport.try_receive(&mut packet) {
                Ok(()) => {
                    self.dispatch_unsolicited(&packet);
                    handled += 1;
                }
                Err(TransportError::NoData) => return Ok(handled),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn dispatch_unsolicited(&mut self, packet: &Packet) -> Option<DebugEvent>
    {
        match classify(packet) {
            Incoming::Stop(event) => {
                self.record_stop(event.clone());
                Some(event)
            }
            Incoming::Output(bytes) => {
                self.emit_output(&bytes);
                None
            }
            Incoming::Reply => {
                debug!(payload = %packet.payload().escape_ascii(), "Ignoring reply with no request outstanding");
                None
            }
        }
    }

    fn record_stop(&mut self, event: DebugEvent)
    {
        info!(event = %event.describe(), "Target stopped");
        self.running = event.state == ProcessState::Running;
        if let Some(handler) = self.on_stop.as_mut() {
            handler(&event);
        }
        self.subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
        self.last_event = Some(event);
    }

    fn emit_output(&mut self, bytes: &[u8])
    {
        match self.on_output.as_mut() {
            Some(handler) => handler(bytes),
            None => debug!(output = %bytes.escape_ascii(), "Target output"),
        }
    }

    pub(crate) fn read_memory_chunk(&mut self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        let mut request = Packet::new();
        request.put_raw(b'm');
        request.put_number(address.value(), b',');
        request.put_number(len as u64, 0);

        let mut reply = self.transact(&request, Exchange::Query)?;
        check_error(&reply)?;
        let bytes = reply
            .get_hex_block(len)
            .ok_or_else(|| unexpected(reply.payload()))?;
        if !reply.peek_remaining().is_empty() {
            return Err(unexpected(reply.payload()));
        }
        Ok(bytes)
    }

    pub(crate) fn write_memory_chunk(&mut self, address: Address, data: &[u8]) -> Result<()>
    {
        let mut request = Packet::new();
        request.put_raw(b'M');
        request.put_number(address.value(), b',');
        request.put_number(data.len() as u64, b':');
        request.put_hex_block(data);

        let reply = self.transact(&request, Exchange::Query)?;
        check_error(&reply)?;
        match reply.payload() {
            b"OK" => Ok(()),
            payload => Err(unexpected(payload)),
        }
    }
}

impl PatchMemory for Session
{
    fn read_byte(&mut self, address: Address) -> Result<u8>
    {
        self.read_memory_chunk(address, 1)?
            .first()
            .copied()
            .ok_or(DebugError::MemoryAccess { address, len: 1 })
    }

    fn write_byte(&mut self, address: Address, value: u8) -> Result<()>
    {
        self.write_memory_chunk(address, &[value])
    }
}

/// Turn an `E<code>` reply into [`DebugError::Remote`].
pub(crate) fn check_error(reply: &Packet) -> Result<()>
{
    match parse_error(reply.payload()) {
        Some(code) => Err(DebugError::Remote(code)),
        None => Ok(()),
    }
}

pub(crate) fn unexpected(payload: &[u8]) -> DebugError
{
    if let Some(code) = parse_error(payload) {
        return DebugError::Remote(code);
    }
    DebugError::MalformedReply(payload.escape_ascii().to_string())
}
