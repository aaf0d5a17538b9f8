//! # Transport
//!
//! Framing, checksums, acknowledgements and sequence numbers over a [`Stream`].
//!
//! ## Wire format
//!
//! ```text
//! $[SS:]<payload>#<cc>
//! ```
//!
//! - `SS:` is an optional two-digit hex sequence number. It is covered by the
//!   checksum and stripped into [`Packet::sequence`] on receipt.
//! - `cc` is the sum of every byte between `$` and `#`, modulo 256, as two hex
//!   digits.
//! - A good frame is answered with `+` (followed by the echoed `SS` digits when
//!   the frame carried a sequence number), a bad one with `-`.
//! - A bare `0x03` outside any frame is an out-of-band break request.
//!
//! ## Acknowledgement wait
//!
//! After writing a frame, [`Transport::send`] reads until it sees `+`. Any other
//! byte causes the exact same frame to be written again. When the frame carried
//! a sequence number, a `+` echoing some other number is a late acknowledgement
//! of an earlier frame and is skipped; a `+` with no digits behind it is taken
//! as the acknowledgement. A `$` seen while
//! waiting is the peer's own frame crossing ours on the wire: it is received,
//! acknowledged and queued for the next [`Transport::receive`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{TransportError, TransportResult};
use crate::packet::{decode_hex_pair, encode_nibble, Packet};
use crate::stream::Stream;

/// Out-of-band break byte.
pub const INTERRUPT: u8 = 0x03;

/// Largest payload advertised to peers.
pub const MAX_PACKET_SIZE: usize = 0x3fff;

/// Wait budget used by [`Transport::try_receive`] once a frame has started.
pub const FRAME_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long the digits echoed after a `+` may trail it.
const ECHO_WAIT: Duration = Duration::from_millis(50);

const READ_CHUNK: usize = 1024;

/// Per-session behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct TransportFlags
{
    /// Neither send nor expect `+`/`-` acknowledgements.
    pub ignore_ack: bool,
    /// Prefix outgoing frames with an `SS:` sequence number.
    pub use_sequence: bool,
    /// Log every framed packet written.
    pub log_sent: bool,
    /// Log every framed packet read.
    pub log_received: bool,
}

impl TransportFlags
{
    /// Turn both wire-logging flags on or off.
    #[must_use]
    pub const fn with_wire_log(mut self, enabled: bool) -> Self
    {
        self.log_sent = enabled;
        self.log_received = enabled;
        self
    }
}

/// One framed, acknowledged session bound to a single stream
///
/// The transport owns its stream; dropping the transport closes the
/// connection. It is not shared between threads: one side of one connection
/// uses one transport.
///
/// ## Example
///
/// ```rust
/// use std::time::Duration;
/// use tether_protocol::stream::memory_pair;
/// use tether_protocol::{Packet, Transport};
///
/// let (left, right) = memory_pair();
/// let mut debugger = Transport::new(Box::new(left));
/// let mut target = Transport::new(Box::new(right));
///
/// let receiver = std::thread::spawn(move || {
///     let mut request = Packet::new();
///     target.receive(&mut request, Duration::from_secs(5)).map(|()| request)
/// });
///
/// debugger.send(&Packet::from_payload("?"), Duration::from_secs(5))?;
/// let request = receiver.join().unwrap()?;
/// assert_eq!(request.payload(), b"?");
/// # Ok::<(), tether_protocol::TransportError>(())
/// ```
pub struct Transport
{
    stream: Box<dyn Stream>,
    flags: TransportFlags,
    next_sequence: u8,
    inbound: VecDeque<u8>,
    deferred: VecDeque<Packet>,
}

impl Transport
{
    /// Wrap `stream` with default flags (acknowledged, no sequence numbers).
    #[must_use]
    pub fn new(stream: Box<dyn Stream>) -> Self
    {
        Self::with_flags(stream, TransportFlags::default())
    }

    /// Wrap `stream` with explicit flags.
    #[must_use]
    pub fn with_flags(stream: Box<dyn Stream>, flags: TransportFlags) -> Self
    {
        Self {
            stream,
            flags,
            next_sequence: 0,
            inbound: VecDeque::new(),
            deferred: VecDeque::new(),
        }
    }

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> TransportFlags
    {
        self.flags
    }

    /// Replace the flags.
    pub fn set_flags(&mut self, flags: TransportFlags)
    {
        self.flags = flags;
    }

    fn allocate_sequence(&mut self) -> u8
    {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        sequence
    }

    /// Frame and send `packet`, waiting up to `timeout` for the acknowledgement.
    ///
    /// A sequence number already set on the packet is always put on the wire
    /// (replies echo the request's number). Otherwise, when sequence numbers
    /// are enabled, the next value of the session counter is used.
    ///
    /// ## Returns
    ///
    /// The sequence number put on the wire, if any.
    ///
    /// ## Errors
    ///
    /// - [`TransportError::Timeout`] if no `+` arrived in time
    /// - [`TransportError::ConnectionLost`] on any stream failure
    pub fn send(&mut self, packet: &Packet, timeout: Duration) -> TransportResult<Option<u8>>
    {
        let sequence = match packet.sequence() {
            Some(sequence) => Some(sequence),
            None if self.flags.use_sequence => Some(self.allocate_sequence()),
            None => None,
        };
        let frame = frame_payload(packet.payload(), sequence);
        let deadline = Instant::now() + timeout;

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            self.stream.write_all(&frame)?;
            if self.flags.log_sent {
                debug!(target: "tether_protocol::wire", attempt = attempts, frame = %frame.escape_ascii(), "TX");
            }
            if self.flags.ignore_ack || self.await_ack(sequence, deadline, timeout)? {
                return Ok(sequence);
            }
            warn!(attempt = attempts, "Frame not acknowledged, resending");
        }
    }

    /// Write the raw break byte. No framing and no acknowledgement.
    ///
    /// ## Errors
    ///
    /// [`TransportError::ConnectionLost`] on stream failure.
    pub fn send_interrupt(&mut self) -> TransportResult<()>
    {
        self.stream.write_all(&[INTERRUPT])?;
        if self.flags.log_sent {
            debug!(target: "tether_protocol::wire", "TX <break>");
        }
        Ok(())
    }

    /// Receive the next packet, waiting up to `timeout`.
    ///
    /// Bad checksums are answered with `-` and the frame is read again; they do
    /// not count as a result. Packets queued during an acknowledgement wait are
    /// returned first.
    ///
    /// ## Errors
    ///
    /// - [`TransportError::Timeout`] if no complete packet arrived in time
    /// - [`TransportError::ConnectionLost`] on any stream failure
    pub fn receive(&mut self, packet: &mut Packet, timeout: Duration) -> TransportResult<()>
    {
        if let Some(queued) = self.deferred.pop_front() {
            *packet = queued;
            return Ok(());
        }
        *packet = self.receive_frame(Instant::now() + timeout, timeout)?;
        Ok(())
    }

    /// Receive a packet only if one has already started to arrive.
    ///
    /// ## Errors
    ///
    /// - [`TransportError::NoData`] if nothing is waiting
    /// - otherwise as [`receive`](Self::receive), with [`FRAME_TIMEOUT`] to
    ///   finish a frame that has begun
    pub fn try_receive(&mut self, packet: &mut Packet) -> TransportResult<()>
    {
        if let Some(queued) = self.deferred.pop_front() {
            *packet = queued;
            return Ok(());
        }
        loop {
            while let Some(&byte) = self.inbound.front() {
                if byte == b'$' || byte == INTERRUPT {
                    return self.receive(packet, FRAME_TIMEOUT);
                }
                trace!(byte, "Discarding byte outside frame");
                self.inbound.pop_front();
            }
            if !self.stream.poll_readable(Duration::ZERO)? {
                return Err(TransportError::NoData);
            }
            self.read_available()?;
        }
    }

    /// Whether a packet or unread bytes are waiting, without blocking.
    ///
    /// ## Errors
    ///
    /// [`TransportError::ConnectionLost`] on stream failure.
    pub fn data_available(&mut self) -> TransportResult<bool>
    {
        self.wait_readable(Duration::ZERO)
    }

    /// Wait up to `timeout` for a packet or unread bytes.
    ///
    /// ## Errors
    ///
    /// [`TransportError::ConnectionLost`] on stream failure.
    pub fn wait_readable(&mut self, timeout: Duration) -> TransportResult<bool>
    {
        if !self.deferred.is_empty() || !self.inbound.is_empty() {
            return Ok(true);
        }
        Ok(self.stream.poll_readable(timeout)?)
    }

    fn read_available(&mut self) -> TransportResult<()>
    {
        let mut chunk = [0u8; READ_CHUNK];
        let count = self.stream.read(&mut chunk)?;
        self.inbound.extend(&chunk[..count]);
        Ok(())
    }

    fn next_byte(&mut self, deadline: Instant, budget: Duration) -> TransportResult<u8>
    {
        loop {
            if let Some(byte) = self.inbound.pop_front() {
                return Ok(byte);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout(budget));
            }
            if self.stream.poll_readable(deadline - now)? {
                self.read_available()?;
            }
        }
    }

    /// `true` once a `+` is read, `false` when the frame must be resent.
    ///
    /// With a sequence number on the wire, a `+` echoing a different number
    /// belongs to an earlier frame and is skipped. A bare `+` is still
    /// accepted.
    fn await_ack(&mut self, sequence: Option<u8>, deadline: Instant, budget: Duration) -> TransportResult<bool>
    {
        loop {
            match self.next_byte(deadline, budget)? {
                b'+' => {
                    let Some(sent) = sequence else {
                        return Ok(true);
                    };
                    match self.read_echoed_sequence(deadline)? {
                        Some(echoed) if echoed != sent => {
                            debug!(sent, echoed, "Skipping acknowledgement of an earlier frame");
                        }
                        _ => return Ok(true),
                    }
                }
                b'$' => {
                    if let Some(crossing) = self.read_frame_body(deadline, budget)? {
                        debug!("Queued packet received while awaiting acknowledgement");
                        self.deferred.push_back(crossing);
                    }
                }
                INTERRUPT => self.deferred.push_back(Packet::from_payload(vec![INTERRUPT])),
                other => {
                    debug!(byte = other, "Negative or unexpected acknowledgement");
                    return Ok(false);
                }
            }
        }
    }

    /// The two hex digits following a `+`, if they arrive within
    /// [`ECHO_WAIT`]. Anything else is left unread.
    fn read_echoed_sequence(&mut self, deadline: Instant) -> TransportResult<Option<u8>>
    {
        let limit = deadline.min(Instant::now() + ECHO_WAIT);
        while self.inbound.len() < 2 {
            let now = Instant::now();
            if now >= limit {
                break;
            }
            if self.stream.poll_readable(limit - now)? {
                self.read_available()?;
            }
        }

        let (Some(&high), Some(&low)) = (self.inbound.front(), self.inbound.get(1)) else {
            trace!("Acknowledgement carried no sequence number");
            return Ok(None);
        };
        let echoed = decode_hex_pair(high, low);
        if echoed.is_some() {
            self.inbound.drain(..2);
        }
        Ok(echoed)
    }

    fn receive_frame(&mut self, deadline: Instant, budget: Duration) -> TransportResult<Packet>
    {
        loop {
            match self.next_byte(deadline, budget)? {
                b'$' => {
                    if let Some(packet) = self.read_frame_body(deadline, budget)? {
                        return Ok(packet);
                    }
                }
                INTERRUPT => {
                    if self.flags.log_received {
                        debug!(target: "tether_protocol::wire", "RX <break>");
                    }
                    return Ok(Packet::from_payload(vec![INTERRUPT]));
                }
                other => trace!(byte = other, "Discarding byte outside frame"),
            }
        }
    }

    /// Read everything after a `$`. `None` means the frame was rejected and
    /// the caller should look for the next one.
    fn read_frame_body(&mut self, deadline: Instant, budget: Duration) -> TransportResult<Option<Packet>>
    {
        let mut body = Vec::new();
        let mut sum: u8 = 0;
        loop {
            match self.next_byte(deadline, budget)? {
                b'$' => {
                    debug!(abandoned = body.len(), "Frame restarted mid-payload");
                    body.clear();
                    sum = 0;
                }
                b'#' => break,
                byte => {
                    body.push(byte);
                    sum = sum.wrapping_add(byte);
                }
            }
        }

        let high = self.next_byte(deadline, budget)?;
        let low = self.next_byte(deadline, budget)?;
        if self.flags.log_received {
            let digits = [high, low];
            debug!(
                target: "tether_protocol::wire",
                frame = %body.escape_ascii(),
                checksum = %digits.escape_ascii(),
                "RX"
            );
        }

        if decode_hex_pair(high, low) != Some(sum) {
            warn!(expected = sum, "Checksum mismatch, requesting resend");
            if !self.flags.ignore_ack {
                self.stream.write_all(b"-")?;
            }
            return Ok(None);
        }

        let sequence = parse_sequence_prefix(&body);
        if !self.flags.ignore_ack {
            let mut ack = vec![b'+'];
            if let Some(sequence) = sequence {
                ack.extend([encode_nibble(sequence >> 4), encode_nibble(sequence)]);
            }
            self.stream.write_all(&ack)?;
        }

        let mut packet = match sequence {
            Some(sequence) => {
                let mut packet = Packet::from_payload(body.split_off(3));
                packet.set_sequence(sequence);
                packet
            }
            None => Packet::from_payload(body),
        };
        packet.rewind();
        Ok(Some(packet))
    }
}

/// Build `$[SS:]payload#cc` for `payload`.
#[must_use]
pub fn frame_payload(payload: &[u8], sequence: Option<u8>) -> Vec<u8>
{
    if payload.iter().any(|&byte| byte == b'$' || byte == b'#') {
        warn!("Payload contains a framing character and will be misread by the peer");
    }
    if payload.len() > MAX_PACKET_SIZE {
        warn!(len = payload.len(), "Payload exceeds the advertised packet size");
    }

    let mut body = Vec::with_capacity(payload.len() + 3);
    if let Some(sequence) = sequence {
        body.extend([encode_nibble(sequence >> 4), encode_nibble(sequence), b':']);
    }
    body.extend_from_slice(payload);
    let checksum = checksum(&body);

    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.push(b'$');
    frame.extend_from_slice(&body);
    frame.push(b'#');
    frame.extend([encode_nibble(checksum >> 4), encode_nibble(checksum)]);
    frame
}

/// Sum of `bytes` modulo 256.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8
{
    bytes.iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte))
}

fn parse_sequence_prefix(body: &[u8]) -> Option<u8>
{
    match body {
        [high, low, b':', ..] => decode_hex_pair(*high, *low),
        _ => None,
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_frame_without_sequence()
    {
        assert_eq!(frame_payload(b"OK", None), b"$OK#9a".to_vec());
        assert_eq!(frame_payload(b"", None), b"$#00".to_vec());
    }

    #[test]
    fn test_frame_with_sequence_covers_prefix()
    {
        let frame = frame_payload(b"g", Some(0x1f));
        assert_eq!(&frame[..5], b"$1f:g");
        let cc = checksum(b"1f:g");
        assert_eq!(&frame[6..], &[encode_nibble(cc >> 4), encode_nibble(cc)]);
    }

    #[test]
    fn test_sequence_prefix_detection()
    {
        assert_eq!(parse_sequence_prefix(b"0a:S05"), Some(0x0a));
        assert_eq!(parse_sequence_prefix(b"m10"), None);
        assert_eq!(parse_sequence_prefix(b"zz:"), None);
        assert_eq!(parse_sequence_prefix(b"1"), None);
    }
}
