//! Classification of incoming packets.
//!
//! Anything the stub sends is one of three things: a stop notification
//! (`S`, `T`, `W`, `X` followed by two hex digits), console output (`O`
//! followed by hex bytes) or the reply to the outstanding request.

use tether_protocol::packet::decode_hex_pair;
use tether_protocol::Packet;

use crate::events::{DebugEvent, ProcessState};
use crate::types::{ProcessId, ThreadId};

/// What an incoming packet turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming
{
    /// The target changed execution state.
    Stop(DebugEvent),
    /// Console output from the target.
    Output(Vec<u8>),
    /// A reply to a request.
    Reply,
}

/// Classify `packet` by its payload.
#[must_use]
pub fn classify(packet: &Packet) -> Incoming
{
    let payload = packet.payload();
    if let Some(event) = parse_stop(payload) {
        return Incoming::Stop(event);
    }
    if let Some(output) = parse_output(payload) {
        return Incoming::Output(output);
    }
    Incoming::Reply
}

/// Decode a stop packet.
///
/// `T` packets may carry `key:value;` pairs after the signal; `thread` and
/// `process` fill the event's context and pid, everything else is ignored.
///
/// ```rust
/// use tether_core::client::parse_stop;
/// use tether_core::events::ProcessState;
/// use tether_core::types::ThreadId;
///
/// let event = parse_stop(b"T05thread:7;").unwrap();
/// assert_eq!(event.state, ProcessState::Stopped);
/// assert_eq!(event.signal, 5);
/// assert_eq!(event.context, Some(ThreadId(7)));
///
/// assert!(parse_stop(b"OK").is_none());
/// ```
#[must_use]
pub fn parse_stop(payload: &[u8]) -> Option<DebugEvent>
{
    let (&kind, rest) = payload.split_first()?;
    let state = match kind {
        b'S' | b'T' => ProcessState::Stopped,
        b'W' => ProcessState::Exited,
        b'X' => ProcessState::Terminated,
        _ => return None,
    };
    let [high, low, tail @ ..] = rest else {
        return None;
    };
    let signal = decode_hex_pair(*high, *low)?;

    let mut event = DebugEvent {
        pid: None,
        state,
        signal,
        context: None,
    };
    if kind == b'T' {
        for pair in tail.split(|&byte| byte == b';') {
            let Some(colon) = pair.iter().position(|&byte| byte == b':') else {
                continue;
            };
            let (key, value) = (&pair[..colon], &pair[colon + 1..]);
            match key {
                b"thread" => event.context = parse_hex(value).map(ThreadId),
                b"process" => {
                    event.pid = parse_hex(value)
                        .and_then(|pid| u32::try_from(pid).ok())
                        .map(ProcessId)
                }
                _ => {}
            }
        }
    }
    Some(event)
}

/// Decode an `O<hex>` console output packet. `OK` is not output.
#[must_use]
pub fn parse_output(payload: &[u8]) -> Option<Vec<u8>>
{
    let (&b'O', hex) = payload.split_first()? else {
        return None;
    };
    if hex.is_empty() || hex.len() % 2 != 0 {
        return None;
    }
    hex.chunks_exact(2)
        .map(|pair| decode_hex_pair(pair[0], pair[1]))
        .collect()
}

/// Decode an `E<code>` error reply.
#[must_use]
pub fn parse_error(payload: &[u8]) -> Option<u8>
{
    match payload {
        [b'E', high, low] => decode_hex_pair(*high, *low),
        _ => None,
    }
}

fn parse_hex(digits: &[u8]) -> Option<u64>
{
    if digits.is_empty() {
        return None;
    }
    let mut packet = Packet::from_payload(digits.to_vec());
    match packet.get_number()? {
        (value, 0) => Some(value),
        _ => None,
    }
}
