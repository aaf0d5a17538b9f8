//! # Packet Codec
//!
//! In-memory encoding and decoding of a single protocol message payload.
//!
//! A [`Packet`] is the unframed body of a message: the bytes between `$` and
//! `#` on the wire, minus any `SS:` sequence prefix. Writers append to the end
//! of the buffer; readers consume from a cursor that starts at the beginning,
//! so a packet is read back in the same order it was written.
//!
//! ## Encoding rules
//!
//! - Hex output is always lowercase, hex input accepts either case.
//! - Bytes are written as two nibbles, high nibble first.
//! - Numbers are written as hex padded to whole bytes. The all-bits-set value
//!   is written as the literal `-1`.
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::Packet;
//!
//! let mut request = Packet::new();
//! request.put_raw(b'm');
//! request.put_number(0x1000, b',');
//! request.put_number(4, 0);
//! assert_eq!(request.payload(), b"m1000,04");
//!
//! assert_eq!(request.get_raw(), Some(b'm'));
//! assert_eq!(request.get_number(), Some((0x1000, b',')));
//! assert_eq!(request.get_number(), Some((4, 0)));
//! assert_eq!(request.get_raw(), None);
//! ```

use std::fmt;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Hex digits in the widest number `get_number` accepts.
const MAX_NUMBER_DIGITS: usize = 16;

/// Encode the low four bits of `value` as a lowercase ASCII hex digit.
#[must_use]
pub fn encode_nibble(value: u8) -> u8
{
    HEX_DIGITS[usize::from(value & 0x0f)]
}

/// Decode one ASCII hex digit (`0-9`, `a-f`, `A-F`).
#[must_use]
pub fn decode_nibble(digit: u8) -> Option<u8>
{
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

/// Decode two ASCII hex digits into a byte, high nibble first.
#[must_use]
pub fn decode_hex_pair(high: u8, low: u8) -> Option<u8>
{
    Some((decode_nibble(high)? << 4) | decode_nibble(low)?)
}

/// One protocol message payload plus an optional sequence number.
///
/// All `get_*` operations return `None` when the cursor is already at the end
/// of the buffer (or the bytes there do not decode), and leave the cursor where
/// it was in that case. Callers must check the result before using it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Packet
{
    data: Vec<u8>,
    cursor: usize,
    sequence: Option<u8>,
}

impl Packet
{
    /// Create an empty packet with no sequence number.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Create a packet whose payload is `payload`, with the cursor at the start.
    #[must_use]
    pub fn from_payload(payload: impl Into<Vec<u8>>) -> Self
    {
        Self {
            data: payload.into(),
            cursor: 0,
            sequence: None,
        }
    }

    /// Reset the packet to empty: payload, cursor and sequence number.
    pub fn clear(&mut self)
    {
        self.data.clear();
        self.cursor = 0;
        self.sequence = None;
    }

    /// Move the read cursor back to the start of the payload.
    pub fn rewind(&mut self)
    {
        self.cursor = 0;
    }

    /// The complete payload, independent of the read cursor.
    #[must_use]
    pub fn payload(&self) -> &[u8]
    {
        &self.data
    }

    /// Number of payload bytes.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.data.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.data.is_empty()
    }

    /// The sequence number, if one was set.
    #[must_use]
    pub fn sequence(&self) -> Option<u8>
    {
        self.sequence
    }

    /// Attach a sequence number to this packet.
    ///
    /// A sequence number can be set once per message. Returns `false` and
    /// keeps the existing number if one is already set; [`clear`](Self::clear)
    /// makes it settable again.
    pub fn set_sequence(&mut self, sequence: u8) -> bool
    {
        if self.sequence.is_some() {
            return false;
        }
        self.sequence = Some(sequence);
        true
    }

    /// Append one byte verbatim.
    pub fn put_raw(&mut self, byte: u8)
    {
        self.data.push(byte);
    }

    /// Append one byte as two lowercase hex digits.
    pub fn put_hex_byte(&mut self, byte: u8)
    {
        self.data.push(encode_nibble(byte >> 4));
        self.data.push(encode_nibble(byte));
    }

    /// Append every byte of `bytes` as hex.
    pub fn put_hex_block(&mut self, bytes: &[u8])
    {
        self.data.reserve(bytes.len() * 2);
        for &byte in bytes {
            self.put_hex_byte(byte);
        }
    }

    /// Append the UTF-8 bytes of `text` verbatim.
    pub fn put_string(&mut self, text: &str)
    {
        self.data.extend_from_slice(text.as_bytes());
    }

    /// Append `value` as hex followed by `separator` (skipped when zero).
    ///
    /// The value is padded to whole bytes, so an odd count of significant
    /// nibbles gets exactly one leading zero (`5` → `05`, `0x123` → `0123`).
    /// `u64::MAX` is written as `-1`.
    pub fn put_number(&mut self, value: u64, separator: u8)
    {
        if value == u64::MAX {
            self.data.extend_from_slice(b"-1");
        } else {
            let significant_bytes = (8 - value.leading_zeros() / 8).max(1);
            for index in (0..significant_bytes).rev() {
                #[allow(clippy::cast_possible_truncation)]
                self.put_hex_byte((value >> (index * 8)) as u8);
            }
        }
        if separator != 0 {
            self.data.push(separator);
        }
    }

    /// Bytes not consumed yet, without moving the cursor.
    #[must_use]
    pub fn peek_remaining(&self) -> &[u8]
    {
        &self.data[self.cursor..]
    }

    /// The next unread byte, without moving the cursor.
    #[must_use]
    pub fn peek_char(&self) -> Option<u8>
    {
        self.data.get(self.cursor).copied()
    }

    /// Consume one byte verbatim.
    pub fn get_raw(&mut self) -> Option<u8>
    {
        let byte = self.peek_char()?;
        self.cursor += 1;
        Some(byte)
    }

    /// Consume two hex digits as one byte.
    pub fn get_hex_byte(&mut self) -> Option<u8>
    {
        let remaining = self.peek_remaining();
        if remaining.len() < 2 {
            return None;
        }
        let byte = decode_hex_pair(remaining[0], remaining[1])?;
        self.cursor += 2;
        Some(byte)
    }

    /// Consume `count` hex-encoded bytes. Nothing is consumed on failure.
    pub fn get_hex_block(&mut self, count: usize) -> Option<Vec<u8>>
    {
        let remaining = self.peek_remaining();
        if remaining.is_empty() || remaining.len() < count * 2 {
            return None;
        }
        let block = remaining[..count * 2]
            .chunks_exact(2)
            .map(|pair| decode_hex_pair(pair[0], pair[1]))
            .collect::<Option<Vec<u8>>>()?;
        self.cursor += count * 2;
        Some(block)
    }

    /// Consume a number written by [`put_number`](Self::put_number).
    ///
    /// Returns the value and the separator that terminated it. The separator
    /// is the first non-hex byte (consumed) or `0` when the number ran to the
    /// end of the payload. A leading `-1` decodes as `u64::MAX`. More than
    /// 16 digits do not fit a `u64`; the number is rejected and nothing is
    /// consumed.
    pub fn get_number(&mut self) -> Option<(u64, u8)>
    {
        let remaining = self.peek_remaining();
        if remaining.is_empty() {
            return None;
        }

        if remaining.starts_with(b"-1") {
            let separator = remaining.get(2).copied().unwrap_or(0);
            self.cursor += if separator == 0 { 2 } else { 3 };
            return Some((u64::MAX, separator));
        }

        let mut value: u64 = 0;
        let mut consumed = 0;
        let mut separator = 0;
        for &byte in remaining {
            consumed += 1;
            if let Some(nibble) = decode_nibble(byte) {
                if consumed > MAX_NUMBER_DIGITS {
                    return None;
                }
                value = (value << 4) | u64::from(nibble);
            } else {
                separator = byte;
                break;
            }
        }
        self.cursor += consumed;
        Some((value, separator))
    }

    /// Consume everything left in the payload as text.
    pub fn get_string(&mut self) -> Option<String>
    {
        let remaining = self.peek_remaining();
        if remaining.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(remaining).into_owned();
        self.cursor = self.data.len();
        Some(text)
    }
}

impl fmt::Debug for Packet
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Packet")
            .field("payload", &String::from_utf8_lossy(&self.data))
            .field("cursor", &self.cursor)
            .field("sequence", &self.sequence)
            .finish()
    }
}
