//! Datagram layout shared by master, slave and relay.
//!
//! A data datagram is a run of tuples, repeated until the end of the payload:
//!
//! | Field | Size |
//! |-------|------|
//! | `name_len` | 1 byte |
//! | `name` | `name_len` bytes, UTF-8 |
//! | `value_len` | 4 bytes, little-endian |
//! | `value` | `value_len` bytes |
//!
//! An empty datagram is a valid frame with no variables. The shutdown datagram
//! is the ASCII text `!!!dgr_died!!!`, optionally NUL-terminated. No data frame
//! can take that shape: its first tuple would claim a 33-byte name.

use std::collections::HashSet;

use crate::error::DgrError;

/// Shutdown marker without terminator.
pub const SHUTDOWN_MAGIC: &[u8] = b"!!!dgr_died!!!";

/// Shutdown datagram as emitted by masters (NUL-terminated).
pub const SHUTDOWN_DATAGRAM: &[u8] = b"!!!dgr_died!!!\0";

/// Largest payload that fits one Ethernet frame without IP fragmentation.
pub const SAFE_PAYLOAD: usize = 1472;

/// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_PAYLOAD: usize = 65_507;

/// Longest name the one-byte length prefix can describe.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

const VALUE_LEN_BYTES: usize = 4;

/// One `(name, value)` pair inside a data frame, borrowed from the datagram.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Tuple<'a> {
    pub name: &'a str,
    pub value: &'a [u8],
}

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Data(Vec<Tuple<'a>>),
    Shutdown,
}

/// Reasons a datagram is refused. The datagram is dropped as a whole.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("truncated tuple at byte {offset}: needed {needed} bytes, {remaining} left")]
    Truncated {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("empty variable name at byte {offset}")]
    EmptyName { offset: usize },

    #[error("variable name at byte {offset} is not UTF-8")]
    NameNotUtf8 { offset: usize },

    #[error("variable {name:?} appears twice in one frame")]
    DuplicateName { name: String },

    #[error("variable {name:?} carries {actual} bytes, registered size is {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Returns `true` when `datagram` is the shutdown marker.
pub fn is_shutdown(datagram: &[u8]) -> bool {
    match datagram.len() {
        14 => datagram == SHUTDOWN_MAGIC,
        15 => datagram == SHUTDOWN_DATAGRAM,
        _ => false,
    }
}

/// Encoded size of one tuple.
#[inline]
pub fn tuple_len(name: &str, value: &[u8]) -> usize {
    1 + name.len() + VALUE_LEN_BYTES + value.len()
}

/// Appends one tuple to `out`.
///
/// Fails without touching `out` when a length prefix cannot describe the
/// name (empty or over 255 bytes) or the value (over `u32::MAX` bytes).
pub fn encode_tuple(name: &str, value: &[u8], out: &mut Vec<u8>) -> Result<(), DgrError> {
    let name_len = u8::try_from(name.len())
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| DgrError::InvalidName { name: name.to_string() })?;
    let value_len = u32::try_from(value.len())
        .map_err(|_| DgrError::PacketTooLarge { size: tuple_len(name, value) })?;

    out.reserve(tuple_len(name, value));
    out.push(name_len);
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&value_len.to_le_bytes());
    out.extend_from_slice(value);
    Ok(())
}

impl Frame<'_> {
    /// Writes the datagram for this frame into `out` (which is cleared first).
    ///
    /// On error `out` holds the tuples encoded so far and must not be sent.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), DgrError> {
        out.clear();
        match self {
            Frame::Shutdown => out.extend_from_slice(SHUTDOWN_DATAGRAM),
            Frame::Data(tuples) => {
                for t in tuples {
                    encode_tuple(t.name, t.value, out)?;
                }
            }
        }
        Ok(())
    }
}

/// Parses a datagram. Either every tuple is well-formed or an error is returned.
pub fn decode(datagram: &[u8]) -> Result<Frame<'_>, ProtocolError> {
    if is_shutdown(datagram) {
        return Ok(Frame::Shutdown);
    }

    let mut tuples = Vec::new();
    let mut seen = HashSet::new();
    let mut offset = 0;

    while offset < datagram.len() {
        let start = offset;
        let name_len = datagram[offset] as usize;
        offset += 1;

        if name_len == 0 {
            return Err(ProtocolError::EmptyName { offset: start });
        }

        let name_bytes = take(datagram, &mut offset, name_len, start)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| ProtocolError::NameNotUtf8 { offset: start })?;

        let len_bytes = take(datagram, &mut offset, VALUE_LEN_BYTES, start)?;
        let value_len =
            u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        let value = take(datagram, &mut offset, value_len as usize, start)?;

        if !seen.insert(name) {
            return Err(ProtocolError::DuplicateName { name: name.to_string() });
        }
        tuples.push(Tuple { name, value });
    }

    Ok(Frame::Data(tuples))
}

fn take<'a>(
    datagram: &'a [u8],
    offset: &mut usize,
    needed: usize,
    tuple_start: usize,
) -> Result<&'a [u8], ProtocolError> {
    let remaining = datagram.len() - *offset;
    if needed > remaining {
        return Err(ProtocolError::Truncated {
            offset: tuple_start,
            needed,
            remaining,
        });
    }
    let bytes = &datagram[*offset..*offset + needed];
    *offset += needed;
    Ok(bytes)
}
