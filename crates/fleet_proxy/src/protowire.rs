//! Minimal protobuf wire-format scanner.
//!
//! Only what routing needs is implemented: walking length-delimited fields by
//! field number, reading a string field, and replacing a string field deep in
//! a message. Every byte outside the rewritten field and the length prefixes
//! of its ancestors is copied through untouched, so unknown fields survive a
//! rewrite.
//!
//! An embedded message that occurs more than once is read the way a protobuf
//! parser merges it: the occurrences are concatenated.

use std::borrow::Cow;

use bytes::Bytes;

const WIRE_VARINT: u8 = 0;
const WIRE_I64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_START_GROUP: u8 = 3;
const WIRE_END_GROUP: u8 = 4;
const WIRE_I32: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,
    #[error("varint overflows 64 bits")]
    VarintOverflow,
    #[error("invalid wire type {0}")]
    InvalidWireType(u8),
    #[error("invalid field number 0")]
    InvalidFieldNumber,
    #[error("field {0} is not length-delimited")]
    NotLengthDelimited(u32),
    #[error("field {0} is missing")]
    MissingField(u32),
    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(u32),
}

/// Location of one field inside a message buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpan {
    pub number: u32,
    pub wire_type: u8,
    /// Offset of the tag.
    pub start: usize,
    /// Offset of the payload (after the length prefix for `LEN` fields).
    pub value_start: usize,
    /// One past the last byte of the field.
    pub end: usize,
}

pub fn decode_varint(buf: &[u8], pos: &mut usize) -> Result<u64, WireError> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = *buf.get(*pos).ok_or(WireError::Truncated)?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(WireError::VarintOverflow)
}

pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn skip(buf: &[u8], pos: &mut usize, len: usize) -> Result<(), WireError> {
    let end = pos.checked_add(len).ok_or(WireError::Truncated)?;
    if end > buf.len() {
        return Err(WireError::Truncated);
    }
    *pos = end;
    Ok(())
}

/// Scan the top-level fields of `buf`.
pub fn scan(buf: &[u8]) -> Result<Vec<FieldSpan>, WireError> {
    let mut spans = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let start = pos;
        let tag = decode_varint(buf, &mut pos)?;
        let wire_type = (tag & 0x7) as u8;
        let number = u32::try_from(tag >> 3).map_err(|_| WireError::InvalidFieldNumber)?;
        if number == 0 {
            return Err(WireError::InvalidFieldNumber);
        }
        let value_start;
        match wire_type {
            WIRE_VARINT => {
                value_start = pos;
                decode_varint(buf, &mut pos)?;
            }
            WIRE_I64 => {
                value_start = pos;
                skip(buf, &mut pos, 8)?;
            }
            WIRE_LEN => {
                let len = decode_varint(buf, &mut pos)?;
                let len = usize::try_from(len).map_err(|_| WireError::Truncated)?;
                value_start = pos;
                skip(buf, &mut pos, len)?;
            }
            WIRE_I32 => {
                value_start = pos;
                skip(buf, &mut pos, 4)?;
            }
            WIRE_START_GROUP | WIRE_END_GROUP => {
                // Groups are deprecated and never used by the services we route.
                return Err(WireError::InvalidWireType(wire_type));
            }
            other => return Err(WireError::InvalidWireType(other)),
        }
        spans.push(FieldSpan {
            number,
            wire_type,
            start,
            value_start,
            end: pos,
        });
    }
    Ok(spans)
}

/// Last occurrence of a length-delimited field, which is what a protobuf
/// parser keeps for a singular string.
fn last_len_field(buf: &[u8], number: u32) -> Result<Option<FieldSpan>, WireError> {
    Ok(len_fields(buf, number)?.pop())
}

fn len_fields(buf: &[u8], number: u32) -> Result<Vec<FieldSpan>, WireError> {
    let mut found = Vec::new();
    for span in scan(buf)? {
        if span.number != number {
            continue;
        }
        if span.wire_type != WIRE_LEN {
            return Err(WireError::NotLengthDelimited(number));
        }
        found.push(span);
    }
    Ok(found)
}

/// Payload of the embedded message `number`, with repeated occurrences merged.
fn merged_message(buf: &[u8], number: u32) -> Result<Option<Cow<'_, [u8]>>, WireError> {
    let spans = len_fields(buf, number)?;
    Ok(match spans.as_slice() {
        [] => None,
        [span] => Some(Cow::Borrowed(&buf[span.value_start..span.end])),
        spans => Some(Cow::Owned(
            spans
                .iter()
                .flat_map(|span| &buf[span.value_start..span.end])
                .copied()
                .collect(),
        )),
    })
}

/// Walk `path` through nested messages and return the innermost payload.
/// Returns `None` when any step is absent.
pub fn find_message<'a>(buf: &'a [u8], path: &[u32]) -> Result<Option<Cow<'a, [u8]>>, WireError> {
    let mut current = Cow::Borrowed(buf);
    for &number in path {
        let next = match current {
            Cow::Borrowed(message) => merged_message(message, number)?,
            Cow::Owned(message) => {
                merged_message(&message, number)?.map(|next| Cow::Owned(next.into_owned()))
            }
        };
        match next {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Read the string at `field` of the message located by `path`.
pub fn read_string(buf: &[u8], path: &[u32], field: u32) -> Result<Option<String>, WireError> {
    let Some(message) = find_message(buf, path)? else {
        return Ok(None);
    };
    match last_len_field(&message, field)? {
        Some(span) => std::str::from_utf8(&message[span.value_start..span.end])
            .map(|s| Some(s.to_string()))
            .map_err(|_| WireError::InvalidUtf8(field)),
        None => Ok(None),
    }
}

fn push_len_field(number: u32, payload: &[u8], out: &mut Vec<u8>) {
    encode_varint((u64::from(number) << 3) | u64::from(WIRE_LEN), out);
    encode_varint(payload.len() as u64, out);
    out.extend_from_slice(payload);
}

/// Replace the string at `field` of the message located by `path` with
/// `value`. Every occurrence of `field` is replaced; the field is appended if
/// absent. Fails with [`WireError::MissingField`] when a message on `path`
/// does not exist. A message on `path` that occurs more than once is
/// written back as one merged occurrence.
pub fn rewrite_string(
    buf: &[u8],
    path: &[u32],
    field: u32,
    value: &str,
) -> Result<Bytes, WireError> {
    rewrite_in(buf, path, field, value).map(Bytes::from)
}

fn rewrite_in(buf: &[u8], path: &[u32], field: u32, value: &str) -> Result<Vec<u8>, WireError> {
    let spans = scan(buf)?;
    let mut out = Vec::with_capacity(buf.len() + value.len());

    match path.split_first() {
        None => {
            let mut replaced = false;
            let mut cursor = 0;
            for span in spans.iter().filter(|span| span.number == field) {
                if span.wire_type != WIRE_LEN {
                    return Err(WireError::NotLengthDelimited(field));
                }
                out.extend_from_slice(&buf[cursor..span.start]);
                push_len_field(field, value.as_bytes(), &mut out);
                cursor = span.end;
                replaced = true;
            }
            out.extend_from_slice(&buf[cursor..]);
            if !replaced {
                push_len_field(field, value.as_bytes(), &mut out);
            }
        }
        Some((&head, rest)) => {
            let merged = merged_message(buf, head)?.ok_or(WireError::MissingField(head))?;
            let inner = rewrite_in(&merged, rest, field, value)?;
            let occurrences = len_fields(buf, head)?;
            let mut cursor = 0;
            for (index, span) in occurrences.iter().enumerate() {
                out.extend_from_slice(&buf[cursor..span.start]);
                if index + 1 == occurrences.len() {
                    push_len_field(head, &inner, &mut out);
                }
                cursor = span.end;
            }
            out.extend_from_slice(&buf[cursor..]);
        }
    }
    Ok(out)
}
