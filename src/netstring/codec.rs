//! Netstring encoding and parsing.
//!
//! A netstring frame on the wire is `<length>:<code>[ <payload>],` where `length` is the
//! decimal byte count of everything between `:` and the trailing `,`. Frames whose code is
//! [`CONTAINER`] carry a sequence of nested netstrings as their payload; [`parse`] and the
//! streaming [`Decoder`] expand those in place, so `((A, B), C)` comes out as `A, B, C`.
//!
//! Expansion runs off a work queue rather than the call stack, so arbitrarily deep nesting
//! cannot overflow the stack.
//!
//! # Example
//! ```rust
//! use hera_client::netstring::codec::{Frame, encode, encode_container, parse};
//!
//! let mut wire = encode_container([encode(1, Some(b"A")), encode(2, Some(b"B"))]);
//! wire.extend(encode(3, Some(b"C")));
//!
//! let frames = parse(&wire).unwrap();
//! assert_eq!(frames, vec![
//!     Frame::new(1, Some(b"A".to_vec())),
//!     Frame::new(2, Some(b"B".to_vec())),
//!     Frame::new(3, Some(b"C".to_vec())),
//! ]);
//! ```
use std::collections::VecDeque;

use thiserror::Error;

use super::codes::CONTAINER;

/// Largest payload length the length prefix can describe.
pub const MAX_LENGTH: usize = 999_999_999;
const MAX_LENGTH_DIGITS: usize = 9;

/// Failure kinds while parsing netstrings.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("string longer than {MAX_LENGTH} bytes")]
    TooLong,

    #[error("string missing colon")]
    NoColon,

    #[error("string shorter than length advertised")]
    TooShort,

    #[error("string missing comma")]
    NoComma,

    #[error("string beginning with zero")]
    LeadingZero,

    #[error("string without length prefix")]
    NoLength,

    #[error("string with malformed payload code")]
    BadCode,
}

/// A single decoded netstring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u32,
    pub payload: Option<Vec<u8>>,
}

impl Frame {
    pub fn new(code: u32, payload: Option<Vec<u8>>) -> Self {
        Self { code, payload }
    }

    /// Payload bytes, treating an absent payload as empty.
    pub fn data(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    pub fn is_container(&self) -> bool {
        self.code == CONTAINER
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self.code, self.payload.as_deref())
    }
}

/// Length of the payload [`encode`] writes for `code` and a value of `value_len` bytes.
/// This is the number that must stay within [`MAX_LENGTH`].
pub fn payload_len(code: u32, value_len: Option<usize>) -> usize {
    let digits = code.checked_ilog10().map_or(1, |d| d as usize + 1);
    match value_len {
        Some(n) => digits.saturating_add(1).saturating_add(n),
        None => digits,
    }
}

/// Encodes a single netstring.
///
/// The payload is `code` alone when `value` is `None`, otherwise `code`, one space and
/// `value`.
pub fn encode(code: u32, value: Option<&[u8]>) -> Vec<u8> {
    let len = payload_len(code, value.map(<[u8]>::len));
    let code = code.to_string();
    let length = len.to_string();

    let mut out = Vec::with_capacity(length.len() + len + 2);
    out.extend_from_slice(length.as_bytes());
    out.push(b':');
    out.extend_from_slice(code.as_bytes());
    if let Some(v) = value {
        out.push(b' ');
        out.extend_from_slice(v);
    }
    out.push(b',');
    out
}

/// Wraps already-encoded netstrings into one container frame.
///
/// An empty iterator produces a container without payload.
pub fn encode_container<I, B>(frames: I) -> Vec<u8>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut nested = Vec::new();
    for frame in frames {
        nested.extend_from_slice(frame.as_ref());
    }

    if nested.is_empty() {
        encode(CONTAINER, None)
    } else {
        encode(CONTAINER, Some(&nested))
    }
}

/// Parses a complete buffer into a flat sequence of frames.
///
/// Every byte of `buf` must belong to a well-formed netstring; a truncated tail is reported
/// as [`ParseError::TooShort`] (or [`ParseError::NoColon`] when cut inside the length).
pub fn parse(buf: &[u8]) -> Result<Vec<Frame>, ParseError> {
    let mut out = Vec::new();
    let mut pending: VecDeque<Frame> = split_all(buf)?.into();
    expand(&mut pending, &mut out)?;
    Ok(out)
}

/// Expands a single frame, flattening it when it is a container.
pub fn flatten(frame: Frame) -> Result<Vec<Frame>, ParseError> {
    let mut out = Vec::new();
    let mut pending = VecDeque::from([frame]);
    expand(&mut pending, &mut out)?;
    Ok(out)
}

fn expand(pending: &mut VecDeque<Frame>, out: &mut Vec<Frame>) -> Result<(), ParseError> {
    while let Some(frame) = pending.pop_front() {
        if !frame.is_container() {
            out.push(frame);
            continue;
        }

        let children = split_all(frame.data())?;
        for child in children.into_iter().rev() {
            pending.push_front(child);
        }
    }
    Ok(())
}

fn split_all(mut buf: &[u8]) -> Result<Vec<Frame>, ParseError> {
    let mut frames = Vec::new();
    while !buf.is_empty() {
        match split_frame(buf, true)? {
            Some((frame, used)) => {
                frames.push(frame);
                buf = &buf[used..];
            }
            None => return Err(ParseError::TooShort),
        }
    }
    Ok(frames)
}

/// Splits the first netstring off `buf`, returning it with the number of bytes consumed.
///
/// With `complete` unset, running out of bytes yields `Ok(None)` instead of an error so the
/// caller can retry once more data has arrived.
fn split_frame(buf: &[u8], complete: bool) -> Result<Option<(Frame, usize)>, ParseError> {
    let short = |err: ParseError| if complete { Err(err) } else { Ok(None) };

    match buf.first() {
        None => return short(ParseError::NoLength),
        Some(b) if !b.is_ascii_digit() => return Err(ParseError::NoLength),
        _ => {}
    }

    let digits = buf.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits > MAX_LENGTH_DIGITS {
        return Err(ParseError::TooLong);
    }
    if digits > 1 && buf[0] == b'0' {
        return Err(ParseError::LeadingZero);
    }
    if digits == buf.len() {
        return short(ParseError::NoColon);
    }
    if buf[digits] != b':' {
        return Err(ParseError::NoColon);
    }

    let length = ascii_number(&buf[..digits]).ok_or(ParseError::TooLong)?;
    let start = digits + 1;
    let end = start + length;
    if buf.len() <= end {
        return short(ParseError::TooShort);
    }
    if buf[end] != b',' {
        return Err(ParseError::NoComma);
    }

    let frame = split_code(&buf[start..end])?;
    Ok(Some((frame, end + 1)))
}

fn split_code(payload: &[u8]) -> Result<Frame, ParseError> {
    let digits = payload.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return Err(ParseError::BadCode);
    }

    let code = ascii_number(&payload[..digits])
        .and_then(|c| u32::try_from(c).ok())
        .ok_or(ParseError::BadCode)?;

    let value = match payload.get(digits) {
        None => None,
        Some(b' ') => Some(payload[digits + 1..].to_vec()),
        Some(_) => return Err(ParseError::BadCode),
    };

    Ok(Frame::new(code, value))
}

fn ascii_number(digits: &[u8]) -> Option<usize> {
    digits.iter().try_fold(0usize, |acc, d| {
        acc.checked_mul(10)?.checked_add(usize::from(d - b'0'))
    })
}

/// Restartable netstring decoder for byte streams.
///
/// Bytes are fed in as they arrive; complete frames are handed back already flattened, in
/// wire order. Partial frames stay buffered until the rest shows up.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
    ready: VecDeque<Frame>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame, `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ParseError> {
        if let Some(frame) = self.ready.pop_front() {
            return Ok(Some(frame));
        }

        let Some((frame, used)) = split_frame(&self.buf, false)? else {
            return Ok(None);
        };
        self.buf.drain(..used);

        self.ready.extend(flatten(frame)?);
        Ok(self.ready.pop_front())
    }
}
