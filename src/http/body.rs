//! Request body framing.
//!
//! Determines how a body is delimited (`Content-Length` or chunked transfer
//! coding) and extracts it once every byte has arrived.

use crate::http::parser::RequestHead;
use std::fmt;

/// How the body following a request head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body.
    Empty,
    /// Exactly this many bytes.
    Length(usize),
    /// Chunked transfer coding, terminated by a zero-size chunk.
    Chunked,
}

/// Body framing errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    /// `Content-Length` is not a number, or repeated with different values.
    InvalidContentLength,
    /// `Transfer-Encoding` other than a final `chunked`.
    UnsupportedTransferEncoding,
    /// Malformed chunk size line or missing chunk terminator.
    InvalidChunk,
    /// Body exceeds the configured limit.
    TooLarge,
}

impl fmt::Display for BodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyError::InvalidContentLength => write!(f, "invalid content-length"),
            BodyError::UnsupportedTransferEncoding => write!(f, "unsupported transfer-encoding"),
            BodyError::InvalidChunk => write!(f, "invalid chunked body"),
            BodyError::TooLarge => write!(f, "request body too large"),
        }
    }
}

impl std::error::Error for BodyError {}

/// Body decode result.
#[derive(Debug)]
pub enum BodyResult {
    /// Decoded body and the number of input bytes it occupied.
    Complete(Vec<u8>, usize),
    /// Need more data.
    Incomplete,
    /// Malformed or oversized body.
    Error(BodyError),
}

/// Work out body framing from the request headers.
///
/// Chunked transfer coding takes precedence over `Content-Length`.
pub fn framing(head: &RequestHead, max_body_size: usize) -> Result<Framing, BodyError> {
    let mut codings = head
        .header_values("transfer-encoding")
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .peekable();

    if codings.peek().is_some() {
        return match codings.last() {
            Some(last) if last.eq_ignore_ascii_case("chunked") => Ok(Framing::Chunked),
            _ => Err(BodyError::UnsupportedTransferEncoding),
        };
    }

    let mut length: Option<usize> = None;
    for value in head.header_values("content-length") {
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(BodyError::InvalidContentLength);
            }
            let n: usize = part.parse().map_err(|_| BodyError::InvalidContentLength)?;
            match length {
                Some(prev) if prev != n => return Err(BodyError::InvalidContentLength),
                _ => length = Some(n),
            }
        }
    }

    match length {
        None | Some(0) => Ok(Framing::Empty),
        Some(n) if n > max_body_size => Err(BodyError::TooLarge),
        Some(n) => Ok(Framing::Length(n)),
    }
}

/// Extract the body from the start of `input`.
pub fn decode(framing: Framing, input: &[u8], max_body_size: usize) -> BodyResult {
    match framing {
        Framing::Empty => BodyResult::Complete(Vec::new(), 0),
        Framing::Length(n) if input.len() >= n => BodyResult::Complete(input[..n].to_vec(), n),
        Framing::Length(_) => BodyResult::Incomplete,
        Framing::Chunked => decode_chunked(input, max_body_size),
    }
}

/// Walk the chunk headers first and only copy once the last chunk is in.
fn decode_chunked(input: &[u8], max_body_size: usize) -> BodyResult {
    let mut pos = 0;
    let mut chunks: Vec<(usize, usize)> = Vec::new();
    let mut total = 0usize;

    loop {
        let (line, line_len) = match read_line(&input[pos..]) {
            Some(found) => found,
            None => return BodyResult::Incomplete,
        };

        let size = match parse_chunk_size(line) {
            Some(size) => size,
            None => return BodyResult::Error(BodyError::InvalidChunk),
        };
        pos += line_len;

        if size == 0 {
            break;
        }

        total = match total.checked_add(size) {
            Some(t) if t <= max_body_size => t,
            _ => return BodyResult::Error(BodyError::TooLarge),
        };

        let data_end = pos + size;
        if input.len() < data_end + 2 {
            // Reject a bad terminator as soon as it's visible.
            if input.len() > data_end && input[data_end] != b'\r' && input[data_end] != b'\n' {
                return BodyResult::Error(BodyError::InvalidChunk);
            }
            if input.len() < data_end + 1 || input[data_end] != b'\n' {
                return BodyResult::Incomplete;
            }
        }

        chunks.push((pos, data_end));
        pos = data_end
            + match &input[data_end..] {
                [b'\r', b'\n', ..] => 2,
                [b'\n', ..] => 1,
                _ => return BodyResult::Error(BodyError::InvalidChunk),
            };
    }

    // Trailer section: header lines up to an empty line, discarded.
    loop {
        let (line, line_len) = match read_line(&input[pos..]) {
            Some(found) => found,
            None => return BodyResult::Incomplete,
        };
        pos += line_len;
        if line.is_empty() {
            break;
        }
    }

    let mut body = Vec::with_capacity(total);
    for (start, end) in chunks {
        body.extend_from_slice(&input[start..end]);
    }

    BodyResult::Complete(body, pos)
}

/// Next line without its terminator, and the length including it.
fn read_line(input: &[u8]) -> Option<(&[u8], usize)> {
    let lf = input.iter().position(|&b| b == b'\n')?;
    let line = &input[..lf];
    Some((line.strip_suffix(b"\r").unwrap_or(line), lf + 1))
}

/// Hex chunk size, ignoring any `;ext=value` chunk extensions.
fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let end = line.iter().position(|&b| b == b';').unwrap_or(line.len());
    let digits = std::str::from_utf8(&line[..end]).ok()?.trim_matches(|c: char| c == ' ' || c == '\t');
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    usize::from_str_radix(digits, 16).ok()
}
