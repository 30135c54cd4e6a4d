//! HTTP/1.x request head parser.
//!
//! Parses the request line and header section from a byte buffer without
//! consuming it. The caller re-invokes `parse` as more data arrives.

use std::fmt;

/// HTTP protocol version of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    /// Version as echoed back to clients (`"1.0"` / `"1.1"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "1.0",
            Version::Http11 => "1.1",
        }
    }
}

/// A parsed request line plus headers.
///
/// Header names are lowercased; order and duplicates are preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: Version,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First value of a header (name must be lowercase).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values of a header, in arrival order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the comma-separated `connection` header carries `token`.
    fn connection_has(&self, token: &str) -> bool {
        self.header_values("connection")
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Whether the connection stays open after this exchange.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.connection_has("close"),
            Version::Http10 => self.connection_has("keep-alive"),
        }
    }

    /// Whether the client waits for `100 Continue` before sending the body.
    pub fn expects_continue(&self) -> bool {
        self.version == Version::Http11
            && self
                .header("expect")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }
}

/// Request head parse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Request line is not `METHOD SP target SP HTTP/x.y`.
    InvalidRequestLine,
    /// Version other than HTTP/1.0 or HTTP/1.1.
    UnsupportedVersion,
    /// Header line without a valid `name:` prefix.
    InvalidHeader,
    /// Request line plus headers exceed the configured limit.
    HeadTooLarge,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidRequestLine => write!(f, "invalid request line"),
            ParseError::UnsupportedVersion => write!(f, "unsupported HTTP version"),
            ParseError::InvalidHeader => write!(f, "invalid header line"),
            ParseError::HeadTooLarge => write!(f, "request head too large"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// Complete head and the number of bytes it occupied.
    Complete(RequestHead, usize),
    /// Need more data.
    Incomplete,
    /// Malformed head; the connection cannot be recovered.
    Error(ParseError),
}

/// Parse a request head from the start of `input`.
pub fn parse(input: &[u8], max_head_size: usize) -> ParseResult {
    // Empty lines ahead of the request line are ignored.
    let start = skip_leading_newlines(input);
    let input_rest = &input[start..];

    let head_end = match find_head_end(input_rest) {
        Some(end) => end,
        None if input_rest.len() > max_head_size => {
            return ParseResult::Error(ParseError::HeadTooLarge)
        }
        None => return ParseResult::Incomplete,
    };

    let (head_len, total_len) = head_end;
    if total_len > max_head_size {
        return ParseResult::Error(ParseError::HeadTooLarge);
    }

    let mut lines = input_rest[..head_len].split(|&b| b == b'\n').map(strip_cr);

    let request_line = match lines.next() {
        Some(line) => line,
        None => return ParseResult::Error(ParseError::InvalidRequestLine),
    };
    let (method, target, version) = match parse_request_line(request_line) {
        Ok(parts) => parts,
        Err(e) => return ParseResult::Error(e),
    };

    let mut headers = Vec::new();
    for line in lines {
        match parse_header_line(line) {
            Ok(header) => headers.push(header),
            Err(e) => return ParseResult::Error(e),
        }
    }

    let head = RequestHead {
        method,
        target,
        version,
        headers,
    };

    ParseResult::Complete(head, start + total_len)
}

fn parse_request_line(line: &[u8]) -> Result<(String, String, Version), ParseError> {
    let mut parts = line.split(|&b| b == b' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => return Err(ParseError::InvalidRequestLine),
    };

    if method.is_empty() || !method.iter().all(|&b| is_token(b)) {
        return Err(ParseError::InvalidRequestLine);
    }
    if target.is_empty() || target.iter().any(|&b| b <= b' ' || b == 0x7f) {
        return Err(ParseError::InvalidRequestLine);
    }

    let version = match version {
        b"HTTP/1.1" => Version::Http11,
        b"HTTP/1.0" => Version::Http10,
        v if v.starts_with(b"HTTP/") => return Err(ParseError::UnsupportedVersion),
        _ => return Err(ParseError::InvalidRequestLine),
    };

    // Both slices were checked to be ASCII above.
    let method = String::from_utf8_lossy(method).into_owned();
    let target = String::from_utf8_lossy(target).into_owned();

    Ok((method, target, version))
}

fn parse_header_line(line: &[u8]) -> Result<(String, String), ParseError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::InvalidHeader)?;

    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_token(b)) {
        return Err(ParseError::InvalidHeader);
    }

    let value = trim_ows(&line[colon + 1..]);

    Ok((
        String::from_utf8_lossy(name).to_ascii_lowercase(),
        String::from_utf8_lossy(value).into_owned(),
    ))
}

/// Find the blank line ending the head.
///
/// Returns the length of the head without its final line break, and the
/// total length up to and including the blank line.
fn find_head_end(input: &[u8]) -> Option<(usize, usize)> {
    for (i, &b) in input.iter().enumerate() {
        if b != b'\n' {
            continue;
        }
        let rest = &input[i + 1..];
        let blank = if rest.starts_with(b"\r\n") {
            2
        } else if rest.starts_with(b"\n") {
            1
        } else {
            continue;
        };
        let head_len = if i > 0 && input[i - 1] == b'\r' { i - 1 } else { i };
        return Some((head_len, i + 1 + blank));
    }
    None
}

fn skip_leading_newlines(input: &[u8]) -> usize {
    input
        .iter()
        .position(|&b| b != b'\r' && b != b'\n')
        .unwrap_or(input.len())
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_ows(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(value.len());
    let end = value
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(start, |p| p + 1);
    &value[start..end]
}

/// RFC 9110 `tchar`.
fn is_token(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
