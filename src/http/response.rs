//! HTTP/1.1 response serialization.

use bytes::{BufMut, BytesMut};
use chrono::Utc;

/// Response status codes the server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Continue,
    Ok,
    BadRequest,
    PayloadTooLarge,
    HeaderFieldsTooLarge,
    NotImplemented,
    VersionNotSupported,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Continue => 100,
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::PayloadTooLarge => 413,
            Status::HeaderFieldsTooLarge => 431,
            Status::NotImplemented => 501,
            Status::VersionNotSupported => 505,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Status::Continue => "Continue",
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::PayloadTooLarge => "Payload Too Large",
            Status::HeaderFieldsTooLarge => "Request Header Fields Too Large",
            Status::NotImplemented => "Not Implemented",
            Status::VersionNotSupported => "HTTP Version Not Supported",
        }
    }
}

/// Append a complete response to `out`.
pub fn write_response(
    out: &mut BytesMut,
    status: Status,
    content_type: &str,
    body: &[u8],
    keep_alive: bool,
) {
    write_response_head(out, status, content_type, body.len(), keep_alive);
    out.put_slice(body);
}

/// Append a status line and headers only, as for a `HEAD` request.
///
/// `Content-Length` still announces the body a `GET` would have carried.
pub fn write_response_head(
    out: &mut BytesMut,
    status: Status,
    content_type: &str,
    content_length: usize,
    keep_alive: bool,
) {
    write_status_line(out, status);
    write_header(out, "Date", &http_date());
    write_header(out, "Content-Type", content_type);
    write_header(out, "Content-Length", &content_length.to_string());
    write_header(
        out,
        "Connection",
        if keep_alive { "keep-alive" } else { "close" },
    );
    out.put_slice(b"\r\n");
}

/// Append an interim `100 Continue` response to `out`.
pub fn write_continue(out: &mut BytesMut) {
    write_status_line(out, Status::Continue);
    out.put_slice(b"\r\n");
}

/// Append a plain-text error response; the connection closes after it.
pub fn write_error(out: &mut BytesMut, status: Status) {
    write_response(out, status, "text/plain", status.reason().as_bytes(), false);
}

fn write_status_line(out: &mut BytesMut, status: Status) {
    out.put_slice(format!("HTTP/1.1 {} {}\r\n", status.code(), status.reason()).as_bytes());
}

fn write_header(out: &mut BytesMut, name: &str, value: &str) {
    out.reserve(name.len() + value.len() + 4);
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_slice(b"\r\n");
}

/// Current time as an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
