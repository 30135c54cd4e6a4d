//! Request dispatch for the worker event loop.
//!
//! Synchronous processing over raw byte buffers: frames one HTTP request
//! from the input, runs the echo responder, and appends the response to the
//! output buffer.

use crate::echo::EchoResponder;
use crate::http::body::{self, BodyError, BodyResult};
use crate::http::parser::{self, ParseError, ParseResult};
use crate::http::response::{self, Status};
use bytes::BytesMut;
use tracing::{debug, info, warn};

/// Per-worker settings shared by every request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub worker_id: usize,
    pub pid: u32,
    pub responder: EchoResponder,
    pub max_header_size: usize,
    pub max_body_size: usize,
}

/// Result of processing a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// Need more data to complete the request.
    NeedData {
        /// Head is complete and the client waits for `100 Continue`.
        expect_continue: bool,
    },
    /// A response was appended to the output buffer.
    Response {
        /// Bytes consumed from input.
        consumed: usize,
        keep_alive: bool,
    },
    /// The echo failed; drop the connection without answering.
    Abort,
    /// Malformed request; answer with this status and close.
    Error(Status),
}

/// Process the first request in `input`.
pub fn process_http(input: &[u8], output: &mut BytesMut, ctx: &RequestContext) -> ProcessResult {
    let (head, head_len) = match parser::parse(input, ctx.max_header_size) {
        ParseResult::Complete(head, consumed) => (head, consumed),
        ParseResult::Incomplete => {
            return ProcessResult::NeedData {
                expect_continue: false,
            }
        }
        ParseResult::Error(e) => {
            debug!(worker = ctx.worker_id, error = %e, "Bad request head");
            return ProcessResult::Error(parse_error_status(&e));
        }
    };

    let framing = match body::framing(&head, ctx.max_body_size) {
        Ok(framing) => framing,
        Err(e) => {
            debug!(worker = ctx.worker_id, error = %e, "Bad request body");
            return ProcessResult::Error(body_error_status(&e));
        }
    };

    let (payload, body_len) = match body::decode(framing, &input[head_len..], ctx.max_body_size) {
        BodyResult::Complete(payload, consumed) => (payload, consumed),
        BodyResult::Incomplete => {
            return ProcessResult::NeedData {
                expect_continue: head.expects_continue(),
            }
        }
        BodyResult::Error(e) => {
            debug!(worker = ctx.worker_id, error = %e, "Bad request body");
            return ProcessResult::Error(body_error_status(&e));
        }
    };

    info!(
        worker = ctx.worker_id,
        pid = ctx.pid,
        method = %head.method,
        target = %head.target,
        "Replying"
    );

    match ctx.responder.respond(&head, &payload) {
        Ok(rendered) => {
            let keep_alive = head.keep_alive();
            if head.method == "HEAD" {
                response::write_response_head(
                    output,
                    Status::Ok,
                    rendered.content_type,
                    rendered.body.len(),
                    keep_alive,
                );
            } else {
                response::write_response(
                    output,
                    Status::Ok,
                    rendered.content_type,
                    &rendered.body,
                    keep_alive,
                );
            }
            ProcessResult::Response {
                consumed: head_len + body_len,
                keep_alive,
            }
        }
        Err(e) => {
            warn!(
                worker = ctx.worker_id,
                method = %head.method,
                target = %head.target,
                error = %e,
                "Request failed"
            );
            ProcessResult::Abort
        }
    }
}

fn parse_error_status(e: &ParseError) -> Status {
    match e {
        ParseError::HeadTooLarge => Status::HeaderFieldsTooLarge,
        ParseError::UnsupportedVersion => Status::VersionNotSupported,
        ParseError::InvalidRequestLine | ParseError::InvalidHeader => Status::BadRequest,
    }
}

fn body_error_status(e: &BodyError) -> Status {
    match e {
        BodyError::TooLarge => Status::PayloadTooLarge,
        BodyError::UnsupportedTransferEncoding => Status::NotImplemented,
        BodyError::InvalidContentLength | BodyError::InvalidChunk => Status::BadRequest,
    }
}
