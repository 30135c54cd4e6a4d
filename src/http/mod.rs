//! Minimal HTTP/1.x wire layer.
//!
//! - `parser`: request line and headers
//! - `body`: `Content-Length` and chunked body framing
//! - `response`: status line, headers and body serialization
//!
//! Only what an echo fixture needs: no TLS, no HTTP/2, no upgrades.

pub mod body;
pub mod parser;
pub mod response;

pub use parser::RequestHead;
