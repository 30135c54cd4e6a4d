//! Echo responder.
//!
//! Reflects a request back to its sender:
//!
//! ```text
//! GET /foo?x=1 HTTP/1.1
//! Accept: */*
//!
//! {"method":"GET","url":"http://127.0.0.1:3000/foo?x=1","query_params":{"x":"1"},
//!  "headers":{"accept":"*/*"},"code":200,"version":"1.1"}
//! ```
//!
//! POST, PUT, DELETE and PATCH additionally carry a `body` field: parsed
//! JSON when the request says `Content-Type: application/json`, the raw
//! payload text otherwise. `?format=html` switches to an HTML listing.

pub mod handler;
pub mod record;
pub mod render;

pub use handler::EchoResponder;
