//! Per-request echo handling.

use crate::echo::record::{has_body, Body, EchoError, ResponseRecord};
use crate::echo::render::Format;
use crate::http::RequestHead;

/// A rendered echo, ready to be framed as a 200 response.
#[derive(Debug)]
pub struct Rendered {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

/// Turns complete requests into echo responses.
#[derive(Debug, Clone)]
pub struct EchoResponder {
    /// `http://host:port`, prefixed to every request target.
    origin: String,
    /// Whether `format=html` is honored.
    html: bool,
}

impl EchoResponder {
    pub fn new(host: &str, port: u16, html: bool) -> Self {
        let origin = if host.contains(':') {
            format!("http://[{host}]:{port}")
        } else {
            format!("http://{host}:{port}")
        };

        Self { origin, html }
    }

    /// Build the record for a request whose body has been fully read.
    ///
    /// The payload is only looked at for POST, PUT, DELETE and PATCH.
    pub fn record(&self, head: &RequestHead, payload: &[u8]) -> Result<ResponseRecord, EchoError> {
        let mut record = ResponseRecord::new(&self.origin, head);

        if has_body(&head.method) {
            let body = Body::decode(record.header("content-type"), payload)?;
            record.body = Some(body);
        }

        Ok(record)
    }

    /// Build and render the echo for a request.
    pub fn respond(&self, head: &RequestHead, payload: &[u8]) -> Result<Rendered, EchoError> {
        let record = self.record(head, payload)?;
        let format = Format::select(&record, self.html);

        Ok(Rendered {
            content_type: format.content_type(),
            body: format.render(&record)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parser::{self, ParseResult};
    use serde_json::{json, Value};

    fn head(raw: &str) -> RequestHead {
        match parser::parse(raw.as_bytes(), 16 * 1024) {
            ParseResult::Complete(head, _) => head,
            other => panic!("unexpected: {:?}", other),
        }
    }

    fn responder() -> EchoResponder {
        EchoResponder::new("127.0.0.1", 3000, true)
    }

    #[test]
    fn test_get_echo_exact() {
        let rendered = responder()
            .respond(&head("GET /foo?x=1 HTTP/1.1\r\nAccept: */*\r\n\r\n"), b"")
            .unwrap();
        assert_eq!(rendered.content_type, "application/json");
        assert_eq!(
            String::from_utf8(rendered.body).unwrap(),
            r#"{"method":"GET","url":"http://127.0.0.1:3000/foo?x=1","query_params":{"x":"1"},"headers":{"accept":"*/*"},"code":200,"version":"1.1"}"#
        );
    }

    #[test]
    fn test_get_ignores_payload() {
        let record = responder()
            .record(&head("GET / HTTP/1.1\r\nContent-Type: application/json\r\n\r\n"), b"{bad")
            .unwrap();
        assert_eq!(record.body, None);
    }

    #[test]
    fn test_post_json_body_is_structured() {
        let rendered = responder()
            .respond(
                &head("POST /echo HTTP/1.1\r\nContent-Type: application/json\r\n\r\n"),
                br#"{"a":1}"#,
            )
            .unwrap();
        let value: Value = serde_json::from_slice(&rendered.body).unwrap();
        assert_eq!(value["body"], json!({"a": 1}));
    }

    #[test]
    fn test_first_content_type_decides_body() {
        let record = responder()
            .record(
                &head("POST / HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Type: application/json\r\n\r\n"),
                b"{bad",
            )
            .unwrap();
        assert_eq!(record.header("content-type"), Some("text/plain"));
        assert_eq!(record.body, Some(Body::Raw("{bad".into())));
    }

    #[test]
    fn test_body_methods_get_raw_body() {
        for method in ["POST", "PUT", "DELETE", "PATCH"] {
            let raw = format!("{method} / HTTP/1.1\r\nContent-Type: text/plain\r\n\r\n");
            let record = responder().record(&head(&raw), b"payload").unwrap();
            assert_eq!(record.body, Some(Body::Raw("payload".into())), "{method}");
        }
    }

    #[test]
    fn test_empty_body_still_present() {
        let record = responder().record(&head("DELETE /x HTTP/1.1\r\n\r\n"), b"").unwrap();
        assert_eq!(record.body, Some(Body::Raw(String::new())));
    }

    #[test]
    fn test_malformed_json_fails_request() {
        let result = responder().respond(
            &head("PUT / HTTP/1.1\r\nContent-Type: application/json\r\n\r\n"),
            b"{\"a\":",
        );
        assert!(matches!(result, Err(EchoError::MalformedJson(_))));
    }

    #[test]
    fn test_html_format() {
        let rendered = responder()
            .respond(&head("GET /page?format=html HTTP/1.1\r\n\r\n"), b"")
            .unwrap();
        assert_eq!(rendered.content_type, "text/html");
        let html = String::from_utf8(rendered.body).unwrap();
        assert!(html.contains("GET"));
        assert!(html.contains("http://127.0.0.1:3000/page?format=html"));
    }

    #[test]
    fn test_json_only_variant() {
        let rendered = EchoResponder::new("127.0.0.1", 3000, false)
            .respond(&head("GET /page?format=html HTTP/1.1\r\n\r\n"), b"")
            .unwrap();
        assert_eq!(rendered.content_type, "application/json");
    }

    #[test]
    fn test_ipv6_origin() {
        let record = EchoResponder::new("::1", 8080, true)
            .record(&head("GET /x HTTP/1.1\r\n\r\n"), b"")
            .unwrap();
        assert_eq!(record.url, "http://[::1]:8080/x");
    }
}
