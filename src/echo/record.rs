//! The echoed description of a request.

use crate::http::RequestHead;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

/// Headers where a repeated line is dropped and the first value kept.
const SINGLE_VALUE_HEADERS: [&str; 18] = [
    "age",
    "authorization",
    "content-length",
    "content-type",
    "etag",
    "expires",
    "from",
    "host",
    "if-modified-since",
    "if-unmodified-since",
    "last-modified",
    "location",
    "max-forwards",
    "proxy-authorization",
    "referer",
    "retry-after",
    "server",
    "user-agent",
];

/// Methods whose request body is read and echoed.
const BODY_METHODS: [&str; 4] = ["POST", "PUT", "DELETE", "PATCH"];

/// Whether requests with this method get a `body` field.
pub fn has_body(method: &str) -> bool {
    BODY_METHODS.contains(&method)
}

/// A decoded request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Body {
    /// Payload kept as text (any content type but `application/json`).
    Raw(String),
    /// Payload parsed as JSON.
    Json(serde_json::Value),
}

impl Body {
    /// Decode a payload according to its `Content-Type`.
    ///
    /// Only an exact (case-insensitive) `application/json` is parsed; anything
    /// else, parameters included, is kept as text.
    pub fn decode(content_type: Option<&str>, payload: &[u8]) -> Result<Body, EchoError> {
        match content_type {
            Some(ct) if ct.eq_ignore_ascii_case("application/json") => serde_json::from_slice(payload)
                .map(Body::Json)
                .map_err(EchoError::MalformedJson),
            _ => Ok(Body::Raw(String::from_utf8_lossy(payload).into_owned())),
        }
    }

    /// Whether the body counts as present when listed in HTML output.
    ///
    /// Empty strings, `0`, `false` and `null` are left out.
    pub fn is_truthy(&self) -> bool {
        match self {
            Body::Raw(s) => !s.is_empty(),
            Body::Json(serde_json::Value::Null) => false,
            Body::Json(serde_json::Value::Bool(b)) => *b,
            // Numbers keep their source text; out-of-range ones parse to infinity.
            Body::Json(serde_json::Value::Number(n)) => {
                n.to_string().parse::<f64>().map_or(true, |f| f != 0.0)
            }
            Body::Json(serde_json::Value::String(s)) => !s.is_empty(),
            Body::Json(_) => true,
        }
    }

    /// The body as a JSON document.
    pub fn to_json_string(&self) -> String {
        match self {
            Body::Raw(s) => serde_json::Value::String(s.clone()).to_string(),
            Body::Json(value) => value.to_string(),
        }
    }
}

/// Everything the server reflects back about one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseRecord {
    pub method: String,
    pub url: String,
    pub query_params: IndexMap<String, String>,
    pub headers: IndexMap<String, String>,
    pub code: u16,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
}

impl ResponseRecord {
    /// Build the record for a request head; `origin` is `http://host:port`.
    pub fn new(origin: &str, head: &RequestHead) -> Self {
        let url = format!("{origin}{}", head.target);

        Self {
            method: head.method.clone(),
            query_params: query_params(&head.target),
            url,
            headers: headers(head),
            code: 200,
            version: head.version.as_str(),
            body: None,
        }
    }

    /// Value of a request header, as echoed.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Value of a query parameter.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(String::as_str)
    }
}

/// Parse the query string of a request target.
///
/// A repeated key keeps its first position and its last value.
fn query_params(target: &str) -> IndexMap<String, String> {
    let query = match target.split_once('?') {
        Some((_, rest)) => rest.split('#').next().unwrap_or(""),
        None => return IndexMap::new(),
    };

    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Collapse headers into a map in arrival order.
///
/// Repeated lines keep the first value for single-value headers such as
/// `content-type`, join with `"; "` for `cookie` and with `", "` otherwise.
fn headers(head: &RequestHead) -> IndexMap<String, String> {
    let mut map: IndexMap<String, String> = IndexMap::with_capacity(head.headers.len());
    for (name, value) in &head.headers {
        match map.get_mut(name) {
            None => {
                map.insert(name.clone(), value.clone());
            }
            Some(_) if SINGLE_VALUE_HEADERS.contains(&name.as_str()) => {}
            Some(existing) => {
                existing.push_str(if name == "cookie" { "; " } else { ", " });
                existing.push_str(value);
            }
        }
    }
    map
}

/// Per-request echo failures.
#[derive(Debug)]
pub enum EchoError {
    /// Body declared `application/json` but did not parse.
    MalformedJson(serde_json::Error),
    /// The record could not be serialized.
    Render(serde_json::Error),
}

impl fmt::Display for EchoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EchoError::MalformedJson(e) => write!(f, "malformed JSON body: {e}"),
            EchoError::Render(e) => write!(f, "failed to render echo: {e}"),
        }
    }
}

impl std::error::Error for EchoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EchoError::MalformedJson(e) | EchoError::Render(e) => Some(e),
        }
    }
}
