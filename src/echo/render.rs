//! JSON and HTML renderings of a `ResponseRecord`.

use crate::echo::record::{EchoError, ResponseRecord};
use std::fmt::Write;

/// Output format selected by the `format` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Html,
}

impl Format {
    /// Pick the format for a record. Anything but `html` means JSON.
    pub fn select(record: &ResponseRecord, html_enabled: bool) -> Self {
        match record.query("format") {
            Some("html") if html_enabled => Format::Html,
            _ => Format::Json,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Format::Json => "application/json",
            Format::Html => "text/html",
        }
    }

    pub fn render(&self, record: &ResponseRecord) -> Result<Vec<u8>, EchoError> {
        match self {
            Format::Json => render_json(record).map_err(EchoError::Render),
            Format::Html => Ok(render_html(record).into_bytes()),
        }
    }
}

/// The record as a compact JSON object.
pub fn render_json(record: &ResponseRecord) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(record)
}

/// The record as an HTML page.
///
/// Values are inserted verbatim, without escaping.
pub fn render_html(record: &ResponseRecord) -> String {
    let mut query_params = String::from("<li>query_params:<ul>");
    for (param, value) in &record.query_params {
        let _ = write!(query_params, "<li>{param}: {value}</li>");
    }
    query_params.push_str("</ul></li>");

    let mut headers = String::from("<li>headers:<ul>");
    for (name, value) in &record.headers {
        let _ = write!(headers, "<li>{name}: {value}</li>");
    }
    headers.push_str("</ul></li>");

    let mut html = format!(
        r#"<html lang="en">
    <head><title>{method}: {url}</title></head>
    <body>
        <h1>{method}: {url}</h1>
        <div>
            <ul>
                <li>method: {method}</li>
                <li>url: {url}</li>
                {query_params}
                {headers}
                <li>code: {code}</li>
                <li>version: {version}</li>"#,
        method = record.method,
        url = record.url,
        code = record.code,
        version = record.version,
    );

    if let Some(body) = record.body.as_ref().filter(|b| b.is_truthy()) {
        let _ = write!(html, "<li>body:<div>{}</div></li>", body.to_json_string());
    }
    html.push_str("</ul></div></body></html>");

    html
}
