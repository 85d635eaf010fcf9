//! Echo of a request that did not ask to be proxied.

use crate::request::Request;
use std::fmt::Write;

/// How header, URI, method and body values are written into the echo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiagnosticMode {
    /// Values are copied between quotes as-is. Embedded quotes or control
    /// characters produce invalid JSON; kept for compatibility with existing
    /// consumers of the echo.
    #[default]
    Raw,
    /// Values are JSON string literals.
    Escaped,
}

impl DiagnosticMode {
    pub fn from_config(escape_values: bool) -> Self {
        if escape_values {
            DiagnosticMode::Escaped
        } else {
            DiagnosticMode::Raw
        }
    }
}

/// Renders `{"uri": .., "method": .., "body": .., "headers": {..}}`.
///
/// Every header occurrence becomes one entry, in request order, so repeated
/// names appear more than once.
pub fn render(request: &Request, mode: DiagnosticMode) -> String {
    let body = String::from_utf8_lossy(&request.body);
    let mut out = String::with_capacity(64 + request.uri.len() + body.len());

    out.push_str("{\"uri\": ");
    push_value(&mut out, &request.uri, mode);
    out.push_str(", \"method\": ");
    push_value(&mut out, &request.method, mode);
    out.push_str(", \"body\": ");
    push_value(&mut out, &body, mode);
    out.push_str(", \"headers\": {");

    for (i, header) in request.headers.iter().enumerate() {
        if i != 0 {
            out.push_str(", ");
        }
        push_value(&mut out, &header.name, mode);
        out.push_str(": ");
        push_value(&mut out, &header.value, mode);
    }

    out.push_str("}}");
    out
}

fn push_value(out: &mut String, value: &str, mode: DiagnosticMode) {
    match mode {
        DiagnosticMode::Raw => {
            let _ = write!(out, "\"{}\"", value);
        }
        DiagnosticMode::Escaped => match serde_json::to_string(value) {
            Ok(encoded) => out.push_str(&encoded),
            Err(_) => out.push_str("\"\""),
        },
    }
}
