//! Replies the proxy writes itself.

use bytes::Bytes;

/// Sent once the CONNECT target is reachable, before any relayed byte.
pub fn tunnel_established(agent: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 200 OK\r\nProxy-agent: {}\r\n\r\n",
        agent
    ))
}

pub fn bad_request(detail: Option<&str>) -> Bytes {
    error(400, "Bad Request", detail)
}

pub fn bad_gateway(detail: Option<&str>) -> Bytes {
    error(502, "Bad Gateway", detail)
}

/// Error reply with a plain text body: the detail if given, else the reason.
pub fn error(code: u16, reason: &str, detail: Option<&str>) -> Bytes {
    let body = match detail {
        Some(detail) if !detail.is_empty() => detail,
        _ => reason,
    };
    Bytes::from(format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        body.len(),
        body
    ))
}

/// Diagnostic echo; the connection closes after it, which ends the body.
pub fn diagnostic(json: &str) -> Bytes {
    let mut out = String::with_capacity(64 + json.len());
    out.push_str("HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n");
    out.push_str(json);
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_established() {
        assert_eq!(
            &tunnel_established("simple_proxy/1.0")[..],
            b"HTTP/1.1 200 OK\r\nProxy-agent: simple_proxy/1.0\r\n\r\n"
        );
    }

    #[test]
    fn test_bad_gateway_carries_detail() {
        let reply = bad_gateway(Some("Connection refused (os error 111)"));
        let text = std::str::from_utf8(&reply).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("Content-Length: 33\r\n"));
        assert!(text.ends_with("\r\n\r\nConnection refused (os error 111)"));
    }

    #[test]
    fn test_bad_request_defaults_to_reason() {
        let reply = bad_request(None);
        assert!(reply.ends_with(b"Content-Length: 11\r\nConnection: close\r\n\r\nBad Request"));
    }

    #[test]
    fn test_diagnostic_headers() {
        let reply = diagnostic("{}");
        assert_eq!(
            &reply[..],
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n{}"
        );
    }
}
