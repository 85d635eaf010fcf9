//! HTTP/1.x message framing.
//!
//! Requests from clients are parsed into an ordered, duplicate-preserving
//! header list. Upstream replies are never decoded; the proxy only needs to
//! know where the first reply ends so it can copy it to the client verbatim.

use crate::error::ProxyError;
use bytes::Bytes;
use std::fmt;

/// Maximum number of headers accepted in a single message head.
pub const MAX_HEADERS: usize = 100;
/// Maximum size of a message head before it is rejected.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const HTTP_DEFAULT_PORT: u16 = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    #[inline]
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// A fully received client request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub uri: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    pub headers: Vec<Header>,
    /// Body exactly as received (chunked bodies keep their framing).
    pub body: Bytes,
}

impl Request {
    /// First value of `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.is(name))
            .map(|h| h.value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h.is(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

/// Parses one request from the front of `buf`.
///
/// Returns `Ok(None)` while more bytes are needed, otherwise the request and
/// the number of bytes it occupied.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => {
            if buf.len() > MAX_HEAD_SIZE {
                return Err(ProxyError::MalformedRequest(
                    "request head too large".to_string(),
                ));
            }
            return Ok(None);
        }
    };

    let (Some(method), Some(uri), Some(version)) = (req.method, req.path, req.version) else {
        return Err(ProxyError::MalformedRequest(
            "incomplete request line".to_string(),
        ));
    };

    let headers: Vec<Header> = req
        .headers
        .iter()
        .map(|h| Header::new(h.name, String::from_utf8_lossy(h.value)))
        .collect();

    let body_len = match request_framing(&headers).map_err(ProxyError::MalformedRequest)? {
        BodyFraming::Empty | BodyFraming::UntilClose => 0,
        BodyFraming::Length(len) => {
            if buf.len() < head_len + len {
                return Ok(None);
            }
            len
        }
        BodyFraming::Chunked => {
            match chunked_length(&buf[head_len..]).map_err(ProxyError::MalformedRequest)? {
                Some(len) => len,
                None => return Ok(None),
            }
        }
    };

    let total = head_len + body_len;
    let request = Request {
        method: method.to_string(),
        uri: uri.to_string(),
        version,
        headers,
        body: Bytes::copy_from_slice(&buf[head_len..total]),
    };

    Ok(Some((request, total)))
}

/// Progress of an upstream reply being accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Incomplete,
    /// The first reply occupies this many bytes of the buffer.
    Complete(usize),
}

/// Decides whether `buf` holds a complete reply to a `request_method` request.
///
/// `eof` tells whether the upstream has closed; it completes close-delimited
/// bodies and turns a truncated message into an error.
pub fn reply_length(buf: &[u8], request_method: &str, eof: bool) -> Result<ReplyStatus, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    let head_len = match resp.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if eof {
                return Err(ProxyError::UpstreamProtocol(
                    "connection closed before reply head".to_string(),
                ));
            }
            if buf.len() > MAX_HEAD_SIZE {
                return Err(ProxyError::UpstreamProtocol("reply head too large".to_string()));
            }
            return Ok(ReplyStatus::Incomplete);
        }
        Err(e) => return Err(ProxyError::UpstreamProtocol(e.to_string())),
    };

    let code = resp.code.unwrap_or_default();
    let headers: Vec<Header> = resp
        .headers
        .iter()
        .map(|h| Header::new(h.name, String::from_utf8_lossy(h.value)))
        .collect();

    let framing = if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&code)
        || code == 204
        || code == 304
    {
        BodyFraming::Empty
    } else {
        match request_framing(&headers).map_err(ProxyError::UpstreamProtocol)? {
            BodyFraming::Empty => BodyFraming::UntilClose,
            other => other,
        }
    };

    let status = match framing {
        BodyFraming::Empty => ReplyStatus::Complete(head_len),
        BodyFraming::Length(len) if buf.len() >= head_len + len => {
            ReplyStatus::Complete(head_len + len)
        }
        BodyFraming::Length(_) => ReplyStatus::Incomplete,
        BodyFraming::Chunked => {
            match chunked_length(&buf[head_len..]).map_err(ProxyError::UpstreamProtocol)? {
                Some(len) => ReplyStatus::Complete(head_len + len),
                None => ReplyStatus::Incomplete,
            }
        }
        BodyFraming::UntilClose if eof => ReplyStatus::Complete(buf.len()),
        BodyFraming::UntilClose => ReplyStatus::Incomplete,
    };

    if eof && status == ReplyStatus::Incomplete {
        return Err(ProxyError::UpstreamProtocol(
            "connection closed mid-reply".to_string(),
        ));
    }

    Ok(status)
}

/// Body framing from headers. Requests without a length have no body;
/// callers turn `Empty` into `UntilClose` for replies.
fn request_framing(headers: &[Header]) -> Result<BodyFraming, String> {
    let chunked = headers
        .iter()
        .filter(|h| h.is("transfer-encoding"))
        .flat_map(|h| h.value.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(BodyFraming::Chunked);
    }

    let mut length = None;
    for header in headers.iter().filter(|h| h.is("content-length")) {
        let parsed = header
            .value
            .trim()
            .parse::<usize>()
            .map_err(|_| format!("invalid Content-Length '{}'", header.value))?;
        match length {
            Some(prev) if prev != parsed => {
                return Err("conflicting Content-Length values".to_string());
            }
            _ => length = Some(parsed),
        }
    }

    Ok(match length {
        Some(0) | None => BodyFraming::Empty,
        Some(len) => BodyFraming::Length(len),
    })
}

/// Length of a complete chunked body at the front of `buf`, trailers included.
fn chunked_length(buf: &[u8]) -> Result<Option<usize>, String> {
    let mut pos = 0;
    loop {
        let (consumed, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(parsed)) => parsed,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err("invalid chunk size".to_string()),
        };
        pos += consumed;

        if size == 0 {
            // Trailer section ends with an empty line
            loop {
                let Some(line_len) = find_crlf(&buf[pos..]) else {
                    return Ok(None);
                };
                pos += line_len + 2;
                if line_len == 0 {
                    return Ok(Some(pos));
                }
            }
        }

        let size = usize::try_from(size).map_err(|_| "chunk too large".to_string())?;
        let chunk_end = pos
            .checked_add(size)
            .ok_or_else(|| "chunk too large".to_string())?;
        if buf.len() < chunk_end + 2 {
            return Ok(None);
        }
        if &buf[chunk_end..chunk_end + 2] != b"\r\n" {
            return Err("chunk not terminated by CRLF".to_string());
        }
        pos = chunk_end + 2;
    }
}

#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// A `host:port` pair the proxy connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Parses an authority such as `example.com:443` or `[::1]:8080`.
    ///
    /// Without a port, `default_port` is used; when that is `None` the port
    /// is mandatory.
    pub fn from_authority(authority: &str, default_port: Option<u16>) -> Result<Self, ProxyError> {
        let malformed = |why: &str| {
            ProxyError::MalformedRequest(format!("invalid target '{}': {}", authority, why))
        };

        if authority.is_empty() {
            return Err(malformed("empty authority"));
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| malformed("unterminated IPv6 literal"))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(malformed("unexpected characters after IPv6 literal")),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, _)) if host.contains(':') => {
                    return Err(malformed("IPv6 literal must be bracketed"));
                }
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
            return Err(malformed("bad host"));
        }

        let port = match port {
            Some(p) => match p.parse::<u16>() {
                Ok(0) | Err(_) => return Err(malformed("bad port")),
                Ok(p) => p,
            },
            None => default_port.ok_or_else(|| malformed("missing port"))?,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// The authority form, bracketing IPv6 hosts.
    pub fn authority(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Target of a CONNECT request: the URI is the authority itself.
pub fn connect_target(request: &Request) -> Result<Target, ProxyError> {
    Target::from_authority(&request.uri, None)
}

/// Target and origin-form path for a request forwarded as plain HTTP.
///
/// Absolute-form URIs (`http://host/path`) carry the target; origin-form
/// URIs take it from the `Host` header.
pub fn forward_target(request: &Request) -> Result<(Target, String), ProxyError> {
    let uri = request.uri.as_str();

    if let Some(rest) = strip_scheme(uri, "http://") {
        let split = rest.find(['/', '?']).unwrap_or(rest.len());
        let authority = &rest[..split];
        let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
        let path = match &rest[split..] {
            "" => "/".to_string(),
            p if p.starts_with('?') => format!("/{}", p),
            p => p.to_string(),
        };
        let target = Target::from_authority(authority, Some(HTTP_DEFAULT_PORT))?;
        return Ok((target, path));
    }

    if strip_scheme(uri, "https://").is_some() {
        return Err(ProxyError::MalformedRequest(
            "https targets require CONNECT".to_string(),
        ));
    }

    if uri.starts_with('/') || uri == "*" {
        let host = request.header("host").ok_or_else(|| {
            ProxyError::MalformedRequest("origin-form request without Host header".to_string())
        })?;
        let target = Target::from_authority(host.trim(), Some(HTTP_DEFAULT_PORT))?;
        return Ok((target, uri.to_string()));
    }

    Err(ProxyError::MalformedRequest(format!(
        "unsupported request target '{}'",
        uri
    )))
}

/// Case-insensitive ASCII prefix match. Compares bytes, so a multi-byte
/// character straddling the prefix length never splits.
fn strip_scheme<'a>(uri: &'a str, scheme: &str) -> Option<&'a str> {
    let n = scheme.len();
    uri.as_bytes()
        .get(..n)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme.as_bytes()))
        .then(|| &uri[n..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> (Request, usize) {
        parse_request(raw).unwrap().expect("request should be complete")
    }

    #[test]
    fn test_parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\nFoo: bar\r\n\r\n";
        let (req, used) = parse(raw);
        assert_eq!(used, raw.len());
        assert_eq!(req.method, "GET");
        assert_eq!(req.uri, "/");
        assert_eq!(req.version, 1);
        assert_eq!(
            req.headers,
            vec![Header::new("Host", "x"), Header::new("Foo", "bar")]
        );
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_parse_keeps_duplicates_in_order() {
        let raw = b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nA: 3\r\n\r\n";
        let (req, _) = parse(raw);
        let names: Vec<_> = req.headers.iter().map(|h| h.name.as_str()).collect();
        let values: Vec<_> = req.headers.iter().map(|h| h.value.as_str()).collect();
        assert_eq!(names, ["A", "B", "A"]);
        assert_eq!(values, ["1", "2", "3"]);
        assert_eq!(req.header("a"), Some("1"));
    }

    #[test]
    fn test_parse_partial_head() {
        assert!(parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap().is_none());
        assert!(parse_request(b"").unwrap().is_none());
    }

    #[test]
    fn test_parse_waits_for_content_length_body() {
        let raw = b"POST /p HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel";
        assert!(parse_request(raw).unwrap().is_none());

        let raw = b"POST /p HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloEXTRA";
        let (req, used) = parse(raw);
        assert_eq!(&req.body[..], b"hello");
        assert_eq!(used, raw.len() - 5);
    }

    #[test]
    fn test_parse_chunked_body_kept_raw() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
        let (req, used) = parse(raw);
        assert_eq!(used, raw.len());
        assert_eq!(&req.body[..], b"3\r\nabc\r\n0\r\n\r\n");

        let partial = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n";
        assert!(parse_request(partial).unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_request(b"\x01\x02 nonsense\r\n\r\n").unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));
    }

    #[test]
    fn test_parse_rejects_conflicting_lengths() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\nab";
        assert!(matches!(
            parse_request(raw),
            Err(ProxyError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_parse_rejects_oversized_head() {
        let mut raw = b"GET / HTTP/1.1\r\nX: ".to_vec();
        raw.extend(std::iter::repeat_n(b'a', MAX_HEAD_SIZE + 1));
        assert!(parse_request(&raw).is_err());
    }

    #[test]
    fn test_reply_with_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        assert_eq!(
            reply_length(raw, "GET", false).unwrap(),
            ReplyStatus::Complete(raw.len())
        );
        assert_eq!(
            reply_length(&raw[..raw.len() - 1], "GET", false).unwrap(),
            ReplyStatus::Incomplete
        );
    }

    #[test]
    fn test_reply_to_head_has_no_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
        assert_eq!(
            reply_length(raw, "HEAD", false).unwrap(),
            ReplyStatus::Complete(raw.len())
        );
    }

    #[test]
    fn test_reply_204_has_no_body() {
        let raw = b"HTTP/1.1 204 No Content\r\n\r\n";
        assert_eq!(
            reply_length(raw, "GET", false).unwrap(),
            ReplyStatus::Complete(raw.len())
        );
    }

    #[test]
    fn test_reply_chunked_with_trailer() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\nX-T: 1\r\n\r\n";
        assert_eq!(
            reply_length(raw, "GET", false).unwrap(),
            ReplyStatus::Complete(raw.len())
        );
    }

    #[test]
    fn test_reply_close_delimited() {
        let raw = b"HTTP/1.0 200 OK\r\n\r\nsome body";
        assert_eq!(
            reply_length(raw, "GET", false).unwrap(),
            ReplyStatus::Incomplete
        );
        assert_eq!(
            reply_length(raw, "GET", true).unwrap(),
            ReplyStatus::Complete(raw.len())
        );
    }

    #[test]
    fn test_reply_truncated_at_eof_is_protocol_error() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc";
        assert!(matches!(
            reply_length(raw, "GET", true),
            Err(ProxyError::UpstreamProtocol(_))
        ));
        assert!(matches!(
            reply_length(b"HTTP/1.1 200", "GET", true),
            Err(ProxyError::UpstreamProtocol(_))
        ));
    }

    #[test]
    fn test_reply_garbage_is_protocol_error() {
        assert!(matches!(
            reply_length(b"SSH-2.0-OpenSSH\r\n\r\n", "GET", false),
            Err(ProxyError::UpstreamProtocol(_))
        ));
    }

    #[test]
    fn test_target_from_authority() {
        let t = Target::from_authority("example.com:443", None).unwrap();
        assert_eq!(t.host, "example.com");
        assert_eq!(t.port, 443);

        let t = Target::from_authority("[::1]:8080", None).unwrap();
        assert_eq!(t.host, "::1");
        assert_eq!(t.to_string(), "[::1]:8080");

        let t = Target::from_authority("example.com", Some(80)).unwrap();
        assert_eq!(t.authority(), "example.com:80");
    }

    #[test]
    fn test_target_errors() {
        assert!(Target::from_authority("example.com", None).is_err());
        assert!(Target::from_authority("example.com:0", None).is_err());
        assert!(Target::from_authority("example.com:http", None).is_err());
        assert!(Target::from_authority(":443", None).is_err());
        assert!(Target::from_authority("::1:443", None).is_err());
        assert!(Target::from_authority("", Some(80)).is_err());
    }

    #[test]
    fn test_forward_target_absolute_form() {
        let (req, _) = parse(b"GET http://origin.test:8080/a/b?q=1 HTTP/1.1\r\n\r\n");
        let (target, path) = forward_target(&req).unwrap();
        assert_eq!(target.to_string(), "origin.test:8080");
        assert_eq!(path, "/a/b?q=1");

        let (req, _) = parse(b"GET http://origin.test HTTP/1.1\r\n\r\n");
        let (target, path) = forward_target(&req).unwrap();
        assert_eq!(target.to_string(), "origin.test:80");
        assert_eq!(path, "/");

        let (req, _) = parse(b"GET HTTP://Origin.test?x=1 HTTP/1.1\r\n\r\n");
        let (_, path) = forward_target(&req).unwrap();
        assert_eq!(path, "/?x=1");
    }

    #[test]
    fn test_forward_target_origin_form_uses_host() {
        let (req, _) = parse(b"GET /foo HTTP/1.1\r\nHost: x\r\n\r\n");
        let (target, path) = forward_target(&req).unwrap();
        assert_eq!(target, Target { host: "x".to_string(), port: 80 });
        assert_eq!(path, "/foo");
    }

    #[test]
    fn test_forward_target_errors() {
        let (req, _) = parse(b"GET /foo HTTP/1.1\r\n\r\n");
        assert!(forward_target(&req).is_err());

        let (req, _) = parse(b"GET https://secure.test/ HTTP/1.1\r\n\r\n");
        assert!(forward_target(&req).is_err());
    }

    #[test]
    fn test_forward_target_non_ascii_origin_form() {
        let (req, _) = parse("GET //\u{e9}\u{e9}\u{e9} HTTP/1.1\r\nHost: x\r\n\r\n".as_bytes());
        assert_eq!(req.uri, "//\u{e9}\u{e9}\u{e9}");
        let (target, path) = forward_target(&req).unwrap();
        assert_eq!(target, Target { host: "x".to_string(), port: 80 });
        assert_eq!(path, "//\u{e9}\u{e9}\u{e9}");
    }

    #[test]
    fn test_strip_scheme_multibyte_boundary() {
        assert_eq!(strip_scheme("//\u{e9}\u{e9}\u{e9}", "http://"), None);
        assert_eq!(strip_scheme("\u{e9}", "http://"), None);
        assert_eq!(strip_scheme("HTTP://\u{e9}", "http://"), Some("\u{e9}"));
    }
}
