//! Header rewriting for forwarded requests.
//!
//! Proxy-only headers are removed and the proxy discloses itself with
//! `Via`, `X-Forwarded-*` and `Forwarded`. All other headers pass through in
//! their original order, duplicates included.

use crate::request::{Header, Target};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;

pub const PROXY_CONNECTION: &str = "Proxy-Connection";
pub const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";
pub const VIA: &str = "Via";
pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";
pub const X_FORWARDED_PORT: &str = "X-Forwarded-Port";
pub const X_FORWARDED_PROTO: &str = "X-Forwarded-Proto";
pub const FORWARDED: &str = "Forwarded";

const STRIPPED: [&str; 2] = [PROXY_CONNECTION, PROXY_AUTHORIZATION];

/// Network identity of the client connection a request arrived on.
#[derive(Debug, Clone)]
pub struct ForwardingContext<'a> {
    /// Local host name, as used in `Via`
    pub host_name: &'a str,
    /// `name/version` of this proxy
    pub agent: &'a str,
    /// Proxy side of the client connection
    pub local: SocketAddr,
    /// Client side of the client connection; its port is the forwarded port
    pub peer: SocketAddr,
}

/// Applies the forwarding rules to `headers`, returning the header list to
/// send upstream.
pub fn rewrite(headers: &[Header], ctx: &ForwardingContext<'_>) -> Vec<Header> {
    let mut out: Vec<Header> = headers
        .iter()
        .filter(|h| !STRIPPED.iter().any(|name| h.is(name)))
        .cloned()
        .collect();

    let peer_ip = ctx.peer.ip().to_string();
    let local_ip = ctx.local.ip().to_string();

    out.reserve(5);
    out.push(Header::new(
        VIA,
        format!("1.1 {} ({})", ctx.host_name, ctx.agent),
    ));
    out.push(Header::new(X_FORWARDED_FOR, peer_ip.clone()));
    out.push(Header::new(X_FORWARDED_PORT, ctx.peer.port().to_string()));
    out.push(Header::new(X_FORWARDED_PROTO, "http"));
    out.push(Header::new(
        FORWARDED,
        format!("for={};proto=http;by={}", peer_ip, local_ip),
    ));
    out
}

/// Serialises a request for the upstream.
///
/// A `Host` header is added first when the list has none.
pub fn encode_request(
    method: &str,
    path: &str,
    target: &Target,
    headers: &[Header],
    body: &[u8],
) -> Bytes {
    let head_size: usize = headers
        .iter()
        .map(|h| h.name.len() + h.value.len() + 4)
        .sum();
    let mut buf = BytesMut::with_capacity(method.len() + path.len() + head_size + body.len() + 64);

    buf.put_slice(method.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    if !headers.iter().any(|h| h.is("host")) {
        let host = if target.port == 80 {
            target.host.clone()
        } else {
            target.authority()
        };
        put_header(&mut buf, "Host", &host);
    }
    for header in headers {
        put_header(&mut buf, &header.name, &header.value);
    }

    buf.put_slice(b"\r\n");
    buf.put_slice(body);
    buf.freeze()
}

#[inline]
fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}

/// Host name of this machine, or `localhost` when it cannot be read.
pub fn local_host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
