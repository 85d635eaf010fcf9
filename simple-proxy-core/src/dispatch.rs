//! Route selection for the first request on a client connection.

use crate::headers::PROXY_CONNECTION;
use crate::request::Request;

/// How the first request on a client connection is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// CONNECT: raw byte tunnel to `host:port`.
    Tunnel,
    /// Plain HTTP request relayed to the origin with rewritten headers.
    Forward,
    /// No proxying requested: echo the request back as JSON.
    Diagnostic,
}

impl Route {
    /// Returns a string representation of the route for metrics and logging
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Tunnel => "tunnel",
            Route::Forward => "forward",
            Route::Diagnostic => "diagnostic",
        }
    }
}

/// Picks the route from the method and header names alone.
///
/// A `Proxy-Connection` header marks a request as addressed to this proxy.
pub fn classify(request: &Request) -> Route {
    if request.method.eq_ignore_ascii_case("CONNECT") {
        Route::Tunnel
    } else if request.has_header(PROXY_CONNECTION) {
        Route::Forward
    } else {
        Route::Diagnostic
    }
}
