use std::error::Error;
use std::fmt;
use std::io;

/// Failures the proxy distinguishes when deciding how to answer a client.
#[derive(Debug)]
pub enum ProxyError {
    /// Incoming request could not be parsed into method, URI and headers.
    MalformedRequest(String),
    /// DNS resolution or TCP connect to the target failed.
    UpstreamConnect(String),
    /// Upstream reply could not be parsed as HTTP.
    UpstreamProtocol(String),
    /// Relay attempted on a connection without a live peer.
    PeerGone,
    Io(io::Error),
}

impl ProxyError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::MalformedRequest(_) => "malformed_request",
            ProxyError::UpstreamConnect(_) => "upstream_connect",
            ProxyError::UpstreamProtocol(_) => "upstream_protocol",
            ProxyError::PeerGone => "peer_gone",
            ProxyError::Io(_) => "io",
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::MalformedRequest(msg) => write!(f, "Malformed request: {}", msg),
            ProxyError::UpstreamConnect(msg) => write!(f, "Upstream connect failed: {}", msg),
            ProxyError::UpstreamProtocol(msg) => write!(f, "Invalid upstream reply: {}", msg),
            ProxyError::PeerGone => write!(f, "No live peer for relay"),
            ProxyError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl Error for ProxyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProxyError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> Self {
        ProxyError::Io(err)
    }
}

impl From<httparse::Error> for ProxyError {
    fn from(err: httparse::Error) -> Self {
        ProxyError::MalformedRequest(err.to_string())
    }
}
