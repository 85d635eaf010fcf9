//! Connection table, pairing registry and the per-connection state machine.
//!
//! [`Proxy`] is a synchronous state machine: the I/O driver feeds it one
//! [`Event`] at a time and executes the [`Action`]s it returns. Nothing in
//! here touches a socket, so every transition can be exercised directly.

use crate::diagnostic::{self, DiagnosticMode};
use crate::dispatch::{Route, classify};
use crate::error::ProxyError;
use crate::headers::{self, ForwardingContext};
use crate::request::{self, ReplyStatus, Request, Target};
use crate::responses;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out connection ids; ids are never reused within a process.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: u64,
}

impl IdGenerator {
    pub fn next_id(&mut self) -> ConnectionId {
        self.next += 1;
        ConnectionId(self.next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Upstream,
}

impl Role {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Upstream => "upstream",
        }
    }
}

/// Work waiting on an outbound connect.
#[derive(Debug, Clone, PartialEq)]
pub enum Pending {
    Tunnel,
    /// Encoded request to send once connected, and its method for reply framing.
    Forward { request: Bytes, method: String },
}

/// Connection state. A connection removed from the table is closed.
#[derive(Debug, Clone, PartialEq)]
pub enum State {
    /// Client connection reading its first request.
    AwaitingRequest,
    /// Client connection waiting for the upstream connect result.
    Connecting(Pending),
    /// Raw byte relay between paired connections.
    TunnelRelay,
    /// One HTTP exchange in flight. Upstream side keeps the request method.
    Forwarding { method: Option<String> },
    /// Flushing or torn down; waiting for the driver to release it.
    Closing,
}

#[derive(Debug)]
pub struct Connection {
    pub role: Role,
    pub state: State,
    /// Proxy side and client side addresses; upstream connections have none.
    pub addrs: Option<(SocketAddr, SocketAddr)>,
    buffer: BytesMut,
}

impl Connection {
    fn client(local: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            role: Role::Client,
            state: State::AwaitingRequest,
            addrs: Some((local, peer)),
            buffer: BytesMut::new(),
        }
    }

    fn upstream(state: State) -> Self {
        Self {
            role: Role::Upstream,
            state,
            addrs: None,
            buffer: BytesMut::new(),
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.state != State::Closing
    }
}

/// Symmetric client/upstream association.
#[derive(Debug, Default)]
pub struct Pairings {
    peers: HashMap<ConnectionId, ConnectionId>,
}

impl Pairings {
    /// Pairs `a` and `b`. Refuses self-pairing and already paired ids.
    pub fn pair(&mut self, a: ConnectionId, b: ConnectionId) -> bool {
        if a == b || self.peers.contains_key(&a) || self.peers.contains_key(&b) {
            return false;
        }
        self.peers.insert(a, b);
        self.peers.insert(b, a);
        true
    }

    /// Clears the pairing of `id` on both sides, returning the former peer.
    pub fn unpair(&mut self, id: ConnectionId) -> Option<ConnectionId> {
        let peer = self.peers.remove(&id)?;
        if self.peers.get(&peer) == Some(&id) {
            self.peers.remove(&peer);
        }
        Some(peer)
    }

    /// Peer of `id`, only if the pairing is symmetric.
    pub fn peer_of(&self, id: ConnectionId) -> Option<ConnectionId> {
        let peer = *self.peers.get(&id)?;
        (self.peers.get(&peer) == Some(&id)).then_some(peer)
    }

    /// Number of live pairs.
    pub fn len(&self) -> usize {
        self.peers.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (&ConnectionId, &ConnectionId)> {
        self.peers.iter()
    }
}

/// Input delivered by the I/O driver for one connection.
#[derive(Debug)]
pub enum Event {
    /// New client connection.
    Accepted { local: SocketAddr, peer: SocketAddr },
    Data(Bytes),
    /// Outbound connect for this client succeeded; `upstream` is already
    /// attached to the driver.
    Connected { upstream: ConnectionId },
    ConnectFailed { error: String },
    /// The transport reported EOF or an error.
    Closed,
    /// The driver finished tearing the connection down.
    Released,
}

/// Things worth counting or logging that are not I/O.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Classified {
        client: ConnectionId,
        route: Route,
        method: String,
        uri: String,
    },
    Relayed { from: Role, bytes: usize },
    Failed {
        id: ConnectionId,
        kind: &'static str,
        detail: String,
    },
    Released { id: ConnectionId, role: Role },
}

/// Work for the I/O driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Queue bytes on a connection without waiting.
    Send { to: ConnectionId, bytes: Bytes },
    /// Open an upstream connection on behalf of `client`.
    Connect {
        client: ConnectionId,
        target: Target,
        route: Route,
    },
    /// Close a connection, writing out queued bytes first if `flush`.
    Close { id: ConnectionId, flush: bool },
    Notify(Notice),
}

/// Fixed identity used when answering and forwarding.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// `name/version`
    pub agent: String,
    pub host_name: String,
    pub diagnostic: DiagnosticMode,
}

/// The proxy state machine.
#[derive(Debug)]
pub struct Proxy {
    options: ProxyOptions,
    connections: HashMap<ConnectionId, Connection>,
    pairings: Pairings,
}

impl Proxy {
    pub fn new(options: ProxyOptions) -> Self {
        Self {
            options,
            connections: HashMap::new(),
            pairings: Pairings::default(),
        }
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn peer_of(&self, id: ConnectionId) -> Option<ConnectionId> {
        self.pairings.peer_of(id)
    }

    pub fn pairings(&self) -> &Pairings {
        &self.pairings
    }

    /// Every pairing is symmetric and joins two live connections in the table.
    pub fn pairings_consistent(&self) -> bool {
        self.pairings.iter().all(|(a, b)| {
            self.pairings.peer_of(*a) == Some(*b)
                && [*a, *b]
                    .iter()
                    .all(|id| self.connections.get(id).is_some_and(Connection::is_live))
        })
    }

    /// Applies `event` to connection `id`.
    pub fn handle(&mut self, id: ConnectionId, event: Event) -> Vec<Action> {
        let mut actions = Vec::new();

        match event {
            Event::Accepted { local, peer } => {
                self.connections
                    .entry(id)
                    .or_insert_with(|| Connection::client(local, peer));
            }
            Event::Data(bytes) => self.on_data(id, bytes, &mut actions),
            Event::Connected { upstream } => self.on_connected(id, upstream, &mut actions),
            Event::ConnectFailed { error } => self.on_connect_failed(id, error, &mut actions),
            Event::Closed => self.on_closed(id, &mut actions),
            Event::Released => self.on_released(id, &mut actions),
        }

        debug_assert!(self.pairings_consistent());
        actions
    }

    fn on_data(&mut self, id: ConnectionId, bytes: Bytes, actions: &mut Vec<Action>) {
        let Some(conn) = self.connections.get_mut(&id) else {
            debug!(conn = %id, bytes = bytes.len(), "Data for unknown connection dropped");
            return;
        };

        let role = conn.role;
        match (role, &conn.state) {
            (Role::Client, State::AwaitingRequest) => {
                conn.buffer.extend_from_slice(&bytes);
                match request::parse_request(&conn.buffer) {
                    Ok(None) => {}
                    Ok(Some((req, used))) => {
                        let _ = conn.buffer.split_to(used);
                        self.start_route(id, req, actions);
                    }
                    Err(e) => self.reject(id, e, actions),
                }
            }
            (Role::Client, State::Connecting(Pending::Tunnel)) => {
                // Relayed once the tunnel is paired
                conn.buffer.extend_from_slice(&bytes);
            }
            (_, State::TunnelRelay) => self.relay(id, role, bytes, actions),
            (Role::Upstream, State::Forwarding { method }) => {
                let method = method.clone().unwrap_or_default();
                conn.buffer.extend_from_slice(&bytes);
                match request::reply_length(&conn.buffer, &method, false) {
                    Ok(ReplyStatus::Incomplete) => {}
                    Ok(ReplyStatus::Complete(len)) => self.deliver_reply(id, len, actions),
                    Err(e) => self.abort_pair(id, e, actions),
                }
            }
            (_, State::Closing) => {
                debug!(conn = %id, bytes = bytes.len(), "Data on closing connection dropped");
            }
            (_, state) => {
                debug!(
                    conn = %id,
                    role = role.as_str(),
                    ?state,
                    bytes = bytes.len(),
                    "Unexpected data discarded"
                );
            }
        }
    }

    fn start_route(&mut self, id: ConnectionId, req: Request, actions: &mut Vec<Action>) {
        let route = classify(&req);
        debug!(
            conn = %id,
            route = route.as_str(),
            method = %req.method,
            uri = %req.uri,
            "Request classified"
        );
        actions.push(Action::Notify(Notice::Classified {
            client: id,
            route,
            method: req.method.clone(),
            uri: req.uri.clone(),
        }));

        match route {
            Route::Tunnel => match request::connect_target(&req) {
                Ok(target) => {
                    self.set_state(id, State::Connecting(Pending::Tunnel));
                    actions.push(Action::Connect {
                        client: id,
                        target,
                        route,
                    });
                }
                Err(e) => self.reject(id, e, actions),
            },
            Route::Forward => match self.prepare_forward(id, &req) {
                Ok((target, encoded)) => {
                    if let Some(conn) = self.connections.get_mut(&id) {
                        conn.buffer.clear();
                        conn.state = State::Connecting(Pending::Forward {
                            request: encoded,
                            method: req.method,
                        });
                    }
                    actions.push(Action::Connect {
                        client: id,
                        target,
                        route,
                    });
                }
                Err(e) => self.reject(id, e, actions),
            },
            Route::Diagnostic => {
                let json = diagnostic::render(&req, self.options.diagnostic);
                actions.push(Action::Send {
                    to: id,
                    bytes: responses::diagnostic(&json),
                });
                self.close(id, true, actions);
            }
        }
    }

    fn prepare_forward(&self, id: ConnectionId, req: &Request) -> Result<(Target, Bytes), ProxyError> {
        let (target, path) = request::forward_target(req)?;
        let (local, peer) = self
            .connections
            .get(&id)
            .and_then(|c| c.addrs)
            .ok_or(ProxyError::PeerGone)?;

        let ctx = ForwardingContext {
            host_name: &self.options.host_name,
            agent: &self.options.agent,
            local,
            peer,
        };
        let rewritten = headers::rewrite(&req.headers, &ctx);
        let encoded = headers::encode_request(&req.method, &path, &target, &rewritten, &req.body);
        Ok((target, encoded))
    }

    fn on_connected(&mut self, id: ConnectionId, upstream: ConnectionId, actions: &mut Vec<Action>) {
        let pending = match self.connections.get(&id).map(|c| &c.state) {
            Some(State::Connecting(pending)) => pending.clone(),
            _ => {
                debug!(conn = %id, upstream = %upstream, "Client gone before connect completed");
                actions.push(Action::Close {
                    id: upstream,
                    flush: false,
                });
                return;
            }
        };

        let upstream_state = match &pending {
            Pending::Tunnel => State::TunnelRelay,
            Pending::Forward { method, .. } => State::Forwarding {
                method: Some(method.clone()),
            },
        };
        self.connections
            .insert(upstream, Connection::upstream(upstream_state));

        if !self.pairings.pair(id, upstream) {
            warn!(conn = %id, upstream = %upstream, "Refusing second pairing");
            self.shutdown_one(upstream, false, actions);
            self.close(id, true, actions);
            return;
        }
        debug!(conn = %id, upstream = %upstream, "Paired with upstream");

        match pending {
            Pending::Tunnel => {
                actions.push(Action::Send {
                    to: id,
                    bytes: responses::tunnel_established(&self.options.agent),
                });
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.state = State::TunnelRelay;
                    if !conn.buffer.is_empty() {
                        let early = conn.buffer.split().freeze();
                        actions.push(Action::Notify(Notice::Relayed {
                            from: Role::Client,
                            bytes: early.len(),
                        }));
                        actions.push(Action::Send {
                            to: upstream,
                            bytes: early,
                        });
                    }
                }
            }
            Pending::Forward { request, .. } => {
                self.set_state(id, State::Forwarding { method: None });
                actions.push(Action::Send {
                    to: upstream,
                    bytes: request,
                });
            }
        }
    }

    fn on_connect_failed(&mut self, id: ConnectionId, error: String, actions: &mut Vec<Action>) {
        match self.connections.get(&id).map(|c| &c.state) {
            Some(State::Connecting(_)) => {
                self.reject(id, ProxyError::UpstreamConnect(error), actions);
            }
            _ => debug!(conn = %id, error = %error, "Connect result for inactive connection ignored"),
        }
    }

    fn on_closed(&mut self, id: ConnectionId, actions: &mut Vec<Action>) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };

        match (&conn.role, &conn.state) {
            (_, State::Closing) => {}
            (Role::Upstream, State::Forwarding { method }) => {
                let method = method.clone().unwrap_or_default();
                match request::reply_length(&conn.buffer, &method, true) {
                    Ok(ReplyStatus::Complete(len)) => self.deliver_reply(id, len, actions),
                    Ok(ReplyStatus::Incomplete) => {
                        let e = ProxyError::UpstreamProtocol("reply incomplete".to_string());
                        self.abort_pair(id, e, actions);
                    }
                    Err(e) => self.abort_pair(id, e, actions),
                }
            }
            _ => {
                debug!(conn = %id, role = conn.role.as_str(), "Transport closed");
                self.close(id, true, actions);
            }
        }
    }

    fn on_released(&mut self, id: ConnectionId, actions: &mut Vec<Action>) {
        // A released connection must not stay referenced by its peer
        if self.pairings.peer_of(id).is_some() {
            self.close(id, false, actions);
        }
        if let Some(conn) = self.connections.remove(&id) {
            actions.push(Action::Notify(Notice::Released {
                id,
                role: conn.role,
            }));
        }
    }

    fn relay(&mut self, id: ConnectionId, from: Role, bytes: Bytes, actions: &mut Vec<Action>) {
        match self.live_peer(id) {
            Some(peer) => {
                actions.push(Action::Notify(Notice::Relayed {
                    from,
                    bytes: bytes.len(),
                }));
                actions.push(Action::Send { to: peer, bytes });
            }
            None => {
                debug!(conn = %id, bytes = bytes.len(), error = %ProxyError::PeerGone, "Relay dropped");
            }
        }
    }

    fn live_peer(&self, id: ConnectionId) -> Option<ConnectionId> {
        let peer = self.pairings.peer_of(id)?;
        self.connections
            .get(&peer)
            .is_some_and(Connection::is_live)
            .then_some(peer)
    }

    /// Copies the first `len` buffered bytes of an upstream reply to the
    /// client, then closes both sides.
    fn deliver_reply(&mut self, upstream: ConnectionId, len: usize, actions: &mut Vec<Action>) {
        let reply = match self.connections.get_mut(&upstream) {
            Some(conn) => conn.buffer.split_to(len).freeze(),
            None => return,
        };

        if let Some(client) = self.live_peer(upstream) {
            debug!(conn = %client, upstream = %upstream, bytes = reply.len(), "Upstream reply complete");
            actions.push(Action::Notify(Notice::Relayed {
                from: Role::Upstream,
                bytes: reply.len(),
            }));
            actions.push(Action::Send {
                to: client,
                bytes: reply,
            });
        }
        self.close(upstream, false, actions);
    }

    /// Ends a pair without sending anything more to either side.
    fn abort_pair(&mut self, id: ConnectionId, error: ProxyError, actions: &mut Vec<Action>) {
        warn!(conn = %id, error = %error, "Aborting connection pair");
        let peer = self.pairings.unpair(id);
        // Failures are reported against the client side of the pair
        let client = match self.connections.get(&id).map(|c| c.role) {
            Some(Role::Upstream) => peer.unwrap_or(id),
            _ => id,
        };
        actions.push(Action::Notify(Notice::Failed {
            id: client,
            kind: error.kind(),
            detail: error.to_string(),
        }));
        self.shutdown_one(id, false, actions);
        if let Some(peer) = peer {
            self.shutdown_one(peer, false, actions);
        }
    }

    /// Answers a client with an error reply and closes it.
    fn reject(&mut self, id: ConnectionId, error: ProxyError, actions: &mut Vec<Action>) {
        let reply = match &error {
            ProxyError::UpstreamConnect(detail) => {
                warn!(conn = %id, error = %error, "Upstream unreachable");
                responses::bad_gateway(Some(detail))
            }
            _ => {
                debug!(conn = %id, error = %error, "Client request rejected");
                responses::bad_request(Some(&error.to_string()))
            }
        };
        actions.push(Action::Notify(Notice::Failed {
            id,
            kind: error.kind(),
            detail: error.to_string(),
        }));
        actions.push(Action::Send {
            to: id,
            bytes: reply,
        });
        self.close(id, true, actions);
    }

    /// Moves `id` to `Closing` and propagates the close to its live peer.
    /// The pairing is cleared before either side can be released.
    fn close(&mut self, id: ConnectionId, flush: bool, actions: &mut Vec<Action>) {
        let peer = self.pairings.unpair(id);
        self.shutdown_one(id, flush, actions);
        if let Some(peer) = peer {
            // Whatever is already queued for the peer still goes out
            self.shutdown_one(peer, true, actions);
        }
    }

    fn shutdown_one(&mut self, id: ConnectionId, flush: bool, actions: &mut Vec<Action>) {
        if let Some(conn) = self.connections.get_mut(&id)
            && conn.is_live()
        {
            conn.state = State::Closing;
            conn.buffer.clear();
            actions.push(Action::Close { id, flush });
        }
    }

    fn set_state(&mut self, id: ConnectionId, state: State) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: ConnectionId = ConnectionId::new(1);
    const UPSTREAM: ConnectionId = ConnectionId::new(2);

    fn proxy() -> Proxy {
        Proxy::new(ProxyOptions {
            agent: "simple_proxy/1.0".to_string(),
            host_name: "proxyhost".to_string(),
            diagnostic: DiagnosticMode::Raw,
        })
    }

    fn accepted(p: &mut Proxy) {
        p.handle(
            CLIENT,
            Event::Accepted {
                local: "127.0.0.1:8000".parse().unwrap(),
                peer: "127.0.0.1:50000".parse().unwrap(),
            },
        );
    }

    fn data(p: &mut Proxy, id: ConnectionId, bytes: &'static [u8]) -> Vec<Action> {
        p.handle(id, Event::Data(Bytes::from_static(bytes)))
    }

    fn io(actions: &[Action]) -> Vec<&Action> {
        actions
            .iter()
            .filter(|a| !matches!(a, Action::Notify(_)))
            .collect()
    }

    fn sent_to(actions: &[Action], to: ConnectionId) -> Vec<u8> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { to: t, bytes } if *t == to => Some(bytes.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn tunnel(p: &mut Proxy) {
        accepted(p);
        data(p, CLIENT, b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n");
        p.handle(CLIENT, Event::Connected { upstream: UPSTREAM });
    }

    #[test]
    fn test_pairings_symmetric() {
        let mut pairs = Pairings::default();
        assert!(pairs.pair(CLIENT, UPSTREAM));
        assert_eq!(pairs.peer_of(CLIENT), Some(UPSTREAM));
        assert_eq!(pairs.peer_of(UPSTREAM), Some(CLIENT));
        assert_eq!(pairs.len(), 1);

        // At most one pairing per connection
        assert!(!pairs.pair(CLIENT, ConnectionId::new(3)));
        assert!(!pairs.pair(ConnectionId::new(3), ConnectionId::new(3)));

        assert_eq!(pairs.unpair(UPSTREAM), Some(CLIENT));
        assert_eq!(pairs.peer_of(CLIENT), None);
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_id_generator_is_monotonic() {
        let mut ids = IdGenerator::default();
        let a = ids.next_id();
        let b = ids.next_id();
        assert!(b > a);
        assert_eq!(a.to_string(), "#1");
    }

    #[test]
    fn test_partial_request_waits() {
        let mut p = proxy();
        accepted(&mut p);
        let actions = data(&mut p, CLIENT, b"GET / HTTP/1.1\r\nHost");
        assert!(actions.is_empty());
        assert_eq!(p.connection(CLIENT).unwrap().state, State::AwaitingRequest);
    }

    #[test]
    fn test_connect_requests_upstream() {
        let mut p = proxy();
        accepted(&mut p);
        let actions = data(
            &mut p,
            CLIENT,
            b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n",
        );
        assert_eq!(
            io(&actions),
            [&Action::Connect {
                client: CLIENT,
                target: Target {
                    host: "example.com".to_string(),
                    port: 443
                },
                route: Route::Tunnel,
            }]
        );
        assert_eq!(
            p.connection(CLIENT).unwrap().state,
            State::Connecting(Pending::Tunnel)
        );
        assert!(p.pairings().is_empty());
    }

    #[test]
    fn test_tunnel_success_then_relay() {
        let mut p = proxy();
        accepted(&mut p);
        data(&mut p, CLIENT, b"CONNECT example.com:443 HTTP/1.1\r\n\r\n");
        // Bytes sent before the connect completes are held back
        assert!(io(&data(&mut p, CLIENT, b"early")).is_empty());

        let actions = p.handle(CLIENT, Event::Connected { upstream: UPSTREAM });
        assert_eq!(
            io(&actions),
            [
                &Action::Send {
                    to: CLIENT,
                    bytes: Bytes::from_static(
                        b"HTTP/1.1 200 OK\r\nProxy-agent: simple_proxy/1.0\r\n\r\n"
                    ),
                },
                &Action::Send {
                    to: UPSTREAM,
                    bytes: Bytes::from_static(b"early"),
                },
            ]
        );
        assert_eq!(p.peer_of(CLIENT), Some(UPSTREAM));
        assert_eq!(p.connection(UPSTREAM).unwrap().role, Role::Upstream);

        let actions = data(&mut p, CLIENT, b"\x16\x03\x01");
        assert_eq!(sent_to(&actions, UPSTREAM), b"\x16\x03\x01");
        let actions = data(&mut p, UPSTREAM, b"reply");
        assert_eq!(sent_to(&actions, CLIENT), b"reply");
    }

    #[test]
    fn test_tunnel_connect_failure_sends_502_and_never_pairs() {
        let mut p = proxy();
        accepted(&mut p);
        data(&mut p, CLIENT, b"CONNECT nowhere.invalid:443 HTTP/1.1\r\n\r\n");
        let actions = p.handle(
            CLIENT,
            Event::ConnectFailed {
                error: "failed to lookup address".to_string(),
            },
        );
        let reply = String::from_utf8(sent_to(&actions, CLIENT)).unwrap();
        assert!(reply.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(reply.ends_with("failed to lookup address"));
        assert!(actions.contains(&Action::Close {
            id: CLIENT,
            flush: true
        }));
        assert!(p.pairings().is_empty());
        assert_eq!(p.connection(CLIENT).unwrap().state, State::Closing);
    }

    #[test]
    fn test_connect_without_port_is_bad_request() {
        let mut p = proxy();
        accepted(&mut p);
        let actions = data(&mut p, CLIENT, b"CONNECT example.com HTTP/1.1\r\n\r\n");
        let reply = String::from_utf8(sent_to(&actions, CLIENT)).unwrap();
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(!actions.iter().any(|a| matches!(a, Action::Connect { .. })));
    }

    #[test]
    fn test_malformed_request_rejected() {
        let mut p = proxy();
        accepted(&mut p);
        let actions = data(&mut p, CLIENT, b"\x00\x01garbage\r\n\r\n");
        let reply = String::from_utf8(sent_to(&actions, CLIENT)).unwrap();
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(actions.contains(&Action::Close {
            id: CLIENT,
            flush: true
        }));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Notify(Notice::Failed {
                kind: "malformed_request",
                ..
            })
        )));
    }

    #[test]
    fn test_diagnostic_echo_then_close() {
        let mut p = proxy();
        accepted(&mut p);
        let actions = data(&mut p, CLIENT, b"GET / HTTP/1.1\r\nHost: x\r\nFoo: bar\r\n\r\n");
        let reply = String::from_utf8(sent_to(&actions, CLIENT)).unwrap();
        assert!(reply.ends_with(
            r#"{"uri": "/", "method": "GET", "body": "", "headers": {"Host": "x", "Foo": "bar"}}"#
        ));
        assert_eq!(
            io(&actions).last(),
            Some(&&Action::Close {
                id: CLIENT,
                flush: true
            })
        );
        assert!(p.pairings().is_empty());
        assert!(!actions.iter().any(|a| matches!(a, Action::Connect { .. })));
    }

    #[test]
    fn test_forward_rewrites_and_relays_reply() {
        let mut p = proxy();
        accepted(&mut p);
        let actions = data(
            &mut p,
            CLIENT,
            b"GET /foo HTTP/1.1\r\nHost: x\r\nProxy-Connection: Keep-Alive\r\n\r\n",
        );
        assert!(actions.contains(&Action::Connect {
            client: CLIENT,
            target: Target {
                host: "x".to_string(),
                port: 80
            },
            route: Route::Forward,
        }));

        let actions = p.handle(CLIENT, Event::Connected { upstream: UPSTREAM });
        let upstream_req = String::from_utf8(sent_to(&actions, UPSTREAM)).unwrap();
        assert!(upstream_req.starts_with("GET /foo HTTP/1.1\r\nHost: x\r\n"));
        assert!(!upstream_req.contains("Proxy-Connection"));
        assert!(upstream_req.contains("Via: 1.1 proxyhost (simple_proxy/1.0)\r\n"));
        assert!(upstream_req.contains("X-Forwarded-For: 127.0.0.1\r\n"));
        assert!(upstream_req.contains("X-Forwarded-Port: 50000\r\n"));
        assert!(upstream_req.contains("X-Forwarded-Proto: http\r\n"));
        assert!(upstream_req.contains("Forwarded: for=127.0.0.1;proto=http;by=127.0.0.1\r\n"));

        // Reply arrives in two pieces; nothing is sent until it is complete
        let actions = data(&mut p, UPSTREAM, b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 5\r\n\r\nhe");
        assert!(io(&actions).is_empty());
        let actions = data(&mut p, UPSTREAM, b"llo");
        assert_eq!(
            sent_to(&actions, CLIENT),
            b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 5\r\n\r\nhello"
        );
        assert!(actions.contains(&Action::Close {
            id: CLIENT,
            flush: true
        }));
        assert!(actions.contains(&Action::Close {
            id: UPSTREAM,
            flush: false
        }));
        assert_eq!(p.peer_of(CLIENT), None);
    }

    #[test]
    fn test_forward_non_ascii_origin_form_target() {
        let mut p = proxy();
        accepted(&mut p);
        let actions = data(
            &mut p,
            CLIENT,
            "GET //\u{e9}\u{e9}\u{e9} HTTP/1.1\r\nHost: x\r\nProxy-Connection: close\r\n\r\n".as_bytes(),
        );
        assert!(actions.contains(&Action::Connect {
            client: CLIENT,
            target: Target {
                host: "x".to_string(),
                port: 80
            },
            route: Route::Forward,
        }));

        let actions = p.handle(CLIENT, Event::Connected { upstream: UPSTREAM });
        let upstream_req = String::from_utf8(sent_to(&actions, UPSTREAM)).unwrap();
        assert!(upstream_req.starts_with("GET //\u{e9}\u{e9}\u{e9} HTTP/1.1\r\n"));
        assert_eq!(p.peer_of(CLIENT), Some(UPSTREAM));
    }

    #[test]
    fn test_forward_close_delimited_reply() {
        let mut p = proxy();
        accepted(&mut p);
        data(&mut p, CLIENT, b"GET http://origin.test/ HTTP/1.0\r\nProxy-Connection: close\r\n\r\n");
        p.handle(CLIENT, Event::Connected { upstream: UPSTREAM });
        assert!(io(&data(&mut p, UPSTREAM, b"HTTP/1.0 200 OK\r\n\r\nbody")).is_empty());

        let actions = p.handle(UPSTREAM, Event::Closed);
        assert_eq!(sent_to(&actions, CLIENT), b"HTTP/1.0 200 OK\r\n\r\nbody");
    }

    #[test]
    fn test_unparseable_upstream_reply_aborts_without_response() {
        let mut p = proxy();
        accepted(&mut p);
        data(&mut p, CLIENT, b"GET /foo HTTP/1.1\r\nHost: x\r\nProxy-Connection: close\r\n\r\n");
        p.handle(CLIENT, Event::Connected { upstream: UPSTREAM });

        let actions = data(&mut p, UPSTREAM, b"NOT HTTP AT ALL\r\n\r\n");
        assert!(sent_to(&actions, CLIENT).is_empty());
        assert!(actions.contains(&Action::Close {
            id: CLIENT,
            flush: false
        }));
        assert!(actions.contains(&Action::Close {
            id: UPSTREAM,
            flush: false
        }));
        assert!(p.pairings().is_empty());
    }

    #[test]
    fn test_closing_either_side_closes_peer() {
        for closer in [CLIENT, UPSTREAM] {
            let mut p = proxy();
            tunnel(&mut p);
            let other = if closer == CLIENT { UPSTREAM } else { CLIENT };

            let actions = p.handle(closer, Event::Closed);
            assert!(actions.contains(&Action::Close {
                id: closer,
                flush: true
            }));
            assert!(actions.contains(&Action::Close {
                id: other,
                flush: true
            }));
            // Pairing is gone before anything is released
            assert_eq!(p.peer_of(closer), None);
            assert_eq!(p.peer_of(other), None);
            assert_eq!(p.connection(other).unwrap().state, State::Closing);

            p.handle(closer, Event::Released);
            p.handle(other, Event::Released);
            assert_eq!(p.connection_count(), 0);
        }
    }

    #[test]
    fn test_data_without_live_peer_is_dropped() {
        let mut p = proxy();
        tunnel(&mut p);
        p.handle(UPSTREAM, Event::Closed);

        // Late bytes from the client after the upstream went away
        assert!(io(&data(&mut p, CLIENT, b"late")).is_empty());
        // Bytes for a connection the table never saw
        assert!(data(&mut p, ConnectionId::new(99), b"stray").is_empty());
    }

    #[test]
    fn test_connect_result_after_client_left_closes_upstream() {
        let mut p = proxy();
        accepted(&mut p);
        data(&mut p, CLIENT, b"CONNECT example.com:443 HTTP/1.1\r\n\r\n");
        p.handle(CLIENT, Event::Closed);

        let actions = p.handle(CLIENT, Event::Connected { upstream: UPSTREAM });
        assert_eq!(
            actions,
            [Action::Close {
                id: UPSTREAM,
                flush: false
            }]
        );
        assert!(p.pairings().is_empty());
        assert!(p.connection(UPSTREAM).is_none());
    }

    #[test]
    fn test_duplicate_close_is_noop() {
        let mut p = proxy();
        tunnel(&mut p);
        p.handle(CLIENT, Event::Closed);
        assert!(p.handle(CLIENT, Event::Closed).is_empty());
        assert!(p.handle(UPSTREAM, Event::Closed).is_empty());
    }

    #[test]
    fn test_release_reports_role() {
        let mut p = proxy();
        accepted(&mut p);
        p.handle(CLIENT, Event::Closed);
        let actions = p.handle(CLIENT, Event::Released);
        assert_eq!(
            actions,
            [Action::Notify(Notice::Released {
                id: CLIENT,
                role: Role::Client
            })]
        );
        assert!(p.handle(CLIENT, Event::Released).is_empty());
    }
}
