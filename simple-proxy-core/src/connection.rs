//! Socket plumbing around the [`Proxy`] state machine.
//!
//! Every socket gets a reader task and a writer task. Reader tasks turn
//! bytes and EOF into events; writer tasks drain an unbounded queue, so
//! sending never blocks the loop. All state changes happen on the single
//! task that owns the [`ConnectionHandler`].
//!
//! A flushing close keeps the reader running in drain mode until the peer
//! sends EOF. Dropping a socket with unread input makes the kernel answer
//! with RST, which can discard the reply still in flight.

use crate::dispatch::Route;
use crate::lifecycle::{Action, ConnectionId, Event, IdGenerator, Notice, Proxy, Role};
use crate::request::Target;
use crate::span::{SpanRecord, SpanSink};
use bytes::{Bytes, BytesMut};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, lookup_host};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const READ_BUFFER_SIZE: usize = 16384;

/// Messages delivered to the loop task.
#[derive(Debug)]
pub enum LoopMessage {
    Io(ConnectionId, Event),
    Connected {
        client: ConnectionId,
        result: io::Result<TcpStream>,
    },
}

enum Outbound {
    Data(Bytes),
    Shutdown,
}

struct Slot {
    outbound: mpsc::UnboundedSender<Outbound>,
    drain: oneshot::Sender<()>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct ConnectionMetrics {
    connections_total: IntCounterVec,
    connections_active: IntGauge,
    connection_duration: HistogramVec,
    bytes_relayed: IntCounterVec,
    errors_total: IntCounterVec,
}

impl ConnectionMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let connections_total = IntCounterVec::new(
            Opts::new(
                "simple_proxy_connections_total",
                "Total number of client connections handled",
            ),
            &["route", "status"],
        )?;
        let connections_active = IntGauge::new(
            "simple_proxy_connections_active",
            "Number of currently open client connections",
        )?;
        let connection_duration = HistogramVec::new(
            HistogramOpts::new(
                "simple_proxy_connection_duration_seconds",
                "Client connection duration in seconds",
            )
            .buckets(vec![
                0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0,
            ]),
            &["route"],
        )?;
        let bytes_relayed = IntCounterVec::new(
            Opts::new(
                "simple_proxy_bytes_relayed_total",
                "Total bytes relayed between paired connections",
            ),
            &["direction"],
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("simple_proxy_errors_total", "Total number of errors by kind"),
            &["kind"],
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(connection_duration.clone()))?;
        registry.register(Box::new(bytes_relayed.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            connections_total,
            connections_active,
            connection_duration,
            bytes_relayed,
            errors_total,
        })
    }
}

/// Per-client bookkeeping for logs, metrics and spans.
struct ClientRecord {
    peer: SocketAddr,
    started: SystemTime,
    start: Instant,
    route: Option<Route>,
    method: String,
    uri: String,
    error: Option<&'static str>,
}

pub struct ConnectionHandler {
    proxy: Proxy,
    ids: IdGenerator,
    slots: HashMap<ConnectionId, Slot>,
    /// Readers of closed connections still discarding input until EOF
    draining: Vec<JoinHandle<()>>,
    clients: HashMap<ConnectionId, ClientRecord>,
    events: mpsc::UnboundedSender<LoopMessage>,
    metrics: Option<ConnectionMetrics>,
    spans: Option<Arc<dyn SpanSink>>,
    service: String,
}

impl ConnectionHandler {
    pub fn new(
        proxy: Proxy,
        events: mpsc::UnboundedSender<LoopMessage>,
        registry: Option<&Registry>,
        spans: Option<Arc<dyn SpanSink>>,
        service: String,
    ) -> Result<Self, prometheus::Error> {
        let metrics = registry.map(ConnectionMetrics::new).transpose()?;
        Ok(Self {
            proxy,
            ids: IdGenerator::default(),
            slots: HashMap::new(),
            draining: Vec::new(),
            clients: HashMap::new(),
            events,
            metrics,
            spans,
            service,
        })
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Registers a freshly accepted client socket.
    pub fn accept(&mut self, client: TcpStream, peer: SocketAddr) {
        let local = match client.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!(peer = %peer, error = %e, "Accepted socket has no local address");
                return;
            }
        };

        let id = self.ids.next_id();
        info!(peer = %peer, conn = %id, "New connection");

        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.inc();
        }
        self.clients.insert(
            id,
            ClientRecord {
                peer,
                started: SystemTime::now(),
                start: Instant::now(),
                route: None,
                method: String::new(),
                uri: String::new(),
                error: None,
            },
        );

        self.attach(id, client);
        self.dispatch(id, Event::Accepted { local, peer });
    }

    pub fn handle_message(&mut self, message: LoopMessage) {
        match message {
            LoopMessage::Io(id, event) => self.dispatch(id, event),
            LoopMessage::Connected { client, result } => match result {
                Ok(stream) => {
                    let upstream = self.ids.next_id();
                    self.attach(upstream, stream);
                    self.dispatch(client, Event::Connected { upstream });
                }
                Err(e) => self.dispatch(
                    client,
                    Event::ConnectFailed {
                        error: e.to_string(),
                    },
                ),
            },
        }
    }

    /// Stops every socket task. Used when the loop exits.
    pub fn shutdown(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.reader.abort();
            slot.writer.abort();
        }
        for reader in self.draining.drain(..) {
            reader.abort();
        }
    }

    fn dispatch(&mut self, id: ConnectionId, event: Event) {
        for action in self.proxy.handle(id, event) {
            self.apply(action);
        }
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::Send { to, bytes } => match self.slots.get(&to) {
                Some(slot) => {
                    if slot.outbound.send(Outbound::Data(bytes)).is_err() {
                        debug!(conn = %to, "Writer already gone");
                    }
                }
                None => debug!(conn = %to, bytes = bytes.len(), "Send to detached connection dropped"),
            },
            Action::Connect {
                client,
                target,
                route,
            } => {
                debug!(conn = %client, target = %target, route = route.as_str(), "Connecting upstream");
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = connect_to_server(&target).await;
                    let _ = events.send(LoopMessage::Connected { client, result });
                });
            }
            Action::Close { id, flush } => self.close(id, flush),
            Action::Notify(notice) => self.observe(notice),
        }
    }

    fn attach(&mut self, id: ConnectionId, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(conn = %id, error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let (drain, drain_rx) = oneshot::channel();

        let reader = tokio::spawn(read_loop(id, read_half, drain_rx, self.events.clone()));
        let writer = tokio::spawn(write_loop(id, write_half, queue, self.events.clone()));

        self.slots.insert(
            id,
            Slot {
                outbound,
                drain,
                reader,
                writer,
            },
        );
    }

    fn close(&mut self, id: ConnectionId, flush: bool) {
        let Some(slot) = self.slots.remove(&id) else {
            return;
        };

        let released = if flush {
            // Writer drains what is queued, shuts down and reports release
            let _ = slot.drain.send(());
            self.draining.retain(|reader| !reader.is_finished());
            self.draining.push(slot.reader);
            slot.outbound.send(Outbound::Shutdown).is_err()
        } else {
            slot.reader.abort();
            slot.writer.abort();
            true
        };

        if released {
            let _ = self.events.send(LoopMessage::Io(id, Event::Released));
        }
    }

    fn observe(&mut self, notice: Notice) {
        match notice {
            Notice::Classified {
                client,
                route,
                method,
                uri,
            } => {
                if let Some(record) = self.clients.get_mut(&client) {
                    record.route = Some(route);
                    record.method = method;
                    record.uri = uri;
                }
            }
            Notice::Relayed { from, bytes } => {
                if let Some(ref metrics) = self.metrics {
                    let direction = match from {
                        Role::Client => "client_to_upstream",
                        Role::Upstream => "upstream_to_client",
                    };
                    metrics
                        .bytes_relayed
                        .with_label_values(&[direction])
                        .inc_by(bytes as u64);
                }
            }
            Notice::Failed { id, kind, detail } => {
                debug!(conn = %id, kind, detail = %detail, "Request failed");
                if let Some(ref metrics) = self.metrics {
                    metrics.errors_total.with_label_values(&[kind]).inc();
                }
                if let Some(record) = self.clients.get_mut(&id) {
                    record.error.get_or_insert(kind);
                }
            }
            Notice::Released { id, role } => {
                debug!(conn = %id, role = role.as_str(), "Connection released");
                if let Some(record) = self.clients.remove(&id) {
                    self.finish(record);
                }
            }
        }
    }

    fn finish(&self, record: ClientRecord) {
        let duration = record.start.elapsed();
        let route = record.route.map_or("none", |r| r.as_str());
        let status = if record.error.is_some() {
            "failure"
        } else {
            "success"
        };

        info!(
            peer = %record.peer,
            route,
            status,
            duration_secs = %duration.as_secs_f64(),
            "Connection completed"
        );

        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.dec();
            metrics
                .connections_total
                .with_label_values(&[route, status])
                .inc();
            metrics
                .connection_duration
                .with_label_values(&[route])
                .observe(duration.as_secs_f64());
        }

        if let (Some(sink), Some(route)) = (&self.spans, record.route) {
            sink.record(&SpanRecord {
                service: self.service.clone(),
                route,
                method: record.method,
                uri: record.uri,
                peer: record.peer,
                started: record.started,
                duration,
                error: record.error,
            });
        }
    }
}

/// Resolves and connects to the target. No timeout is applied.
async fn connect_to_server(target: &Target) -> io::Result<TcpStream> {
    debug!("Resolving target address: {}", target);
    let addr = lookup_host((target.host.as_str(), target.port))
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Failed to resolve target"))?;

    debug!("Connecting to target: {}", addr);
    TcpStream::connect(addr).await
}

async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    mut drain: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<LoopMessage>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut draining = false;
    loop {
        buf.reserve(READ_BUFFER_SIZE);
        tokio::select! {
            biased;
            _ = &mut drain, if !draining => {
                draining = true;
                buf.clear();
            }
            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => break,
                Ok(_) if draining => buf.clear(),
                Ok(_) => {
                    let chunk = buf.split().freeze();
                    if events.send(LoopMessage::Io(id, Event::Data(chunk))).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(conn = %id, error = %e, "Read failed");
                    break;
                }
            },
        }
    }
    if draining {
        debug!(conn = %id, "Drained input until EOF");
    } else {
        let _ = events.send(LoopMessage::Io(id, Event::Closed));
    }
}

async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<LoopMessage>,
) {
    let mut failed = false;
    while let Some(outbound) = queue.recv().await {
        match outbound {
            Outbound::Data(bytes) => {
                if failed {
                    continue;
                }
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!(conn = %id, error = %e, "Write failed");
                    failed = true;
                    let _ = events.send(LoopMessage::Io(id, Event::Closed));
                }
            }
            Outbound::Shutdown => {
                if !failed {
                    let _ = writer.shutdown().await;
                }
                break;
            }
        }
    }
    let _ = events.send(LoopMessage::Io(id, Event::Released));
}
