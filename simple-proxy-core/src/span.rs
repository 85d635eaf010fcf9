//! Request spans handed to an optional external collector.
//!
//! Publishing is best effort: a sink must never block the event loop and its
//! failures never reach the proxying path.

use crate::dispatch::Route;
use simple_proxy_config::CollectorUri;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};
use tracing::info;

/// One finished client connection.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    pub service: String,
    pub route: Route,
    pub method: String,
    pub uri: String,
    pub peer: SocketAddr,
    pub started: SystemTime,
    pub duration: Duration,
    /// Error kind, if the request failed.
    pub error: Option<&'static str>,
}

pub trait SpanSink: Send + Sync {
    /// Records a finished span. Must return promptly.
    fn record(&self, span: &SpanRecord);
}

/// Emits spans as `tracing` events tagged with the collector they are bound
/// for, so a log shipper can forward them.
#[derive(Debug, Clone)]
pub struct LogSpanSink {
    broker: String,
    topic: String,
}

impl LogSpanSink {
    pub fn new(collector: &CollectorUri) -> Self {
        Self {
            broker: collector.broker(),
            topic: collector.topic.clone().unwrap_or_default(),
        }
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl SpanSink for LogSpanSink {
    fn record(&self, span: &SpanRecord) {
        let started_us = span
            .started
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or_default();

        info!(
            target: "simple_proxy::span",
            broker = %self.broker,
            topic = %self.topic,
            service = %span.service,
            route = span.route.as_str(),
            method = %span.method,
            uri = %span.uri,
            peer = %span.peer,
            timestamp_us = started_us as u64,
            duration_us = span.duration.as_micros() as u64,
            error = span.error.unwrap_or(""),
            "span"
        );
    }
}
