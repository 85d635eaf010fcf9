pub mod connection;
pub mod diagnostic;
pub mod dispatch;
pub mod error;
pub mod headers;
pub mod lifecycle;
pub mod request;
pub mod responses;
pub mod span;

use connection::{ConnectionHandler, LoopMessage};
use prometheus::Registry;
use simple_proxy_config::{CollectorUri, Config};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

pub use diagnostic::DiagnosticMode;
pub use dispatch::Route;
pub use error::ProxyError;
pub use lifecycle::{Proxy, ProxyOptions};
pub use span::{LogSpanSink, SpanRecord, SpanSink};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Everything the event loop needs besides the listener.
pub struct RunContext {
    pub options: ProxyOptions,
    pub registry: Option<Registry>,
    pub spans: Option<Arc<dyn SpanSink>>,
}

impl RunContext {
    pub fn from_config(config: &Config, registry: Option<Registry>) -> Result<Self, BoxError> {
        let spans = match &config.tracing {
            Some(tracing) => {
                let uri = CollectorUri::parse(&tracing.collector)?;
                info!(collector = %uri.broker(), "Logging request spans for collector");
                Some(Arc::new(LogSpanSink::new(&uri)) as Arc<dyn SpanSink>)
            }
            None => None,
        };

        Ok(Self {
            options: ProxyOptions {
                agent: config.agent.to_string(),
                host_name: headers::local_host_name(),
                diagnostic: DiagnosticMode::from_config(config.diagnostic.escape_values),
            },
            registry,
            spans,
        })
    }
}

/// Binds the configured listen address and serves until `shutdown` fires.
pub async fn run_proxy(
    config: Config,
    registry: Option<Registry>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), BoxError> {
    config.validate()?;
    let ctx = RunContext::from_config(&config, registry)?;

    let addr = config.listen_socket_addr()?;
    info!("Starting listener on {}", addr);
    let listener = TcpListener::bind(addr).await?;

    serve(listener, ctx, shutdown).await
}

/// Runs the single event loop over an already bound listener.
pub async fn serve(
    listener: TcpListener,
    ctx: RunContext,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), BoxError> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<LoopMessage>();
    let service = ctx
        .options
        .agent
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let mut handler = ConnectionHandler::new(
        Proxy::new(ctx.options),
        events_tx,
        ctx.registry.as_ref(),
        ctx.spans,
        service,
    )?;

    info!("Proxy started, waiting for connections...");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Received shutdown signal");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, peer)) => handler.accept(socket, peer),
                    Err(e) => error!("Accept error: {}", e),
                }
            }
            Some(message) = events_rx.recv() => handler.handle_message(message),
        }
    }

    info!(
        open = handler.proxy().connection_count(),
        "Shutting down proxy"
    );
    handler.shutdown();
    Ok(())
}
