use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use simple_proxy_config::{Config, Tracing};
use simple_proxy_core::{BoxError, run_proxy};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt};

/// Start-up options collected from the command line.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub config: Option<PathBuf>,
    pub port: Option<u16>,
    pub collector: Option<String>,
}

pub async fn run(options: Options) -> Result<(), BoxError> {
    // Initialize logging
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("simple_proxy=debug".parse()?),
        )
        .with_target(false)
        .json()
        .try_init()?;

    let config = load_config(&options)?;

    // Set up metrics
    let registry = if config.metrics.enabled {
        let registry = Registry::new();
        let metrics_addr: SocketAddr = config.metrics.address.parse()?;
        let metrics_listener = TcpListener::bind(metrics_addr).await?;
        info!("Serving metrics on {}", metrics_addr);
        tokio::spawn(serve_metrics(metrics_listener, registry.clone()));
        Some(registry)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => info!("Received {}", name),
            Err(e) => error!("Failed to install signal handlers: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    run_proxy(config, registry, shutdown_rx).await
}

/// Reads the config file when one is given and applies command line
/// overrides on top.
pub fn load_config(options: &Options) -> Result<Config, BoxError> {
    let mut config = match &options.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(port) = options.port {
        config.set_listen_port(port)?;
    }
    if let Some(collector) = &options.collector {
        config.tracing = Some(Tracing {
            collector: collector.clone(),
        });
    }

    config.validate()?;
    Ok(config)
}

/// Serves the Prometheus text exposition of `registry` on every request.
pub async fn serve_metrics(listener: TcpListener, registry: Registry) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                debug!("Metrics accept error: {}", e);
                continue;
            }
        };
        let registry = registry.clone();
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |_req: Request<hyper::body::Incoming>| {
                let registry = registry.clone();
                async move {
                    let encoder = TextEncoder::new();
                    let metric_families = registry.gather();
                    let mut buffer = vec![];
                    encoder
                        .encode(&metric_families, &mut buffer)
                        .map_err(|e| format!("Metrics encoding error: {}", e))?;
                    let mut response = Response::new(Full::new(bytes::Bytes::from(buffer)));
                    if let Ok(value) = encoder.format_type().parse() {
                        response.headers_mut().insert(CONTENT_TYPE, value);
                    }
                    Ok::<_, String>(response)
                }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server error: {}", err);
            }
        });
    }
}

/// Resolves once SIGINT or SIGTERM arrives, returning the signal name.
#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}
