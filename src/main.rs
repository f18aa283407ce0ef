//! tiercached - Tiered TTL Cache Daemon
//!
//! Runs the cache engine with its analysis and metrics loops, logs alerts,
//! and optionally serves Prometheus metrics and health over HTTP.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        tiercached                          │
//! ├───────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌─────────────┐  │
//! │  │  Analysis    │    │   Metrics    │    │ HTTP        │  │
//! │  │  loop        │    │   loop       │───▶│ /metrics    │  │
//! │  │              │    │              │    │ /healthz    │  │
//! │  └──────────────┘    └──────────────┘    └─────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::monitoring::LoggingAlertHandler;
use tiercache::{CacheEngine, EngineConfig, InMemoryBackingStore};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercached - Tiered TTL cache with adaptive expiration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Redis URL of the backing store (in-memory store when omitted)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Metrics and health server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting tiercached");

    let config = match &args.config {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    info!(
        "  Analysis interval: {}s",
        config.analysis_interval.as_secs()
    );
    info!("  Metrics interval: {}s", config.collector.interval.as_secs());
    info!("  Memory limit: {}MB", config.memory.max_memory_mb);

    let engine = Arc::new(build_engine(args.redis_url.as_deref(), config).await?);
    engine
        .alerts()
        .register_handler_for_all(Arc::new(LoggingAlertHandler));
    engine.start()?;

    if let Some(addr) = args.metrics_addr.clone() {
        let server_engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = run_http_server(&addr, server_engine).await {
                error!("HTTP server error: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    engine.shutdown().await;
    info!("tiercached shutdown complete");
    Ok(())
}

async fn build_engine(redis_url: Option<&str>, config: EngineConfig) -> anyhow::Result<CacheEngine> {
    match redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let engine = CacheEngine::connect_redis(url, config)
                .await
                .with_context(|| format!("connecting to backing store at {}", url))?;
            info!("Connected to Redis backing store");
            Ok(engine)
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!("--redis-url given but the redis feature is disabled"),
        None => {
            warn!("No Redis URL given, using the in-memory backing store");
            Ok(CacheEngine::new(Arc::new(InMemoryBackingStore::new()), config)?)
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("redis=info".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// HTTP Server
// =============================================================================

async fn run_http_server(addr: &str, engine: Arc<CacheEngine>) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
    }

    async fn handle(
        req: Request<hyper::body::Incoming>,
        engine: Arc<CacheEngine>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                let snapshot = match engine.metrics() {
                    Some(data) => Ok(data),
                    None => engine.collect_metrics().await,
                };
                match snapshot.and_then(|data| data.to_prometheus()) {
                    Ok(text) => respond(StatusCode::OK, "text/plain; version=0.0.4", text),
                    Err(e) => respond(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "text/plain",
                        e.to_string(),
                    ),
                }
            }
            "/healthz" => {
                let health = engine.health().await;
                let status = if health.status.is_operational() {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                match serde_json::to_vec(&health) {
                    Ok(body) => respond(status, "application/json", body),
                    Err(e) => respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        e.to_string(),
                    ),
                }
            }
            _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics address {}", addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding metrics server to {}", addr))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("metrics server accept")?;
        let io = TokioIo::new(stream);
        let engine = engine.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, engine.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("HTTP connection error: {}", e);
            }
        });
    }
}
