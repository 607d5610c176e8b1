//! Strata Warm-Cache Daemon
//!
//! Opens the tiered cache over a directory of JSON index fragments, warms the
//! requested fragments, runs periodic maintenance and serves metrics and
//! health endpoints until interrupted.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          strata                                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ CacheManager │───▶│ Maintenance  │    │  /metrics    │       │
//! │  │ L1 / L2 / L3 │    │ (expiry,     │    │  /healthz    │       │
//! │  │              │    │  idle unload)│    │  /readyz     │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use strata::error::{Error, Result};
use strata::{CacheManager, DependencyGraph, FragmentsFile, JsonDirSource, MetricsExporter, StrataConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Strata - multi-tier cache with lazy index loading
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache configuration (YAML)
    #[arg(long, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// Fragment graph declaration (YAML)
    #[arg(long, env = "STRATA_FRAGMENTS")]
    fragments: Option<PathBuf>,

    /// Directory holding `<fragment>.json` files
    #[arg(long, env = "STRATA_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Disk tier directory (overrides the config file)
    #[arg(long, env = "STRATA_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Memory tier budget in bytes (overrides the config file)
    #[arg(long, env = "STRATA_L1_CAPACITY_BYTES")]
    l1_capacity_bytes: Option<u64>,

    /// Disk tier budget in bytes (overrides the config file)
    #[arg(long, env = "STRATA_L2_CAPACITY_BYTES")]
    l2_capacity_bytes: Option<u64>,

    /// Fragments to load at startup, comma separated
    #[arg(long, env = "STRATA_WARM", value_delimiter = ',')]
    warm: Vec<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9464")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn load_config(&self) -> Result<StrataConfig> {
        let mut config = match &self.config {
            Some(path) => StrataConfig::from_yaml_file(path)?,
            None => StrataConfig::default(),
        };
        if let Some(dir) = &self.cache_dir {
            config.l2_dir = dir.clone();
        }
        if let Some(bytes) = self.l1_capacity_bytes {
            config.l1_capacity_bytes = bytes;
        }
        if let Some(bytes) = self.l2_capacity_bytes {
            config.l2_capacity_bytes = bytes;
        }
        config.validate()?;
        Ok(config)
    }

    fn load_graph(&self) -> Result<DependencyGraph> {
        match &self.fragments {
            Some(path) => FragmentsFile::from_yaml_file(path)?.into_graph(),
            None => {
                warn!("No fragment declaration given; index tier is empty");
                DependencyGraph::new(Vec::new())
            }
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.load_config()?;
    let graph = args.load_graph()?;

    info!("Starting Strata");
    info!("  L1 capacity: {} bytes", config.l1_capacity_bytes);
    info!("  L2 directory: {}", config.l2_dir.display());
    info!("  L2 capacity: {} bytes", config.l2_capacity_bytes);
    info!("  Fragments: {}", graph.len());
    info!("  Data directory: {}", args.data_dir.display());

    let source = Arc::new(JsonDirSource::new(&args.data_dir));
    let cache = CacheManager::open(config.cache_config(), graph, source).await?;
    let maintenance = cache.spawn_maintenance(config.maintenance_interval());

    let ready = Arc::new(AtomicBool::new(false));
    let exporter = Arc::new(MetricsExporter::new(cache.clone())?);

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = Arc::clone(&ready);
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, exporter).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Warm requested fragments
    if !args.warm.is_empty() {
        let ids: Vec<&str> = args.warm.iter().map(String::as_str).collect();
        match cache.ensure_loaded(&ids).await {
            Ok(loaded) => info!(count = loaded.len(), "Warm-up complete"),
            Err(e) => error!("Warm-up failed: {}", e),
        }
    }
    ready.store(true, Ordering::Release);
    info!("Strata ready");

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");

    cache.shutdown().await?;
    if let Err(e) = maintenance.await {
        warn!("Maintenance task ended abnormally: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "h2=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

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
}

// =============================================================================
// HTTP Servers
// =============================================================================

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

async fn bind(addr: &str, what: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {} address: {}", what, e)))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {}: {}", what, e)))?;
    info!("{} listening on {}", what, addr);
    Ok(listener)
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    let listener = bind(addr, "health server").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let ready = Arc::clone(&ready);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let ready = ready.load(Ordering::Acquire);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "text/plain", "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "warming"),
                        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

async fn run_metrics_server(addr: &str, exporter: Arc<MetricsExporter>) -> Result<()> {
    let listener = bind(addr, "metrics server").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let exporter = Arc::clone(&exporter);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let exporter = Arc::clone(&exporter);
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match exporter.render() {
                            Ok((content_type, body)) => respond(StatusCode::OK, &content_type, body),
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
                        },
                        "/metrics.json" => match serde_json::to_vec(&exporter.refresh()) {
                            Ok(body) => respond(StatusCode::OK, "application/json", body),
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
                        },
                        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
