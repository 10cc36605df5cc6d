//! Symbol Mapping Cache Service
//!
//! Serves the three-tier symbol mapping cache over a YAML rule directory,
//! with health and Prometheus endpoints, or resolves a single batch from the
//! command line.
//!
//! ```text
//! symbol-cache [serve]                       run until Ctrl-C
//! symbol-cache map --provider acme AAA BBB   print one mapping result
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use symbol_cache::adapters::{
    LoggingEventPublisher, ProcMemoryProbe, TradingHoursSessionSource, YamlRuleStore,
};
use symbol_cache::domain::{ChangeFeed, Direction, MemoryProbe, ProviderId};
use symbol_cache::error::{Error, Result};
use symbol_cache::{MapOptions, Settings, SymbolMappingCache};

/// Interval of the expired-entry sweep
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// CLI Arguments
// =============================================================================

/// Symbol mapping cache - provider/standard symbol translation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the cache service (default)
    Serve,

    /// Resolve one batch and print the result as JSON
    Map {
        /// Provider identifier
        #[arg(long)]
        provider: String,

        /// to-standard or from-standard
        #[arg(long, default_value = "to-standard")]
        direction: Direction,

        /// Skip the cache layers
        #[arg(long)]
        force_refresh: bool,

        /// Symbols to map
        #[arg(required = true)]
        symbols: Vec<String>,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.settings);

    let engine = build_engine(&cli.settings)?;

    match cli.command {
        None | Some(Command::Serve) => serve(&cli.settings, engine).await,
        Some(Command::Map {
            provider,
            direction,
            force_refresh,
            symbols,
        }) => {
            let options = MapOptions { force_refresh };
            let result = engine
                .map_symbols(&ProviderId::from(provider), direction, symbols.as_slice(), options)
                .await?;
            let json = serde_json::to_string_pretty(&result)
                .map_err(|e| Error::Internal(format!("Failed to encode result: {}", e)))?;
            println!("{}", json);
            Ok(())
        }
    }
}

fn build_engine(settings: &Settings) -> Result<Arc<SymbolMappingCache>> {
    let config = settings.engine_config()?;
    let store = Arc::new(YamlRuleStore::new(
        settings.rules_dir.clone(),
        settings.rules_poll_interval(),
    ));
    let sessions = Arc::new(TradingHoursSessionSource::new(settings.trading_hours()?));

    SymbolMappingCache::new(
        config,
        store,
        sessions,
        Arc::new(LoggingEventPublisher::info_level()),
    )
}

async fn serve(settings: &Settings, engine: Arc<SymbolMappingCache>) -> Result<()> {
    info!("Starting symbol mapping cache");
    info!("  Rules directory: {}", settings.rules_dir.display());
    info!("  Cache enabled: {}", settings.cache_enabled);
    info!(
        "  Memory watermarks: warning {}%, critical {}%",
        settings.memory_warning_percent, settings.memory_critical_percent
    );

    let feed: Arc<dyn ChangeFeed> = Arc::new(YamlRuleStore::new(
        settings.rules_dir.clone(),
        settings.rules_poll_interval(),
    ));
    let probe: Arc<dyn MemoryProbe> = Arc::new(ProcMemoryProbe::new(settings.memory_limit_bytes));
    engine.start_background(Some(feed), Some(probe))?;

    if let Some(bound) = engine.staleness_bound() {
        info!("  Invalidation staleness bound: {:?}", bound);
    }

    // Start health server
    let health_addr = settings.health_addr.clone();
    let health_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_engine).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = settings.metrics_addr.clone();
    let metrics_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_engine).await {
            error!("Metrics server error: {}", e);
        }
    });

    let mut purge = tokio::time::interval(PURGE_INTERVAL);
    purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = purge.tick() => {
                engine.purge_expired();
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
        }
    }

    info!("Shutdown requested");
    engine.shutdown().await;
    info!("Symbol mapping cache shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(settings: &Settings) {
    let level = match settings.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap());

    if settings.log_json {
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
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, engine: Arc<SymbolMappingCache>) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
        engine: Arc<SymbolMappingCache>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let (status, body) = match req.uri().path() {
            "/healthz" | "/livez" => {
                let check = engine.health_check().liveness_check();
                let status = if check.status.is_operational() {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                (status, serde_json::to_vec(&check).unwrap_or_default())
            }
            "/readyz" => {
                let health = engine.health();
                let status = if engine.health_check().is_ready() && health.status.is_operational()
                {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                (status, serde_json::to_vec(&health).unwrap_or_default())
            }
            _ => (StatusCode::NOT_FOUND, b"not found".to_vec()),
        };

        let response = Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap();
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid health server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let engine = Arc::clone(&engine);

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(req, Arc::clone(&engine)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

mod exporter {
    use once_cell::sync::Lazy;
    use prometheus::{register_gauge_vec, register_int_gauge, register_int_gauge_vec};
    use prometheus::{GaugeVec, IntGauge, IntGaugeVec};

    use symbol_cache::SymbolMappingCache;

    static LAYER_HITS: Lazy<IntGaugeVec> = Lazy::new(|| {
        register_int_gauge_vec!("symbol_cache_layer_hits", "Cache hits per layer", &["layer"])
            .unwrap()
    });
    static LAYER_MISSES: Lazy<IntGaugeVec> = Lazy::new(|| {
        register_int_gauge_vec!("symbol_cache_layer_misses", "Cache misses per layer", &["layer"])
            .unwrap()
    });
    static LAYER_HIT_RATIO: Lazy<GaugeVec> = Lazy::new(|| {
        register_gauge_vec!("symbol_cache_layer_hit_ratio", "Hit ratio per layer", &["layer"])
            .unwrap()
    });
    static LAYER_ENTRIES: Lazy<IntGaugeVec> = Lazy::new(|| {
        register_int_gauge_vec!("symbol_cache_layer_entries", "Entries held per layer", &["layer"])
            .unwrap()
    });
    static COUNTERS: Lazy<IntGaugeVec> = Lazy::new(|| {
        register_int_gauge_vec!("symbol_cache_events", "Engine event totals", &["event"])
            .unwrap()
    });
    static REQUEST_LATENCY_US: Lazy<IntGauge> = Lazy::new(|| {
        register_int_gauge!(
            "symbol_cache_request_latency_us",
            "Moving average of map_symbols latency in microseconds"
        )
        .unwrap()
    });

    /// Copy the engine's counters into the registered gauges
    pub fn refresh(engine: &SymbolMappingCache) {
        let m = engine.metrics();
        let stats = engine.layer_stats();

        for (layer, hits, misses, ratio, entries) in [
            ("l1", m.l1_hits, m.l1_misses, m.l1_hit_ratio, stats.l1.entries),
            ("l2", m.l2_hits, m.l2_misses, m.l2_hit_ratio, stats.l2.entries),
            ("l3", m.l3_hits, m.l3_misses, m.l3_hit_ratio, stats.l3.entries),
        ] {
            LAYER_HITS.with_label_values(&[layer]).set(hits as i64);
            LAYER_MISSES.with_label_values(&[layer]).set(misses as i64);
            LAYER_HIT_RATIO.with_label_values(&[layer]).set(ratio);
            LAYER_ENTRIES.with_label_values(&[layer]).set(entries as i64);
        }

        for (event, value) in [
            ("requests", m.requests),
            ("symbols_mapped", m.symbols_mapped),
            ("symbols_failed", m.symbols_failed),
            ("disabled_fallbacks", m.disabled_fallbacks),
            ("internal_fallbacks", m.internal_fallbacks),
            ("forced_refreshes", m.forced_refreshes),
            ("rule_loads", m.rule_loads),
            ("rule_load_failures", m.rule_load_failures),
            ("dedup_joins", m.dedup_joins),
            ("query_timeouts", m.query_timeouts),
            ("invalidations", m.invalidations),
            ("memory_cleanups", m.memory_cleanups),
            ("cleanup_failures", m.cleanup_failures),
            ("entries_shed", m.entries_shed),
        ] {
            COUNTERS.with_label_values(&[event]).set(value as i64);
        }
        REQUEST_LATENCY_US.set(m.request_latency_us as i64);
    }
}

async fn run_metrics_server(addr: &str, engine: Arc<SymbolMappingCache>) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
        engine: Arc<SymbolMappingCache>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                exporter::refresh(&engine);
                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let mut buffer = Vec::new();
                encoder.encode(&metric_families, &mut buffer).unwrap();

                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", encoder.format_type())
                    .body(Full::new(Bytes::from(buffer)))
                    .unwrap()
            }
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let engine = Arc::clone(&engine);

        tokio::spawn(async move {
            let service = service_fn(move |req| metrics_handler(req, Arc::clone(&engine)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
