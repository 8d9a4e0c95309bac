use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use studygate::api::{self, AppState};
use studygate::auth::TokenVerifier;
use studygate::config::{GatewayConfig, SessionCacheMode, TlsMode, LOCK_GC_INTERVAL_SECS};
use studygate::crypto::CryptoEngine;
use studygate::file_store::FileStore;
use studygate::gateway::DocumentGateway;
use studygate::persistence::{self, DocumentStore, PersistenceManager};
use studygate::queue::UserQueues;
use studygate::ratelimit::RateLimiter;
use studygate::upstream::UpstreamClient;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const RATE_LIMIT_PURGE_SECS: u64 = 60;

#[derive(Parser, Debug)]
#[command(name = "studygate")]
#[command(about = "StudyGate - per-user sequential gateway to the study AI service")]
struct Args {
    /// Server port
    #[arg(short, long, default_value = "8000")]
    port: u16,

    /// Optional TOML config file (upstream pool, retry, rate limits)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory for uploads and metadata snapshots
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// AI service base URL (falls back to AI_SERVICE_URL, then the config file)
    #[arg(short, long)]
    upstream_url: Option<String>,

    /// Upstream TLS verification
    #[arg(long, value_enum)]
    tls_mode: Option<TlsMode>,

    /// Reuse upstream sessions across AI calls on the same document
    #[arg(long, value_enum)]
    session_cache: Option<SessionCacheMode>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Snapshot interval in seconds
    #[arg(short, long, default_value = "60")]
    snapshot_interval: u64,
}

fn load_config(args: &Args) -> Result<GatewayConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };

    if let Some(url) = args
        .upstream_url
        .clone()
        .or_else(|| std::env::var("AI_SERVICE_URL").ok())
    {
        config.upstream.base_url = url;
    }
    if let Some(mode) = args.tls_mode {
        config.upstream.tls_mode = mode;
    }
    if let Some(mode) = args.session_cache {
        config.session_cache = mode;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _log_guard = match &args.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "studygate.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_env_filter(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    };

    let config = load_config(&args)?;

    info!("🚀 StudyGate - AI request gateway");
    info!("📁 Data directory: {:?}", args.data_dir);
    info!("⏱️  Snapshot interval: {}s", args.snapshot_interval);
    info!("🤖 AI service: {} (tls: {:?})", config.upstream.base_url, config.upstream.tls_mode);
    info!("🗂️  Session cache: {:?}", config.session_cache);
    if !config.rate_limits.enabled {
        warn!("⚠️  Rate limiting disabled");
    }

    // Metadata store
    let persistence = PersistenceManager::new(&args.data_dir, args.snapshot_interval);
    let store = Arc::new(persistence.load_store()?);
    info!("✅ Loaded {} document records", store.len());
    let snapshot_handle = persistence.start_background_snapshots(store.clone());

    // File store
    let files = Arc::new(
        FileStore::with_max_file_size(args.data_dir.join("uploads"), config.max_upload_bytes()).await?,
    );
    let lock_gc_handle = files
        .clone()
        .start_lock_gc(Duration::from_secs(LOCK_GC_INTERVAL_SECS));

    // Upstream, queue, gateway
    let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);
    let queue = Arc::new(UserQueues::new());
    let gateway = DocumentGateway::new(
        store.clone() as Arc<dyn DocumentStore>,
        files,
        upstream,
        queue.clone(),
    )
    .with_session_cache(config.session_cache);

    // Auth and rate limiting
    let verifier = Arc::new(TokenVerifier::new(CryptoEngine::from_env()));
    let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
    let purge_handle = limiter
        .clone()
        .start_purge(Duration::from_secs(RATE_LIMIT_PURGE_SECS));

    // Build the router
    let app = Router::new()
        .merge(api::routes(AppState {
            gateway: Arc::new(gateway),
            verifier,
            limiter,
        }))
        .layer(CorsLayer::permissive());

    // Start the server
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("🌐 Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(persistence::shutdown_signal())
        .await?;

    // Drain in-flight AI work before the final snapshot
    queue.shutdown().await;
    snapshot_handle.abort();
    lock_gc_handle.abort();
    purge_handle.abort();

    info!("Saving final snapshot before shutdown...");
    if let Err(e) = persistence.save_state(&store) {
        error!("Failed to save final snapshot: {}", e);
    } else {
        info!("Final snapshot saved successfully");
    }

    Ok(())
}
