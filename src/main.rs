//! Volume Orchestrator
//!
//! Starts the orchestrator: store, bootstrap, self-healing loop, health and
//! metrics servers, and the REST API.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_orchestrator::domain::check_platform_version;
use volume_orchestrator::healing::{
    CryptsetupDeviceProvider, FilePassphraseSource, IscsiadmClient,
};
use volume_orchestrator::{
    ApiServer, ApiServerConfig, BackendFactory, Error, FileStore, InMemoryStore, KubeStore,
    Orchestrator, OrchestratorConfig, Result, SessionSelfHealer, StoreRef,
};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum StoreKind {
    /// Volatile, for development
    Memory,
    /// JSON files under `--store-path`
    File,
    /// Custom resources in `--namespace`
    Kubernetes,
}

/// Volume Orchestrator - volume lifecycle across storage backends
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Orchestrator configuration file (YAML)
    #[arg(long, env = "ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Persistent store backend
    #[arg(long, env = "STORE", value_enum, default_value = "kubernetes")]
    store: StoreKind,

    /// Root directory for the file store
    #[arg(long, env = "STORE_PATH", default_value = "/var/lib/vorch")]
    store_path: PathBuf,

    /// Namespace holding the orchestrator's records
    #[arg(long, env = "NAMESPACE", default_value = "vorch")]
    namespace: String,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Only heal publications on this node
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Directory holding LUKS passphrase files
    #[arg(long, env = "PASSPHRASE_DIR", default_value = "/etc/vorch/luks")]
    passphrase_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::load(path)?,
        None => OrchestratorConfig::default(),
    };
    if args.node_name.is_some() {
        config.healing.node_name = args.node_name.clone();
    }
    let config = Arc::new(config);

    info!("Starting Volume Orchestrator");
    info!("  Version: {}", volume_orchestrator::VERSION);
    info!("  Orchestrator: {}", config.orchestrator_name);
    info!("  Store: {:?}", args.store);
    info!("  REST API: {}{}", args.api_addr, config.api_base_path());
    info!("  Standalone mode: {}", args.standalone);

    if !args.standalone {
        check_kubernetes_version(&config).await?;
    }

    let store = open_store(&args, &config).await?;
    let orchestrator = Orchestrator::new(config.clone(), store, BackendFactory::new())?;

    // Health first so probes answer while bootstrap retries
    let health_addr = args.health_addr.clone();
    let probe = orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, probe).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    let scraped = orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, scraped).await {
            error!("Metrics server error: {}", e);
        }
    });

    let report = orchestrator.bootstrap().await?;
    info!(
        "Bootstrap complete after {} connect attempt(s), schema {:?}",
        report.connect_attempts, report.schema
    );

    let cancel = CancellationToken::new();
    if config.healing.enabled {
        let healer = SessionSelfHealer::new(
            config.healing.clone(),
            orchestrator.clone(),
            Arc::new(IscsiadmClient::new()),
            Arc::new(CryptsetupDeviceProvider),
            Arc::new(FilePassphraseSource::new(args.passphrase_dir.clone())),
            orchestrator.metrics().clone(),
        );
        tokio::spawn(healer.run(cancel.clone()));
    } else {
        warn!("Session self-healing disabled");
    }

    let api_config = ApiServerConfig {
        rest_addr: args.api_addr.parse().map_err(|e| {
            Error::Configuration(format!("Invalid REST API address: {}", e))
        })?,
        ..Default::default()
    };
    let api_server = Arc::new(ApiServer::new(api_config, orchestrator.clone()));

    let signalled = api_server.clone();
    let stop = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            stop.cancel();
            signalled.shutdown();
        }
    });

    api_server.run().await?;
    cancel.cancel();

    info!("Orchestrator shutdown complete");
    Ok(())
}

// =============================================================================
// Startup
// =============================================================================

async fn check_kubernetes_version(config: &OrchestratorConfig) -> Result<()> {
    let client = kube::Client::try_default().await?;
    let info = client.apiserver_version().await?;
    let version = check_platform_version(
        &info.git_version,
        &config.platform.min_version,
        &config.platform.max_version,
    )?;
    info!("Kubernetes {} is supported", version);
    Ok(())
}

async fn open_store(args: &Args, config: &OrchestratorConfig) -> Result<StoreRef> {
    let store: StoreRef = match args.store {
        StoreKind::Memory => {
            warn!("Using the in-memory store; state is lost on exit");
            Arc::new(InMemoryStore::new())
        }
        StoreKind::File => Arc::new(FileStore::with_path(args.store_path.clone()).await?),
        StoreKind::Kubernetes => {
            if args.standalone {
                return Err(Error::Configuration(
                    "the kubernetes store cannot be used in standalone mode".into(),
                ));
            }
            Arc::new(KubeStore::try_default(&args.namespace, &config.orchestrator_name).await?)
        }
    };
    Ok(store)
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
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info"] {
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
// Health Server
// =============================================================================

fn plain_response(
    status: hyper::StatusCode,
    body: impl Into<hyper::Body>,
) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, orchestrator: Arc<Orchestrator>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let orchestrator = orchestrator.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = orchestrator.is_ready();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => plain_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => plain_response(StatusCode::OK, "ok"),
                        "/readyz" => {
                            plain_response(StatusCode::SERVICE_UNAVAILABLE, "bootstrapping")
                        }
                        _ => plain_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Internal(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, orchestrator: Arc<Orchestrator>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let orchestrator = orchestrator.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let orchestrator = orchestrator.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match orchestrator.metrics().encode() {
                            Ok(text) => {
                                let mut response = plain_response(StatusCode::OK, text);
                                response.headers_mut().insert(
                                    hyper::header::CONTENT_TYPE,
                                    hyper::header::HeaderValue::from_static(
                                        "text/plain; version=0.0.4",
                                    ),
                                );
                                response
                            }
                            Err(e) => plain_response(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                e.to_string(),
                            ),
                        },
                        _ => plain_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Internal(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
