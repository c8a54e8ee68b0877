//! fngate server - main entry point.
//!
//! Wires the watch source, the reconciler, the invocation bridge and the
//! HTTP gateway together, then serves until SIGINT/SIGTERM.

use clap::Parser;
use fngate::bridge::{Bridge, HttpSubstrate, RpcBus, RpcSubstrate};
use fngate::reconcile::Reconciler;
use fngate::session::{self, GatewayState};
use fngate::watch::{spawn_pump, ManifestSource, MemoryCache};
use fngate::{Config, Error};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "fngate-server", version, about = "Start the fngate MCP gateway.")]
struct Cli {
    /// Listen address.
    #[arg(long, env = "FNGATE_ADDR")]
    addr: Option<String>,

    /// Namespace scope to watch; empty watches every namespace.
    #[arg(short = 'n', long, env = "FNGATE_NAMESPACE")]
    namespace: Option<String>,

    /// Resource manifest (credentials, declarations, functions).
    #[arg(long, env = "FNGATE_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Base URL of the HTTP function gateway. Without it calls go to the in-process bus.
    #[arg(long, env = "FNGATE_BACKEND_URL")]
    backend_url: Option<String>,

    /// JSON config file; flags override its values.
    #[arg(long, env = "FNGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Manifest resync period, e.g. `30s`.
    #[arg(long, env = "FNGATE_RESYNC", value_parser = humantime_parse)]
    resync: Option<Duration>,

    /// Log format: `json` or `compact`.
    #[arg(long, env = "FNGATE_LOG_FORMAT", default_value = "compact")]
    log_format: String,
}

fn humantime_parse(raw: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(raw).map_err(|e| e.to_string())
}

impl Cli {
    fn into_config(self) -> fngate::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)?,
            None => Config::default(),
        };
        if let Some(addr) = self.addr {
            config.server.listen_addr = addr;
        }
        if let Some(namespace) = self.namespace {
            config.server.namespace = namespace;
        }
        if self.manifest.is_some() {
            config.watch.manifest = self.manifest;
        }
        if self.backend_url.is_some() {
            config.backend.base_url = self.backend_url;
        }
        if let Some(resync) = self.resync {
            config.watch.resync_period = resync;
        }
        if self.log_format.eq_ignore_ascii_case("json") {
            config.observability.json_logs = true;
        }
        config.validate()?;
        Ok(config)
    }
}

fn process_identity() -> fngate::Result<String> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return Ok(name);
        }
    }
    let name = std::fs::read_to_string("/etc/hostname")?;
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::internal("cannot determine hostname"));
    }
    Ok(name.to_string())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("ctrl-c handler error: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("SIGTERM handler error: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received signal \"interrupt\", exiting..."),
        _ = terminate => tracing::info!("Received signal \"terminated\", exiting..."),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let json_logs = cli.log_format.eq_ignore_ascii_case("json")
        || fngate::observability::json_requested_by_env();
    fngate::observability::init_tracing(json_logs);

    let config = cli.into_config()?;
    let identity = process_identity()?;
    tracing::info!(
        "fngate {} starting as {} (namespace={:?})",
        env!("CARGO_PKG_VERSION"),
        identity,
        config.server.namespace
    );

    let shutdown = CancellationToken::new();
    let cache = Arc::new(MemoryCache::new(config.server.namespace.clone()));
    let reconciler = Arc::new(Reconciler::new(cache.clone(), &shutdown));
    let (sink, lanes) = spawn_pump(reconciler.clone(), shutdown.clone());

    let substrate: Arc<dyn RpcSubstrate> = match &config.backend.base_url {
        Some(url) => {
            tracing::info!("backend substrate: http {}", url);
            Arc::new(HttpSubstrate::new(url, &identity)?)
        }
        None => {
            tracing::warn!("no backend url configured, calls go to the in-process bus");
            Arc::new(RpcBus::new())
        }
    };
    let bridge = Arc::new(Bridge::new(substrate, cache.clone(), config.bridge.clone()));

    let mut background = Vec::new();
    match &config.watch.manifest {
        Some(path) => {
            let source = ManifestSource::new(
                path.clone(),
                cache.clone(),
                sink,
                config.watch.resync_period,
            );
            let delivered = source.sync_once()?;
            tracing::info!("success sync manifest cache ({} events)", delivered);
            background.push(tokio::spawn(source.run(shutdown.clone())));
        }
        None => {
            tracing::warn!("no manifest configured, serving an empty routing table");
            drop(sink);
        }
    }

    let listener = TcpListener::bind(&config.server.listen_addr).await?;
    let state = GatewayState {
        routes: reconciler.routes(),
        bridge,
        session: config.session.clone(),
    };
    let server = tokio::spawn(session::serve(listener, state, shutdown.clone()));

    shutdown_signal().await;
    shutdown.cancel();

    server.await??;
    for task in lanes.into_iter().chain(background) {
        let _ = task.await;
    }
    Ok(())
}
