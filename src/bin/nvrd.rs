//! The `nvrd` binary: loads configuration, wires the path manager to the
//! RTSP server and the HLS HTTP server, spawns one `MonitorPipelineSet`
//! per enabled monitor, and runs until SIGINT/SIGTERM.
//!
//! Parses CLI args, builds config, spawns one task per listener, joins
//! all of them and logs anything that returns an error. There are exactly
//! two listeners (RTSP, HLS HTTP) since this crate has one ingress
//! transport and one egress HTTP surface; each monitor gets its own
//! watchdog, which subscribes to real segment activity instead of polling
//! on a fixed interval.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nvrd::config::Config;
use nvrd::hooks::NullHooks;
use nvrd::monitor::MonitorPipelineSet;
use nvrd::path::PathManager;
use nvrd::rtsp::RtspServer;

#[derive(Parser, Debug)]
#[command(name = "nvrd", about = "Network video recorder media plane daemon")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Overrides `recordings_dir` from the config file.
    #[arg(long)]
    recordings_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::load(&args.config, args.recordings_dir).context("loading configuration")?);

    std::fs::create_dir_all(&config.recordings_dir)
        .with_context(|| format!("creating recordings dir {}", config.recordings_dir.display()))?;
    std::fs::create_dir_all(&config.hls_dir)
        .with_context(|| format!("creating hls dir {}", config.hls_dir.display()))?;

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(
        nvrd::metrics::GlobalMetrics::new(&registry).context("registering prometheus metrics")?,
    );

    // Authentication and recording-finalized notification are the
    // embedder's call; the standalone daemon runs with no-op hooks,
    // accepting every session and doing nothing extra once a recording
    // lands.
    let hooks = Arc::new(NullHooks);

    let paths = Arc::new(
        PathManager::new(config.recordings_dir.clone(), config.hls_dir.clone(), hooks.clone())
            .with_metrics(metrics)
            .with_hls_config(config.hls.clone()),
    );

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    tasks.push(spawn_rtsp_server(config.clone(), paths.clone(), hooks.clone(), shutdown.clone()));
    tasks.push(spawn_hls_http_server(config.clone(), paths.clone(), registry, shutdown.clone())?);

    let mut pipelines = Vec::new();
    for monitor in &config.monitors {
        if !monitor.enable {
            continue;
        }
        let set = Arc::new(MonitorPipelineSet::new(
            config.transcoder_path.clone(),
            config.rtsp.listen.clone(),
            monitor.clone(),
            paths.clone(),
        ));
        set.start().await;
        info!(monitor = %monitor.id, "monitor pipeline started");
        pipelines.push(set);
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    shutdown.cancel();

    for set in &pipelines {
        set.stop().await;
    }
    for task in tasks {
        if let Err(e) = task.await {
            error!("task panicked: {}", e);
        }
    }

    info!("nvrd shut down cleanly");
    Ok(())
}

fn spawn_rtsp_server(
    config: Arc<Config>,
    paths: Arc<PathManager>,
    hooks: Arc<NullHooks>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let server = RtspServer::new(config, paths, hooks);
        if let Err(e) = server.run(shutdown).await {
            error!("rtsp server exited: {}", e);
        }
    })
}

#[cfg(feature = "egress-hls")]
fn spawn_hls_http_server(
    config: Arc<Config>,
    paths: Arc<PathManager>,
    registry: prometheus::Registry,
    shutdown: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    use hyper::server::conn::http1;
    use hyper_util::rt::TokioIo;
    use nvrd::mux::hls::http::HlsHttpServer;
    use tokio::net::TcpListener;

    let addr = config.http.listen.clone();
    Ok(tokio::spawn(async move {
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("failed to bind hls http listener to {}: {}", addr, e);
                return;
            }
        };
        info!(%addr, "hls http server listening");
        let service = HlsHttpServer::new(config.hls_dir.clone())
            .with_metrics(registry)
            .with_path_manager(paths);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("hls http server shutting down");
                    return;
                }
                accepted = listener.accept() => {
                    let (socket, _peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("hls http accept failed: {}", e);
                            continue;
                        }
                    };
                    let service = service.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(socket);
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            tracing::debug!("hls http connection error: {}", e);
                        }
                    });
                }
            }
        }
    }))
}

#[cfg(not(feature = "egress-hls"))]
fn spawn_hls_http_server(
    _config: Arc<Config>,
    _paths: Arc<PathManager>,
    _registry: prometheus::Registry,
    _shutdown: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    Ok(tokio::spawn(async {}))
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
