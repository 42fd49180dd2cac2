//! Component E: the RTSP server, the single network entry point for both
//! ingest (ANNOUNCE/RECORD, from an internal monitor supervisor's
//! transcoder or an external RTSP-capable camera) and egress
//! (DESCRIBE/PLAY, from any RTSP client). One task per accepted TCP
//! connection; see `session` for the per-connection state machine.
//!
//! `TcpListener::bind`, then `while let Ok((socket, addr)) =
//! listener.accept().await { spawn_pipeline(...) }`, wrapped in a
//! `CancellationToken` so the listener (and every session it has spawned)
//! drains on shutdown instead of being dropped mid-connection.

pub mod sdp;
pub mod session;
pub mod transport;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::hooks::CoreHooks;
use crate::path::PathManager;

pub struct RtspServer {
    config: Arc<Config>,
    paths: Arc<PathManager>,
    hooks: Arc<dyn CoreHooks>,
}

impl RtspServer {
    pub fn new(config: Arc<Config>, paths: Arc<PathManager>, hooks: Arc<dyn CoreHooks>) -> Self {
        Self { config, paths, hooks }
    }

    /// Runs the accept loop until `cancel` fires. Each accepted
    /// connection is handled on its own task; one session's error never
    /// takes down the listener.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.config.rtsp.listen)
            .await
            .with_context(|| format!("binding rtsp listener to {}", self.config.rtsp.listen))?;
        info!(addr = %self.config.rtsp.listen, "rtsp server listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("rtsp server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            if let Err(e) = socket.set_nodelay(true) {
                                warn!(%peer, "failed to set tcp_nodelay: {}", e);
                            }
                            let config = self.config.clone();
                            let paths = self.paths.clone();
                            let hooks = self.hooks.clone();
                            tokio::spawn(async move {
                                session::handle_connection(socket, peer, config, paths, hooks).await;
                            });
                        }
                        Err(e) => warn!("rtsp accept failed: {}", e),
                    }
                }
            }
        }
    }
}
