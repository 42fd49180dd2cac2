//! Component H: supervises the external transcoder process for monitors
//! whose camera stream needs one (e.g. a sub-stream decoder, or a camera
//! that can't speak RTSP natively and is bridged through a helper
//! binary). Restarts the child with jittered backoff on exit, and a
//! watchdog that force-restarts it if no segment has been produced in
//! too long.
//!
//! Follows the same spawn-loop shape as the RTSP accept loop: spawn a
//! task per unit of work, log and continue past one failure instead of
//! taking the whole daemon down, applied here to "spawn and watch a child
//! process" instead of "accept a connection".

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);

/// Supervises one monitor's external transcoder subprocess.
pub struct MonitorSupervisor {
    monitor_id: String,
    transcoder_path: std::path::PathBuf,
    args: Vec<String>,
    cancel: CancellationToken,
}

impl MonitorSupervisor {
    pub fn new(
        monitor_id: String,
        transcoder_path: std::path::PathBuf,
        args: Vec<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            monitor_id,
            transcoder_path,
            args,
            cancel,
        }
    }

    /// Runs until cancelled, restarting the child process with jittered
    /// exponential backoff every time it exits (whether cleanly or not;
    /// a transcoder that exits 0 still needs to be running continuously).
    pub async fn run(&self) {
        let mut backoff = BASE_BACKOFF;

        while !self.cancel.is_cancelled() {
            match self.spawn_once().await {
                Ok(status) => {
                    info!(monitor = %self.monitor_id, ?status, "transcoder exited");
                    backoff = BASE_BACKOFF;
                }
                Err(e) => {
                    error!(monitor = %self.monitor_id, "transcoder failed: {}", e);
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }

            let jitter = rand::thread_rng().gen_range(0..250);
            let sleep = backoff + Duration::from_millis(jitter);
            warn!(monitor = %self.monitor_id, backoff_ms = sleep.as_millis() as u64, "restarting transcoder");
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = self.cancel.cancelled() => break,
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn spawn_once(&self) -> anyhow::Result<std::process::ExitStatus> {
        let mut child = Command::new(&self.transcoder_path)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stderr) = child.stderr.take() {
            let monitor_id = self.monitor_id.clone();
            tokio::spawn(log_child_stderr(monitor_id, stderr));
        }

        tokio::select! {
            status = child.wait() => Ok(status?),
            _ = self.cancel.cancelled() => {
                child.start_kill().ok();
                Ok(child.wait().await?)
            }
        }
    }
}

async fn log_child_stderr(monitor_id: String, stderr: tokio::process::ChildStderr) {
    use tokio::io::{AsyncBufReadExt, BufReader};
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(monitor = %monitor_id, "transcoder: {}", line);
    }
}

/// Watches a liveness signal (fired once per HLS segment or part close;
/// see `mux::hls::HlsMuxer::notify`) and restarts the monitor supervisor
/// if nothing has happened within `WATCHDOG_TIMEOUT`. This is why the
/// watchdog subscribes to segment-finalized activity instead of polling
/// the filesystem: a stalled camera feed produces no new segments, and
/// that absence is exactly what needs to be noticed quickly.
pub async fn run_watchdog(
    monitor_id: String,
    liveness: Arc<crate::mux::hls::HlsLiveState>,
    cancel: CancellationToken,
    on_stall: impl Fn(),
) {
    loop {
        let timed_out = tokio::select! {
            res = tokio::time::timeout(WATCHDOG_TIMEOUT, liveness.wait()) => res.is_err(),
            _ = cancel.cancelled() => return,
        };
        if timed_out {
            warn!(monitor = %monitor_id, "no segment activity in {:?}, declaring stream stalled", WATCHDOG_TIMEOUT);
            on_stall();
        }
    }
}

/// Builds the transcoder argv from a monitor's config (§6 "Monitor keys
/// recognized by the core"): input options spliced before `-i`, the
/// camera's main or sub RTSP URL, hardware acceleration and encoder
/// choices, publishing into this server's own RTSP listener as the path
/// named `<id>` (main) or `<id>_sub` (sub stream). The core never
/// transcodes the video itself; the encoder keys only matter for the
/// audio path and any container remux the external binary performs,
/// never for picture content.
pub fn build_transcoder_args(cfg: &crate::config::MonitorConfig, rtsp_listen: &str, sub_stream: bool) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(opts) = &cfg.input_options {
        args.extend(opts.split_whitespace().map(str::to_string));
    }
    if let Some(hwaccel) = &cfg.hwaccel {
        args.push("-hwaccel".to_string());
        args.push(hwaccel.clone());
    }

    let input = if sub_stream {
        cfg.sub_input.as_deref().unwrap_or(&cfg.main_input)
    } else {
        &cfg.main_input
    };
    args.push("-i".to_string());
    args.push(input.to_string());

    args.push("-c:v".to_string());
    args.push(cfg.video_encoder.clone().unwrap_or_else(|| "copy".to_string()));
    args.push("-c:a".to_string());
    args.push(cfg.audio_encoder.clone().unwrap_or_else(|| "copy".to_string()));

    let path_name = if sub_stream {
        format!("{}_sub", cfg.id)
    } else {
        cfg.id.clone()
    };
    args.push("-f".to_string());
    args.push("rtsp".to_string());
    args.push(format!("rtsp://{rtsp_listen}/{path_name}"));
    args
}

/// Orchestrates one monitor's pipeline(s): the main stream always runs,
/// the sub stream additionally if `subInputEnabled`. Each pipeline is a
/// `MonitorSupervisor` (process lifecycle) plus a watchdog that forces a
/// restart on a stalled feed. `restart()` implements §4.H's
/// `RestartMonitor(id)`: it cancels and replaces both tasks, picking up
/// whatever the config now says.
pub struct MonitorPipelineSet {
    monitor_id: String,
    transcoder_path: std::path::PathBuf,
    rtsp_listen: String,
    cfg: crate::config::MonitorConfig,
    paths: Arc<crate::path::PathManager>,
    tasks: Mutex<Vec<(CancellationToken, tokio::task::JoinHandle<()>)>>,
}

impl MonitorPipelineSet {
    pub fn new(
        transcoder_path: std::path::PathBuf,
        rtsp_listen: String,
        cfg: crate::config::MonitorConfig,
        paths: Arc<crate::path::PathManager>,
    ) -> Self {
        Self {
            monitor_id: cfg.id.clone(),
            transcoder_path,
            rtsp_listen,
            cfg,
            paths,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Starts (or restarts) the configured pipelines: always the main
    /// stream, plus the sub stream when `subInputEnabled`. This is
    /// `RestartMonitor(id)` from §4.H: a config change takes effect by
    /// calling `start()` again, which tears down whatever was running
    /// and spawns fresh.
    pub async fn start(self: &Arc<Self>) {
        self.stop().await;
        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_pipeline(false));
        if self.cfg.sub_input_enabled {
            tasks.push(self.spawn_pipeline(true));
        }
    }

    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for (cancel, handle) in tasks.drain(..) {
            cancel.cancel();
            handle.abort();
        }
    }

    /// A stalled-feed restart (from the watchdog) and an outer `stop()`
    /// both need to tear down the same running supervisor, but only the
    /// outer one should stop the pipeline for good; a stall should come
    /// back up. So the outer `CancellationToken` returned to `stop()`
    /// wraps an inner one that's recreated on every stall.
    ///
    /// The watchdog's liveness notifier is fetched fresh on every loop
    /// iteration rather than captured once: each (re)publish gets a new
    /// `HlsMuxer` with its own `Notify`, and before the very first
    /// publish there's nothing to watch yet at all.
    fn spawn_pipeline(self: &Arc<Self>, sub_stream: bool) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let outer_cancel = CancellationToken::new();
        let args = build_transcoder_args(&self.cfg, &self.rtsp_listen, sub_stream);
        let path_name = if sub_stream {
            format!("{}_sub", self.monitor_id)
        } else {
            self.monitor_id.clone()
        };
        let transcoder_path = self.transcoder_path.clone();
        let paths = self.paths.clone();

        let task_outer_cancel = outer_cancel.clone();
        let handle = tokio::spawn(async move {
            paths.ensure_path(&path_name, 90_000).await;
            loop {
                if task_outer_cancel.is_cancelled() {
                    return;
                }
                let inner_cancel = task_outer_cancel.child_token();
                let supervisor = MonitorSupervisor::new(
                    path_name.clone(),
                    transcoder_path.clone(),
                    args.clone(),
                    inner_cancel.clone(),
                );

                let liveness = wait_for_live_state(&paths, &path_name, inner_cancel.clone()).await;
                let Some(liveness) = liveness else {
                    // Cancelled while waiting for the first publish.
                    return;
                };

                let watchdog_cancel = inner_cancel.clone();
                let on_stall_cancel = inner_cancel.clone();
                tokio::join!(
                    supervisor.run(),
                    run_watchdog(path_name.clone(), liveness, watchdog_cancel, move || {
                        on_stall_cancel.cancel();
                    }),
                );
                if task_outer_cancel.is_cancelled() {
                    return;
                }
                // `inner_cancel` only ever fires from a watchdog stall (the
                // outer token is checked separately above), so looping back
                // here always means "restart after a stall", never "stop".
            }
        });
        (outer_cancel, handle)
    }
}

/// Polls `PathManager::hls_live` until a publisher's first `HlsMuxer`
/// shows up, or `cancel` fires. There's no push notification for "a path
/// was just created"; the publisher side of this same pipeline is what
/// will eventually cause one to exist, so a short poll is simpler than
/// threading a broadcast channel through `PathManager` for an event that
/// only ever needs to be observed once per reconnect.
async fn wait_for_live_state(
    paths: &crate::path::PathManager,
    monitor_id: &str,
    cancel: CancellationToken,
) -> Option<Arc<crate::mux::hls::HlsLiveState>> {
    loop {
        if let Some(n) = paths.hls_live(monitor_id).await {
            return Some(n);
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            _ = cancel.cancelled() => return None,
        }
    }
}
