//! Component F: the path manager. One `Path` per monitor id, owning the
//! single-publisher invariant, the publisher's video/audio tracks
//! (component D, the stream bus), the HLS muxer, and the recorder, and
//! bridging samples from the tracks' broadcast channels to both.
//!
//! A single point that is asked "can this session publish" and "who is
//! allowed to read this path", implemented as a concrete `PathManager`
//! since this crate has exactly one owner implementation rather than a
//! pluggable set of backends.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::track::{AudioTrack, VideoTrack};
use crate::codec::aac::AudioSpecificConfig;
use crate::codec::h264::AvcParameters;
use crate::codec::Sample;
use crate::config::MonitorConfig;
use crate::error::{CoreError, CoreResult};
use crate::hooks::CoreHooks;
use crate::mux::hls::HlsMuxer;
use crate::recorder::Recorder;

/// A live publisher's exclusive handle to push samples. Dropping it clears
/// the path's publisher slot (unless a newer publisher already preempted
/// it) so the next ANNOUNCE can take it over.
pub struct PublisherGuard {
    path: Arc<Path>,
    generation: u64,
    cancel: CancellationToken,
}

impl PublisherGuard {
    pub fn video(&self) -> Arc<Mutex<VideoTrack>> {
        self.path.video.clone()
    }

    pub fn audio(&self) -> Arc<Mutex<Option<AudioTrack>>> {
        self.path.audio.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// True once a newer publisher has preempted this one; the RTSP
    /// session loop should check this (or race it against the
    /// cancellation token) and tear down.
    pub fn is_current(&self) -> bool {
        self.path.generation.load(std::sync::atomic::Ordering::SeqCst) == self.generation
    }
}

impl Drop for PublisherGuard {
    fn drop(&mut self) {
        // Only free the slot if nobody has reserved or preempted it since;
        // a preempting ANNOUNCE already owns the generation counter and
        // must not have its reservation clobbered by the old publisher's
        // teardown racing behind it.
        let _ = self.path.generation.compare_exchange(
            self.generation,
            0,
            std::sync::atomic::Ordering::SeqCst,
            std::sync::atomic::Ordering::SeqCst,
        );
    }
}

/// Reserves a path for a publisher between ANNOUNCE and RECORD. Handed
/// back to `PathManager::publish` to prove the reservation is still
/// current; a preempting ANNOUNCE in between makes that call fail with
/// `PublisherNotAssigned` instead of silently taking over.
pub struct AnnounceToken {
    path: Arc<Path>,
    generation: u64,
}

pub struct Path {
    pub name: String,
    video: Arc<Mutex<VideoTrack>>,
    audio: Arc<Mutex<Option<AudioTrack>>>,
    generation: std::sync::atomic::AtomicU64,
    cancel: Mutex<CancellationToken>,
    bridge: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// The current publisher generation's HLS live state (segment/part
    /// position plus its finalized-notifier), used by the monitor
    /// supervisor's watchdog (component H) and by the HLS HTTP server's
    /// blocking-playlist-request support. `None` until a publisher has
    /// connected at least once; replaced on every reconnect since each one
    /// gets a fresh `HlsMuxer`.
    hls_live: Mutex<Option<Arc<crate::mux::hls::HlsLiveState>>>,
    /// The current publisher generation's bound on a blocking playlist
    /// request's wait (three segment durations), alongside `hls_live`.
    hls_blocking_timeout: Mutex<Option<std::time::Duration>>,
}

impl Path {
    fn new(video_clock_rate: u32) -> Self {
        Self {
            name: String::new(),
            video: Arc::new(Mutex::new(VideoTrack::new(video_clock_rate, None))),
            audio: Arc::new(Mutex::new(None)),
            hls_live: Mutex::new(None),
            hls_blocking_timeout: Mutex::new(None),
            generation: std::sync::atomic::AtomicU64::new(0),
            cancel: Mutex::new(CancellationToken::new()),
            bridge: Mutex::new(None),
        }
    }
}

pub struct PathManager {
    recordings_dir: std::path::PathBuf,
    hls_dir: std::path::PathBuf,
    hooks: Arc<dyn CoreHooks>,
    metrics: Option<Arc<crate::metrics::GlobalMetrics>>,
    hls_config: crate::config::HlsConfig,
    paths: Mutex<HashMap<String, Arc<Path>>>,
}

impl PathManager {
    pub fn new(recordings_dir: std::path::PathBuf, hls_dir: std::path::PathBuf, hooks: Arc<dyn CoreHooks>) -> Self {
        Self {
            recordings_dir,
            hls_dir,
            hooks,
            metrics: None,
            hls_config: crate::config::HlsConfig::default(),
            paths: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches process-wide Prometheus counters; without this, segment
    /// and recording accounting simply isn't exported (the rest of the
    /// crate works the same either way).
    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::GlobalMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Overrides the LL-HLS segment/part cadence and retention window used
    /// by every path's muxer; without this, the spec's defaults (1s
    /// segment target, 7-segment window) apply.
    pub fn with_hls_config(mut self, hls_config: crate::config::HlsConfig) -> Self {
        self.hls_config = hls_config;
        self
    }

    async fn get_or_create(&self, monitor_id: &str, video_clock_rate: u32) -> Arc<Path> {
        let mut paths = self.paths.lock().await;
        if let Some(p) = paths.get(monitor_id) {
            return p.clone();
        }
        let mut path = Path::new(video_clock_rate);
        path.name = monitor_id.to_string();
        let path = Arc::new(path);
        paths.insert(monitor_id.to_string(), path.clone());
        path
    }

    /// Reserves `monitor_id` for a publisher at ANNOUNCE time. A prior
    /// publisher, if any, is preempted unless `disable_publisher_override`
    /// is set on the monitor, in which case an already-reserved or live
    /// path rejects the ANNOUNCE with `PublisherAlreadyAssigned`.
    pub async fn announce(&self, monitor_cfg: &MonitorConfig, video_clock_rate: u32) -> CoreResult<AnnounceToken> {
        let path = self.get_or_create(&monitor_cfg.id, video_clock_rate).await;

        let mut cancel = path.cancel.lock().await;
        let occupied = path.generation.load(std::sync::atomic::Ordering::SeqCst) != 0;
        if monitor_cfg.disable_publisher_override && occupied {
            return Err(CoreError::PublisherAlreadyAssigned(monitor_cfg.id.clone()));
        }

        let generation = path
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let fresh_cancel = CancellationToken::new();
        cancel.cancel();
        *cancel = fresh_cancel;
        drop(cancel);

        if let Some(handle) = path.bridge.lock().await.take() {
            handle.abort();
        }

        info!(monitor = %monitor_cfg.id, generation, "publisher announced");
        Ok(AnnounceToken { path, generation })
    }

    /// Activates a reservation made by `announce` at RECORD time. Fails
    /// with `PublisherNotAssigned` if a newer ANNOUNCE has since preempted
    /// this one, matching the common "DisablePublisherOverride=false"
    /// scenario where the second ANNOUNCE wins and the first session's
    /// RECORD discovers it no longer owns the path.
    pub async fn publish(
        &self,
        monitor_cfg: &MonitorConfig,
        token: AnnounceToken,
        avc_params: AvcParameters,
        aac: Option<(AudioSpecificConfig, bytes::Bytes)>,
        video_clock_rate: u32,
        audio_clock_rate: u32,
    ) -> CoreResult<PublisherGuard> {
        let path = token.path;
        if path.generation.load(std::sync::atomic::Ordering::SeqCst) != token.generation {
            return Err(CoreError::PublisherNotAssigned(monitor_cfg.id.clone()));
        }

        *path.video.lock().await = VideoTrack::new(video_clock_rate, Some(avc_params.clone()));
        *path.audio.lock().await = aac.as_ref().map(|(cfg, raw)| AudioTrack::new(*cfg, raw.clone(), audio_clock_rate));

        self.start_bridge(&path, monitor_cfg, avc_params, aac).await?;

        let cancel = path.cancel.lock().await.clone();
        info!(monitor = %monitor_cfg.id, generation = token.generation, "publisher connected");
        Ok(PublisherGuard {
            path,
            generation: token.generation,
            cancel,
        })
    }

    async fn start_bridge(
        &self,
        path: &Arc<Path>,
        monitor_cfg: &MonitorConfig,
        avc_params: AvcParameters,
        aac: Option<(AudioSpecificConfig, bytes::Bytes)>,
    ) -> CoreResult<()> {
        let video_rx = path.video.lock().await.subscribe();
        let audio_rx = {
            let guard = path.audio.lock().await;
            guard.as_ref().map(|a| a.subscribe())
        };

        let hls_out = self.hls_dir.join(&monitor_cfg.id);
        let video_timescale = 90_000;
        let audio_timescale = aac.as_ref().map(|(c, _)| c.sampling_frequency).unwrap_or(0);
        let muxer = HlsMuxer::new(
            hls_out,
            self.hls_config.segment_target_secs,
            true,
            video_timescale,
            avc_params.clone(),
            aac.clone(),
            self.hls_config.window_size,
            self.metrics.clone(),
        )
        .map_err(|e| CoreError::Protocol(format!("failed to open hls muxer: {e}")))?;
        *path.hls_live.lock().await = Some(muxer.live_state());
        *path.hls_blocking_timeout.lock().await = Some(muxer.blocking_request_timeout());

        let recorder = Recorder::new(
            monitor_cfg.id.clone(),
            self.recordings_dir.clone(),
            monitor_cfg.always_record,
            monitor_cfg.video_length_secs,
            monitor_cfg.timestamp_offset_ms,
            video_timescale,
            audio_timescale,
            avc_params.avc_decoder_configuration_record(),
            aac.as_ref().map(|(_, raw)| raw.clone()),
            self.hooks.clone(),
        );

        let handle = tokio::spawn(bridge_loop(
            monitor_cfg.id.clone(),
            muxer,
            recorder,
            video_rx,
            audio_rx,
            self.metrics.clone(),
        ));
        *path.bridge.lock().await = Some(handle);
        Ok(())
    }

    /// Current HLS live state for a monitor, once a publisher has
    /// connected (`None` before then). Used by the monitor supervisor's
    /// watchdog and by the HLS HTTP server's blocking-playlist-request
    /// support; since each reconnect gets a fresh `HlsMuxer`, callers that
    /// hold on to this across a restart should re-fetch it rather than
    /// caching it.
    pub async fn hls_live(&self, monitor_id: &str) -> Option<Arc<crate::mux::hls::HlsLiveState>> {
        let paths = self.paths.lock().await;
        let path = paths.get(monitor_id)?;
        path.hls_live.lock().await.clone()
    }

    /// The bound on how long a blocking `_HLS_msn`/`_HLS_part` playlist
    /// request for this monitor may wait before it's answered with 503.
    /// `None` before the first publisher connects.
    pub async fn hls_blocking_timeout(&self, monitor_id: &str) -> Option<std::time::Duration> {
        let paths = self.paths.lock().await;
        let path = paths.get(monitor_id)?;
        *path.hls_blocking_timeout.lock().await
    }

    /// Ensures a path entry exists for `monitor_id` (without a publisher)
    /// so callers like the watchdog can poll `hls_live` before the first
    /// ANNOUNCE/RECORD arrives.
    pub async fn ensure_path(&self, monitor_id: &str, video_clock_rate: u32) {
        self.get_or_create(monitor_id, video_clock_rate).await;
    }

    pub async fn subscribe_video(&self, monitor_id: &str) -> Option<broadcast::Receiver<Sample>> {
        let paths = self.paths.lock().await;
        let path = paths.get(monitor_id)?;
        Some(path.video.lock().await.subscribe())
    }

    pub async fn subscribe_audio(&self, monitor_id: &str) -> Option<broadcast::Receiver<Sample>> {
        let paths = self.paths.lock().await;
        let path = paths.get(monitor_id)?;
        let guard = path.audio.lock().await;
        guard.as_ref().map(|a| a.subscribe())
    }

    /// Current parameter sets for a path, for building a DESCRIBE response.
    /// `None` until a publisher has sent at least one access unit with an
    /// SPS/PPS to derive `AvcParameters` from.
    pub async fn describe(&self, monitor_id: &str) -> Option<(AvcParameters, Option<(AudioSpecificConfig, bytes::Bytes)>)> {
        let paths = self.paths.lock().await;
        let path = paths.get(monitor_id)?;
        let avc = path.video.lock().await.current_params()?;
        let aac = {
            let guard = path.audio.lock().await;
            guard.as_ref().map(|a| (a.config(), a.raw_config()))
        };
        Some((avc, aac))
    }
}

async fn bridge_loop(
    monitor_id: String,
    mut muxer: HlsMuxer,
    mut recorder: Recorder,
    mut video_rx: broadcast::Receiver<Sample>,
    mut audio_rx: Option<broadcast::Receiver<Sample>>,
    metrics: Option<Arc<crate::metrics::GlobalMetrics>>,
) {
    // The recorder is fed from the muxer's own finalized-segment stream
    // rather than these raw taps directly, so it only ever sees samples
    // that actually survived the muxer's ingestion (including anything a
    // back-pressure resync dropped), and the two never disagree about
    // what was recorded.
    let mut segment_rx = muxer.subscribe_segment_finalized();
    loop {
        tokio::select! {
            v = video_rx.recv() => {
                match v {
                    Ok(sample) => {
                        match muxer.push_video_sample(sample) {
                            Ok(Some(_finalized)) => {
                                if let Some(m) = &metrics {
                                    m.segments_finalized.with_label_values(&[&monitor_id]).inc();
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!("hls muxer failed on video sample: {}", e),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("video bridge lagged, dropped {} samples", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            a = recv_audio(&mut audio_rx) => {
                match a {
                    Some(Ok(sample)) => {
                        muxer.push_audio_sample(sample);
                    }
                    Some(Err(broadcast::error::RecvError::Lagged(n))) => {
                        warn!("audio bridge lagged, dropped {} samples", n);
                    }
                    Some(Err(broadcast::error::RecvError::Closed)) | None => {}
                }
            }
            seg = segment_rx.recv() => {
                match seg {
                    Ok(finalized) => {
                        for sample in &finalized.video {
                            let was_recording = recorder.is_recording();
                            if let Err(e) = recorder.push_video_sample(sample).await {
                                warn!("recorder failed on video sample: {}", e);
                            }
                            if let Some(m) = &metrics {
                                if recorder.is_recording() != was_recording {
                                    m.active_recordings.add(if recorder.is_recording() { 1 } else { -1 });
                                }
                            }
                        }
                        for sample in &finalized.audio {
                            if let Err(e) = recorder.push_audio_sample(sample) {
                                warn!("recorder failed on audio sample: {}", e);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("recorder lagged behind finalized hls segments, dropped {} segments", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                }
            }
        }
    }
}

async fn recv_audio(
    rx: &mut Option<broadcast::Receiver<Sample>>,
) -> Option<std::result::Result<Sample, broadcast::error::RecvError>> {
    match rx {
        Some(r) => Some(r.recv().await),
        None => std::future::pending().await,
    }
}
