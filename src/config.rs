use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top level daemon configuration, loaded from `config.yaml` plus `NVR_`
/// prefixed environment variables, with CLI flags layered on top (see
/// `src/bin/nvrd.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where finalized recordings (`.meta`/`.mdat` pairs) are written.
    pub recordings_dir: PathBuf,

    /// Where live HLS output (segments, parts, playlists) is written.
    pub hls_dir: PathBuf,

    /// RTSP server bind configuration.
    #[serde(default)]
    pub rtsp: RtspConfig,

    /// HLS HTTP server bind configuration.
    #[serde(default)]
    pub http: HttpConfig,

    /// LL-HLS segmentation parameters shared by every monitor's muxer.
    #[serde(default)]
    pub hls: HlsConfig,

    /// Path to the external transcoder binary the monitor supervisor
    /// spawns per camera (stdin/stdout framed RTP, see the monitor module).
    pub transcoder_path: PathBuf,

    pub monitors: Vec<MonitorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtspConfig {
    pub listen: String,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

fn default_session_timeout_secs() -> u64 {
    60
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8554".to_string(),
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8888".to_string(),
        }
    }
}

/// LL-HLS segment/part cadence and retention window, shared across every
/// monitor's muxer rather than per-monitor since it's an output-format
/// concern, not a camera one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlsConfig {
    #[serde(rename = "segmentTarget", default = "default_segment_target_secs")]
    pub segment_target_secs: f64,
    #[serde(rename = "windowSize", default = "default_window_size")]
    pub window_size: usize,
}

fn default_segment_target_secs() -> f64 {
    1.0
}

fn default_window_size() -> usize {
    crate::mux::hls::variant::DEFAULT_SEGMENT_WINDOW_COUNT
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            segment_target_secs: default_segment_target_secs(),
            window_size: default_window_size(),
        }
    }
}

/// One camera's configuration. Modeled as a typed accessor layer over the
/// opaque string-keyed map described for the monitor config surface: the
/// keys the core itself dereferences are pulled out as fields, everything
/// else passes through untouched in `extra` so higher layers (a management
/// UI, a provisioning tool) can round-trip keys this crate never looks at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(rename = "mainInput")]
    pub main_input: String,
    #[serde(rename = "subInput", default)]
    pub sub_input: Option<String>,
    #[serde(rename = "subInputEnabled", default)]
    pub sub_input_enabled: bool,
    /// Extra flags spliced in before the transcoder's `-i <input>`, e.g.
    /// `-rtsp_transport tcp`.
    #[serde(rename = "inputOptions", default)]
    pub input_options: Option<String>,
    #[serde(rename = "hwaccel", default)]
    pub hwaccel: Option<String>,
    #[serde(rename = "videoEncoder", default)]
    pub video_encoder: Option<String>,
    #[serde(rename = "audioEncoder", default)]
    pub audio_encoder: Option<String>,
    #[serde(rename = "alwaysRecord", default)]
    pub always_record: bool,
    /// Minimum length of a recording in seconds once triggered, before the
    /// recorder is allowed to close it on a non-IDR boundary check.
    #[serde(rename = "videoLength", default = "default_video_length")]
    pub video_length_secs: u32,
    /// Applied to every sample timestamp written into the recording and HLS
    /// segment index for this monitor. Always applied, regardless of
    /// whether the monitor is currently recording.
    #[serde(rename = "timestampOffset", default)]
    pub timestamp_offset_ms: i64,
    #[serde(rename = "logLevel", default = "default_log_level")]
    pub log_level: String,
    /// When set, a second ANNOUNCE for this path while one is already
    /// reserved or live is rejected rather than preempting the first.
    #[serde(rename = "disablePublisherOverride", default)]
    pub disable_publisher_override: bool,

    #[serde(flatten)]
    pub extra: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_video_length() -> u32 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &std::path::Path, cli_recordings_dir: Option<PathBuf>) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .add_source(config::Environment::with_prefix("NVR").separator("__"))
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;

        let mut cfg: Config = builder
            .try_deserialize()
            .context("deserializing configuration")?;

        if let Some(dir) = cli_recordings_dir {
            cfg.recordings_dir = dir;
        }

        Ok(cfg)
    }

    pub fn monitor(&self, id: &str) -> Option<&MonitorConfig> {
        self.monitors.iter().find(|m| m.id == id)
    }
}
