use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

use crate::codec::h264::AvcParameters;
use crate::codec::Sample;

pub mod http;
pub mod segment;
pub mod variant;

use variant::HlsVariant;

/// Shared, lock-protected view of a variant's live position (current
/// segment/part indices) plus the `Notify` a waiter wakes on every time
/// that position advances. Used by the blocking-playlist-request support
/// in `http`: a request for `_HLS_msn=N&_HLS_part=P` polls this rather
/// than reaching into the muxer directly, since the muxer itself is only
/// ever touched by the single task bridging samples into it.
pub struct HlsLiveState {
    notify: tokio::sync::Notify,
    position: std::sync::Mutex<(u64, u32)>,
}

impl HlsLiveState {
    fn new() -> Self {
        Self {
            notify: tokio::sync::Notify::new(),
            position: std::sync::Mutex::new((0, 0)),
        }
    }

    fn set_position(&self, msn: u64, part_idx: u32) {
        *self.position.lock().unwrap_or_else(|e| e.into_inner()) = (msn, part_idx);
        self.notify.notify_waiters();
    }

    pub fn position(&self) -> (u64, u32) {
        *self.position.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Same "has `msn`/`part` already landed" check as
    /// `HlsVariant::has_segment_part`, evaluated against the last position
    /// published by `set_position` rather than the variant's own live
    /// state; the two agree because `set_position` is always called with
    /// exactly the values `has_segment_part` would compute at that moment.
    pub fn has_segment_part(&self, msn: u64, part: Option<u32>) -> bool {
        let (idx, part_idx) = self.position();
        if msn < idx {
            return true;
        }
        if msn > idx {
            return false;
        }
        match part {
            Some(p) => p < part_idx,
            None => false,
        }
    }

    pub async fn wait(&self) {
        self.notify.notified().await
    }
}

/// Component C top level: one fMP4 rendition per path. Every path produces
/// exactly one rendition straight from the camera's own bitstream, so the
/// master playlist always lists a single `EXT-X-STREAM-INF` entry.
pub struct HlsMuxer {
    out_dir: PathBuf,
    segment_length_target: f64,
    variant: HlsVariant,
}

impl HlsMuxer {
    pub fn new(
        out_dir: PathBuf,
        segment_length_target: f64,
        low_latency: bool,
        video_timescale: u32,
        avc_params: AvcParameters,
        aac_config: Option<(crate::codec::aac::AudioSpecificConfig, Bytes)>,
        segment_window_count: usize,
        metrics: Option<Arc<crate::metrics::GlobalMetrics>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&out_dir)?;
        let variant = HlsVariant::new(
            out_dir.join("0"),
            segment_length_target,
            low_latency,
            video_timescale,
            avc_params,
            aac_config,
            segment_window_count,
            metrics,
        )?;
        let muxer = Self {
            out_dir,
            segment_length_target,
            variant,
        };
        muxer.write_master_playlist()?;
        Ok(muxer)
    }

    pub const MASTER_PLAYLIST_NAME: &'static str = "stream.m3u8";

    fn write_master_playlist(&self) -> Result<()> {
        let mut pl = m3u8_rs::MasterPlaylist::default();
        pl.version = Some(6);
        pl.variants = vec![m3u8_rs::VariantStream {
            is_i_frame: false,
            uri: format!("0/{}", HlsVariant::PLAYLIST_NAME),
            bandwidth: 0,
            average_bandwidth: None,
            codecs: Some(self.variant.codec_string()),
            resolution: None,
            frame_rate: None,
            hdcp_level: None,
            audio: None,
            video: None,
            subtitles: None,
            closed_captions: None,
            other_attributes: None,
        }];

        let mut f_out = File::create(self.out_dir.join(Self::MASTER_PLAYLIST_NAME))?;
        pl.write_to(&mut f_out)?;
        Ok(())
    }

    pub fn push_video_sample(&mut self, sample: Sample) -> Result<Option<segment::SegmentInfo>> {
        self.variant.push_video_sample(sample)
    }

    pub fn push_audio_sample(&mut self, sample: Sample) {
        self.variant.push_audio_sample(sample)
    }

    pub fn live_state(&self) -> Arc<HlsLiveState> {
        self.variant.live.clone()
    }

    /// The recorder's feed: every sample that landed in a just-closed
    /// segment, in the order the muxer itself committed them.
    pub fn subscribe_segment_finalized(&self) -> tokio::sync::broadcast::Receiver<segment::FinalizedSegment> {
        self.variant.subscribe_segment_finalized()
    }

    /// Part target duration in seconds (a third of the segment target).
    pub fn partial_target_duration(&self) -> f64 {
        self.segment_length_target / 3.0
    }

    /// Bound on how long a blocking `_HLS_msn`/`_HLS_part` playlist
    /// request may suspend before it's answered with 503: three times the
    /// segment target duration.
    pub fn blocking_request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.segment_length_target * 3.0)
    }
}
