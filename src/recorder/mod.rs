//! Component G: the recorder FSM. One `Recorder` per monitor, fed the same
//! remuxed samples the HLS muxer sees, deciding when to open, extend, and
//! close a `.meta`/`.mdat` recording.
//!
//! Idle until triggered, write while triggered, flush and publish once the
//! trigger window lapses. Segments are written via
//! `format::writer::SegmentWriter`; the `alwaysRecord`/manual-trigger/
//! minimum-length state machine governs when a recording opens and closes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use tracing::{info, warn};

use crate::codec::Sample;
use crate::format::writer::SegmentWriter;
use crate::format::{TrackHeader, FLAG_AUDIO_SAMPLE, FLAG_KEYFRAME};
use crate::hooks::CoreHooks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    /// Writing samples. `extend_until` is the wall-clock time the
    /// recorder will close the file at, absent a new trigger or (for
    /// always-on monitors) forever.
    Recording,
    /// The trigger window has lapsed but we haven't yet seen a keyframe
    /// to close cleanly on; by spec a recording only ever ends at an
    /// access unit boundary, which for this format means ending
    /// unconditionally at the next sample (no mid-GOP truncation needed
    /// since every sample is already a full access unit).
    Flushing,
}

pub struct Recorder {
    monitor_id: String,
    recordings_dir: PathBuf,
    always_record: bool,
    /// `recDuration` (spec.md §4.G / §6 `videoLength`): the hard cap on how
    /// far a trigger can push the recording window out, measured from the
    /// first trigger, not from the most recent one.
    rec_duration: Duration,
    timestamp_offset_ms: i64,
    video_timescale: u32,
    audio_timescale: u32,
    avc_config: Bytes,
    aac_config: Option<Bytes>,
    hooks: Arc<dyn CoreHooks>,

    state: State,
    writer: Option<SegmentWriter>,
    current_id: Option<String>,
    current_start_unix_ms: Option<i64>,
    started_at: Option<Instant>,
    /// Set on the first trigger of a window and never moved afterwards;
    /// `recDuration` is measured from here (spec.md §8 S6).
    window_start: Option<Instant>,
    extend_until: Option<Instant>,
    first_sample_seen: bool,
}

impl Recorder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        monitor_id: String,
        recordings_dir: PathBuf,
        always_record: bool,
        min_length_secs: u32,
        timestamp_offset_ms: i64,
        video_timescale: u32,
        audio_timescale: u32,
        avc_config: Bytes,
        aac_config: Option<Bytes>,
        hooks: Arc<dyn CoreHooks>,
    ) -> Self {
        Self {
            monitor_id,
            recordings_dir,
            always_record,
            rec_duration: Duration::from_secs(min_length_secs as u64),
            timestamp_offset_ms,
            video_timescale,
            audio_timescale,
            avc_config,
            aac_config,
            hooks,
            state: State::Idle,
            writer: None,
            current_id: None,
            current_start_unix_ms: None,
            started_at: None,
            window_start: None,
            extend_until: None,
            first_sample_seen: false,
        }
    }

    /// Extends (or starts) the trigger window by `event_duration`, called
    /// by whatever upstream motion/event source exists (out of scope
    /// here; see spec.md §1). A monitor configured with `alwaysRecord`
    /// never needs this; its window never expires.
    ///
    /// Per spec.md §4.G/§8 S6: `endTime = max(endTime, now + event_duration)`,
    /// but never beyond `window_start + recDuration` — a second trigger
    /// extends the window, it doesn't restart the cap.
    pub fn trigger(&mut self, event_duration: Duration) {
        let now = Instant::now();
        let start = *self.window_start.get_or_insert(now);
        let cap = start + self.rec_duration;
        let proposed_end = (now + event_duration).min(cap);
        self.extend_until = Some(match self.extend_until {
            Some(cur) => cur.max(proposed_end),
            None => proposed_end,
        });
        if self.state == State::Flushing {
            self.state = State::Recording;
        }
    }

    fn wants_to_record(&self) -> bool {
        if self.always_record {
            return true;
        }
        match self.extend_until {
            Some(deadline) => Instant::now() < deadline,
            None => false,
        }
    }

    pub async fn push_video_sample(&mut self, sample: &Sample) -> Result<()> {
        match self.state {
            State::Idle => {
                if !self.wants_to_record() {
                    return Ok(());
                }
                if !sample.is_sync {
                    // Must start a recording on a keyframe; drop samples
                    // until the next one.
                    return Ok(());
                }
                self.open(sample)?;
                self.state = State::Recording;
                self.first_sample_seen = true;
            }
            State::Recording => {
                if !self.wants_to_record() {
                    self.state = State::Flushing;
                }
            }
            State::Flushing => {}
        }

        if let Some(writer) = self.writer.as_mut() {
            let flags = if sample.is_sync { FLAG_KEYFRAME } else { 0 };
            writer.append_sample(
                flags,
                sample.pts_90k + scale_offset(self.timestamp_offset_ms, self.video_timescale),
                sample.dts_90k + scale_offset(self.timestamp_offset_ms, self.video_timescale),
                &sample.data,
            )?;
        }

        if self.state == State::Flushing && sample.is_sync {
            self.close().await?;
        }

        Ok(())
    }

    pub fn push_audio_sample(&mut self, sample: &Sample) -> Result<()> {
        if self.state == State::Idle {
            return Ok(());
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.append_sample(
                FLAG_AUDIO_SAMPLE,
                sample.pts_90k + scale_offset(self.timestamp_offset_ms, self.audio_timescale),
                sample.dts_90k + scale_offset(self.timestamp_offset_ms, self.audio_timescale),
                &sample.data,
            )?;
        }
        Ok(())
    }

    fn open(&mut self, first_sample: &Sample) -> Result<()> {
        let now = chrono::Utc::now();
        let id = format!("{}_{}", now.format("%Y-%m-%d_%H-%M-%S"), self.monitor_id);
        let dir = day_dir(&self.recordings_dir, now, &self.monitor_id);

        let header = TrackHeader {
            monitor_id: self.monitor_id.clone(),
            start_time_unix_ms: now.timestamp_millis(),
            video_timescale: self.video_timescale,
            avc_config: self.avc_config.clone(),
            aac_config: self.aac_config.clone(),
            audio_timescale: self.audio_timescale,
        };
        let writer = SegmentWriter::create(&dir, &id, &header)?;
        info!(monitor = %self.monitor_id, id, pts = first_sample.pts_90k, "recording started");
        self.writer = Some(writer);
        self.current_id = Some(id);
        self.current_start_unix_ms = Some(now.timestamp_millis());
        self.started_at = Some(Instant::now());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            self.state = State::Idle;
            return Ok(());
        };
        let id = self.current_id.take().unwrap_or_default();
        let start_time_unix_ms = self.current_start_unix_ms.take().unwrap_or_default();

        if writer.sample_count() == 0 {
            warn!(monitor = %self.monitor_id, id, "discarding empty recording");
            writer.discard()?;
        } else {
            let (meta_path, _mdat_path) = writer.finalize()?;
            info!(monitor = %self.monitor_id, id, path = %meta_path.display(), "recording finalized");
            if let Err(e) = write_event_metadata(&meta_path, &EventMetadata {
                id: id.clone(),
                monitor_id: self.monitor_id.clone(),
                start_time_unix_ms,
                end_time_unix_ms: chrono::Utc::now().timestamp_millis(),
                always_record: self.always_record,
            }) {
                warn!(monitor = %self.monitor_id, id, "failed to write event metadata sidecar: {}", e);
            }
            self.hooks.on_recording_finalized(&self.monitor_id, &meta_path).await;
        }

        self.state = State::Idle;
        self.extend_until = None;
        self.window_start = None;
        self.started_at = None;
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, State::Recording | State::Flushing)
    }
}

fn scale_offset(offset_ms: i64, timescale: u32) -> i64 {
    (offset_ms * timescale as i64) / 1000
}

/// The `<id>.json` sidecar written alongside a finalized recording
/// (spec.md §3/§4.G). Pure in-process metadata, no transcoder round trip
/// needed the way the `.jpeg` thumbnail requires.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EventMetadata {
    pub id: String,
    pub monitor_id: String,
    pub start_time_unix_ms: i64,
    pub end_time_unix_ms: i64,
    pub always_record: bool,
}

fn write_event_metadata(meta_path: &Path, meta: &EventMetadata) -> Result<()> {
    let json_path = meta_path.with_extension("json");
    let body = serde_json::to_vec_pretty(meta)?;
    std::fs::write(json_path, body)?;
    Ok(())
}

/// Recordings are laid out `<root>/YYYY/MM/DD/<monitor_id>/`, the
/// directory shape `crawler` walks in lexicographic time order.
fn day_dir(root: &Path, now: chrono::DateTime<chrono::Utc>, monitor_id: &str) -> PathBuf {
    root.join(format!("{:04}", now.format("%Y")))
        .join(format!("{:02}", now.format("%m")))
        .join(format!("{:02}", now.format("%d")))
        .join(monitor_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NullHooks;

    fn sample(pts: i64, is_sync: bool) -> Sample {
        Sample {
            pts_90k: pts,
            dts_90k: pts,
            is_sync,
            data: Bytes::from_static(&[1, 2, 3, 4]),
            avc_params: None,
        }
    }

    /// spec.md §9 open question (a): `timestampOffset` must always be
    /// applied at the point samples are written, not silently dropped on
    /// some code path the way the source's `time.Add`-without-assignment
    /// bug could. Pins the computation `scale_offset` performs rather than
    /// just asserting the recording opened.
    #[test]
    fn scale_offset_converts_milliseconds_to_the_track_timescale() {
        // +500ms at a 90kHz video timescale is 45_000 ticks.
        assert_eq!(scale_offset(500, 90_000), 45_000);
        // Negative offsets (camera clock ahead of wall clock) subtract.
        assert_eq!(scale_offset(-500, 90_000), -45_000);
        // A track with no audio (timescale 0) always offsets by zero.
        assert_eq!(scale_offset(500, 0), 0);
    }

    #[tokio::test]
    async fn timestamp_offset_is_applied_to_every_written_sample() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = Recorder::new(
            "4".to_string(),
            dir.path().to_path_buf(),
            true,
            60,
            500, // +500ms
            90_000,
            0,
            Bytes::from_static(&[1, 2, 3]),
            None,
            Arc::new(NullHooks),
        );

        rec.push_video_sample(&sample(0, true)).await.unwrap();
        rec.push_video_sample(&sample(9_000, false)).await.unwrap();

        // Force-close without waiting for the trigger window to lapse, so
        // the finalized recording can be read back.
        rec.state = State::Flushing;
        rec.close().await.unwrap();

        let mut meta_path = None;
        for entry in walk(dir.path()) {
            if entry.extension().and_then(|e| e.to_str()) == Some("meta") {
                meta_path = Some(entry);
            }
        }
        let meta_path = meta_path.expect("recording was written");
        let mdat_path = meta_path.with_extension("mdat");
        let reader = crate::format::reader::SegmentReader::open(&meta_path, &mdat_path).unwrap();

        let samples = reader.samples();
        assert_eq!(samples.len(), 2);
        // +500ms at 90kHz is +45_000 ticks, applied to both samples.
        assert_eq!(samples[0].pts_90k, 0 + 45_000);
        assert_eq!(samples[1].pts_90k, 9_000 + 45_000);
    }

    fn walk(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path);
            }
        }
        out
    }

    #[tokio::test]
    async fn always_record_opens_on_first_keyframe_and_stays_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = Recorder::new(
            "1".to_string(),
            dir.path().to_path_buf(),
            true,
            60,
            0,
            90_000,
            0,
            Bytes::from_static(&[1, 2, 3]),
            None,
            Arc::new(NullHooks),
        );

        rec.push_video_sample(&sample(0, false)).await.unwrap();
        assert!(!rec.is_recording());
        rec.push_video_sample(&sample(3000, true)).await.unwrap();
        assert!(rec.is_recording());
        rec.push_video_sample(&sample(6000, false)).await.unwrap();
        assert!(rec.is_recording());
    }

    #[tokio::test]
    async fn triggered_recording_closes_after_window_lapses_on_next_keyframe() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = Recorder::new(
            "2".to_string(),
            dir.path().to_path_buf(),
            false,
            0,
            0,
            90_000,
            0,
            Bytes::from_static(&[1, 2, 3]),
            None,
            Arc::new(NullHooks),
        );

        assert!(!rec.wants_to_record());
        rec.trigger(Duration::from_secs(0));
        rec.push_video_sample(&sample(0, true)).await.unwrap();
        assert!(rec.is_recording());

        // Window of 0s has already lapsed; the next keyframe closes it.
        rec.push_video_sample(&sample(3000, true)).await.unwrap();
        assert!(!rec.is_recording());
    }

    /// spec.md §8 S6: a trigger whose requested end exceeds
    /// `window_start + recDuration` is clamped to the cap, and a later
    /// trigger within the cap can't pull the window back down but also
    /// can't push it past that same cap — the cap is anchored to the
    /// first trigger in the window, not to whichever trigger arrived
    /// most recently.
    #[tokio::test]
    async fn trigger_window_is_capped_at_rec_duration_from_window_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = Recorder::new(
            "3".to_string(),
            dir.path().to_path_buf(),
            false,
            90,
            0,
            90_000,
            0,
            Bytes::from_static(&[1, 2, 3]),
            None,
            Arc::new(NullHooks),
        );

        // First trigger asks for 120s, well past the 90s recDuration cap.
        rec.trigger(Duration::from_secs(120));
        let window_start = rec.window_start.unwrap();
        let first_end = rec.extend_until.unwrap();
        assert_eq!(first_end, window_start + Duration::from_secs(90));

        // A second trigger for only 10s can't shrink the already-granted
        // window, and staying within the cap doesn't move it either.
        rec.trigger(Duration::from_secs(10));
        assert_eq!(rec.extend_until.unwrap(), window_start + Duration::from_secs(90));
        // The cap is still anchored to the original window_start.
        assert_eq!(rec.window_start.unwrap(), window_start);
    }

    #[tokio::test]
    async fn close_writes_event_metadata_sidecar_next_to_the_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = Recorder::new(
            "5".to_string(),
            dir.path().to_path_buf(),
            true,
            60,
            0,
            90_000,
            0,
            Bytes::from_static(&[1, 2, 3]),
            None,
            Arc::new(NullHooks),
        );

        rec.push_video_sample(&sample(0, true)).await.unwrap();
        rec.state = State::Flushing;
        rec.close().await.unwrap();

        let mut json_path = None;
        for entry in walk(dir.path()) {
            if entry.extension().and_then(|e| e.to_str()) == Some("json") {
                json_path = Some(entry);
            }
        }
        let json_path = json_path.expect("sidecar was written");
        let body = std::fs::read_to_string(&json_path).unwrap();
        let meta: EventMetadata = serde_json::from_str(&body).unwrap();
        assert_eq!(meta.monitor_id, "5");
        assert!(meta.end_time_unix_ms >= meta.start_time_unix_ms);
        assert!(meta.always_record);
    }
}
