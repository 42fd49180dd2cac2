use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use bytes::Bytes;
use chrono::Utc;
use m3u8_rs::{ExtTag, MediaSegmentType, PartInf, PreloadHint};
use tracing::{debug, info, warn};

use crate::codec::fmp4::{self, TrunSample};
use crate::codec::h264::AvcParameters;
use crate::codec::Sample;
use crate::mux::hls::segment::{FinalizedSegment, HlsSegment, PartialSegmentInfo, SegmentInfo};

const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;

/// One path's single-rendition fMP4 LL-HLS output: segments and parts
/// written as raw `moof`/`mdat` fragments appended to a per-segment file,
/// retained on a rolling window, with a playlist kept in sync on every
/// part and segment boundary.
///
/// The decision logic (when to close a part, when to close a segment, how
/// windowed cleanup works, how the playlist is regenerated) follows a
/// single segment/part state machine: track duration since the last
/// split, split on an IDR once the target is reached, maintain a rolling
/// window, write a preload hint for the next part. There is exactly one
/// rendition per path, so no per-variant-group bookkeeping is needed; a
/// hand-rolled box writer in `codec::fmp4` tracks byte offsets manually
/// as fragments are appended.
pub struct HlsVariant {
    out_dir: PathBuf,
    segment_length_target: f64,
    partial_target_duration: f64,
    low_latency: bool,
    /// Retention window measured in finalized segment *count*, not elapsed
    /// time (spec's `windowSize`).
    segment_window_count: usize,

    video_timescale: u32,
    audio_timescale: u32,
    avc_params: Option<AvcParameters>,
    aac_config: Option<(crate::codec::aac::AudioSpecificConfig, Bytes)>,

    /// Bumped whenever an IDR carries SPS/PPS values different from the
    /// ones init.mp4 was last built from (spec: "Init.mp4 is built once
    /// per (trackset, parameter-set) generation").
    param_generation: u32,

    idx: u64,
    segment_start_pts: Option<i64>,
    part_start_pts: Option<i64>,
    part_idx: u32,
    part_pending_independent: bool,
    /// Last positive `dts_90k` delta observed between consecutive video
    /// samples, used to stamp a trailing sample's duration when there's no
    /// next sample yet to derive it from (instead of the elapsed part/
    /// segment duration, which would wildly overstate a single frame's
    /// length).
    last_positive_video_delta: u32,

    current_file: Option<File>,
    current_file_offset: u64,
    pending_video: Vec<(Sample, TrunSample)>,
    pending_audio: Vec<Sample>,
    /// Accumulates every sample that has gone into the segment currently
    /// being written, across all its parts, so the whole segment can be
    /// handed to `finalized_tx` in one piece once it closes.
    segment_video: Vec<Sample>,
    segment_audio: Vec<Sample>,
    /// Set once an overflow forces the current part to be dropped; cleared
    /// on the next IDR, since a decoder can't resume mid-GOP.
    resyncing: bool,
    metrics: Option<Arc<crate::metrics::GlobalMetrics>>,

    segments: Vec<HlsSegment>,
    pub live: Arc<super::HlsLiveState>,
    finalized_tx: tokio::sync::broadcast::Sender<FinalizedSegment>,
}

/// Small: there is exactly one consumer (the recorder), which drains every
/// finalized segment promptly rather than batching requests.
const FINALIZED_SEGMENT_CHANNEL_CAPACITY: usize = 8;

/// Spec default `windowSize`: the number of finalized segments retained
/// before the oldest is evicted.
pub const DEFAULT_SEGMENT_WINDOW_COUNT: usize = 7;

/// Generous upper bound on how many video samples can sit in `pending_video`
/// before the current part is dropped. A part at the default cadence holds
/// a handful of frames; this is a backstop against unbounded growth if a
/// segment stalls open (no IDR arriving to close it), not a normal limit.
const MAX_PENDING_VIDEO_SAMPLES: usize = 512;

impl HlsVariant {
    pub const PLAYLIST_NAME: &'static str = "index.m3u8";
    pub const INIT_SEGMENT_NAME: &'static str = "init.mp4";

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

        let partial_target_duration = segment_length_target / 3.0;
        // A nominal 30fps cadence at the 90kHz shared timescale until the
        // first real inter-sample delta is observed.
        let default_video_delta = (video_timescale / 30).max(1);

        let mut v = Self {
            out_dir,
            segment_length_target,
            partial_target_duration,
            low_latency,
            segment_window_count,
            video_timescale,
            audio_timescale: aac_config.as_ref().map(|(c, _)| c.sampling_frequency).unwrap_or(0),
            avc_params: Some(avc_params),
            aac_config,
            param_generation: 0,
            idx: 1,
            segment_start_pts: None,
            part_start_pts: None,
            part_idx: 0,
            part_pending_independent: false,
            last_positive_video_delta: default_video_delta,
            current_file: None,
            current_file_offset: 0,
            pending_video: Vec::new(),
            pending_audio: Vec::new(),
            segment_video: Vec::new(),
            segment_audio: Vec::new(),
            resyncing: false,
            metrics,
            segments: Vec::new(),
            live: Arc::new(super::HlsLiveState::new()),
            finalized_tx: tokio::sync::broadcast::channel(FINALIZED_SEGMENT_CHANNEL_CAPACITY).0,
        };
        v.write_init_segment()?;
        Ok(v)
    }

    fn write_init_segment(&mut self) -> Result<()> {
        let Some(avc) = &self.avc_params else {
            bail!("cannot build an init segment without avc parameters");
        };
        let avcc = avc.avc_decoder_configuration_record();
        let tkhd = fmp4::tkhd(VIDEO_TRACK_ID, true, avc.width, avc.height);
        let mdhd = fmp4::mdhd(self.video_timescale);
        let hdlr = fmp4::hdlr(b"vide", "VideoHandler");
        let avc1 = fmp4::avc1(avc.width as u16, avc.height as u16, &avcc);
        let stsd = fmp4::stsd(&avc1);
        let stbl = fmp4::write_container(
            b"stbl",
            &[
                stsd,
                fmp4::empty_table(b"stts"),
                fmp4::empty_table(b"stss"),
                fmp4::empty_table(b"stsc"),
                fmp4::stsz_empty(),
                fmp4::stco_empty(),
            ],
        );
        let minf = fmp4::write_container(b"minf", &[fmp4::vmhd(), fmp4::dinf(), stbl]);
        let mdia = fmp4::write_container(b"mdia", &[mdhd, hdlr, minf]);
        let video_trak = fmp4::write_container(b"trak", &[tkhd, mdia]);

        let mut traks = vec![video_trak];
        let mut trex_boxes = vec![fmp4::trex(VIDEO_TRACK_ID)];

        if let Some((cfg, raw)) = &self.aac_config {
            let tkhd = fmp4::tkhd(AUDIO_TRACK_ID, false, 0, 0);
            let mdhd = fmp4::mdhd(self.audio_timescale);
            let hdlr = fmp4::hdlr(b"soun", "SoundHandler");
            let mp4a = crate::codec::aac::mp4a_box(cfg, raw);
            let stsd = fmp4::stsd(&mp4a);
            let stbl = fmp4::write_container(
                b"stbl",
                &[
                    stsd,
                    fmp4::empty_table(b"stts"),
                    fmp4::empty_table(b"stsc"),
                    fmp4::stsz_empty(),
                    fmp4::stco_empty(),
                ],
            );
            let minf = fmp4::write_container(b"minf", &[fmp4::smhd(), fmp4::dinf(), stbl]);
            let mdia = fmp4::write_container(b"mdia", &[mdhd, hdlr, minf]);
            traks.push(fmp4::write_container(b"trak", &[tkhd, mdia]));
            trex_boxes.push(fmp4::trex(AUDIO_TRACK_ID));
        }

        let ftyp = fmp4::ftyp(b"isom", 512, &[*b"isom", *b"iso6", *b"mp41"]);
        let mvhd = fmp4::mvhd(self.video_timescale, traks.len() as u32 + 1);
        let mvex = fmp4::write_container(b"mvex", &trex_boxes);
        let mut moov_children = vec![mvhd];
        moov_children.extend(traks);
        moov_children.push(mvex);
        let moov = fmp4::write_container(b"moov", &moov_children);

        let mut out = Vec::with_capacity(ftyp.len() + moov.len());
        out.extend_from_slice(&ftyp);
        out.extend_from_slice(&moov);
        std::fs::write(self.out_dir.join(Self::INIT_SEGMENT_NAME), out)?;
        Ok(())
    }

    fn segment_path(&self, idx: u64) -> PathBuf {
        self.out_dir.join(format!("segment{idx}.mp4"))
    }

    /// Feeds one remuxed video sample in. This drives all segmentation
    /// decisions: parts close on a duration cadence, segments close only
    /// on an IDR once the target duration has elapsed.
    pub fn push_video_sample(&mut self, sample: Sample) -> Result<Option<SegmentInfo>> {
        if sample.is_sync {
            if let Some(params) = &sample.avc_params {
                if self.avc_params.as_ref() != Some(params) {
                    self.avc_params = Some(params.clone());
                    self.param_generation += 1;
                    info!(generation = self.param_generation, "SPS/PPS changed, regenerating init.mp4");
                    self.write_init_segment()?;
                }
            }
        }

        if self.resyncing {
            if !sample.is_sync {
                return Ok(None);
            }
            self.resyncing = false;
        }

        if self.pending_video.len() >= MAX_PENDING_VIDEO_SAMPLES {
            self.pending_video.clear();
            self.pending_audio.clear();
            self.resyncing = true;
            warn!(
                limit = MAX_PENDING_VIDEO_SAMPLES,
                "part-drop: ingest buffer overflowed before the next keyframe, dropping current part and resyncing"
            );
            if let Some(m) = &self.metrics {
                m.parts_dropped.inc();
            }
            if !sample.is_sync {
                return Ok(None);
            }
            self.resyncing = false;
        }

        if self.current_file.is_none() {
            if !sample.is_sync {
                // Can't open a new segment except on a keyframe.
                return Ok(None);
            }
            self.open_segment(sample.pts_90k)?;
        }

        let segment_start = self.segment_start_pts.unwrap_or(sample.pts_90k);
        let part_start = self.part_start_pts.unwrap_or(sample.pts_90k);
        let segment_elapsed = secs(sample.pts_90k - segment_start, self.video_timescale);
        let part_elapsed = secs(sample.pts_90k - part_start, self.video_timescale);

        let should_close_segment =
            sample.is_sync && segment_elapsed >= self.segment_length_target && !self.pending_video.is_empty();
        let should_close_part = !should_close_segment
            && part_elapsed >= self.partial_target_duration
            && !self.pending_video.is_empty();

        // Patch the previously-buffered sample's duration from this
        // sample's DTS delta *before* any close below drains
        // `pending_video` — otherwise the patch runs against an empty
        // buffer and does nothing, and the close path's own fallback ends
        // up stamping a whole part/segment duration onto one frame.
        if let Some(last) = self.pending_video.last_mut() {
            let delta = sample.dts_90k - last.0.dts_90k;
            let duration = if delta > 0 {
                self.last_positive_video_delta = delta as u32;
                self.last_positive_video_delta
            } else {
                self.last_positive_video_delta
            };
            last.1.duration = duration;
        }

        let mut finalized = None;
        if should_close_segment {
            finalized = Some(self.close_segment(segment_elapsed)?);
            // close_segment() clears current_file; the sample that
            // triggered the close still needs a home, so reopen straight
            // away rather than falling through with no file to write to.
            self.open_segment(sample.pts_90k)?;
        } else if should_close_part {
            self.close_part(part_elapsed)?;
        }

        if !self.part_pending_independent && self.pending_video.is_empty() {
            self.part_pending_independent = sample.is_sync;
        }

        let trun = TrunSample {
            duration: 0, // patched once the next sample's dts is known, or by flush_part's fallback for the last sample in a part
            size: sample.data.len() as u32,
            flags: fmp4::sample_flags(sample.is_sync),
            composition_offset: (sample.pts_90k - sample.dts_90k) as i32,
        };
        self.pending_video.push((sample, trun));
        if self.part_start_pts.is_none() {
            self.part_start_pts = self.pending_video.last().map(|(s, _)| s.pts_90k);
        }
        if self.segment_start_pts.is_none() {
            self.segment_start_pts = self.pending_video.first().map(|(s, _)| s.pts_90k);
        }

        Ok(finalized)
    }

    pub fn push_audio_sample(&mut self, sample: Sample) {
        if self.resyncing {
            return;
        }
        self.pending_audio.push(sample);
    }

    fn open_segment(&mut self, pts: i64) -> Result<()> {
        let file = File::create(self.segment_path(self.idx))?;
        self.current_file = Some(file);
        self.current_file_offset = 0;
        self.segment_start_pts = Some(pts);
        self.part_start_pts = Some(pts);
        self.part_idx = 0;
        self.segment_video.clear();
        self.segment_audio.clear();
        Ok(())
    }

    fn flush_part(&mut self, duration_secs: f64, is_final_in_segment: bool) -> Result<PartialSegmentInfo> {
        // The very last sample in the whole stream (or the last one before
        // a close forced mid-cadence) has no successor to derive a duration
        // from yet; fall back to the last observed frame interval rather
        // than the part/segment's entire elapsed duration, which would
        // grossly overstate a single frame's length.
        if let Some(last) = self.pending_video.last_mut() {
            if last.1.duration == 0 {
                last.1.duration = self.last_positive_video_delta;
            }
        }

        let video_samples: Vec<_> = self.pending_video.drain(..).collect();
        let trun_samples: Vec<TrunSample> = video_samples
            .iter()
            .map(|(_, t)| TrunSample {
                duration: t.duration,
                size: t.size,
                flags: t.flags,
                composition_offset: t.composition_offset,
            })
            .collect();
        let base_decode_time = video_samples.first().map(|(s, _)| s.dts_90k).unwrap_or(0).max(0) as u64;

        // Every audio sample that arrived before this part's end belongs to
        // it; audio has no bearing on segment/part split decisions, which
        // are driven by the video keyframe cadence alone.
        let part_end_pts = video_samples.last().map(|(s, _)| s.pts_90k);
        let audio_split = part_end_pts
            .map(|end| self.pending_audio.partition_point(|s| s.pts_90k < end))
            .unwrap_or(self.pending_audio.len());
        let audio_samples: Vec<Sample> = self.pending_audio.drain(..audio_split).collect();

        self.segment_video.extend(video_samples.iter().map(|(s, _)| s.clone()));
        self.segment_audio.extend(audio_samples.iter().cloned());

        let audio_video_boundary: usize = video_samples.iter().map(|(s, _)| s.data.len()).sum();
        let mut mdat_body: Vec<u8> = Vec::with_capacity(
            audio_video_boundary + audio_samples.iter().map(|s| s.data.len()).sum::<usize>(),
        );
        for (s, _) in &video_samples {
            mdat_body.extend_from_slice(&s.data);
        }
        for s in &audio_samples {
            mdat_body.extend_from_slice(&s.data);
        }

        let audio_dts: Vec<i64> = audio_samples.iter().map(|s| s.dts_90k).collect();
        let audio_durations = fmp4::derive_durations_90k(&audio_dts, 1024);
        let audio_trun_samples: Vec<TrunSample> = audio_samples
            .iter()
            .zip(audio_durations)
            .map(|(s, duration)| TrunSample {
                duration,
                size: s.data.len() as u32,
                flags: fmp4::sample_flags(true),
                composition_offset: 0,
            })
            .collect();
        let audio_base_decode_time = audio_samples.first().map(|s| s.dts_90k).unwrap_or(0).max(0) as u64;
        let has_audio = !audio_trun_samples.is_empty();

        let seq = self.idx as u32 * 10_000 + self.part_idx;
        let mut moof_children = vec![fmp4::mfhd(seq), fmp4::traf(VIDEO_TRACK_ID, base_decode_time, &trun_samples, 0)];
        if has_audio {
            moof_children.push(fmp4::traf(AUDIO_TRACK_ID, audio_base_decode_time, &audio_trun_samples, 0));
        }
        let moof_unfinished = fmp4::write_container(b"moof", &moof_children);

        let video_data_offset = moof_unfinished.len() as i32 + 8;
        let audio_data_offset = video_data_offset + audio_video_boundary as i32;
        let mut moof_children = vec![
            fmp4::mfhd(seq),
            fmp4::traf(VIDEO_TRACK_ID, base_decode_time, &trun_samples, video_data_offset),
        ];
        if has_audio {
            moof_children.push(fmp4::traf(
                AUDIO_TRACK_ID,
                audio_base_decode_time,
                &audio_trun_samples,
                audio_data_offset,
            ));
        }
        let moof = fmp4::write_container(b"moof", &moof_children);
        let mdat = fmp4::mdat(&mdat_body);

        let part_start_offset = self.current_file_offset;
        let Some(file) = self.current_file.as_mut() else {
            bail!("flush_part called with no open segment file");
        };
        file.write_all(&moof)?;
        file.write_all(&mdat)?;
        self.current_file_offset += (moof.len() + mdat.len()) as u64;

        let independent = self.part_pending_independent;
        self.part_pending_independent = false;
        let part = PartialSegmentInfo {
            index: self.part_idx as u64,
            parent_index: self.idx,
            duration: duration_secs,
            independent,
            byte_range: Some((self.current_file_offset - part_start_offset, Some(part_start_offset))),
        };
        self.part_idx += 1;
        self.part_start_pts = None;

        if !is_final_in_segment {
            self.segments.push(HlsSegment::Partial(part.clone()));
        }
        Ok(part)
    }

    fn close_part(&mut self, duration_secs: f64) -> Result<()> {
        let part = self.flush_part(duration_secs, false)?;
        self.live.set_position(self.idx, self.part_idx);
        self.write_playlist()?;
        debug!(
            "closed part {}.{} [{:.3}s]",
            part.parent_index, part.index, part.duration
        );
        Ok(())
    }

    fn close_segment(&mut self, duration_secs: f64) -> Result<SegmentInfo> {
        let part = self.flush_part(duration_secs, true)?;
        self.segments
            .retain(|s| !matches!(s, HlsSegment::Partial(p) if p.parent_index == self.idx));

        self.current_file = None;
        let path = self.segment_path(self.idx);
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        let info = SegmentInfo {
            index: self.idx,
            duration: duration_secs as f32,
            timestamp: Utc::now(),
            discontinuity: false,
            first_idr: true,
        };
        info!(
            "closed segment {} [{:.3}s, {} bytes, {} parts]",
            info.index,
            info.duration,
            size,
            part.index + 1
        );
        self.segments.push(HlsSegment::Full(info.clone()));
        self.clean_segments();
        self.idx += 1;
        self.part_idx = 0;
        self.segment_start_pts = None;

        // Ignored if nobody's listening; the recorder is the only
        // subscriber and may not exist in every caller (e.g. tests).
        let _ = self.finalized_tx.send(FinalizedSegment {
            video: std::mem::take(&mut self.segment_video),
            audio: std::mem::take(&mut self.segment_audio),
        });

        self.live.set_position(self.idx, self.part_idx);
        self.write_playlist()?;
        Ok(info)
    }

    /// Subscribes to every segment as it's finalized, complete with the
    /// exact samples the muxer itself wrote (after any back-pressure
    /// resync has already dropped what it dropped).
    pub fn subscribe_segment_finalized(&self) -> tokio::sync::broadcast::Receiver<FinalizedSegment> {
        self.finalized_tx.subscribe()
    }

    fn clean_segments(&mut self) {
        let full_count = self
            .segments
            .iter()
            .filter(|s| matches!(s, HlsSegment::Full(_)))
            .count();
        let to_evict = full_count.saturating_sub(self.segment_window_count);
        let mut cutoff = None;
        let mut evicted = 0;
        for (i, seg) in self.segments.iter().enumerate() {
            if evicted >= to_evict {
                break;
            }
            if matches!(seg, HlsSegment::Full(_)) {
                evicted += 1;
            }
            cutoff = Some(i + 1);
        }
        if let Some(cutoff) = cutoff {
            let removed: Vec<_> = self.segments.drain(..cutoff).collect();
            for seg in removed {
                if let HlsSegment::Full(s) = seg {
                    let path = self.segment_path(s.index);
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!("failed to remove old segment {}: {}", path.display(), e);
                    }
                }
            }
        }
    }

    /// Segments here are always fMP4, which requires EXT-X-MAP and thus a
    /// playlist version of at least 6 regardless of low-latency mode.
    fn playlist_version(&self) -> i32 {
        6
    }

    pub fn write_playlist(&self) -> Result<()> {
        if self.segments.is_empty() {
            return Ok(());
        }

        let mut pl = m3u8_rs::MediaPlaylist::default();
        pl.segments = self.segments.iter().map(|s| s.to_media_segment()).collect();

        pl.unknown_tags.push(ExtTag {
            tag: "X-MAP".to_string(),
            rest: Some(format!("URI=\"{}\"", Self::INIT_SEGMENT_NAME)),
        });

        if let Some(HlsSegment::Partial(partial)) = self.segments.last() {
            pl.segments.push(MediaSegmentType::PreloadHint(PreloadHint {
                hint_type: "PART".to_string(),
                uri: partial.filename(),
                byte_range_start: partial.end_pos(),
                byte_range_length: None,
            }));
        }

        pl.version = Some(self.playlist_version() as usize);
        pl.target_duration = self.segment_length_target.round() as u64;
        if self.low_latency {
            pl.part_inf = Some(PartInf {
                part_target: self.partial_target_duration,
            });
        }
        pl.media_sequence = self
            .segments
            .iter()
            .find_map(|s| match s {
                HlsSegment::Full(s) => Some(s.index),
                _ => None,
            })
            .unwrap_or(self.idx);
        pl.end_list = false;

        let mut f_out = File::create(self.out_dir.join(Self::PLAYLIST_NAME))?;
        pl.write_to(&mut f_out)?;
        Ok(())
    }

    /// Whether segment `msn` (and, if given, part `part` within it) has
    /// already been written out. Segments below the currently-open one
    /// are always complete; within the currently-open segment, only
    /// parts below `part_idx` have been flushed; anything at or beyond
    /// the open segment with no part number isn't done until it closes.
    pub fn has_segment_part(&self, msn: u64, part: Option<u32>) -> bool {
        if msn < self.idx {
            return true;
        }
        if msn > self.idx {
            return false;
        }
        match part {
            Some(p) => p < self.part_idx,
            None => false,
        }
    }

    pub fn codec_string(&self) -> String {
        let mut codecs = Vec::new();
        if let Some(avc) = &self.avc_params {
            codecs.push(avc.rfc6381_codec());
        }
        if let Some((cfg, _)) = &self.aac_config {
            codecs.push(cfg.rfc6381_codec());
        }
        codecs.join(",")
    }
}

fn secs(ticks: i64, timescale: u32) -> f64 {
    ticks as f64 / timescale as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::AvcParameters;

    fn test_avc() -> AvcParameters {
        // Same minimal baseline-profile SPS/PPS fixture used by the RTSP
        // SDP tests.
        let sps = Bytes::from_static(&[
            0x67, 0x42, 0x00, 0x0a, 0xe8, 0x83, 0x00, 0x2d, 0x08, 0x80, 0x00, 0x00, 0x03, 0x00, 0x80, 0x00, 0x00,
            0x1e, 0x2c, 0x5c, 0x90,
        ]);
        let pps = Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80]);
        AvcParameters::from_sps_pps(sps, pps).unwrap()
    }

    fn sample(pts: i64, dts: i64, is_sync: bool) -> Sample {
        Sample {
            pts_90k: pts,
            dts_90k: dts,
            is_sync,
            data: Bytes::from_static(&[0xaa; 8]),
            avc_params: None,
        }
    }

    /// Walks top-level boxes in a segment file looking for `fourcc`,
    /// returning its body. Segment files are a flat sequence of
    /// `moof`/`mdat` pairs, one pair per part, so this finds the first.
    fn find_box<'a>(buf: &'a [u8], fourcc: &[u8; 4]) -> Option<&'a [u8]> {
        let mut pos = 0;
        while pos + 8 <= buf.len() {
            let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            if len < 8 || pos + len > buf.len() {
                return None;
            }
            if &buf[pos + 4..pos + 8] == fourcc {
                return Some(&buf[pos + 8..pos + len]);
            }
            pos += len;
        }
        None
    }

    /// Parses the video `trun`'s per-sample durations out of a `moof` box
    /// body: `mfhd`, then `traf` (`tfhd` + `tfdt` + `trun`). `trun`'s body
    /// is a 12-byte header (version/flags, sample_count, data_offset)
    /// followed by 16-byte-per-sample records.
    fn parse_trun_durations(moof_body: &[u8]) -> Vec<u32> {
        let traf = find_box(moof_body, b"traf").expect("traf present");
        let trun = find_box(traf, b"trun").expect("trun present");
        let sample_count = u32::from_be_bytes(trun[4..8].try_into().unwrap()) as usize;
        let mut out = Vec::with_capacity(sample_count);
        let mut pos = 12; // version/flags(4) + sample_count(4) + data_offset(4)
        for _ in 0..sample_count {
            out.push(u32::from_be_bytes(trun[pos..pos + 4].try_into().unwrap()));
            pos += 16;
        }
        out
    }

    #[test]
    fn last_sample_duration_is_frame_sized_not_segment_sized() {
        let dir = tempfile::tempdir().unwrap();
        let mut v = HlsVariant::new(dir.path().to_path_buf(), 6.0, true, 90_000, test_avc(), None, 7, None).unwrap();

        // Steady 3000-tick (33ms) cadence; force a part close by exceeding
        // the 2s partial target, then stop without a following sample so
        // the close path's own fallback is exercised for the last sample.
        let mut pts = 0i64;
        for i in 0..80 {
            let is_sync = i == 0;
            v.push_video_sample(sample(pts, pts, is_sync)).unwrap();
            pts += 3000;
        }
        v.close_part(secs(pts, 90_000)).unwrap();

        let segment_path = v.segment_path(1);
        let bytes = std::fs::read(segment_path).unwrap();
        let moof_body = find_box(&bytes, b"moof").expect("moof present");
        let durations = parse_trun_durations(moof_body);

        assert!(!durations.is_empty());
        for d in &durations {
            assert_eq!(*d, 3000, "every sample duration should be frame-sized, not segment-sized");
        }
    }

    #[test]
    fn clean_segments_retains_at_most_window_count_full_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut v = HlsVariant::new(dir.path().to_path_buf(), 0.03, true, 90_000, test_avc(), None, 2, None).unwrap();

        // Each segment closes as soon as one keyframe-started segment
        // reaches its (tiny) target duration on the next keyframe.
        let mut pts = 0i64;
        for seg in 0..5 {
            for frame in 0..4 {
                let is_sync = frame == 0;
                v.push_video_sample(sample(pts, pts, is_sync)).unwrap();
                pts += 3000;
            }
            let _ = seg;
        }

        let full_count = v.segments.iter().filter(|s| matches!(s, HlsSegment::Full(_))).count();
        assert!(full_count <= 2, "window of 2 should evict older segments, got {full_count}");
    }

    #[test]
    fn closing_a_segment_broadcasts_exactly_the_samples_it_contains() {
        let dir = tempfile::tempdir().unwrap();
        let mut v = HlsVariant::new(dir.path().to_path_buf(), 0.03, true, 90_000, test_avc(), None, 7, None).unwrap();
        let mut finalized_rx = v.subscribe_segment_finalized();

        // First segment: 4 frames, starting on a keyframe.
        let mut pts = 0i64;
        for frame in 0..4 {
            v.push_video_sample(sample(pts, pts, frame == 0)).unwrap();
            pts += 3000;
        }
        // Triggers the close of the first segment on this keyframe.
        v.push_video_sample(sample(pts, pts, true)).unwrap();

        let finalized = finalized_rx.try_recv().expect("first segment finalized");
        assert_eq!(finalized.video.len(), 4);
        assert!(finalized.audio.is_empty());
        assert!(finalized.video[0].is_sync);
    }
}
