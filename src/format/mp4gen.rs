//! On-demand regeneration of a playable fragmented MP4 from a finalized
//! `.meta`/`.mdat` recording, used to serve a recording for download or
//! playback without having kept the original HLS segments around.
//!
//! Builds directly on the box writer in `codec::fmp4`; the recording's own
//! sample index already carries everything `trun` needs (duration is
//! derived from consecutive DTS deltas, since the container doesn't store
//! per-sample duration directly).

use anyhow::Result;
use bytes::{Bytes, BytesMut};

use crate::codec::fmp4::{self, TrunSample};
use crate::format::reader::SegmentReader;

const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;

/// Produces a single self-contained fragmented MP4 (`ftyp` + `moov` +
/// one `moof`/`mdat` pair covering every sample in the recording).
pub fn generate(reader: &SegmentReader) -> Result<Bytes> {
    let ftyp = fmp4::ftyp(b"isom", 512, &[*b"isom", *b"iso6", *b"mp41"]);

    let video_trak = video_trak(reader)?;
    let mut traks = vec![video_trak];
    let has_audio = reader.header.aac_config.is_some();
    if has_audio {
        traks.push(audio_trak(reader)?);
    }

    let mvhd = fmp4::mvhd(reader.header.video_timescale, if has_audio { 3 } else { 2 });
    let mut mvex_children = vec![fmp4::trex(VIDEO_TRACK_ID)];
    if has_audio {
        mvex_children.push(fmp4::trex(AUDIO_TRACK_ID));
    }
    let mvex = fmp4::write_container(b"mvex", &mvex_children);

    let mut moov_children = vec![mvhd];
    moov_children.extend(traks);
    moov_children.push(mvex);
    let moov = fmp4::write_container(b"moov", &moov_children);

    // Duration is derived per track from consecutive DTS deltas in that
    // track's own on-disk order, independent of how the two tracks'
    // samples are interleaved in the `.mdat` byte stream.
    let video_dts: Vec<i64> = reader.samples().iter().filter(|s| !s.is_audio()).map(|s| s.dts_90k).collect();
    let video_durations = fmp4::derive_durations_90k(&video_dts, 3000);
    let audio_dts: Vec<i64> = reader.samples().iter().filter(|s| s.is_audio()).map(|s| s.dts_90k).collect();
    let audio_durations = fmp4::derive_durations_90k(&audio_dts, 1024);

    let video_base_decode_time = video_dts.first().copied().unwrap_or(0).max(0) as u64;
    let audio_base_decode_time = audio_dts.first().copied().unwrap_or(0).max(0) as u64;

    // Walk samples in on-disk order and group them into maximal runs of
    // the same track, so the regenerated `mdat` reproduces the original
    // byte order exactly rather than collecting each track's samples
    // contiguously. A `traf` can carry several `trun`s, one per run.
    struct Run {
        is_audio: bool,
        trun_samples: Vec<TrunSample>,
        byte_len: usize,
    }
    let mut runs: Vec<Run> = Vec::new();
    let mut mdat_body = BytesMut::new();
    let mut video_idx = 0usize;
    let mut audio_idx = 0usize;
    for rec in reader.samples() {
        let is_audio = rec.is_audio();
        let duration = if is_audio {
            let d = audio_durations[audio_idx];
            audio_idx += 1;
            d
        } else {
            let d = video_durations[video_idx];
            video_idx += 1;
            d
        };
        let trun_sample = TrunSample {
            duration,
            size: rec.size,
            flags: fmp4::sample_flags(if is_audio { true } else { rec.is_keyframe() }),
            composition_offset: if is_audio { 0 } else { (rec.pts_90k - rec.dts_90k) as i32 },
        };
        let data = reader.read_sample_data(rec)?;
        match runs.last_mut() {
            Some(run) if run.is_audio == is_audio => {
                run.byte_len += data.len();
                run.trun_samples.push(trun_sample);
            }
            _ => runs.push(Run {
                is_audio,
                trun_samples: vec![trun_sample],
                byte_len: data.len(),
            }),
        }
        mdat_body.extend_from_slice(&data);
    }

    let mut run_offsets = Vec::with_capacity(runs.len());
    let mut offset = 0usize;
    for run in &runs {
        run_offsets.push(offset);
        offset += run.byte_len;
    }

    let build_moof = |runs: &[Run], run_offsets: &[usize], base: i32| -> Bytes {
        let video_runs: Vec<(i32, &[TrunSample])> = runs
            .iter()
            .zip(run_offsets)
            .filter(|(r, _)| !r.is_audio)
            .map(|(r, o)| (base + *o as i32, r.trun_samples.as_slice()))
            .collect();
        let audio_runs: Vec<(i32, &[TrunSample])> = runs
            .iter()
            .zip(run_offsets)
            .filter(|(r, _)| r.is_audio)
            .map(|(r, o)| (base + *o as i32, r.trun_samples.as_slice()))
            .collect();

        let mut children = vec![fmp4::mfhd(1)];
        if !video_runs.is_empty() {
            children.push(fmp4::traf_multi(VIDEO_TRACK_ID, video_base_decode_time, &video_runs));
        }
        if !audio_runs.is_empty() {
            children.push(fmp4::traf_multi(AUDIO_TRACK_ID, audio_base_decode_time, &audio_runs));
        }
        fmp4::write_container(b"moof", &children)
    };

    // Two-pass: data_offset is relative to the start of moof, which isn't
    // known until the moof itself is fully built.
    let moof_unfinished = build_moof(&runs, &run_offsets, 0);
    let data_offset_base = moof_unfinished.len() as i32 + 8;
    let moof = build_moof(&runs, &run_offsets, data_offset_base);

    let mdat = fmp4::mdat(&mdat_body);

    let mut out = BytesMut::new();
    out.extend_from_slice(&ftyp);
    out.extend_from_slice(&moov);
    out.extend_from_slice(&moof);
    out.extend_from_slice(&mdat);
    Ok(out.freeze())
}

fn video_trak(reader: &SegmentReader) -> Result<Bytes> {
    let avcc = &reader.header.avc_config;
    // width/height aren't stored directly in the track header; callers
    // that need exact dimensions should parse `avc_config` via
    // `AvcParameters`. 0x0 dimensions here are harmless for a `tkhd`
    // used only to drive fragmented playback, since players read the
    // real dimensions out of the SPS inside `avcC`.
    let (width, height) = sps_dimensions(avcc).unwrap_or((0, 0));

    let tkhd = fmp4::tkhd(VIDEO_TRACK_ID, true, width, height);
    let mdhd = fmp4::mdhd(reader.header.video_timescale);
    let hdlr = fmp4::hdlr(b"vide", "VideoHandler");

    let avc1 = fmp4::avc1(width as u16, height as u16, avcc);
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
    Ok(fmp4::write_container(b"trak", &[tkhd, mdia]))
}

fn audio_trak(reader: &SegmentReader) -> Result<Bytes> {
    let cfg_bytes = reader
        .header
        .aac_config
        .as_ref()
        .expect("audio_trak only called when aac_config is present");
    let parsed = crate::codec::aac::AudioSpecificConfig::parse(cfg_bytes)?;

    let tkhd = fmp4::tkhd(AUDIO_TRACK_ID, false, 0, 0);
    let mdhd = fmp4::mdhd(reader.header.audio_timescale.max(parsed.sampling_frequency));
    let hdlr = fmp4::hdlr(b"soun", "SoundHandler");

    let mp4a = crate::codec::aac::mp4a_box(&parsed, cfg_bytes);
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
    Ok(fmp4::write_container(b"trak", &[tkhd, mdia]))
}

fn sps_dimensions(avcc: &[u8]) -> Option<(u32, u32)> {
    if avcc.len() < 8 {
        return None;
    }
    let sps_len = u16::from_be_bytes([avcc[6], avcc[7]]) as usize;
    let sps_start = 8;
    if avcc.len() < sps_start + sps_len {
        return None;
    }
    let sps = bytes::Bytes::copy_from_slice(&avcc[sps_start..sps_start + sps_len]);
    // pps is irrelevant for dimensions; a synthetic empty pps satisfies
    // `AvcParameters::from_sps_pps`'s shape check only when non-empty, so
    // reuse the raw sps parse path directly instead of round-tripping
    // through `AvcParameters`.
    let rbsp = {
        let mut out = Vec::with_capacity(sps.len());
        let mut zero_run = 0u8;
        for &b in &sps[1..] {
            if zero_run >= 2 && b == 0x03 {
                zero_run = 0;
                continue;
            }
            out.push(b);
            zero_run = if b == 0 { zero_run + 1 } else { 0 };
        }
        out
    };
    let parsed = h264_reader::nal::sps::SeqParameterSet::from_bits(
        h264_reader::rbsp::BitReader::new(rbsp.as_slice()),
    )
    .ok()?;
    parsed.pixel_dimensions().ok()
}
