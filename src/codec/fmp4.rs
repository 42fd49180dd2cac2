//! Hand-rolled fragmented MP4 (ISO/IEC 14496-12/14) box marshalling.
//!
//! The `write_box!` backpatch-the-length-after-the-fact idiom is carried
//! over from `scottlamb-moonfire-playground/rtsp/src/client/audio/aac.rs`
//! (which credits it for the `esds`/`mp4a` tree); this module generalizes
//! the same trick to the full box set an fMP4 init segment and media
//! segment need: `ftyp`, `moov` (`mvhd`/`trak`/`tkhd`/`mdia`/`mdhd`/`hdlr`/
//! `minf`/`vmhd`/`smhd`/`dinf`/`stbl`/`stsd`/`avc1`/`avcC`/`mp4a`/`esds`/
//! `stts`/`stsc`/`stsz`/`stco`/`stss`), and `moof`/`mdat` for each segment.

use bytes::{BufMut, Bytes, BytesMut};

/// Writes `size(u32 be) + fourcc + body` and returns the finished box.
/// All multi-byte fields in ISO BMFF boxes are big-endian.
pub fn write_box(fourcc: &[u8; 4], body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(8 + body.len());
    out.put_u32((8 + body.len()) as u32);
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out.freeze()
}

/// Concatenates zero or more already-built child boxes under one parent
/// box header (`moov`, `trak`, `mdia`, `minf`, `stbl`, `dinf`, `moof`,
/// `traf`...).
pub fn write_container(fourcc: &[u8; 4], children: &[Bytes]) -> Bytes {
    let body_len: usize = children.iter().map(|c| c.len()).sum();
    let mut body = BytesMut::with_capacity(body_len);
    for c in children {
        body.extend_from_slice(c);
    }
    write_box(fourcc, &body)
}

pub fn ftyp(major_brand: &[u8; 4], minor_version: u32, compatible_brands: &[[u8; 4]]) -> Bytes {
    let mut body = BytesMut::new();
    body.extend_from_slice(major_brand);
    body.put_u32(minor_version);
    for b in compatible_brands {
        body.extend_from_slice(b);
    }
    write_box(b"ftyp", &body)
}

/// `mvhd` version 0. `timescale` is the movie-level timescale (we use the
/// video track's clock rate, matching the convention of single-video-track
/// recordings); `duration` is 0 for fragmented/live content.
pub fn mvhd(timescale: u32, next_track_id: u32) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(0); // version + flags
    body.put_u32(0); // creation_time
    body.put_u32(0); // modification_time
    body.put_u32(timescale);
    body.put_u32(0); // duration
    body.put_u32(0x0001_0000); // rate 1.0
    body.put_u16(0x0100); // volume 1.0
    body.put_u16(0); // reserved
    body.put_u64(0); // reserved[2]
    // unity matrix
    for v in [0x0001_0000i32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        body.put_i32(v);
    }
    body.extend_from_slice(&[0u8; 24]); // pre_defined
    body.put_u32(next_track_id);
    write_box(b"mvhd", &body)
}

pub fn tkhd(track_id: u32, is_video: bool, width: u32, height: u32) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(0x0000_0007); // version 0, flags: enabled|in_movie|in_preview
    body.put_u32(0); // creation_time
    body.put_u32(0); // modification_time
    body.put_u32(track_id);
    body.put_u32(0); // reserved
    body.put_u32(0); // duration
    body.put_u64(0); // reserved[2]
    body.put_u16(0); // layer
    body.put_u16(0); // alternate_group
    body.put_u16(if is_video { 0 } else { 0x0100 }); // volume
    body.put_u16(0); // reserved
    for v in [0x0001_0000i32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        body.put_i32(v);
    }
    body.put_u32(width << 16);
    body.put_u32(height << 16);
    write_box(b"tkhd", &body)
}

pub fn mdhd(timescale: u32) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(0); // version + flags
    body.put_u32(0); // creation_time
    body.put_u32(0); // modification_time
    body.put_u32(timescale);
    body.put_u32(0); // duration
    body.put_u16(0x55c4); // language = und
    body.put_u16(0); // pre_defined
    write_box(b"mdhd", &body)
}

pub fn hdlr(handler_type: &[u8; 4], name: &str) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(0); // version + flags
    body.put_u32(0); // pre_defined
    body.extend_from_slice(handler_type);
    body.extend_from_slice(&[0u8; 12]); // reserved
    body.extend_from_slice(name.as_bytes());
    body.put_u8(0);
    write_box(b"hdlr", &body)
}

pub fn vmhd() -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(1); // version 0, flags=1
    body.put_u64(0); // graphicsmode + opcolor
    write_box(b"vmhd", &body)
}

pub fn smhd() -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(0);
    body.put_u16(0); // balance
    body.put_u16(0); // reserved
    write_box(b"smhd", &body)
}

pub fn dinf() -> Bytes {
    let mut dref_body = BytesMut::new();
    dref_body.put_u32(0);
    dref_body.put_u32(1); // entry_count
    let url = write_box(b"url ", &[0, 0, 0, 1u8]);
    dref_body.extend_from_slice(&url);
    let dref = write_box(b"dref", &dref_body);
    write_container(b"dinf", &[dref])
}

/// `avc1` visual sample entry wrapping the AVCDecoderConfigurationRecord.
pub fn avc1(width: u16, height: u16, avcc_record: &[u8]) -> Bytes {
    let mut body = BytesMut::new();
    body.extend_from_slice(&[0u8; 6]); // SampleEntry reserved
    body.put_u16(1); // data_reference_index
    body.put_u16(0); // pre_defined
    body.put_u16(0); // reserved
    body.extend_from_slice(&[0u8; 12]); // pre_defined[3]
    body.put_u16(width);
    body.put_u16(height);
    body.put_u32(0x0048_0000); // horizresolution 72dpi
    body.put_u32(0x0048_0000); // vertresolution 72dpi
    body.put_u32(0); // reserved
    body.put_u16(1); // frame_count
    body.extend_from_slice(&[0u8; 32]); // compressorname
    body.put_u16(0x0018); // depth
    body.put_i16(-1); // pre_defined

    let avcc = write_box(b"avcC", avcc_record);
    body.extend_from_slice(&avcc);

    write_box(b"avc1", &body)
}

pub fn stsd(sample_entry: &Bytes) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(0);
    body.put_u32(1); // entry_count
    body.extend_from_slice(sample_entry);
    write_box(b"stsd", &body)
}

pub fn empty_table(fourcc: &[u8; 4]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(0);
    body.put_u32(0); // entry_count = 0, used for stts/stsc/stss in fragmented mode
    write_box(fourcc, &body)
}

pub fn stsz_empty() -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(0);
    body.put_u32(0); // sample_size = 0 (varies per sample)
    body.put_u32(0); // sample_count = 0, sample sizes live in trun
    write_box(b"stsz", &body)
}

pub fn stco_empty() -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(0);
    body.put_u32(0);
    write_box(b"stco", &body)
}

/// `mehd`/`trex` live in `mvex`, required for a fragmented-MP4 init segment
/// so players know to expect `moof`/`mdat` pairs rather than a classic
/// `stbl` sample table.
pub fn trex(track_id: u32) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(0);
    body.put_u32(track_id);
    body.put_u32(1); // default_sample_description_index
    body.put_u32(0); // default_sample_duration
    body.put_u32(0); // default_sample_size
    body.put_u32(0); // default_sample_flags
    write_box(b"trex", &body)
}

pub struct TrunSample {
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
    pub composition_offset: i32,
}

/// `tfhd` + `tfdt` + `trun` for one track fragment. `data_offset` is
/// patched in by the caller once the final `moof` size is known (the
/// classic two-pass fMP4 `trun` dance).
pub fn traf(
    track_id: u32,
    base_decode_time: u64,
    samples: &[TrunSample],
    data_offset: i32,
) -> Bytes {
    let mut tfhd_body = BytesMut::new();
    tfhd_body.put_u32(0x02_0000); // flags: default-base-is-moof
    tfhd_body.put_u32(track_id);
    let tfhd = write_box(b"tfhd", &tfhd_body);

    let mut tfdt_body = BytesMut::new();
    tfdt_body.put_u32(1 << 24); // version 1 (64-bit base_media_decode_time)
    tfdt_body.put_u64(base_decode_time);
    let tfdt = write_box(b"tfdt", &tfdt_body);

    let mut trun_body = BytesMut::new();
    // flags: data-offset-present | sample-duration | sample-size |
    // sample-flags | sample-composition-time-offset
    trun_body.put_u32(0x00_0f01);
    trun_body.put_u32(samples.len() as u32);
    trun_body.put_i32(data_offset);
    for s in samples {
        trun_body.put_u32(s.duration);
        trun_body.put_u32(s.size);
        trun_body.put_u32(s.flags);
        trun_body.put_i32(s.composition_offset);
    }
    let trun = write_box(b"trun", &trun_body);

    write_container(b"traf", &[tfhd, tfdt, trun])
}

/// `tfhd` + `tfdt` + one `trun` per run. ISO BMFF allows several `trun`
/// boxes inside one `traf`; sample decode time accumulates across all of
/// them in the order they appear, so a track fragment can be written as
/// several non-contiguous on-disk runs without disturbing its timeline.
/// Each run gets its own `data_offset`, already resolved by the caller.
pub fn traf_multi(track_id: u32, base_decode_time: u64, runs: &[(i32, &[TrunSample])]) -> Bytes {
    let mut tfhd_body = BytesMut::new();
    tfhd_body.put_u32(0x02_0000); // flags: default-base-is-moof
    tfhd_body.put_u32(track_id);
    let tfhd = write_box(b"tfhd", &tfhd_body);

    let mut tfdt_body = BytesMut::new();
    tfdt_body.put_u32(1 << 24); // version 1 (64-bit base_media_decode_time)
    tfdt_body.put_u64(base_decode_time);
    let tfdt = write_box(b"tfdt", &tfdt_body);

    let mut children = Vec::with_capacity(2 + runs.len());
    children.push(tfhd);
    children.push(tfdt);
    for (data_offset, samples) in runs {
        let mut trun_body = BytesMut::new();
        trun_body.put_u32(0x00_0f01);
        trun_body.put_u32(samples.len() as u32);
        trun_body.put_i32(*data_offset);
        for s in *samples {
            trun_body.put_u32(s.duration);
            trun_body.put_u32(s.size);
            trun_body.put_u32(s.flags);
            trun_body.put_i32(s.composition_offset);
        }
        children.push(write_box(b"trun", &trun_body));
    }

    write_container(b"traf", &children)
}

pub fn mfhd(sequence_number: u32) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(0);
    body.put_u32(sequence_number);
    write_box(b"mfhd", &body)
}

pub fn mdat(payload: &[u8]) -> Bytes {
    write_box(b"mdat", payload)
}

/// Sample flags bitfield helper used in `tfhd`'s default and `trun`'s
/// per-sample override: bit layout per ISO/IEC 14496-12 §8.8.3.1.
pub fn sample_flags(is_sync: bool) -> u32 {
    if is_sync {
        0
    } else {
        // sample_depends_on = 1 (not I-frame), sample_is_non_sync_sample = 1
        (1 << 24) | (1 << 16)
    }
}

/// Derives each sample's `trun.duration` (the fMP4 analogue of
/// `stts.sample_delta`) from the *next* sample's decode timestamp delta,
/// since the container stores per-sample DTS rather than a duration
/// directly. The last sample has no successor, so it falls back to
/// `fallback`. A non-positive delta (decode-order samples sharing or
/// inverting a timestamp shouldn't happen, but malformed input can produce
/// one) is clamped to the last known positive delta rather than to zero,
/// so a single bad sample doesn't collapse that run's duration to nothing.
pub fn derive_durations_90k(dts_90k: &[i64], fallback: u32) -> Vec<u32> {
    let mut out = Vec::with_capacity(dts_90k.len());
    let mut last_positive = fallback;
    for i in 0..dts_90k.len() {
        let duration = match dts_90k.get(i + 1) {
            Some(next) => {
                let delta = next - dts_90k[i];
                if delta > 0 {
                    last_positive = delta as u32;
                    last_positive
                } else {
                    last_positive
                }
            }
            None => fallback,
        };
        out.push(duration);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_length_matches_content() {
        let b = write_box(b"free", &[1, 2, 3, 4]);
        assert_eq!(b.len(), 8 + 4);
        assert_eq!(u32::from_be_bytes(b[0..4].try_into().unwrap()), b.len() as u32);
        assert_eq!(&b[4..8], b"free");
    }

    #[test]
    fn container_sums_child_lengths() {
        let a = write_box(b"aaaa", &[0; 4]);
        let b = write_box(b"bbbb", &[0; 8]);
        let parent = write_container(b"moov", &[a.clone(), b.clone()]);
        assert_eq!(parent.len(), 8 + a.len() + b.len());
    }

    #[test]
    fn avc1_embeds_avcc_payload() {
        let avcc = vec![1u8, 0x42, 0, 0x1f, 0xff, 0xe1, 0, 2, 0x67, 0x42, 1, 0, 1, 0x68];
        let b = avc1(1920, 1080, &avcc);
        assert!(b.windows(avcc.len()).any(|w| w == avcc.as_slice()));
    }

    #[test]
    fn derive_durations_uses_next_dts_delta() {
        let durations = derive_durations_90k(&[0, 3000, 6000, 9000], 3000);
        assert_eq!(durations, vec![3000, 3000, 3000, 3000]);
    }

    #[test]
    fn derive_durations_clamps_non_positive_delta_to_last_positive() {
        // Third sample's dts is equal to the second's (bad input); its
        // derived duration should fall back to the last positive delta
        // (3000) rather than collapsing to 0.
        let durations = derive_durations_90k(&[0, 3000, 3000, 7000], 3000);
        assert_eq!(durations, vec![3000, 3000, 4000, 3000]);
    }

    #[test]
    fn derive_durations_last_sample_uses_fallback() {
        let durations = derive_durations_90k(&[0, 1000], 1024);
        assert_eq!(durations, vec![1000, 1024]);
    }
}
