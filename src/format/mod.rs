//! The on-disk recording container: one `<id>.meta` (header + fixed-width
//! sample index) paired with one `<id>.mdat` (raw AVCC/AAC sample bytes).
//!
//! Open on stream start, append every packet, close/flush on stream end,
//! publish via rename. A hand-rolled fixed-width index replaces a
//! conventional container muxer since this format has no box overhead and
//! is meant to be read back and turned into fMP4 on demand (see `mp4gen`)
//! rather than played directly.

pub mod mp4gen;
pub mod reader;
pub mod writer;

use bytes::Bytes;

pub const META_MAGIC: &[u8; 4] = b"NVR1";
pub const META_VERSION: u16 = 1;

pub const SAMPLE_RECORD_LEN: usize = 1 + 8 + 8 + 8 + 4;

pub const FLAG_KEYFRAME: u8 = 0x01;
pub const FLAG_AUDIO_SAMPLE: u8 = 0x02;

/// One entry in the `.meta` sample index. `offset`/`size` locate the raw
/// sample bytes in the sibling `.mdat` file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleRecord {
    pub flags: u8,
    pub pts_90k: i64,
    pub dts_90k: i64,
    pub offset: u64,
    pub size: u32,
}

impl SampleRecord {
    pub fn is_keyframe(&self) -> bool {
        self.flags & FLAG_KEYFRAME != 0
    }

    pub fn is_audio(&self) -> bool {
        self.flags & FLAG_AUDIO_SAMPLE != 0
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.flags);
        out.extend_from_slice(&self.pts_90k.to_be_bytes());
        out.extend_from_slice(&self.dts_90k.to_be_bytes());
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.size.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        if buf.len() < SAMPLE_RECORD_LEN {
            anyhow::bail!("truncated sample record");
        }
        Ok(Self {
            flags: buf[0],
            pts_90k: i64::from_be_bytes(buf[1..9].try_into().unwrap()),
            dts_90k: i64::from_be_bytes(buf[9..17].try_into().unwrap()),
            offset: u64::from_be_bytes(buf[17..25].try_into().unwrap()),
            size: u32::from_be_bytes(buf[25..29].try_into().unwrap()),
        })
    }
}

/// Per-track header stored once at the front of a `.meta` file.
#[derive(Clone, Debug)]
pub struct TrackHeader {
    pub monitor_id: String,
    pub start_time_unix_ms: i64,
    pub video_timescale: u32,
    /// AVCDecoderConfigurationRecord, see `codec::h264::AvcParameters`.
    pub avc_config: Bytes,
    /// Raw `AudioSpecificConfig` bytes, if this recording has an audio
    /// track (cameras without an audio input have none).
    pub aac_config: Option<Bytes>,
    pub audio_timescale: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_record_round_trips() {
        let rec = SampleRecord {
            flags: FLAG_KEYFRAME,
            pts_90k: 123_456,
            dts_90k: 123_000,
            offset: 4096,
            size: 2048,
        };
        let mut buf = Vec::new();
        rec.encode(&mut buf);
        assert_eq!(buf.len(), SAMPLE_RECORD_LEN);
        let decoded = SampleRecord::decode(&buf).unwrap();
        assert_eq!(decoded, rec);
        assert!(decoded.is_keyframe());
        assert!(!decoded.is_audio());
    }

    #[test]
    fn audio_flag_round_trips() {
        let rec = SampleRecord {
            flags: FLAG_AUDIO_SAMPLE,
            pts_90k: 1,
            dts_90k: 1,
            offset: 0,
            size: 16,
        };
        let mut buf = Vec::new();
        rec.encode(&mut buf);
        let decoded = SampleRecord::decode(&buf).unwrap();
        assert!(decoded.is_audio());
        assert!(!decoded.is_keyframe());
    }
}
