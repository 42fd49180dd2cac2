use chrono::{DateTime, Utc};
use m3u8_rs::{ByteRange, MediaSegment, MediaSegmentType, Part};

use crate::codec::Sample;

/// Every sample that landed in one just-closed segment, broadcast once
/// `close_segment` commits it. A consumer that only ever sees this (the
/// recorder) never disagrees with the muxer's own segment file about what
/// actually survived ingestion, including anything dropped by a
/// back-pressure resync.
#[derive(Clone)]
pub struct FinalizedSegment {
    pub video: Vec<Sample>,
    pub audio: Vec<Sample>,
}

/// A segment or in-progress partial segment queued for the next playlist
/// write. There is exactly one variant per path, so no per-group
/// identifier plumbing is needed here.
#[derive(Clone, PartialEq)]
pub enum HlsSegment {
    Full(SegmentInfo),
    Partial(PartialSegmentInfo),
}

impl HlsSegment {
    pub fn to_media_segment(&self) -> MediaSegmentType {
        match self {
            HlsSegment::Full(f) => f.to_media_segment(),
            HlsSegment::Partial(p) => p.to_media_segment(),
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct SegmentInfo {
    pub index: u64,
    pub duration: f32,
    pub timestamp: DateTime<Utc>,
    pub discontinuity: bool,
    /// Whether the first sample in this segment is a keyframe; a segment
    /// that isn't can still be served live but is never handed to the
    /// recorder.
    pub first_idr: bool,
}

impl SegmentInfo {
    pub fn to_media_segment(&self) -> MediaSegmentType {
        MediaSegmentType::Full(MediaSegment {
            uri: self.filename(),
            duration: self.duration,
            program_date_time: Some(self.timestamp.fixed_offset()),
            discontinuity: self.discontinuity,
            ..MediaSegment::default()
        })
    }

    pub fn filename(&self) -> String {
        format!("segment{}.mp4", self.index)
    }
}

#[derive(Clone, PartialEq)]
pub struct PartialSegmentInfo {
    pub index: u64,
    pub parent_index: u64,
    pub duration: f64,
    pub independent: bool,
    pub byte_range: Option<(u64, Option<u64>)>,
}

impl PartialSegmentInfo {
    pub fn to_media_segment(&self) -> MediaSegmentType {
        MediaSegmentType::Partial(Part {
            uri: self.filename(),
            duration: self.duration,
            independent: self.independent,
            gap: false,
            byte_range: self.byte_range.map(|r| ByteRange {
                length: r.0,
                offset: r.1,
            }),
        })
    }

    pub fn filename(&self) -> String {
        format!("segment{}.mp4", self.parent_index)
    }

    /// Byte offset where this partial segment ends, used both to compute
    /// the next part's byte-range start and, once the segment is closed,
    /// to know where to truncate a partially-written file if the stream
    /// died mid-part.
    pub fn end_pos(&self) -> Option<u64> {
        self.byte_range
            .as_ref()
            .map(|(len, start)| start.unwrap_or(0) + len)
    }
}
