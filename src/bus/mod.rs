//! Component D: the per-camera stream bus. One video track and an optional
//! audio track per connected publisher (RTSP ANNOUNCE/RECORD session),
//! fanning remuxed samples out to every subscriber (the HLS muxer, the
//! recorder) via a `tokio::sync::broadcast` channel per track.
//!
//! `path::Path` is the owner of a publisher's pair of tracks (one
//! `Arc<Mutex<VideoTrack>>`, one `Arc<Mutex<Option<AudioTrack>>>`, locked
//! independently so an RTP depacketizer writing video never blocks on
//! audio); see `track` for the depacketize-remux-broadcast logic itself.

pub mod track;
