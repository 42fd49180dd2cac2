//! Component C: the LL-HLS muxer. Every path gets exactly one fMP4
//! rendition (no transcode ladder), so this module is a thin wrapper
//! around `hls::HlsMuxer`.

#[cfg(feature = "egress-hls")]
pub mod hls;
#[cfg(feature = "egress-hls")]
pub use hls::HlsMuxer;
