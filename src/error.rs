use std::path::PathBuf;
use thiserror::Error;

/// Typed error kinds that cross a component boundary (reply channels,
/// RTSP responses, HTTP responses). Internal plumbing keeps using
/// `anyhow::Result` the way the rest of the crate does; this taxonomy
/// exists at the seams named in the error-handling design so a caller
/// can match on *kind* without string-sniffing an `anyhow::Error`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid H.264 bitstream: {0}")]
    TrackInvalidH264(String),

    #[error("invalid AAC bitstream: {0}")]
    TrackInvalidAac(String),

    #[error("path {0} has no active publisher")]
    PublisherNotAssigned(String),

    #[error("path {0} already has a publisher")]
    PublisherAlreadyAssigned(String),

    #[error("payload of {got} bytes exceeds the {max} byte limit")]
    PayloadTooBig { got: usize, max: usize },

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("path {0} not found")]
    PathNotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("external process error: {0}")]
    Process(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type CoreResult<T> = Result<T, CoreError>;
