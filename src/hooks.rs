//! Extension-point surface for the pieces of the media plane that are
//! deliberately left to the embedder: RTSP authentication and
//! post-recording notification. A small async trait the daemon holds as a
//! `dyn CoreHooks` and calls at well-defined points, with a no-op default
//! implementation so a bare deployment doesn't need to write one.

use async_trait::async_trait;

use crate::error::CoreResult;

/// Credentials offered in an RTSP `Authorization` header (component E).
pub struct RtspCredentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

#[async_trait]
pub trait CoreHooks: Send + Sync {
    /// Called on every RTSP ANNOUNCE, DESCRIBE, and SETUP before the
    /// session is allowed to proceed. The default accepts everything,
    /// since a lot of deployments sit behind a network boundary rather
    /// than per-camera credentials.
    async fn authenticate(&self, _monitor_id: &str, _creds: Option<RtspCredentials<'_>>) -> CoreResult<()> {
        Ok(())
    }

    /// Called once a publisher has been accepted for a path and its first
    /// access unit has been remuxed, letting an embedder record monitor
    /// state transitions (e.g. "camera online") without polling.
    async fn on_publisher_connected(&self, _monitor_id: &str) {}

    async fn on_publisher_disconnected(&self, _monitor_id: &str) {}

    /// Called once a recording has been finalized and renamed into place,
    /// with the final `.meta`/`.mdat` paths, so an embedder can index it,
    /// push a notification, or kick off thumbnail generation out of band.
    async fn on_recording_finalized(&self, _monitor_id: &str, _meta_path: &std::path::Path) {}
}

/// The default hook set used when no embedder-supplied implementation is
/// configured; every call is a no-op.
pub struct NullHooks;

#[async_trait]
impl CoreHooks for NullHooks {}
