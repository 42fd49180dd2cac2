//! Component C's HTTP surface: serves the live LL-HLS tree (`stream.m3u8`,
//! `index.m3u8`, `init.mp4`, numbered `segment<N>.mp4` fragments) straight
//! off disk under `hls_dir/<pathName>/...`.
//!
//! A `hyper::service::Service` over `Request<Incoming>` that maps the URI
//! path onto a file under a base directory and streams it back with
//! `tokio_util::io::ReaderStream` wrapped in a `StreamBody`, with CORS
//! headers and an early HEAD return. There is no embedded UI and no
//! management API, so an unmapped path is a plain 404.
//!
//! `.m3u8` requests carrying `_HLS_msn`/`_HLS_part` suspend in place until
//! the requested segment/part is finalized (or a bounded timeout elapses
//! and the caller gets a 503) rather than racing a playlist file that
//! hasn't caught up yet.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::path::PathManager;

const SERVER_HEADER: &str = "rtsp-simple-server";

#[derive(Clone)]
pub struct HlsHttpServer {
    hls_dir: PathBuf,
    metrics_registry: Option<prometheus::Registry>,
    paths: Option<Arc<PathManager>>,
}

impl HlsHttpServer {
    pub fn new(hls_dir: PathBuf) -> Self {
        Self {
            hls_dir,
            metrics_registry: None,
            paths: None,
        }
    }

    /// Exposes the process-wide Prometheus counters at `/metrics`. This
    /// lives on the HLS listener rather than a dedicated one since the
    /// core has exactly one HTTP surface in scope.
    pub fn with_metrics(mut self, registry: prometheus::Registry) -> Self {
        self.metrics_registry = Some(registry);
        self
    }

    /// Gives `.m3u8` requests access to each path's live HLS state, so a
    /// `_HLS_msn`/`_HLS_part` request can suspend until that segment/part
    /// is finalized instead of racing a half-written playlist. Without
    /// this, the server still serves files, just never blocks.
    pub fn with_path_manager(mut self, paths: Arc<PathManager>) -> Self {
        self.paths = Some(paths);
        self
    }
}

impl Service<Request<Incoming>> for HlsHttpServer {
    type Response = Response<BoxBody<Bytes, anyhow::Error>>;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        if req.method() == Method::OPTIONS {
            return Box::pin(async move { Ok(cors_preflight_response()) });
        }

        if req.uri().path() == "/metrics" {
            let registry = self.metrics_registry.clone();
            return Box::pin(async move { Ok(metrics_response(registry.as_ref())) });
        }

        let Some(rel_path) = sanitize_path(req.uri().path()) else {
            return Box::pin(async move { Ok(status_response(StatusCode::BAD_REQUEST)) });
        };

        let blocking_request = rel_path
            .extension()
            .is_some_and(|e| e == "m3u8")
            .then(|| parse_blocking_request(req.uri().query().unwrap_or("")))
            .flatten();
        let monitor_id = rel_path
            .components()
            .next()
            .and_then(|c| c.as_os_str().to_str())
            .map(str::to_string);
        let paths = self.paths.clone();

        let dst_path = self.hls_dir.join(rel_path);
        Box::pin(async move {
            if let (Some((msn, part)), Some(paths), Some(monitor_id)) = (blocking_request, paths, monitor_id) {
                if !await_segment_part(&paths, &monitor_id, msn, part).await {
                    return Ok(status_response(StatusCode::SERVICE_UNAVAILABLE));
                }
            }

            if !matches!(tokio::fs::metadata(&dst_path).await, Ok(meta) if meta.is_file()) {
                return Ok(status_response(StatusCode::NOT_FOUND));
            }

            let mut builder = Response::builder()
                .header("server", SERVER_HEADER)
                .header("access-control-allow-credentials", "true")
                .header("access-control-allow-origin", "*")
                .header("access-control-allow-headers", "*")
                .header("access-control-allow-methods", "GET, HEAD, OPTIONS")
                .header("content-type", content_type(&dst_path));

            if req.method() == Method::HEAD {
                return Ok(builder.body(empty_body())?);
            }

            let file = File::open(&dst_path).await?;
            let stream = ReaderStream::new(file);
            let body = StreamBody::new(stream.map_ok(Frame::data).map_err(anyhow::Error::new)).boxed();
            builder = builder.status(StatusCode::OK);
            Ok(builder.body(body)?)
        })
    }
}

/// Parses `_HLS_msn=N` and an optional `_HLS_part=P` off a playlist
/// request's query string. A bare `_HLS_msn` with no `_HLS_part` blocks
/// on the whole segment; `_HLS_part` without `_HLS_msn` isn't a valid LL-HLS
/// request and is ignored, same as no query string at all.
fn parse_blocking_request(query: &str) -> Option<(u64, Option<u32>)> {
    let mut msn = None;
    let mut part = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=')?;
        match key {
            "_HLS_msn" => msn = value.parse::<u64>().ok(),
            "_HLS_part" => part = value.parse::<u32>().ok(),
            _ => {}
        }
    }
    msn.map(|msn| (msn, part))
}

/// Suspends until `monitor_id`'s HLS output has segment `msn` (and part
/// `part`, if given) finalized, bounded by that path's blocking-request
/// timeout (three segment durations). Returns `false` on timeout or when
/// the path has no live publisher to wait on, in which case the caller
/// answers 503 rather than serving a playlist that will never catch up.
async fn await_segment_part(paths: &PathManager, monitor_id: &str, msn: u64, part: Option<u32>) -> bool {
    let (Some(live), Some(timeout)) =
        (paths.hls_live(monitor_id).await, paths.hls_blocking_timeout(monitor_id).await)
    else {
        return false;
    };

    if live.has_segment_part(msn, part) {
        return true;
    }
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        if tokio::time::timeout(remaining, live.wait()).await.is_err() {
            return false;
        }
        if live.has_segment_part(msn, part) {
            return true;
        }
    }
}

fn cors_preflight_response() -> Response<BoxBody<Bytes, anyhow::Error>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("server", SERVER_HEADER)
        .header("access-control-allow-credentials", "true")
        .header("access-control-allow-origin", "*")
        .header("access-control-allow-headers", "*")
        .header("access-control-allow-methods", "GET, HEAD, OPTIONS")
        .body(empty_body())
        .unwrap_or_else(|e| {
            warn!("failed to build cors preflight response: {}", e);
            Response::new(empty_body())
        })
}

fn metrics_response(registry: Option<&prometheus::Registry>) -> Response<BoxBody<Bytes, anyhow::Error>> {
    let Some(registry) = registry else {
        return status_response(StatusCode::NOT_FOUND);
    };
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let families = registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        warn!("failed to encode prometheus metrics: {}", e);
        return status_response(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Response::builder()
        .status(StatusCode::OK)
        .header("server", SERVER_HEADER)
        .header("content-type", encoder.format_type())
        .body(Full::new(Bytes::from(buf)).map_err(|e: std::convert::Infallible| match e {}).boxed())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn status_response(status: StatusCode) -> Response<BoxBody<Bytes, anyhow::Error>> {
    Response::builder()
        .status(status)
        .header("server", SERVER_HEADER)
        .body(empty_body())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn empty_body() -> BoxBody<Bytes, anyhow::Error> {
    Full::new(Bytes::new()).map_err(|e: std::convert::Infallible| match e {}).boxed()
}

/// Strips the leading `/` and rejects any path that isn't a clean
/// relative path under `hls_dir` (`..` components, absolute components
/// reintroduced via a Windows drive prefix, etc), returning 400 on a
/// malformed path.
fn sanitize_path(uri_path: &str) -> Option<PathBuf> {
    let trimmed = uri_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            std::path::Component::Normal(part) => out.push(part),
            _ => return None,
        }
    }
    Some(out)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("mp4") | Some("m4s") => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_a_plain_relative_path() {
        let p = sanitize_path("/front-door/stream.m3u8").unwrap();
        assert_eq!(p, PathBuf::from("front-door/stream.m3u8"));
    }

    #[test]
    fn rejects_parent_directory_traversal() {
        assert!(sanitize_path("/front-door/../../etc/passwd").is_none());
    }

    #[test]
    fn rejects_empty_path() {
        assert!(sanitize_path("/").is_none());
    }

    #[test]
    fn content_type_by_extension() {
        assert_eq!(content_type(Path::new("stream.m3u8")), "application/vnd.apple.mpegurl");
        assert_eq!(content_type(Path::new("segment1.mp4")), "video/mp4");
        assert_eq!(content_type(Path::new("init.mp4")), "video/mp4");
        assert_eq!(content_type(Path::new("unknown.bin")), "application/octet-stream");
    }

    #[test]
    fn parses_msn_and_part() {
        assert_eq!(parse_blocking_request("_HLS_msn=100&_HLS_part=2"), Some((100, Some(2))));
    }

    #[test]
    fn parses_msn_without_part() {
        assert_eq!(parse_blocking_request("_HLS_msn=5"), Some((5, None)));
    }

    #[test]
    fn ignores_unrelated_query_params() {
        assert_eq!(parse_blocking_request("foo=bar&_HLS_msn=1"), Some((1, None)));
    }

    #[test]
    fn no_query_is_not_a_blocking_request() {
        assert_eq!(parse_blocking_request(""), None);
    }
}
