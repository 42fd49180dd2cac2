//! Per-connection RTSP state machine (component E): ANNOUNCE/SETUP/RECORD
//! for ingest, DESCRIBE/SETUP/PLAY for egress. SETUP negotiates either
//! TCP-interleaved RTP (sharing the control connection) or UDP (its own
//! socket pair) per track; see `rtsp::transport`.
//!
//! Grounded on the request/response dispatch shape of
//! `mofeng-git-One-KVM/src/rtsp/service.rs`'s `handle_client`/
//! `stream_video_interleaved` (buffer-fill-then-parse control reads
//! raced against outgoing media via `tokio::select!`, the same 4-byte
//! `$`-framed interleaved header on write), generalized from a
//! PLAY-only source to both directions since this crate also ingests.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use rtsp_types::{Method, Request, Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use crate::codec::aac::depacketize_rtp_aus;
use crate::codec::h264::packetize_nal;
use crate::codec::split_avcc_nals;
use crate::config::Config;
use crate::hooks::{CoreHooks, RtspCredentials};
use crate::error::CoreError;
use crate::path::{AnnounceToken, PathManager, PublisherGuard};
use crate::rtp::{RtpPacket, RtpSender};

use super::sdp::{self, AnnouncedMedia};
use super::transport::{self, NegotiatedTransport};

const READ_CHUNK: usize = 4096;
/// RTSP read/write timeout.
const IO_TIMEOUT: Duration = Duration::from_secs(10);
const VIDEO_MTU: usize = crate::codec::h264::DEFAULT_MTU;

pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: Arc<Config>,
    paths: Arc<PathManager>,
    hooks: Arc<dyn CoreHooks>,
) {
    let session_id = generate_session_id();
    let idle_timeout = Duration::from_secs(config.rtsp.session_timeout_secs);
    match run(&mut stream, peer, &session_id, &config, &paths, &hooks, idle_timeout).await {
        Ok(()) => debug!(session = %session_id, %peer, "rtsp session closed"),
        Err(e) => debug!(session = %session_id, %peer, "rtsp session ended: {}", e),
    }
}

fn generate_session_id() -> String {
    // "32-bit LE-encoded decimal strings generated from CSPRNG": a
    // random u32, printed in decimal (the "LE" refers to the wire
    // encoding of the underlying counter used by the reference
    // implementation this crate doesn't share; the externally visible
    // contract is just an opaque decimal session id).
    rand::random::<u32>().to_string()
}

enum TrackKind {
    Video,
    Audio,
}

struct ConnState {
    monitor_id: Option<String>,
    announced: Option<AnnouncedMedia>,
    announce_token: Option<AnnounceToken>,
    video_transport: Option<NegotiatedTransport>,
    audio_transport: Option<NegotiatedTransport>,
}

impl ConnState {
    fn new() -> Self {
        Self {
            monitor_id: None,
            announced: None,
            announce_token: None,
            video_transport: None,
            audio_transport: None,
        }
    }
}

/// The RTSP server always binds a specific address family for its
/// UDP-allocated ports; matching the client's own address family avoids a
/// v4-mapped-address surprise when the control connection is IPv6.
fn unspecified_bind_ip(peer_ip: IpAddr) -> IpAddr {
    match peer_ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

fn status_for_core_error(e: &CoreError) -> StatusCode {
    match e {
        CoreError::PublisherAlreadyAssigned(_) => StatusCode::Forbidden,
        CoreError::PublisherNotAssigned(_) => StatusCode::NotFound,
        CoreError::Unauthorized => StatusCode::Unauthorized,
        _ => StatusCode::BadRequest,
    }
}

async fn run(
    stream: &mut TcpStream,
    peer: SocketAddr,
    session_id: &str,
    config: &Config,
    paths: &Arc<PathManager>,
    hooks: &Arc<dyn CoreHooks>,
    idle_timeout: Duration,
) -> Result<()> {
    let mut buf = BytesMut::new();
    let mut state = ConnState::new();

    loop {
        // `idle_timeout` (the spec's `sessionTimeout`, default 60s) bounds
        // how long a session may sit between requests; it is deliberately
        // looser than `IO_TIMEOUT`, which bounds a single in-flight
        // read/write once bytes have started moving.
        let Some(item) = tokio::time::timeout(idle_timeout, read_item(stream, &mut buf))
            .await
            .context("rtsp connection idle timeout")??
        else {
            return Ok(());
        };

        let Item::Request { req, body } = item else {
            // A stray interleaved frame before any track is set up; ignore.
            continue;
        };

        let headers = header_map(&req);
        let method = req.method().clone();
        debug!(session = %session_id, %peer, ?method, "rtsp request");

        match method {
            Method::Options => {
                send_response(
                    stream,
                    &req,
                    StatusCode::Ok,
                    Some(session_id),
                    &[(
                        "Public",
                        "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD, PAUSE, TEARDOWN, GET_PARAMETER, SET_PARAMETER"
                            .to_string(),
                    )],
                    Vec::new(),
                )
                .await?;
            }
            Method::Describe => {
                let monitor_id = last_path_segment(&request_uri(&req));
                if !authenticate(hooks, &monitor_id, &headers).await {
                    send_response(
                        stream,
                        &req,
                        StatusCode::Unauthorized,
                        Some(session_id),
                        &[("WWW-Authenticate", "Basic realm=\"nvrd\"".to_string())],
                        Vec::new(),
                    )
                    .await?;
                    continue;
                }
                match paths.describe(&monitor_id).await {
                    Some((avc, aac)) => {
                        let body = sdp::build_describe_sdp(
                            &monitor_id,
                            &avc,
                            aac.as_ref().map(|(c, r)| (c, r)),
                        )?;
                        send_response(
                            stream,
                            &req,
                            StatusCode::Ok,
                            Some(session_id),
                            &[("Content-Type", "application/sdp".to_string())],
                            body.into_bytes(),
                        )
                        .await?;
                    }
                    None => {
                        send_response(stream, &req, StatusCode::NotFound, Some(session_id), &[], Vec::new())
                            .await?;
                    }
                }
            }
            Method::Announce => {
                let monitor_id = last_path_segment(&request_uri(&req));
                let Some(monitor_cfg) = config.monitor(&monitor_id).cloned() else {
                    send_response(stream, &req, StatusCode::NotFound, Some(session_id), &[], Vec::new())
                        .await?;
                    continue;
                };
                if !authenticate(hooks, &monitor_id, &headers).await {
                    send_response(
                        stream,
                        &req,
                        StatusCode::Unauthorized,
                        Some(session_id),
                        &[("WWW-Authenticate", "Basic realm=\"nvrd\"".to_string())],
                        Vec::new(),
                    )
                    .await?;
                    continue;
                }
                match sdp::parse_announce_sdp(&body) {
                    Ok(announced) => match paths.announce(&monitor_cfg, 90_000).await {
                        Ok(token) => {
                            state.monitor_id = Some(monitor_id);
                            state.announced = Some(announced);
                            state.announce_token = Some(token);
                            send_response(stream, &req, StatusCode::Ok, Some(session_id), &[], Vec::new()).await?;
                        }
                        Err(e) => {
                            warn!(session = %session_id, "announce rejected: {}", e);
                            send_response(stream, &req, status_for_core_error(&e), Some(session_id), &[], Vec::new())
                                .await?;
                        }
                    },
                    Err(e) => {
                        warn!(session = %session_id, "malformed announce sdp: {}", e);
                        send_response(stream, &req, StatusCode::BadRequest, Some(session_id), &[], Vec::new())
                            .await?;
                    }
                }
            }
            Method::Setup => {
                let monitor_id = state
                    .monitor_id
                    .clone()
                    .unwrap_or_else(|| monitor_id_from_setup_uri(&request_uri(&req)));
                if !authenticate(hooks, &monitor_id, &headers).await {
                    send_response(
                        stream,
                        &req,
                        StatusCode::Unauthorized,
                        Some(session_id),
                        &[("WWW-Authenticate", "Basic realm=\"nvrd\"".to_string())],
                        Vec::new(),
                    )
                    .await?;
                    continue;
                }
                let Some(transport_header) = headers.get("transport") else {
                    send_response(stream, &req, StatusCode::BadRequest, Some(session_id), &[], Vec::new())
                        .await?;
                    continue;
                };
                let parsed = match transport::parse_transport(transport_header) {
                    Ok(Some(p)) => p,
                    Ok(None) | Err(_) => {
                        send_response(stream, &req, StatusCode::BadRequest, Some(session_id), &[], Vec::new())
                            .await?;
                        continue;
                    }
                };

                let negotiated = match parsed {
                    transport::ParsedTransport::Interleaved(c) => NegotiatedTransport::Interleaved(c),
                    transport::ParsedTransport::Udp(client_ports) => {
                        let bind_ip = unspecified_bind_ip(peer.ip());
                        match transport::UdpEndpoint::bind_and_connect(bind_ip, peer.ip(), client_ports).await {
                            Ok(endpoint) => NegotiatedTransport::Udp(endpoint),
                            Err(e) => {
                                warn!(session = %session_id, "failed to allocate udp transport: {}", e);
                                send_response(
                                    stream,
                                    &req,
                                    StatusCode::InternalServerError,
                                    Some(session_id),
                                    &[],
                                    Vec::new(),
                                )
                                .await?;
                                continue;
                            }
                        }
                    }
                };

                let uri = request_uri(&req);
                let kind = match &state.announced {
                    Some(announced) => track_kind_for_announce(&uri, announced),
                    None => track_kind_from_trackid(&uri),
                };

                let header = negotiated.response_header();
                match kind {
                    TrackKind::Video => state.video_transport = Some(negotiated),
                    TrackKind::Audio => state.audio_transport = Some(negotiated),
                }

                send_response(
                    stream,
                    &req,
                    StatusCode::Ok,
                    Some(session_id),
                    &[("Transport", header)],
                    Vec::new(),
                )
                .await?;
            }
            Method::Record => {
                let (Some(monitor_id), Some(announced), Some(token), Some(video_transport)) = (
                    state.monitor_id.clone(),
                    state.announced.take(),
                    state.announce_token.take(),
                    state.video_transport.take(),
                ) else {
                    send_response(stream, &req, StatusCode::BadRequest, Some(session_id), &[], Vec::new())
                        .await?;
                    continue;
                };
                let Some(monitor_cfg) = config.monitor(&monitor_id).cloned() else {
                    send_response(stream, &req, StatusCode::NotFound, Some(session_id), &[], Vec::new())
                        .await?;
                    continue;
                };

                let audio_clock_rate = announced.aac.as_ref().map(|(c, _)| c.sampling_frequency).unwrap_or(0);
                let guard = match paths
                    .publish(&monitor_cfg, token, announced.avc, announced.aac, 90_000, audio_clock_rate)
                    .await
                {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!(session = %session_id, "record rejected: {}", e);
                        send_response(stream, &req, status_for_core_error(&e), Some(session_id), &[], Vec::new())
                            .await?;
                        continue;
                    }
                };

                send_response(stream, &req, StatusCode::Ok, Some(session_id), &[], Vec::new()).await?;
                run_record_loop(
                    stream,
                    &mut buf,
                    guard,
                    video_transport,
                    state.audio_transport.take(),
                    session_id,
                    idle_timeout,
                )
                .await?;
                return Ok(());
            }
            Method::Play => {
                let monitor_id = last_path_segment(&request_uri(&req));
                let Some(video_transport) = state.video_transport.take() else {
                    // SETUP was never completed for the video track: a
                    // PLAY session must complete SETUP for every track
                    // before transitioning.
                    send_response(stream, &req, StatusCode::BadRequest, Some(session_id), &[], Vec::new())
                        .await?;
                    continue;
                };
                let Some(video_rx) = paths.subscribe_video(&monitor_id).await else {
                    send_response(stream, &req, StatusCode::NotFound, Some(session_id), &[], Vec::new())
                        .await?;
                    continue;
                };
                let audio_clock_rate = paths
                    .describe(&monitor_id)
                    .await
                    .and_then(|(_, aac)| aac)
                    .map(|(cfg, _)| cfg.sampling_frequency);
                let audio_transport = state.audio_transport.take();
                let audio_rx = match (&audio_transport, audio_clock_rate) {
                    (Some(_), Some(_)) => paths.subscribe_audio(&monitor_id).await,
                    _ => None,
                };

                send_response(stream, &req, StatusCode::Ok, Some(session_id), &[], Vec::new()).await?;
                run_play_loop(
                    stream,
                    &mut buf,
                    video_rx,
                    video_transport,
                    audio_rx,
                    audio_transport,
                    audio_clock_rate.unwrap_or(90_000),
                    session_id,
                )
                .await?;
                return Ok(());
            }
            Method::Pause => {
                send_response(stream, &req, StatusCode::Ok, Some(session_id), &[], Vec::new()).await?;
            }
            Method::Teardown => {
                send_response(stream, &req, StatusCode::Ok, Some(session_id), &[], Vec::new()).await?;
                return Ok(());
            }
            Method::GetParameter | Method::SetParameter => {
                send_response(stream, &req, StatusCode::Ok, Some(session_id), &[], Vec::new()).await?;
            }
            _ => {
                send_response(stream, &req, StatusCode::MethodNotAllowed, Some(session_id), &[], Vec::new())
                    .await?;
            }
        }
    }
}

async fn authenticate(hooks: &Arc<dyn CoreHooks>, monitor_id: &str, headers: &HashMap<String, String>) -> bool {
    let creds = headers.get("authorization").and_then(|v| parse_basic_auth(v));
    let result = match &creds {
        Some((user, pass)) => {
            hooks
                .authenticate(
                    monitor_id,
                    Some(RtspCredentials {
                        username: user,
                        password: pass,
                    }),
                )
                .await
        }
        None => hooks.authenticate(monitor_id, None).await,
    };
    result.is_ok()
}

fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let mut parts = header.splitn(2, ' ');
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let encoded = parts.next()?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

async fn run_record_loop(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    guard: PublisherGuard,
    video_transport: NegotiatedTransport,
    audio_transport: Option<NegotiatedTransport>,
    session_id: &str,
    idle_timeout: Duration,
) -> Result<()> {
    let video = guard.video();
    let audio = guard.audio();
    let cancel = guard.cancel_token();

    let video_channel = video_transport.as_interleaved().map(|c| c.rtp);
    let video_udp = video_transport.rtp_socket().cloned();
    let audio_channel = audio_transport.as_ref().and_then(|t| t.as_interleaved()).map(|c| c.rtp);
    let audio_udp = audio_transport.as_ref().and_then(|t| t.rtp_socket()).cloned();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            // Every interleaved RTP frame from the publisher also arrives
            // through `read_item`, so a camera that stops sending media
            // entirely is indistinguishable from an idle control channel;
            // the same `idle_timeout` closes both. A UDP publisher's
            // datagrams arrive on their own socket below and don't reset
            // this timer, so a stalled UDP feed still tears the session
            // down once the control connection itself goes quiet.
            item = tokio::time::timeout(idle_timeout, read_item(stream, buf)) => {
                let item = item.context("rtsp connection idle timeout")?;
                let Some(item) = item? else { return Ok(()) };
                match item {
                    Item::Frame { channel, data } => {
                        if Some(channel) == video_channel {
                            if let Ok(pkt) = RtpPacket::parse(data) {
                                if let Err(e) = video.lock().await.push_rtp(pkt) {
                                    warn!(session = %session_id, "video depacketize error: {}", e);
                                }
                            }
                        } else if Some(channel) == audio_channel {
                            if let Ok(pkt) = RtpPacket::parse(data) {
                                match depacketize_rtp_aus(&pkt.payload) {
                                    Ok(aus) => {
                                        let mut guard = audio.lock().await;
                                        if let Some(track) = guard.as_mut() {
                                            for au in aus {
                                                if let Err(e) = track.push_au(pkt.timestamp, au) {
                                                    warn!(session = %session_id, "audio push error: {}", e);
                                                }
                                            }
                                        }
                                    }
                                    Err(e) => warn!(session = %session_id, "aac depacketize error: {}", e),
                                }
                            }
                        }
                        // any other interleaved channel (RTCP) is read and discarded.
                    }
                    Item::Request { req, .. } => {
                        match req.method() {
                            Method::Teardown => {
                                send_response(stream, &req, StatusCode::Ok, Some(session_id), &[], Vec::new()).await?;
                                return Ok(());
                            }
                            Method::GetParameter | Method::SetParameter => {
                                send_response(stream, &req, StatusCode::Ok, Some(session_id), &[], Vec::new()).await?;
                            }
                            _ => {
                                send_response(stream, &req, StatusCode::MethodNotAllowed, Some(session_id), &[], Vec::new()).await?;
                            }
                        }
                    }
                }
            }
            pkt = recv_udp(video_udp.as_ref()) => {
                if let Some(Ok(data)) = pkt {
                    if let Ok(pkt) = RtpPacket::parse(data) {
                        if let Err(e) = video.lock().await.push_rtp(pkt) {
                            warn!(session = %session_id, "video depacketize error: {}", e);
                        }
                    }
                }
            }
            pkt = recv_udp(audio_udp.as_ref()) => {
                if let Some(Ok(data)) = pkt {
                    if let Ok(pkt) = RtpPacket::parse(data) {
                        match depacketize_rtp_aus(&pkt.payload) {
                            Ok(aus) => {
                                let mut guard = audio.lock().await;
                                if let Some(track) = guard.as_mut() {
                                    for au in aus {
                                        if let Err(e) = track.push_au(pkt.timestamp, au) {
                                            warn!(session = %session_id, "audio push error: {}", e);
                                        }
                                    }
                                }
                            }
                            Err(e) => warn!(session = %session_id, "aac depacketize error: {}", e),
                        }
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_play_loop(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    mut video_rx: tokio::sync::broadcast::Receiver<crate::codec::Sample>,
    video_transport: NegotiatedTransport,
    mut audio_rx: Option<tokio::sync::broadcast::Receiver<crate::codec::Sample>>,
    audio_transport: Option<NegotiatedTransport>,
    audio_clock_rate: u32,
    session_id: &str,
) -> Result<()> {
    use tokio::sync::broadcast::error::RecvError;

    let mut video_sender = RtpSender::new(sdp::VIDEO_PAYLOAD_TYPE);
    let mut audio_sender = RtpSender::new(sdp::AUDIO_PAYLOAD_TYPE);

    loop {
        tokio::select! {
            v = video_rx.recv() => {
                match v {
                    Ok(sample) => send_video_sample(stream, &sample, &video_transport, &mut video_sender).await?,
                    Err(RecvError::Lagged(n)) => warn!(session = %session_id, "play session lagged, dropped {} video samples", n),
                    Err(RecvError::Closed) => return Ok(()),
                }
            }
            a = recv_optional(&mut audio_rx) => {
                match a {
                    Some(Ok(sample)) => {
                        if let Some(transport) = &audio_transport {
                            let ts = rtp_timestamp_from_90k(sample.pts_90k, audio_clock_rate);
                            let payload = crate::codec::aac::packetize_rtp_au(&sample.data);
                            let packet = audio_sender.next(ts, true, &payload);
                            send_rtp(stream, transport, &packet).await?;
                        }
                    }
                    Some(Err(RecvError::Lagged(n))) => warn!(session = %session_id, "play session lagged, dropped {} audio samples", n),
                    Some(Err(RecvError::Closed)) | None => {}
                }
            }
            item = read_item(stream, buf) => {
                let Some(item) = item? else { return Ok(()) };
                if let Item::Request { req, .. } = item {
                    match req.method() {
                        Method::Teardown => {
                            send_response(stream, &req, StatusCode::Ok, Some(session_id), &[], Vec::new()).await?;
                            return Ok(());
                        }
                        Method::GetParameter | Method::SetParameter => {
                            send_response(stream, &req, StatusCode::Ok, Some(session_id), &[], Vec::new()).await?;
                        }
                        Method::Pause => {
                            send_response(stream, &req, StatusCode::Ok, Some(session_id), &[], Vec::new()).await?;
                        }
                        _ => {
                            send_response(stream, &req, StatusCode::MethodNotAllowed, Some(session_id), &[], Vec::new()).await?;
                        }
                    }
                }
            }
        }
    }
}

/// The video clock rate is always 90kHz on the wire; `Sample::pts_90k` is
/// already in that timescale, so the video egress path never rescales.
/// Audio samples are also stored in the crate's shared 90kHz timescale
/// (see `bus::track::rescale`), so to build the RTP timestamp for an AAC
/// packet (which must run at the stream's sampling frequency) it is
/// rescaled back down using the clock rate the PLAY handler looked up
/// from the path's `AudioSpecificConfig`.
fn rtp_timestamp_from_90k(pts_90k: i64, clock_rate: u32) -> u32 {
    if clock_rate == 90_000 {
        pts_90k as u32
    } else {
        ((pts_90k * clock_rate as i64) / 90_000) as u32
    }
}

async fn send_video_sample(
    stream: &mut TcpStream,
    sample: &crate::codec::Sample,
    transport: &NegotiatedTransport,
    sender: &mut RtpSender,
) -> Result<()> {
    let nals = split_avcc_nals(&sample.data);
    let ts = sample.pts_90k as u32;
    let last = nals.len().saturating_sub(1);
    for (i, nal) in nals.iter().enumerate() {
        let fragments = packetize_nal(nal, VIDEO_MTU);
        let frag_last = fragments.len().saturating_sub(1);
        for (j, fragment) in fragments.iter().enumerate() {
            let marker = i == last && j == frag_last;
            let packet = sender.next(ts, marker, fragment);
            send_rtp(stream, transport, &packet).await?;
        }
    }
    Ok(())
}

async fn recv_optional(
    rx: &mut Option<tokio::sync::broadcast::Receiver<crate::codec::Sample>>,
) -> Option<std::result::Result<crate::codec::Sample, tokio::sync::broadcast::error::RecvError>> {
    match rx {
        Some(r) => Some(r.recv().await),
        None => std::future::pending().await,
    }
}

/// Sends one RTP packet out over whichever transport SETUP negotiated for
/// this track: framed onto the control connection for interleaved, or as a
/// plain datagram to the already-connected UDP peer.
async fn send_rtp(stream: &mut TcpStream, transport: &NegotiatedTransport, data: &[u8]) -> Result<()> {
    match transport {
        NegotiatedTransport::Interleaved(c) => write_interleaved(stream, c.rtp, data).await,
        NegotiatedTransport::Udp(u) => {
            u.rtp_socket.send(data).await.context("udp rtp send failed")?;
            Ok(())
        }
    }
}

/// Awaits the next datagram on a track's UDP RTP socket, or never resolves
/// if that track has no UDP socket (interleaved transport, or no track at
/// all) so the `tokio::select!` arm simply never fires.
async fn recv_udp(socket: Option<&Arc<UdpSocket>>) -> Option<std::io::Result<Bytes>> {
    match socket {
        Some(sock) => {
            let mut buf = [0u8; 2048];
            match sock.recv(&mut buf).await {
                Ok(n) => Some(Ok(Bytes::copy_from_slice(&buf[..n]))),
                Err(e) => Some(Err(e)),
            }
        }
        None => std::future::pending().await,
    }
}

async fn write_interleaved(stream: &mut TcpStream, channel: u8, data: &[u8]) -> Result<()> {
    if data.len() > u16::MAX as usize {
        bail!("interleaved payload of {} bytes exceeds the 16 bit length field", data.len());
    }
    let mut framed = BytesMut::with_capacity(4 + data.len());
    framed.extend_from_slice(&[0x24, channel]);
    framed.extend_from_slice(&(data.len() as u16).to_be_bytes());
    framed.extend_from_slice(data);
    tokio::time::timeout(IO_TIMEOUT, stream.write_all(&framed))
        .await
        .context("rtsp write timed out")??;
    Ok(())
}

enum Item {
    Frame { channel: u8, data: Bytes },
    Request { req: Request<Vec<u8>>, body: Vec<u8> },
}

/// Reads the next complete item (an interleaved `$`-framed packet, or a
/// full RTSP request with its body already collected per Content-Length)
/// off the connection, filling `buf` with more bytes as needed.
async fn read_item(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<Option<Item>> {
    loop {
        if let Some(item) = try_take_item(buf)? {
            return Ok(Some(item));
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn try_take_item(buf: &mut BytesMut) -> Result<Option<Item>> {
    if buf.first() == Some(&0x24) {
        if buf.len() < 4 {
            return Ok(None);
        }
        let channel = buf[1];
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + len {
            return Ok(None);
        }
        buf.advance(4);
        let data = buf.split_to(len).freeze();
        return Ok(Some(Item::Frame { channel, data }));
    }

    let Some(header_end) = find_subslice(buf, b"\r\n\r\n").map(|p| p + 4) else {
        return Ok(None);
    };
    let content_length = parse_content_length(&buf[..header_end]);
    let total_len = header_end + content_length;
    if buf.len() < total_len {
        return Ok(None);
    }

    let raw = buf.split_to(total_len);
    let body = raw[header_end..].to_vec();
    let (message, consumed) =
        rtsp_types::Message::parse(&raw).map_err(|e| anyhow!("malformed rtsp message: {:?}", e))?;
    if consumed != raw.len() {
        bail!("trailing bytes after rtsp message");
    }
    match message {
        rtsp_types::Message::Request(req) => Ok(Some(Item::Request { req, body })),
        _ => bail!("expected an rtsp request, got a response/data message"),
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_content_length(header_bytes: &[u8]) -> usize {
    let text = String::from_utf8_lossy(header_bytes);
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

fn header_map(req: &Request<Vec<u8>>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in req.headers() {
        map.insert(name.to_string().to_ascii_lowercase(), value.to_string());
    }
    map
}

fn request_uri(req: &Request<Vec<u8>>) -> String {
    req.request_uri().map(|u| u.as_str().to_string()).unwrap_or_default()
}

fn last_path_segment(uri: &str) -> String {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(uri)
        .split('?')
        .next()
        .unwrap_or(uri)
        .to_string()
}

/// Recovers the monitor id from a SETUP request's URI, which for a
/// per-track SETUP ends in `/trackID=N` rather than the bare monitor path
/// that DESCRIBE/ANNOUNCE use. Only used before ANNOUNCE has recorded the
/// monitor id in `ConnState` (the egress DESCRIBE/SETUP/PLAY sequence).
fn monitor_id_from_setup_uri(uri: &str) -> String {
    let trimmed = uri.split('?').next().unwrap_or(uri).trim_end_matches('/');
    let mut segments: Vec<&str> = trimmed.rsplit('/').collect();
    if segments.first().is_some_and(|s| s.to_ascii_lowercase().starts_with("trackid=")) {
        segments.remove(0);
    }
    segments.first().map(|s| s.to_string()).unwrap_or_else(|| trimmed.to_string())
}

fn track_kind_from_trackid(uri: &str) -> TrackKind {
    let last = uri.rsplit('/').next().unwrap_or(uri);
    if last.eq_ignore_ascii_case("trackID=1") {
        TrackKind::Audio
    } else {
        TrackKind::Video
    }
}

fn track_kind_for_announce(uri: &str, announced: &AnnouncedMedia) -> TrackKind {
    let last = uri.rsplit('/').next().unwrap_or(uri);
    if let Some(audio_control) = &announced.audio_control {
        let audio_last = audio_control.rsplit('/').next().unwrap_or(audio_control);
        if audio_last.eq_ignore_ascii_case(last) {
            return TrackKind::Audio;
        }
    }
    TrackKind::Video
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_auth_header() {
        // "alice:hunter2" base64-encoded.
        let header = "Basic YWxpY2U6aHVudGVyMg==";
        let (user, pass) = parse_basic_auth(header).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "hunter2");
    }

    #[test]
    fn rejects_non_basic_auth_scheme() {
        assert!(parse_basic_auth("Digest username=\"alice\"").is_none());
    }

    #[test]
    fn rejects_malformed_base64() {
        assert!(parse_basic_auth("Basic not-valid-base64!!").is_none());
    }

    #[test]
    fn last_path_segment_strips_query_and_trailing_slash() {
        assert_eq!(last_path_segment("rtsp://host/front-door"), "front-door");
        assert_eq!(last_path_segment("rtsp://host/front-door/"), "front-door");
        assert_eq!(last_path_segment("rtsp://host/front-door?x=1"), "front-door");
    }

    #[test]
    fn parses_content_length_header_case_insensitively() {
        let raw = b"ANNOUNCE rtsp://x RTSP/1.0\r\nContent-Length: 42\r\nCSeq: 1\r\n\r\n";
        assert_eq!(parse_content_length(raw), 42);
    }

    #[test]
    fn missing_content_length_defaults_to_zero() {
        let raw = b"OPTIONS rtsp://x RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        assert_eq!(parse_content_length(raw), 0);
    }

    #[test]
    fn monitor_id_from_setup_uri_strips_trackid_segment() {
        assert_eq!(monitor_id_from_setup_uri("rtsp://host/front-door/trackID=0"), "front-door");
        assert_eq!(monitor_id_from_setup_uri("rtsp://host/front-door/trackID=1"), "front-door");
        assert_eq!(monitor_id_from_setup_uri("rtsp://host/front-door"), "front-door");
    }

    #[test]
    fn track_kind_from_trackid_distinguishes_audio_and_video() {
        assert!(matches!(
            track_kind_from_trackid("rtsp://host/cam/trackID=1"),
            TrackKind::Audio
        ));
        assert!(matches!(
            track_kind_from_trackid("rtsp://host/cam/trackID=0"),
            TrackKind::Video
        ));
    }

    #[test]
    fn rtp_timestamp_passes_through_at_90khz() {
        assert_eq!(rtp_timestamp_from_90k(90_000, 90_000), 90_000);
    }

    #[test]
    fn rtp_timestamp_rescales_to_audio_clock_rate() {
        // 90_000 ticks at the shared 90kHz timescale is exactly one
        // second, which at a 48kHz clock rate is 48_000 ticks.
        assert_eq!(rtp_timestamp_from_90k(90_000, 48_000), 48_000);
    }

    #[test]
    fn try_take_item_waits_for_a_complete_interleaved_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x24, 0x00, 0x00, 0x05]);
        buf.extend_from_slice(&[1, 2, 3]);
        assert!(try_take_item(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[4, 5]);
        let item = try_take_item(&mut buf).unwrap().unwrap();
        match item {
            Item::Frame { channel, data } => {
                assert_eq!(channel, 0x00);
                assert_eq!(&data[..], &[1, 2, 3, 4, 5]);
            }
            Item::Request { .. } => panic!("expected a frame"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn try_take_item_waits_for_full_request_body() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"ANNOUNCE rtsp://host/cam RTSP/1.0\r\nCSeq: 1\r\nContent-Length: 4\r\n\r\n");
        assert!(try_take_item(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"abcd");
        let item = try_take_item(&mut buf).unwrap().unwrap();
        match item {
            Item::Request { req, body } => {
                assert_eq!(req.method(), &Method::Announce);
                assert_eq!(body, b"abcd");
            }
            Item::Frame { .. } => panic!("expected a request"),
        }
        assert!(buf.is_empty());
    }
}

async fn send_response(
    stream: &mut TcpStream,
    req: &Request<Vec<u8>>,
    status: StatusCode,
    session_id: Option<&str>,
    extra_headers: &[(&str, String)],
    body: Vec<u8>,
) -> Result<()> {
    let headers = header_map(req);
    let cseq = headers.get("cseq").cloned().unwrap_or_else(|| "0".to_string());

    let mut builder = Response::builder(req.version(), status).header(rtsp_types::headers::CSEQ, cseq);
    if let Some(sid) = session_id {
        builder = builder.header(rtsp_types::headers::SESSION, sid.to_string());
    }
    for (name, value) in extra_headers {
        let header_name = rtsp_types::HeaderName::try_from(*name).map_err(|e| anyhow!("bad header name {}: {:?}", name, e))?;
        builder = builder.header(header_name, value.clone());
    }

    let response = builder.build(body);
    let mut data = Vec::new();
    response.write(&mut data).context("serializing rtsp response")?;
    tokio::time::timeout(IO_TIMEOUT, stream.write_all(&data))
        .await
        .context("rtsp write timed out")??;
    Ok(())
}
