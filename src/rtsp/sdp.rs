//! Builds the SDP body for DESCRIBE responses and parses the SDP body
//! carried in ANNOUNCE requests.
//!
//! Grounded on `build_sdp`/`parse_media` in
//! `mofeng-git-One-KVM/src/rtsp/service.rs` (the `sdp_types::Session`
//! struct literal shape, field by field) and
//! `scottlamb-moonfire-playground/rtsp/src/client/parse.rs` (extracting
//! `rtpmap`/`fmtp`/`control` attributes out of a parsed `MediaDescription`),
//! adapted from client-side DESCRIBE consumption to server-side
//! DESCRIBE production and ANNOUNCE consumption.

use anyhow::{bail, Context, Result};
use base64::Engine;
use bytes::Bytes;
use sdp_types::{Attribute, Connection, Media, Origin, Session, Time};

use crate::codec::aac::AudioSpecificConfig;
use crate::codec::h264::AvcParameters;

pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
pub const AUDIO_PAYLOAD_TYPE: u8 = 97;

/// What a successful ANNOUNCE parse yields.
pub struct AnnouncedMedia {
    pub avc: AvcParameters,
    pub video_control: Option<String>,
    pub aac: Option<(AudioSpecificConfig, Bytes)>,
    pub audio_control: Option<String>,
}

pub fn build_describe_sdp(
    session_name: &str,
    avc: &AvcParameters,
    aac: Option<(&AudioSpecificConfig, &Bytes)>,
) -> Result<String> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let sps_b64 = b64.encode(&avc.sps);
    let pps_b64 = b64.encode(&avc.pps);

    let mut medias = vec![Media {
        media: "video".to_string(),
        port: 0,
        num_ports: None,
        proto: "RTP/AVP".to_string(),
        fmt: VIDEO_PAYLOAD_TYPE.to_string(),
        media_title: None,
        connections: Vec::new(),
        bandwidths: Vec::new(),
        key: None,
        attributes: vec![
            Attribute {
                attribute: "rtpmap".to_string(),
                value: Some(format!("{VIDEO_PAYLOAD_TYPE} H264/90000")),
            },
            Attribute {
                attribute: "fmtp".to_string(),
                value: Some(format!(
                    "{VIDEO_PAYLOAD_TYPE} packetization-mode=1;profile-level-id={:02x}{:02x}{:02x};sprop-parameter-sets={},{}",
                    avc.profile_idc, avc.profile_compat, avc.level_idc, sps_b64, pps_b64
                )),
            },
            Attribute {
                attribute: "control".to_string(),
                value: Some("trackID=0".to_string()),
            },
        ],
    }];

    if let Some((cfg, raw)) = aac {
        medias.push(Media {
            media: "audio".to_string(),
            port: 0,
            num_ports: None,
            proto: "RTP/AVP".to_string(),
            fmt: AUDIO_PAYLOAD_TYPE.to_string(),
            media_title: None,
            connections: Vec::new(),
            bandwidths: Vec::new(),
            key: None,
            attributes: vec![
                Attribute {
                    attribute: "rtpmap".to_string(),
                    value: Some(format!(
                        "{AUDIO_PAYLOAD_TYPE} MPEG4-GENERIC/{}/{}",
                        cfg.sampling_frequency, cfg.channels
                    )),
                },
                Attribute {
                    attribute: "fmtp".to_string(),
                    value: Some(format!(
                        "{AUDIO_PAYLOAD_TYPE} streamtype=5;profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config={}",
                        hex::encode(raw)
                    )),
                },
                Attribute {
                    attribute: "control".to_string(),
                    value: Some("trackID=1".to_string()),
                },
            ],
        });
    }

    let session = Session {
        origin: Origin {
            username: Some("-".to_string()),
            sess_id: "0".to_string(),
            sess_version: 0,
            nettype: "IN".to_string(),
            addrtype: "IP4".to_string(),
            unicast_address: "0.0.0.0".to_string(),
        },
        session_name: session_name.to_string(),
        session_description: None,
        uri: None,
        emails: Vec::new(),
        phones: Vec::new(),
        connection: Some(Connection {
            nettype: "IN".to_string(),
            addrtype: "IP4".to_string(),
            connection_address: "0.0.0.0".to_string(),
        }),
        bandwidths: Vec::new(),
        times: vec![Time {
            start_time: 0,
            stop_time: 0,
            repeats: Vec::new(),
        }],
        time_zones: Vec::new(),
        key: None,
        attributes: vec![Attribute {
            attribute: "control".to_string(),
            value: Some("*".to_string()),
        }],
        medias,
    };

    let mut out = Vec::new();
    session.write(&mut out).context("writing sdp session")?;
    String::from_utf8(out).context("sdp output was not utf8")
}

/// Parses an ANNOUNCE body. Requires a video media with H.264
/// `sprop-parameter-sets`; an audio media, if present, must be
/// `MPEG4-GENERIC` with a `config=` fmtp parameter.
pub fn parse_announce_sdp(body: &[u8]) -> Result<AnnouncedMedia> {
    let session = Session::parse(body).context("parsing announce sdp")?;

    let video = session
        .medias
        .iter()
        .find(|m| m.media == "video")
        .context("announce sdp has no video media")?;
    if !video.proto.eq_ignore_ascii_case("RTP/AVP") && !video.proto.eq_ignore_ascii_case("RTP/AVP/TCP") {
        bail!("unsupported video media proto {}", video.proto);
    }

    let fmtp = attribute_value(&video.attributes, "fmtp").context("video media missing fmtp attribute")?;
    let sprop = fmtp_param(fmtp, "sprop-parameter-sets").context("fmtp missing sprop-parameter-sets")?;
    let (sps_b64, pps_b64) = sprop.split_once(',').context("sprop-parameter-sets missing a comma")?;
    let b64 = base64::engine::general_purpose::STANDARD;
    let sps = Bytes::from(b64.decode(sps_b64.trim()).context("decoding sprop sps")?);
    let pps = Bytes::from(b64.decode(pps_b64.trim()).context("decoding sprop pps")?);
    let avc = AvcParameters::from_sps_pps(sps, pps)?;
    let video_control = attribute_value(&video.attributes, "control").map(str::to_string);

    let mut aac = None;
    let mut audio_control = None;
    if let Some(audio) = session.medias.iter().find(|m| m.media == "audio") {
        let fmtp = attribute_value(&audio.attributes, "fmtp").context("audio media missing fmtp attribute")?;
        let config_hex = fmtp_param(fmtp, "config").context("fmtp missing config")?;
        let raw = Bytes::from(hex::decode(config_hex.trim()).context("decoding aac config hex")?);
        let cfg = AudioSpecificConfig::parse(&raw)?;
        aac = Some((cfg, raw));
        audio_control = attribute_value(&audio.attributes, "control").map(str::to_string);
    }

    Ok(AnnouncedMedia {
        avc,
        video_control,
        aac,
        audio_control,
    })
}

fn attribute_value<'a>(attrs: &'a [Attribute], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|a| a.attribute == name)
        .and_then(|a| a.value.as_deref())
}

/// Extracts one `key=value` parameter out of an `fmtp` attribute value
/// (`"<payload type> key=value;key=value;..."`).
fn fmtp_param<'a>(fmtp: &'a str, key: &str) -> Option<&'a str> {
    let params = fmtp.split_once(' ').map(|(_, rest)| rest).unwrap_or(fmtp);
    params.split(';').find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        (k.trim() == key).then(|| v.trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::AvcParameters;

    fn test_avc() -> AvcParameters {
        // A minimal but structurally valid baseline-profile SPS/PPS pair
        // (320x240), reused from the h264 module's own fixtures.
        let sps = Bytes::from_static(&[
            0x67, 0x42, 0x00, 0x0a, 0xe8, 0x83, 0x00, 0x2d, 0x08, 0x80, 0x00, 0x00, 0x03, 0x00, 0x80, 0x00, 0x00,
            0x1e, 0x2c, 0x5c, 0x90,
        ]);
        let pps = Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80]);
        AvcParameters::from_sps_pps(sps, pps).unwrap()
    }

    #[test]
    fn builds_and_parses_video_only_sdp() {
        let avc = test_avc();
        let text = build_describe_sdp("nvr", &avc, None).unwrap();
        let parsed = parse_announce_sdp(text.as_bytes()).unwrap();
        assert_eq!(parsed.avc.sps, avc.sps);
        assert_eq!(parsed.avc.pps, avc.pps);
        assert!(parsed.aac.is_none());
        assert_eq!(parsed.video_control.as_deref(), Some("trackID=0"));
    }

    #[test]
    fn builds_and_parses_sdp_with_audio() {
        let avc = test_avc();
        let aac_cfg = AudioSpecificConfig::parse(&[0x11, 0x88]).unwrap();
        let raw_config = Bytes::from_static(&[0x11, 0x88]);
        let text = build_describe_sdp("nvr", &avc, Some((&aac_cfg, &raw_config))).unwrap();
        let parsed = parse_announce_sdp(text.as_bytes()).unwrap();
        let (cfg, raw) = parsed.aac.expect("expected an audio media");
        assert_eq!(cfg, aac_cfg);
        assert_eq!(raw, raw_config);
        assert_eq!(parsed.audio_control.as_deref(), Some("trackID=1"));
    }

    #[test]
    fn fmtp_param_extracts_named_value() {
        let fmtp = "96 packetization-mode=1;sprop-parameter-sets=AAA,BBB";
        assert_eq!(fmtp_param(fmtp, "sprop-parameter-sets"), Some("AAA,BBB"));
        assert_eq!(fmtp_param(fmtp, "packetization-mode"), Some("1"));
        assert_eq!(fmtp_param(fmtp, "missing"), None);
    }
}
