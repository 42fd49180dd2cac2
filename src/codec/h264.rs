//! H.264 NAL unit handling: SPS/PPS parsing, AVCDecoderConfiguration
//! marshalling, and the RTP (RFC 6184) depacketizer/packetizer.
//!
//! Modeled on the RTP depacketization state machine in
//! `scottlamb-moonfire-playground/rtsp/src/client/video/h264.rs` (single
//! NAL, STAP-A aggregation, FU-A fragmentation), adapted for server-side
//! ingest: the camera is the RTP sender, this crate is the receiver.

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use h264_reader::nal::sps::SeqParameterSet;
use h264_reader::nal::{Nal, NalHeader, UnitType};
use h264_reader::rbsp::BitReader;

const NAL_HEADER_F_BIT: u8 = 0x80;
const NAL_TYPE_MASK: u8 = 0x1f;

const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

/// Parsed `sprop-parameter-sets` / in-band SPS+PPS pair, plus the derived
/// AVCDecoderConfigurationRecord (ISO/IEC 14496-15 §5.2.4.1) used both as
/// the fMP4 `avcC` box payload and as the blob stored in the `.meta` file
/// header for a track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvcParameters {
    pub sps: Bytes,
    pub pps: Bytes,
    pub width: u32,
    pub height: u32,
    pub profile_idc: u8,
    pub profile_compat: u8,
    pub level_idc: u8,
}

impl AvcParameters {
    pub fn from_sps_pps(sps: Bytes, pps: Bytes) -> Result<Self> {
        if sps.is_empty() || (sps[0] & NAL_TYPE_MASK) != UnitType::SeqParameterSet.id() {
            bail!("sps nal has the wrong nal_unit_type");
        }
        if pps.is_empty() || (pps[0] & NAL_TYPE_MASK) != UnitType::PicParameterSet.id() {
            bail!("pps nal has the wrong nal_unit_type");
        }

        let rbsp = decode_rbsp(&sps[1..]);
        let parsed = SeqParameterSet::from_bits(BitReader::new(rbsp.as_slice()))
            .map_err(|e| anyhow::anyhow!("invalid sps: {:?}", e))?;
        let (width, height) = parsed
            .pixel_dimensions()
            .map_err(|e| anyhow::anyhow!("sps has no usable pixel dimensions: {:?}", e))?;

        Ok(Self {
            profile_idc: sps[1],
            profile_compat: sps[2],
            level_idc: sps[3],
            width,
            height,
            sps,
            pps,
        })
    }

    /// `avc1.PPCCLL` codec string for the HLS `CODECS` attribute.
    pub fn rfc6381_codec(&self) -> String {
        format!(
            "avc1.{:02x}{:02x}{:02x}",
            self.profile_idc, self.profile_compat, self.level_idc
        )
    }

    /// ISO/IEC 14496-15 AVCDecoderConfigurationRecord: used verbatim as the
    /// payload of the fMP4 `avcC` box and as the stored track header in the
    /// `.meta` file.
    pub fn avc_decoder_configuration_record(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(11 + self.sps.len() + self.pps.len());
        out.put_u8(1); // configurationVersion
        out.put_u8(self.profile_idc);
        out.put_u8(self.profile_compat);
        out.put_u8(self.level_idc);
        out.put_u8(0xff); // reserved (6 bits) | lengthSizeMinusOne = 3
        out.put_u8(0xe1); // reserved (3 bits) | numOfSequenceParameterSets = 1
        out.put_u16(self.sps.len() as u16);
        out.extend_from_slice(&self.sps);
        out.put_u8(1); // numOfPictureParameterSets
        out.put_u16(self.pps.len() as u16);
        out.extend_from_slice(&self.pps);
        out.freeze()
    }
}

/// Strips H.264 RBSP emulation-prevention bytes (0x03 after 0x00 0x00) so
/// the parser sees the raw bitstream H264Reader's SPS parser expects.
fn decode_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zero_run = 0u8;
    for &b in data {
        if zero_run >= 2 && b == 0x03 {
            zero_run = 0;
            continue;
        }
        out.push(b);
        if b == 0 {
            zero_run += 1;
        } else {
            zero_run = 0;
        }
    }
    out
}

pub fn is_idr(nal_type: u8) -> bool {
    nal_type == UnitType::SliceLayerWithoutPartitioningIdr.id()
}

pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & NAL_TYPE_MASK)
}

/// Outcome of feeding one RTP packet into the depacketizer.
pub enum DepacketizeOutcome {
    /// More packets are needed before an access unit is complete.
    Buffering,
    /// A complete access unit (one or more NAL units sharing the same RTP
    /// timestamp) is ready.
    AccessUnit(AccessUnit),
}

pub struct AccessUnit {
    pub rtp_timestamp: u32,
    pub nals: Vec<Bytes>,
}

impl AccessUnit {
    pub fn is_random_access_point(&self) -> bool {
        self.nals
            .iter()
            .filter_map(|n| nal_type(n))
            .any(is_idr)
    }
}

enum FragmentState {
    None,
    InProgress { nal_header: u8, buf: BytesMut },
}

/// RFC 6184 depacketizer. One instance per RTP stream (one per camera main
/// or sub track).
pub struct Depacketizer {
    current: Vec<Bytes>,
    current_ts: Option<u32>,
    fragment: FragmentState,
}

impl Default for Depacketizer {
    fn default() -> Self {
        Self {
            current: Vec::new(),
            current_ts: None,
            fragment: FragmentState::None,
        }
    }
}

impl Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `marker` is the RTP marker bit; H.264 payloaders set it on the last
    /// packet of an access unit.
    pub fn push(&mut self, timestamp: u32, marker: bool, mut payload: Bytes) -> Result<DepacketizeOutcome> {
        if payload.is_empty() {
            bail!("empty rtp payload");
        }

        if let Some(cur) = self.current_ts {
            if cur != timestamp && !matches!(self.fragment, FragmentState::None) {
                bail!("timestamp changed mid-fragment");
            }
        }
        self.current_ts = Some(timestamp);

        let header = payload[0];
        if header & NAL_HEADER_F_BIT != 0 {
            bail!("nal forbidden_zero_bit set");
        }
        let nal_t = header & NAL_TYPE_MASK;

        match nal_t {
            1..=23 => {
                self.current.push(payload);
            }
            NAL_TYPE_STAP_A => {
                payload.advance(1);
                while payload.remaining() >= 2 {
                    let len = payload.get_u16() as usize;
                    if payload.remaining() < len {
                        bail!("stap-a sub-nal length exceeds payload");
                    }
                    self.current.push(payload.split_to(len));
                }
            }
            NAL_TYPE_FU_A => {
                if payload.len() < 2 {
                    bail!("fu-a payload too short");
                }
                let fu_indicator = payload[0];
                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let reserved = fu_header & 0x20 != 0;
                if reserved || (start && end) {
                    bail!("invalid fu-a header (start={} end={} reserved)", start, end);
                }
                let reconstructed_nal_header =
                    (fu_indicator & 0xe0) | (fu_header & NAL_TYPE_MASK);

                match (&mut self.fragment, start) {
                    (FragmentState::None, true) => {
                        let mut buf = BytesMut::with_capacity(payload.len());
                        buf.put_u8(reconstructed_nal_header);
                        buf.extend_from_slice(&payload[2..]);
                        if end {
                            self.current.push(buf.freeze());
                            self.fragment = FragmentState::None;
                        } else {
                            self.fragment = FragmentState::InProgress {
                                nal_header: reconstructed_nal_header,
                                buf,
                            };
                        }
                    }
                    (FragmentState::InProgress { nal_header, buf }, false) => {
                        if *nal_header != reconstructed_nal_header {
                            bail!("fu-a nal header changed mid-fragment");
                        }
                        buf.extend_from_slice(&payload[2..]);
                        if end {
                            let FragmentState::InProgress { buf, .. } =
                                std::mem::replace(&mut self.fragment, FragmentState::None)
                            else {
                                unreachable!()
                            };
                            self.current.push(buf.freeze());
                        }
                    }
                    (FragmentState::None, false) => {
                        // A continuation with nothing in progress means the
                        // start packet was lost upstream; there's no NAL to
                        // recover, so drop this packet and wait for the next
                        // fragment's start rather than erroring the stream.
                    }
                    (FragmentState::InProgress { .. }, true) => {
                        // The previous fragment never saw its end packet;
                        // discard it and start fresh from this packet rather
                        // than erroring the whole access unit.
                        let mut buf = BytesMut::with_capacity(payload.len());
                        buf.put_u8(reconstructed_nal_header);
                        buf.extend_from_slice(&payload[2..]);
                        if end {
                            self.current.push(buf.freeze());
                            self.fragment = FragmentState::None;
                        } else {
                            self.fragment = FragmentState::InProgress {
                                nal_header: reconstructed_nal_header,
                                buf,
                            };
                        }
                    }
                }
            }
            25..=27 | 29 => bail!("unsupported nal aggregation type {}", nal_t),
            _ => bail!("unsupported/reserved nal type {}", nal_t),
        }

        if marker {
            if !matches!(self.fragment, FragmentState::None) {
                bail!("rtp marker set while a fu-a fragment is still in progress");
            }
            let nals = std::mem::take(&mut self.current);
            self.current_ts = None;
            if nals.is_empty() {
                bail!("marker bit set but no nal units were accumulated");
            }
            return Ok(DepacketizeOutcome::AccessUnit(AccessUnit {
                rtp_timestamp: timestamp,
                nals,
            }));
        }

        Ok(DepacketizeOutcome::Buffering)
    }
}

/// Maximum single-NAL RTP payload size before FU-A fragmentation kicks in.
/// Chosen conservatively below common Ethernet MTU minus IP/UDP/RTP headers.
pub const DEFAULT_MTU: usize = 1400;

/// Splits a single NAL unit into RTP payloads (single-NAL or FU-A),
/// for the egress side of the RTSP server (PLAY).
pub fn packetize_nal(nal: &Bytes, mtu: usize) -> Vec<Bytes> {
    if nal.len() <= mtu || nal.is_empty() {
        return vec![nal.clone()];
    }

    let header = nal[0];
    let fu_indicator = (header & 0xe0) | NAL_TYPE_FU_A;
    let nal_type = header & NAL_TYPE_MASK;
    let mut rest = &nal[1..];
    let mut out = Vec::new();
    let chunk_size = mtu - 2;
    let mut first = true;

    while !rest.is_empty() {
        let take = chunk_size.min(rest.len());
        let (chunk, remainder) = rest.split_at(take);
        let is_last = remainder.is_empty();

        let mut fu_header = nal_type;
        if first {
            fu_header |= 0x80;
        }
        if is_last {
            fu_header |= 0x40;
        }

        let mut payload = BytesMut::with_capacity(2 + chunk.len());
        payload.put_u8(fu_indicator);
        payload.put_u8(fu_header);
        payload.extend_from_slice(chunk);
        out.push(payload.freeze());

        rest = remainder;
        first = false;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub_nal(bytes: &[u8]) -> Bytes {
        Bytes::copy_from_slice(bytes)
    }

    #[test]
    fn depacketizes_single_nal_access_unit() {
        let mut d = Depacketizer::new();
        let nal = sub_nal(&[0x65, 1, 2, 3]); // IDR slice
        match d.push(1000, true, nal.clone()).unwrap() {
            DepacketizeOutcome::AccessUnit(au) => {
                assert_eq!(au.rtp_timestamp, 1000);
                assert_eq!(au.nals, vec![nal]);
                assert!(au.is_random_access_point());
            }
            DepacketizeOutcome::Buffering => panic!("expected a complete access unit"),
        }
    }

    #[test]
    fn reassembles_fu_a_fragments() {
        let mut d = Depacketizer::new();
        // Original NAL: header 0x65 (IDR), payload [0xaa; 300]
        let fu_indicator = 0x60 | NAL_TYPE_FU_A; // nal_ref_idc bits + FU-A
        let start = sub_nal(&[fu_indicator, 0x80 | 0x05, 0xaa, 0xaa]);
        let mid = sub_nal(&[fu_indicator, 0x05, 0xbb, 0xbb]);
        let end = sub_nal(&[fu_indicator, 0x40 | 0x05, 0xcc, 0xcc]);

        assert!(matches!(
            d.push(2000, false, start).unwrap(),
            DepacketizeOutcome::Buffering
        ));
        assert!(matches!(
            d.push(2000, false, mid).unwrap(),
            DepacketizeOutcome::Buffering
        ));
        match d.push(2000, true, end).unwrap() {
            DepacketizeOutcome::AccessUnit(au) => {
                assert_eq!(au.nals.len(), 1);
                let reconstructed = &au.nals[0];
                assert_eq!(reconstructed[0] & NAL_TYPE_MASK, 5);
                assert_eq!(&reconstructed[1..], &[0xaa, 0xaa, 0xbb, 0xbb, 0xcc, 0xcc]);
            }
            DepacketizeOutcome::Buffering => panic!("expected a complete access unit"),
        }
    }

    #[test]
    fn fu_a_continuation_without_start_is_dropped_not_an_error() {
        let mut d = Depacketizer::new();
        let fu_indicator = 0x60 | NAL_TYPE_FU_A;
        let mid = sub_nal(&[fu_indicator, 0x05, 0xaa]);
        assert!(matches!(
            d.push(3000, false, mid).unwrap(),
            DepacketizeOutcome::Buffering
        ));

        // A clean fragment afterwards still reassembles correctly; the
        // dropped continuation left no stale state behind.
        let start = sub_nal(&[fu_indicator, 0x80 | 0x05, 0x11]);
        let end = sub_nal(&[fu_indicator, 0x40 | 0x05, 0x22]);
        assert!(matches!(
            d.push(3000, false, start).unwrap(),
            DepacketizeOutcome::Buffering
        ));
        match d.push(3000, true, end).unwrap() {
            DepacketizeOutcome::AccessUnit(au) => {
                assert_eq!(au.nals.len(), 1);
                assert_eq!(&au.nals[0][1..], &[0x11, 0x22]);
            }
            DepacketizeOutcome::Buffering => panic!("expected a complete access unit"),
        }
    }

    #[test]
    fn fu_a_start_while_fragment_in_progress_discards_the_stale_one() {
        let mut d = Depacketizer::new();
        let fu_indicator = 0x60 | NAL_TYPE_FU_A;
        let stale_start = sub_nal(&[fu_indicator, 0x80 | 0x05, 0xaa]);
        assert!(matches!(
            d.push(4000, false, stale_start).unwrap(),
            DepacketizeOutcome::Buffering
        ));

        // A new start arrives before the stale fragment ever saw an end.
        let fresh_start = sub_nal(&[fu_indicator, 0x80 | 0x05, 0x11]);
        let fresh_end = sub_nal(&[fu_indicator, 0x40 | 0x05, 0x22]);
        assert!(matches!(
            d.push(4000, false, fresh_start).unwrap(),
            DepacketizeOutcome::Buffering
        ));
        match d.push(4000, true, fresh_end).unwrap() {
            DepacketizeOutcome::AccessUnit(au) => {
                assert_eq!(au.nals.len(), 1);
                assert_eq!(&au.nals[0][1..], &[0x11, 0x22]);
            }
            DepacketizeOutcome::Buffering => panic!("expected a complete access unit"),
        }
    }

    #[test]
    fn packetize_then_depacketize_roundtrips_a_large_nal() {
        let mut nal = vec![0x65u8];
        nal.extend((0..4000u32).map(|i| (i % 251) as u8));
        let nal = Bytes::from(nal);

        let payloads = packetize_nal(&nal, DEFAULT_MTU);
        assert!(payloads.len() > 1);

        let mut d = Depacketizer::new();
        let mut out = None;
        let n = payloads.len();
        for (i, p) in payloads.into_iter().enumerate() {
            let marker = i == n - 1;
            match d.push(42, marker, p).unwrap() {
                DepacketizeOutcome::AccessUnit(au) => out = Some(au),
                DepacketizeOutcome::Buffering => {}
            }
        }
        let au = out.expect("should have completed an access unit");
        assert_eq!(au.nals.len(), 1);
        assert_eq!(au.nals[0], nal);
    }
}
