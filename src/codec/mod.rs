//! Codec-level primitives: H.264 NAL handling, AAC `AudioSpecificConfig`,
//! and the fMP4 box writer both the HLS muxer and the recorder's on-demand
//! MP4 regeneration build on.

pub mod aac;
pub mod fmp4;
pub mod h264;

use bytes::Bytes;

/// One depacketized, presentation-ready access unit handed from the RTP
/// layer (or read back off disk) to the stream bus / muxers. `AVCC` for
/// video (NAL units length-prefixed, see `remux`), raw AAC "raw_data_block"
/// bytes for audio.
#[derive(Clone, Debug)]
pub struct Sample {
    pub pts_90k: i64,
    pub dts_90k: i64,
    pub is_sync: bool,
    pub data: Bytes,
    /// Video track's active parameter set as of this sample, carried so
    /// a downstream muxer can detect an SPS/PPS change and regenerate its
    /// init segment without keeping its own copy of the bus's state.
    /// `None` for audio samples.
    pub avc_params: Option<h264::AvcParameters>,
}

/// Reassembles a sequence of NAL units from one access unit into an AVCC
/// (length-prefixed) sample, stripping AUD delimiters and any in-band
/// SPS/PPS, and injecting the track's current SPS+PPS immediately before
/// every IDR slice. This is the "NALU remux" step the stream bus performs
/// on every access unit before it reaches the HLS muxer or recorder.
pub fn remux_access_unit(nals: &[Bytes], sps: &Bytes, pps: &Bytes) -> Bytes {
    use bytes::{BufMut, BytesMut};

    let is_idr = nals
        .iter()
        .filter_map(|n| h264::nal_type(n))
        .any(h264::is_idr);

    let mut out = BytesMut::new();
    if is_idr {
        out.put_u32(sps.len() as u32);
        out.extend_from_slice(sps);
        out.put_u32(pps.len() as u32);
        out.extend_from_slice(pps);
    }

    for nal in nals {
        let Some(t) = h264::nal_type(nal) else {
            continue;
        };
        // AUD (9), SPS (7), PPS (8) are stripped: AUD carries no payload
        // information we keep, and SPS/PPS are only ever emitted from the
        // track's own current parameter set, immediately above, so stray
        // in-band copies (common with cameras that resend them every IDR)
        // would otherwise duplicate them.
        if matches!(t, 7 | 8 | 9) {
            continue;
        }
        out.put_u32(nal.len() as u32);
        out.extend_from_slice(nal);
    }

    out.freeze()
}

/// Splits an AVCC (4-byte length-prefixed) sample back into individual
/// NAL units, for the RTSP server's PLAY/egress side which has to
/// re-packetize into RTP rather than replay the original camera packets.
pub fn split_avcc_nals(data: &Bytes) -> Vec<Bytes> {
    let mut out = Vec::new();
    let mut rest = data.clone();
    while rest.len() >= 4 {
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = rest.slice(4..);
        if len > rest.len() {
            break;
        }
        out.push(rest.slice(0..len));
        rest = rest.slice(len..);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_sps_pps_before_idr_and_strips_stray_copies() {
        let sps = Bytes::from_static(&[0x67, 1, 2, 3]);
        let pps = Bytes::from_static(&[0x68, 4, 5]);
        let stray_sps = Bytes::from_static(&[0x67, 9, 9, 9]);
        let idr = Bytes::from_static(&[0x65, 0xaa, 0xbb]);
        let aud = Bytes::from_static(&[0x09, 0xf0]);

        let out = remux_access_unit(&[aud, stray_sps, idr.clone()], &sps, &pps);

        let mut expected = Vec::new();
        expected.extend_from_slice(&(sps.len() as u32).to_be_bytes());
        expected.extend_from_slice(&sps);
        expected.extend_from_slice(&(pps.len() as u32).to_be_bytes());
        expected.extend_from_slice(&pps);
        expected.extend_from_slice(&(idr.len() as u32).to_be_bytes());
        expected.extend_from_slice(&idr);

        assert_eq!(out.as_ref(), expected.as_slice());
    }

    #[test]
    fn non_idr_access_units_carry_no_parameter_sets() {
        let sps = Bytes::from_static(&[0x67, 1]);
        let pps = Bytes::from_static(&[0x68, 2]);
        let p_slice = Bytes::from_static(&[0x61, 0xaa]);

        let out = remux_access_unit(&[p_slice.clone()], &sps, &pps);

        let mut expected = Vec::new();
        expected.extend_from_slice(&(p_slice.len() as u32).to_be_bytes());
        expected.extend_from_slice(&p_slice);
        assert_eq!(out.as_ref(), expected.as_slice());
    }

    #[test]
    fn split_avcc_nals_recovers_the_original_units() {
        let sps = Bytes::from_static(&[0x67, 1, 2, 3]);
        let pps = Bytes::from_static(&[0x68, 4, 5]);
        let idr = Bytes::from_static(&[0x65, 0xaa, 0xbb]);

        let remuxed = remux_access_unit(&[idr.clone()], &sps, &pps);
        let nals = split_avcc_nals(&remuxed);
        assert_eq!(nals, vec![sps, pps, idr]);
    }
}
