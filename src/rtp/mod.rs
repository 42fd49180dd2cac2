//! Minimal RTP (RFC 3550) packet parsing, just enough of the header to
//! drive depacketization: sequence number, timestamp, marker bit, and
//! payload. Header extensions and CSRC lists are skipped over, not
//! interpreted (no component currently needs them).

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.len() < 12 {
            bail!("rtp packet shorter than the fixed 12 byte header");
        }
        let b0 = data[0];
        let version = b0 >> 6;
        if version != 2 {
            bail!("unsupported rtp version {}", version);
        }
        let has_padding = b0 & 0x20 != 0;
        let has_extension = b0 & 0x10 != 0;
        let csrc_count = (b0 & 0x0f) as usize;

        let b1 = data[1];
        let marker = b1 & 0x80 != 0;
        let payload_type = b1 & 0x7f;

        data.advance(2);
        let sequence_number = data.get_u16();
        let timestamp = data.get_u32();
        let ssrc = data.get_u32();

        let csrc_bytes = csrc_count * 4;
        if data.remaining() < csrc_bytes {
            bail!("rtp packet truncated in csrc list");
        }
        data.advance(csrc_bytes);

        if has_extension {
            if data.remaining() < 4 {
                bail!("rtp packet truncated in extension header");
            }
            data.advance(2); // profile-specific id
            let ext_len_words = data.get_u16() as usize;
            let ext_bytes = ext_len_words * 4;
            if data.remaining() < ext_bytes {
                bail!("rtp packet truncated in extension data");
            }
            data.advance(ext_bytes);
        }

        let mut payload = data;
        if has_padding {
            let pad_len = *payload.last().ok_or_else(|| {
                anyhow::anyhow!("rtp packet has the padding bit set but no payload")
            })? as usize;
            if pad_len == 0 || pad_len > payload.len() {
                bail!("invalid rtp padding length {}", pad_len);
            }
            payload = payload.slice(0..payload.len() - pad_len);
        }

        Ok(Self {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            payload,
        })
    }
}

/// Marshals a single RTP packet (fixed 12 byte header, no extensions,
/// padding or CSRC list) for the RTSP server's PLAY/egress side.
pub fn marshal(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32, marker: bool, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(12 + payload.len());
    out.put_u8(0x80);
    out.put_u8(if marker { 0x80 | payload_type } else { payload_type });
    out.put_u16(sequence_number);
    out.put_u32(timestamp);
    out.put_u32(ssrc);
    out.extend_from_slice(payload);
    out.freeze()
}

/// Per-session, per-track sequence number bookkeeping for egress RTP.
/// One instance per subscribed track (video, audio) per PLAY session.
pub struct RtpSender {
    payload_type: u8,
    ssrc: u32,
    sequence_number: u16,
}

impl RtpSender {
    pub fn new(payload_type: u8) -> Self {
        Self {
            payload_type,
            ssrc: rand::random(),
            sequence_number: rand::random(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Marshals the next packet in sequence, bumping the sequence number.
    pub fn next(&mut self, timestamp: u32, marker: bool, payload: &[u8]) -> Bytes {
        let seq = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        marshal(self.payload_type, seq, timestamp, self.ssrc, marker, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn marshal_then_parse_roundtrips() {
        let wire = marshal(96, 1000, 90_000, 0xdead_beef, true, &[1, 2, 3, 4]);
        let parsed = RtpPacket::parse(wire).unwrap();
        assert_eq!(parsed.payload_type, 96);
        assert_eq!(parsed.sequence_number, 1000);
        assert_eq!(parsed.timestamp, 90_000);
        assert_eq!(parsed.ssrc, 0xdead_beef);
        assert!(parsed.marker);
        assert_eq!(parsed.payload.as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn rtp_sender_increments_sequence_number() {
        let mut sender = RtpSender::new(97);
        let first = sender.next(0, false, &[0xaa]);
        let second = sender.next(160, true, &[0xbb]);
        let p1 = RtpPacket::parse(first).unwrap();
        let p2 = RtpPacket::parse(second).unwrap();
        assert_eq!(p2.sequence_number, p1.sequence_number.wrapping_add(1));
        assert_eq!(p1.ssrc, p2.ssrc);
    }

    fn build_packet(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(0x80); // version 2, no padding/extension/csrc
        b.put_u8(if marker { 0x80 | 96 } else { 96 });
        b.put_u16(seq);
        b.put_u32(ts);
        b.put_u32(0x1234_5678);
        b.extend_from_slice(payload);
        b.freeze()
    }

    #[test]
    fn parses_fixed_header_and_payload() {
        let pkt = build_packet(100, 90000, true, &[1, 2, 3]);
        let parsed = RtpPacket::parse(pkt).unwrap();
        assert_eq!(parsed.sequence_number, 100);
        assert_eq!(parsed.timestamp, 90000);
        assert!(parsed.marker);
        assert_eq!(parsed.payload.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn rejects_short_packets() {
        assert!(RtpPacket::parse(Bytes::from_static(&[0; 4])).is_err());
    }
}
