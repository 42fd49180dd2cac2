use std::sync::Mutex;

use anyhow::{bail, Result};
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::codec::h264::{AvcParameters, Depacketizer as H264Depacketizer, DepacketizeOutcome};
use crate::codec::{remux_access_unit, Sample};
use crate::rtp::RtpPacket;

/// Backlog depth for a track's broadcast channel. A slow subscriber (a
/// stalled HLS muxer write, a recorder behind on disk I/O) drops the
/// oldest samples rather than back-pressuring the whole bus; see the
/// back-pressure policy in the design notes.
const CHANNEL_CAPACITY: usize = 256;

/// Synthesizes a monotonic decode-order clock from a stream of (possibly
/// non-monotonic, once B-frame reordering is in play) presentation
/// timestamps.
///
/// RTP/H.264 encoders transmit NAL units in decode order, so arrival order
/// already *is* DTS order; what's missing is a per-sample decode timestamp
/// to pair with it. This tracks the smallest positive gap seen between
/// consecutive arrivals (the nominal frame interval) and steps a synthetic
/// clock by that amount on every sample, so `dts_90k` stays strictly
/// increasing even when `pts_90k` jumps backwards for a reordered B-frame.
struct DtsClock {
    last_pts_90k: Option<i64>,
    interval_90k: i64,
    next_dts_90k: Option<i64>,
}

impl DtsClock {
    /// 90kHz/30fps nominal interval, refined downward as soon as a smaller
    /// positive gap between consecutive access units is observed.
    const DEFAULT_INTERVAL_90K: i64 = 3_000;

    fn new() -> Self {
        Self {
            last_pts_90k: None,
            interval_90k: Self::DEFAULT_INTERVAL_90K,
            next_dts_90k: None,
        }
    }

    fn next(&mut self, pts_90k: i64) -> i64 {
        if let Some(last) = self.last_pts_90k {
            let delta = pts_90k - last;
            if delta > 0 {
                self.interval_90k = self.interval_90k.min(delta);
            }
        }
        self.last_pts_90k = Some(pts_90k);

        let dts = match self.next_dts_90k {
            Some(prev) => prev + self.interval_90k,
            None => pts_90k,
        };
        self.next_dts_90k = Some(dts);
        dts
    }
}

/// Depacketizes an H.264 RTP stream into remuxed AVCC samples and fans
/// them out to every subscriber (HLS muxer, recorder, future consumers).
///
/// One owned unit of state per track, an inbound stream of raw RTP, and a
/// broadcast to every registered egress; no transcoding happens on the way
/// through, only depacketization and remux into AVCC framing.
pub struct VideoTrack {
    depacketizer: H264Depacketizer,
    params: Mutex<Option<AvcParameters>>,
    tx: broadcast::Sender<Sample>,
    clock_rate: u32,
    dts_clock: DtsClock,
}

impl VideoTrack {
    pub fn new(clock_rate: u32, initial: Option<AvcParameters>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            depacketizer: H264Depacketizer::new(),
            params: Mutex::new(initial),
            tx,
            clock_rate,
            dts_clock: DtsClock::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Sample> {
        self.tx.subscribe()
    }

    pub fn current_params(&self) -> Option<AvcParameters> {
        self.params.lock().unwrap().clone()
    }

    /// Feeds one RTP packet in. On marker-bit access-unit completion,
    /// updates the current SPS/PPS if the access unit carried a fresh
    /// pair, remuxes the access unit's NAL units against the (now
    /// current) parameter set, and broadcasts the result.
    pub fn push_rtp(&mut self, pkt: RtpPacket) -> Result<()> {
        let outcome = self
            .depacketizer
            .push(pkt.timestamp, pkt.marker, pkt.payload)?;

        let DepacketizeOutcome::AccessUnit(au) = outcome else {
            return Ok(());
        };

        if let Some((sps, pps)) = extract_sps_pps(&au.nals) {
            match AvcParameters::from_sps_pps(sps, pps) {
                Ok(new_params) => {
                    let mut guard = self.params.lock().unwrap();
                    if guard.as_ref() != Some(&new_params) {
                        trace!(
                            width = new_params.width,
                            height = new_params.height,
                            "sps/pps changed"
                        );
                        *guard = Some(new_params);
                    }
                }
                Err(e) => warn!("dropping unparseable sps/pps: {}", e),
            }
        }

        let params = self.params.lock().unwrap().clone();
        let Some(params) = params else {
            // No parameter set yet (camera hasn't sent sprop-parameter-sets
            // or an in-band SPS/PPS); can't remux without one to inject
            // ahead of the next IDR, so the access unit is dropped.
            return Ok(());
        };

        let data = remux_access_unit(&au.nals, &params.sps, &params.pps);
        let pts_90k = rescale(au.rtp_timestamp, self.clock_rate);
        let dts_90k = self.dts_clock.next(pts_90k);
        let is_sync = au.is_random_access_point();

        let sample = Sample {
            pts_90k,
            dts_90k,
            is_sync,
            data,
            avc_params: Some(params),
        };

        // A send error only means there are currently no subscribers;
        // that's normal immediately after a publisher (re)connects before
        // the path has wired up its HLS muxer / recorder.
        let _ = self.tx.send(sample);
        Ok(())
    }
}

fn extract_sps_pps(nals: &[Bytes]) -> Option<(Bytes, Bytes)> {
    let mut sps = None;
    let mut pps = None;
    for nal in nals {
        match crate::codec::h264::nal_type(nal) {
            Some(7) => sps = Some(nal.clone()),
            Some(8) => pps = Some(nal.clone()),
            _ => {}
        }
    }
    match (sps, pps) {
        (Some(s), Some(p)) => Some((s, p)),
        _ => None,
    }
}

/// Rescales an RTP timestamp (in the track's own clock rate, typically
/// 90kHz for H.264) into the 90kHz timescale this crate stores everywhere
/// downstream (the `.meta` format, the fMP4 muxer).
fn rescale(rtp_ts: u32, clock_rate: u32) -> i64 {
    if clock_rate == 90_000 {
        rtp_ts as i64
    } else {
        (rtp_ts as i64 * 90_000) / clock_rate as i64
    }
}

/// Depacketizes an AAC RTP stream (RFC 3640 AAC-hbr) into raw AAC frames
/// and fans them out the same way `VideoTrack` does.
pub struct AudioTrack {
    config: crate::codec::aac::AudioSpecificConfig,
    raw_config: Bytes,
    tx: broadcast::Sender<Sample>,
    clock_rate: u32,
}

impl AudioTrack {
    pub fn new(
        config: crate::codec::aac::AudioSpecificConfig,
        raw_config: Bytes,
        clock_rate: u32,
    ) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            config,
            raw_config,
            tx,
            clock_rate,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Sample> {
        self.tx.subscribe()
    }

    pub fn raw_config(&self) -> Bytes {
        self.raw_config.clone()
    }

    pub fn config(&self) -> crate::codec::aac::AudioSpecificConfig {
        self.config
    }

    /// Pushes one already-depacketized AAC access unit (the RTP AU-header
    /// handling lives closer to the RTSP session, which demultiplexes
    /// au-headers against au-data before handing frames here one at a
    /// time; see `rtsp::session`).
    pub fn push_au(&mut self, timestamp: u32, data: Bytes) -> Result<()> {
        if data.is_empty() {
            bail!("empty aac access unit");
        }
        let pts_90k = rescale(timestamp, self.clock_rate);
        let sample = Sample {
            pts_90k,
            dts_90k: pts_90k,
            is_sync: true,
            data,
            avc_params: None,
        };
        let _ = self.tx.send(sample);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::aac::AudioSpecificConfig;

    #[test]
    fn rescale_passes_through_at_90khz() {
        assert_eq!(rescale(90_000, 90_000), 90_000);
    }

    #[test]
    fn rescale_converts_from_a_48khz_clock() {
        assert_eq!(rescale(48_000, 48_000), 90_000);
    }

    #[test]
    fn extract_sps_pps_finds_both_and_ignores_other_nals() {
        let aud = Bytes::from_static(&[0x09, 0xf0]);
        let sps = Bytes::from_static(&[0x67, 0x64, 0x00, 0x1f]);
        let pps = Bytes::from_static(&[0x68, 0xee, 0x3c, 0x80]);
        let nals = vec![aud, sps.clone(), pps.clone()];
        let (found_sps, found_pps) = extract_sps_pps(&nals).unwrap();
        assert_eq!(found_sps, sps);
        assert_eq!(found_pps, pps);
    }

    #[test]
    fn dts_clock_is_strictly_increasing_even_when_pts_reorders() {
        let mut clock = DtsClock::new();
        let d1 = clock.next(30_000);
        let d2 = clock.next(50_000);
        let d3 = clock.next(70_000);
        // Reordered presentation order (a B-frame arriving after the frame
        // it depends on): PTS goes backwards, DTS must not.
        let d4 = clock.next(60_000);
        assert!(d2 > d1);
        assert!(d3 > d2);
        assert!(d4 > d3);
    }

    #[test]
    fn dts_clock_tracks_the_minimum_positive_interval() {
        let mut clock = DtsClock::new();
        clock.next(0);
        clock.next(1_500);
        let third = clock.next(3_000);
        // interval refined to 1500 after the first gap; third sample's DTS
        // is two refined intervals past the first.
        assert_eq!(third, 3_000);
    }

    #[test]
    fn extract_sps_pps_returns_none_without_both() {
        let sps = Bytes::from_static(&[0x67, 0x64, 0x00, 0x1f]);
        assert!(extract_sps_pps(&[sps]).is_none());
    }

    fn aac_config() -> AudioSpecificConfig {
        AudioSpecificConfig {
            audio_object_type: 2,
            sampling_frequency: 48_000,
            channels: 2,
            frame_length: 1024,
        }
    }

    #[test]
    fn audio_track_rejects_empty_access_units() {
        let mut track = AudioTrack::new(aac_config(), Bytes::from_static(&[0x12, 0x10]), 48_000);
        assert!(track.push_au(0, Bytes::new()).is_err());
    }

    #[test]
    fn audio_track_broadcasts_rescaled_samples() {
        let mut track = AudioTrack::new(aac_config(), Bytes::from_static(&[0x12, 0x10]), 48_000);
        let mut rx = track.subscribe();
        track.push_au(48_000, Bytes::from_static(&[0xaa; 10])).unwrap();
        let sample = rx.try_recv().unwrap();
        assert_eq!(sample.pts_90k, 90_000);
        assert!(sample.is_sync);
        assert_eq!(sample.data.len(), 10);
    }
}
