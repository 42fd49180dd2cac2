//! Lightweight per-component bitrate/packet-rate tracking plus the small
//! set of process-wide Prometheus counters. Rates are logged on interval
//! via a plain `tracing::debug!` emission rather than forwarded onto a
//! command bus.

use std::time::{Duration, Instant};
use tracing::debug;

/// Generic packet/byte rate tracker, one per RTP stream, HLS variant, or
/// recorder track.
#[derive(Debug, Clone)]
pub struct PacketMetrics {
    pub bytes_processed: u64,
    pub packets_processed: u64,
    pub last_update: Instant,
    pub source_name: String,
    pub reporting_interval: Duration,
}

impl PacketMetrics {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self::new_with_interval(source_name, Duration::from_secs(2))
    }

    pub fn new_with_interval(source_name: impl Into<String>, reporting_interval: Duration) -> Self {
        Self {
            bytes_processed: 0,
            packets_processed: 0,
            last_update: Instant::now(),
            source_name: source_name.into(),
            reporting_interval,
        }
    }

    pub fn update(&mut self, bytes: usize) {
        self.bytes_processed += bytes as u64;
        self.packets_processed += 1;
        if self.should_report() {
            self.report_and_reset();
        }
    }

    pub fn calculate_bitrate(&self) -> f64 {
        let elapsed = self.last_update.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.bytes_processed as f64 * 8.0) / elapsed
        } else {
            0.0
        }
    }

    pub fn calculate_packet_rate(&self) -> f64 {
        let elapsed = self.last_update.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.packets_processed as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn should_report(&self) -> bool {
        self.last_update.elapsed() >= self.reporting_interval
    }

    pub fn report_and_reset(&mut self) {
        if !self.should_report() {
            return;
        }
        debug!(
            "{}: {:.1} Mbps, {:.1} pps, {} packets, {} bytes",
            self.source_name,
            self.calculate_bitrate() / 1_000_000.0,
            self.calculate_packet_rate(),
            self.packets_processed,
            self.bytes_processed,
        );
        self.bytes_processed = 0;
        self.packets_processed = 0;
        self.last_update = Instant::now();
    }
}

/// Process-wide Prometheus counters, registered once and shared via
/// `Arc` with every path/recorder/muxer instance.
pub struct GlobalMetrics {
    pub segments_finalized: prometheus::IntCounterVec,
    pub parts_dropped: prometheus::IntCounter,
    pub active_sessions: prometheus::IntGauge,
    pub active_recordings: prometheus::IntGauge,
}

impl GlobalMetrics {
    pub fn new(registry: &prometheus::Registry) -> anyhow::Result<Self> {
        let segments_finalized = prometheus::IntCounterVec::new(
            prometheus::Opts::new(
                "nvr_segments_finalized_total",
                "HLS segments finalized, labeled by monitor id",
            ),
            &["monitor_id"],
        )?;
        let parts_dropped = prometheus::IntCounter::new(
            "nvr_parts_dropped_total",
            "LL-HLS parts dropped because the ingest buffer overflowed before the next keyframe",
        )?;
        let active_sessions = prometheus::IntGauge::new(
            "nvr_rtsp_sessions_active",
            "Currently open RTSP sessions",
        )?;
        let active_recordings = prometheus::IntGauge::new(
            "nvr_recordings_active",
            "Currently open (not-yet-finalized) recordings",
        )?;

        registry.register(Box::new(segments_finalized.clone()))?;
        registry.register(Box::new(parts_dropped.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(active_recordings.clone()))?;

        Ok(Self {
            segments_finalized,
            parts_dropped,
            active_sessions,
            active_recordings,
        })
    }
}
