//! Receive-side metadata extraction and downstream stage recording.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::clock::ClockHandle;
use crate::stats::StreamStats;

use super::rtpext::read_extension_u64;
use super::{Stage, StageProbe, StreamId};

/// Producer-side metadata carried on a frame's first packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub frame_id: u64,
    pub camera_us: u64,
    pub convert_us: u64,
    pub encode_us: u64,
    pub rtp_pay_us: u64,
    pub rtp_pay_ts_us: u64,
}

/// Extract all six side-channel fields, or nothing. A unit missing any
/// field (malformed extension, dropped first fragment) yields `None` and
/// the frame's statistics update is skipped.
pub fn extract_metadata(packet: &[u8]) -> Option<FrameMetadata> {
    Some(FrameMetadata {
        frame_id: read_extension_u64(packet, 0)?,
        camera_us: read_extension_u64(packet, 1)?,
        convert_us: read_extension_u64(packet, 2)?,
        encode_us: read_extension_u64(packet, 3)?,
        rtp_pay_us: read_extension_u64(packet, 4)?,
        rtp_pay_ts_us: read_extension_u64(packet, 5)?,
    })
}

/// Receive-side instrumentation context for one camera. Owned by the probe
/// closures of that camera's pipeline; all writes go straight into the
/// per-camera atomics.
pub struct StageRecorder {
    stream: StreamId,
    stats: Arc<StreamStats>,
    clock: ClockHandle,
}

impl StageRecorder {
    pub fn new(stream: StreamId, stats: Arc<StreamStats>, clock: ClockHandle) -> Self {
        Self { stream, stats, clock }
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    /// Called for every arriving RTP packet, before depayloading.
    ///
    /// The frame's first packet carries the producer metadata and resets the
    /// per-frame packet counter. Every packet refreshes the arrival
    /// timestamp, so the network-transit figure reflects the frame's last
    /// packet.
    pub fn on_packet(&self, packet: &[u8]) {
        let stats = &self.stats;

        if let Some(meta) = extract_metadata(packet) {
            debug!(
                stream = self.stream.label(),
                frame_id = meta.frame_id,
                packets_prev_frame = stats.packets_per_frame.load(Ordering::Relaxed),
                "new frame metadata"
            );
            stats.frame_id.store(meta.frame_id, Ordering::Relaxed);
            stats.camera.store(meta.camera_us, Ordering::Relaxed);
            stats.convert.store(meta.convert_us, Ordering::Relaxed);
            stats.encode.store(meta.encode_us, Ordering::Relaxed);
            stats.rtp_pay.store(meta.rtp_pay_us, Ordering::Relaxed);
            stats.rtp_pay_ts.store(meta.rtp_pay_ts_us, Ordering::Relaxed);
            stats.packets_per_frame.store(0, Ordering::Relaxed);
        }

        let arrival = self.clock.now_us();
        stats.udp_src_ts.store(arrival, Ordering::Relaxed);
        let sent = stats.rtp_pay_ts.load(Ordering::Relaxed);
        stats
            .udp_stream
            .store(arrival.saturating_sub(sent), Ordering::Relaxed);
        stats.packets_per_frame.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, stage: Stage, now_us: u64) {
        let stats = &self.stats;
        match stage {
            Stage::Depayload => {
                stats.rtp_depay_ts.store(now_us, Ordering::Relaxed);
                let prev = stats.udp_src_ts.load(Ordering::Relaxed);
                stats.rtp_depay.store(now_us.saturating_sub(prev), Ordering::Relaxed);
            }
            Stage::Decode => {
                stats.decode_ts.store(now_us, Ordering::Relaxed);
                let prev = stats.rtp_depay_ts.load(Ordering::Relaxed);
                stats.decode.store(now_us.saturating_sub(prev), Ordering::Relaxed);
            }
            Stage::Queue => {
                stats.queue_ts.store(now_us, Ordering::Relaxed);
                let prev = stats.decode_ts.load(Ordering::Relaxed);
                stats.queue.store(now_us.saturating_sub(prev), Ordering::Relaxed);

                // Terminal stage: fold the eight transport stages together
                // and roll the frame into the history.
                let total = stats.camera.load(Ordering::Relaxed)
                    + stats.convert.load(Ordering::Relaxed)
                    + stats.encode.load(Ordering::Relaxed)
                    + stats.rtp_pay.load(Ordering::Relaxed)
                    + stats.udp_stream.load(Ordering::Relaxed)
                    + stats.rtp_depay.load(Ordering::Relaxed)
                    + stats.decode.load(Ordering::Relaxed)
                    + stats.queue.load(Ordering::Relaxed);
                stats.total_latency.store(total, Ordering::Relaxed);
                stats.update_history();

                debug!(
                    stream = self.stream.label(),
                    total_us = total,
                    "frame latency breakdown complete"
                );
            }
            _ => {}
        }
    }

    /// Frame left the decoder and reached the presenter: refresh fps and
    /// the frame-ready timestamp.
    pub fn on_frame_ready(&self, now_us: u64) {
        let stats = &self.stats;
        let prev = stats.curr_frame_us.load(Ordering::Relaxed);
        stats.prev_frame_us.store(prev, Ordering::Relaxed);
        stats.curr_frame_us.store(now_us, Ordering::Relaxed);
        stats.frame_ready_ts.store(now_us, Ordering::Relaxed);
        if prev != 0 && now_us > prev {
            stats.set_fps(1e6 / (now_us - prev) as f64);
        }
    }
}

impl StageProbe for StageRecorder {
    fn on_stage_boundary(&self, _stream: StreamId, stage: Stage, now_us: u64) {
        self.record(stage, now_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::producer::FrameTagger;
    use crate::instrument::rtpext::test_packet;

    fn recorder() -> StageRecorder {
        StageRecorder::new(
            StreamId::Left,
            Arc::new(StreamStats::new()),
            ClockHandle::default(),
        )
    }

    fn tagged_packet() -> Vec<u8> {
        let mut tagger = FrameTagger::new(StreamId::Left);
        let s = StreamId::Left;
        tagger.on_stage_boundary(s, Stage::Capture, 1_000);
        tagger.on_stage_boundary(s, Stage::Convert, 1_400);
        tagger.on_stage_boundary(s, Stage::Encode, 4_400);
        tagger.on_stage_boundary(s, Stage::Payload, 4_500);
        let mut packet = test_packet(&[0; 8]);
        assert!(tagger.tag_packet(&mut packet));
        packet
    }

    #[test]
    fn metadata_round_trip() {
        let meta = extract_metadata(&tagged_packet()).unwrap();
        assert_eq!(meta.frame_id, 0);
        assert_eq!(meta.convert_us, 400);
        assert_eq!(meta.encode_us, 3_000);
        assert_eq!(meta.rtp_pay_us, 100);
        assert_eq!(meta.rtp_pay_ts_us, 4_500);
    }

    #[test]
    fn untagged_packet_skips_metadata_but_counts() {
        let rec = recorder();
        rec.on_packet(&test_packet(&[1, 2, 3]));
        let snap = rec.stats().snapshot();
        assert_eq!(snap.frame_id, 0);
        assert_eq!(snap.encode, 0);
        assert_eq!(snap.packets_per_frame, 1);
        assert!(snap.udp_src_ts > 0);
    }

    #[test]
    fn tagged_packet_stores_producer_stages_and_resets_count() {
        let rec = recorder();
        // Trailing fragments of a previous frame.
        rec.on_packet(&test_packet(&[]));
        rec.on_packet(&test_packet(&[]));
        assert_eq!(rec.stats().snapshot().packets_per_frame, 2);

        rec.on_packet(&tagged_packet());
        let snap = rec.stats().snapshot();
        assert_eq!(snap.frame_id, 0);
        assert_eq!(snap.convert, 400);
        assert_eq!(snap.packets_per_frame, 1);
    }

    #[test]
    fn downstream_stages_sum_into_total_latency() {
        let rec = recorder();
        rec.on_packet(&tagged_packet());

        // Deterministic arithmetic: overwrite arrival bookkeeping with
        // known values, then walk the downstream stages.
        let stats = rec.stats();
        stats.udp_src_ts.store(10_000, Ordering::Relaxed);
        stats.udp_stream.store(5_500, Ordering::Relaxed);

        rec.on_stage_boundary(StreamId::Left, Stage::Depayload, 10_200);
        rec.on_stage_boundary(StreamId::Left, Stage::Decode, 12_200);
        rec.on_stage_boundary(StreamId::Left, Stage::Queue, 12_300);

        let snap = stats.snapshot();
        assert_eq!(snap.rtp_depay, 200);
        assert_eq!(snap.decode, 2_000);
        assert_eq!(snap.queue, 100);
        // camera 0 (first frame) + convert 400 + encode 3000 + rtp_pay 100
        // + udp_stream 5500 + depay 200 + decode 2000 + queue 100
        assert_eq!(snap.total_latency, 11_300);
        assert_eq!(stats.history_len(), 1);
    }

    #[test]
    fn frame_ready_updates_fps() {
        let rec = recorder();
        rec.on_frame_ready(1_000_000);
        rec.on_frame_ready(1_016_667);
        let snap = rec.stats().snapshot();
        assert!((snap.fps - 60.0).abs() < 0.1);
        assert_eq!(snap.prev_frame_us, 1_000_000);
        assert_eq!(snap.curr_frame_us, 1_016_667);
    }
}
