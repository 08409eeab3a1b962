//! Per-camera latency statistics.
//!
//! Writers are instrumentation probes on media threads; readers are the
//! render/telemetry side. Hot fields are individually atomic so neither side
//! ever blocks the other; only the bounded snapshot history sits behind a
//! mutex. A `snapshot()` taken mid-update may mix fields from two adjacent
//! frames, which is acceptable for display purposes.

pub mod frame;

pub use frame::{FramePixels, VideoFrame};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// Rolling history length for the averaged view.
pub const HISTORY_SIZE: usize = 50;

/// Copyable point-in-time view of [`StreamStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    pub prev_frame_us: u64,
    pub curr_frame_us: u64,
    pub fps: f64,

    // Stage latencies, microseconds.
    pub camera: u64,
    pub convert: u64,
    pub encode: u64,
    pub rtp_pay: u64,
    pub udp_stream: u64,
    pub rtp_depay: u64,
    pub decode: u64,
    pub queue: u64,
    pub presentation: u64,
    /// Sum of the eight transport stages (camera through queue).
    /// Presentation is tracked separately and never folded in.
    pub total_latency: u64,

    // Absolute stage timestamps, microseconds.
    pub rtp_pay_ts: u64,
    pub udp_src_ts: u64,
    pub rtp_depay_ts: u64,
    pub decode_ts: u64,
    pub queue_ts: u64,
    pub frame_ready_ts: u64,

    pub frame_id: u64,
    pub packets_per_frame: u32,
}

/// Live, concurrently mutated statistics for one camera/eye.
#[derive(Debug, Default)]
pub struct StreamStats {
    pub prev_frame_us: AtomicU64,
    pub curr_frame_us: AtomicU64,
    /// f64 bits; see [`StreamStats::set_fps`].
    fps_bits: AtomicU64,

    pub camera: AtomicU64,
    pub convert: AtomicU64,
    pub encode: AtomicU64,
    pub rtp_pay: AtomicU64,
    pub udp_stream: AtomicU64,
    pub rtp_depay: AtomicU64,
    pub decode: AtomicU64,
    pub queue: AtomicU64,
    pub presentation: AtomicU64,
    pub total_latency: AtomicU64,

    pub rtp_pay_ts: AtomicU64,
    pub udp_src_ts: AtomicU64,
    pub rtp_depay_ts: AtomicU64,
    pub decode_ts: AtomicU64,
    pub queue_ts: AtomicU64,
    pub frame_ready_ts: AtomicU64,

    pub frame_id: AtomicU64,
    pub packets_per_frame: AtomicU32,

    history: Mutex<VecDeque<StatsSnapshot>>,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    /// Read every field into an immutable record. Not linearizable across
    /// fields; see the module docs.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            prev_frame_us: self.prev_frame_us.load(Ordering::Relaxed),
            curr_frame_us: self.curr_frame_us.load(Ordering::Relaxed),
            fps: self.fps(),
            camera: self.camera.load(Ordering::Relaxed),
            convert: self.convert.load(Ordering::Relaxed),
            encode: self.encode.load(Ordering::Relaxed),
            rtp_pay: self.rtp_pay.load(Ordering::Relaxed),
            udp_stream: self.udp_stream.load(Ordering::Relaxed),
            rtp_depay: self.rtp_depay.load(Ordering::Relaxed),
            decode: self.decode.load(Ordering::Relaxed),
            queue: self.queue.load(Ordering::Relaxed),
            presentation: self.presentation.load(Ordering::Relaxed),
            total_latency: self.total_latency.load(Ordering::Relaxed),
            rtp_pay_ts: self.rtp_pay_ts.load(Ordering::Relaxed),
            udp_src_ts: self.udp_src_ts.load(Ordering::Relaxed),
            rtp_depay_ts: self.rtp_depay_ts.load(Ordering::Relaxed),
            decode_ts: self.decode_ts.load(Ordering::Relaxed),
            queue_ts: self.queue_ts.load(Ordering::Relaxed),
            frame_ready_ts: self.frame_ready_ts.load(Ordering::Relaxed),
            frame_id: self.frame_id.load(Ordering::Relaxed),
            packets_per_frame: self.packets_per_frame.load(Ordering::Relaxed),
        }
    }

    /// Append the current snapshot to the rolling history. Called once per
    /// completed frame, after the terminal stage has stamped its delta.
    pub fn update_history(&self) {
        let snap = self.snapshot();
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(snap);
        if history.len() > HISTORY_SIZE {
            history.pop_front();
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Arithmetic mean of all timing fields across the history. Frame
    /// identity fields (frame id, packet count, absolute timestamps) take
    /// the most recent entry instead; averaging monotonically increasing
    /// identifiers is meaningless. Empty history falls back to a live
    /// snapshot.
    pub fn averaged_snapshot(&self) -> StatsSnapshot {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.is_empty() {
            drop(history);
            return self.snapshot();
        }

        let mut avg = StatsSnapshot::default();
        for snap in history.iter() {
            avg.prev_frame_us += snap.prev_frame_us;
            avg.curr_frame_us += snap.curr_frame_us;
            avg.fps += snap.fps;
            avg.camera += snap.camera;
            avg.convert += snap.convert;
            avg.encode += snap.encode;
            avg.rtp_pay += snap.rtp_pay;
            avg.udp_stream += snap.udp_stream;
            avg.rtp_depay += snap.rtp_depay;
            avg.decode += snap.decode;
            avg.queue += snap.queue;
            avg.presentation += snap.presentation;
            avg.total_latency += snap.total_latency;
        }

        let count = history.len() as u64;
        avg.prev_frame_us /= count;
        avg.curr_frame_us /= count;
        avg.fps /= count as f64;
        avg.camera /= count;
        avg.convert /= count;
        avg.encode /= count;
        avg.rtp_pay /= count;
        avg.udp_stream /= count;
        avg.rtp_depay /= count;
        avg.decode /= count;
        avg.queue /= count;
        avg.presentation /= count;
        avg.total_latency /= count;

        let latest = history.back().copied().unwrap_or_default();
        avg.frame_id = latest.frame_id;
        avg.packets_per_frame = latest.packets_per_frame;
        avg.rtp_pay_ts = latest.rtp_pay_ts;
        avg.udp_src_ts = latest.udp_src_ts;
        avg.rtp_depay_ts = latest.rtp_depay_ts;
        avg.decode_ts = latest.decode_ts;
        avg.queue_ts = latest.queue_ts;
        avg.frame_ready_ts = latest.frame_ready_ts;

        avg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averaged_snapshot_is_arithmetic_mean() {
        let stats = StreamStats::new();
        for (enc, dec) in [(100u64, 10u64), (200, 20), (300, 30)] {
            stats.encode.store(enc, Ordering::Relaxed);
            stats.decode.store(dec, Ordering::Relaxed);
            stats.set_fps(60.0);
            stats.update_history();
        }

        let avg = stats.averaged_snapshot();
        assert_eq!(avg.encode, 200);
        assert_eq!(avg.decode, 20);
        assert!((avg.fps - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn history_capped_at_fifty_oldest_evicted() {
        let stats = StreamStats::new();
        for i in 0..51u64 {
            stats.frame_id.store(i, Ordering::Relaxed);
            stats.camera.store(i, Ordering::Relaxed);
            stats.update_history();
        }

        assert_eq!(stats.history_len(), HISTORY_SIZE);

        // Entries 1..=50 are retained, so the camera mean is (1+..+50)/50.
        let avg = stats.averaged_snapshot();
        assert_eq!(avg.camera, (1..=50).sum::<u64>() / 50);
        assert_eq!(avg.frame_id, 50);
    }

    #[test]
    fn frame_identity_fields_take_latest_value() {
        let stats = StreamStats::new();
        for id in [10u64, 11, 12] {
            stats.frame_id.store(id, Ordering::Relaxed);
            stats.rtp_pay_ts.store(id * 1000, Ordering::Relaxed);
            stats.packets_per_frame.store(id as u32, Ordering::Relaxed);
            stats.update_history();
        }

        let avg = stats.averaged_snapshot();
        assert_eq!(avg.frame_id, 12);
        assert_eq!(avg.rtp_pay_ts, 12_000);
        assert_eq!(avg.packets_per_frame, 12);
    }

    #[test]
    fn empty_history_falls_back_to_live_snapshot() {
        let stats = StreamStats::new();
        stats.queue.store(77, Ordering::Relaxed);
        let avg = stats.averaged_snapshot();
        assert_eq!(avg.queue, 77);
        assert_eq!(stats.history_len(), 0);
    }

    #[test]
    fn snapshot_reflects_atomic_fields() {
        let stats = StreamStats::new();
        stats.total_latency.store(12_345, Ordering::Relaxed);
        stats.set_fps(59.94);
        let snap = stats.snapshot();
        assert_eq!(snap.total_latency, 12_345);
        assert!((snap.fps - 59.94).abs() < 1e-9);
    }
}
