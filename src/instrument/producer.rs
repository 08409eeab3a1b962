//! Send-side frame tagging.

use tracing::warn;

use super::rtpext::{self, FIELD_COUNT};
use super::{Stage, StreamId};

/// Stage timestamps expected before a frame can be tagged:
/// capture, convert, encode, payload.
const PRODUCER_STAGES: usize = 4;

/// Per-pipeline producer instrumentation state.
///
/// Stage probes append local timestamps in stage order. A new capture probe
/// with a non-empty buffer marks the previous frame as flushed; that is how
/// frame boundaries are detected without an explicit end-of-frame signal.
/// `tag_packet` stamps the metadata onto the first RTP packet of each frame
/// only, since one frame fragments into many packets.
#[derive(Debug)]
pub struct FrameTagger {
    stream: StreamId,
    timestamps: Vec<u64>,
    frame_tagged: bool,
    frame_id: u64,
    last_capture_us: u64,
    capture_period_us: u64,
}

impl FrameTagger {
    pub fn new(stream: StreamId) -> Self {
        Self {
            stream,
            timestamps: Vec::with_capacity(PRODUCER_STAGES),
            frame_tagged: false,
            frame_id: 0,
            last_capture_us: 0,
            capture_period_us: 0,
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn next_frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn on_stage_boundary(&mut self, _stream: StreamId, stage: Stage, now_us: u64) {
        if stage == Stage::Capture {
            if self.last_capture_us != 0 {
                self.capture_period_us = now_us.saturating_sub(self.last_capture_us);
            }
            self.last_capture_us = now_us;

            if !self.timestamps.is_empty() {
                // Previous frame left the pipeline; start a new cycle.
                self.timestamps.clear();
                self.frame_tagged = false;
            }
        }
        self.timestamps.push(now_us);
    }

    /// Tag the packet with this frame's metadata if it is the frame's first
    /// packet and all producer stages have been stamped. Returns whether the
    /// packet was tagged. Packing failures leave the packet untouched; the
    /// stream matters more than its statistics.
    pub fn tag_packet(&mut self, packet: &mut Vec<u8>) -> bool {
        if self.frame_tagged {
            return false;
        }
        if self.timestamps.len() < PRODUCER_STAGES {
            return false;
        }

        let [t0, t1, t2, t3] = [
            self.timestamps[0],
            self.timestamps[1],
            self.timestamps[2],
            self.timestamps[3],
        ];
        let fields: [u64; FIELD_COUNT] = [
            self.frame_id,
            self.capture_period_us,
            t1.saturating_sub(t0),
            t2.saturating_sub(t1),
            t3.saturating_sub(t2),
            t3,
        ];

        match rtpext::append_extension_u64s(packet, &fields) {
            Ok(()) => {
                self.frame_tagged = true;
                self.frame_id += 1;
                true
            }
            Err(err) => {
                warn!(stream = self.stream.label(), %err, "failed to tag rtp packet");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::rtpext::{read_extension_u64, test_packet};

    fn stamp_frame(tagger: &mut FrameTagger, t0: u64, t1: u64, t2: u64, t3: u64) {
        let s = StreamId::Left;
        tagger.on_stage_boundary(s, Stage::Capture, t0);
        tagger.on_stage_boundary(s, Stage::Convert, t1);
        tagger.on_stage_boundary(s, Stage::Encode, t2);
        tagger.on_stage_boundary(s, Stage::Payload, t3);
    }

    #[test]
    fn packed_deltas_match_stage_timestamps() {
        let mut tagger = FrameTagger::new(StreamId::Left);
        stamp_frame(&mut tagger, 1_000, 2_500, 7_000, 7_200);

        let mut packet = test_packet(&[0; 16]);
        assert!(tagger.tag_packet(&mut packet));

        assert_eq!(read_extension_u64(&packet, 0), Some(0)); // frame id
        assert_eq!(read_extension_u64(&packet, 2), Some(1_500)); // capture->convert
        assert_eq!(read_extension_u64(&packet, 3), Some(4_500)); // convert->encode
        assert_eq!(read_extension_u64(&packet, 4), Some(200)); // encode->payload
        assert_eq!(read_extension_u64(&packet, 5), Some(7_200)); // payload ts
    }

    #[test]
    fn only_first_packet_of_a_frame_is_tagged() {
        let mut tagger = FrameTagger::new(StreamId::Left);
        stamp_frame(&mut tagger, 10, 20, 30, 40);

        let mut first = test_packet(&[]);
        let mut second = test_packet(&[]);
        assert!(tagger.tag_packet(&mut first));
        assert!(!tagger.tag_packet(&mut second));
        assert_eq!(read_extension_u64(&second, 0), None);
    }

    #[test]
    fn capture_probe_resets_for_next_frame() {
        let mut tagger = FrameTagger::new(StreamId::Left);
        stamp_frame(&mut tagger, 0, 10, 20, 30);
        let mut packet = test_packet(&[]);
        assert!(tagger.tag_packet(&mut packet));

        // Next frame: boundary detected at the capture probe, new frame id,
        // capture period recorded.
        stamp_frame(&mut tagger, 16_667, 16_700, 16_800, 16_900);
        let mut packet = test_packet(&[]);
        assert!(tagger.tag_packet(&mut packet));
        assert_eq!(read_extension_u64(&packet, 0), Some(1));
        assert_eq!(read_extension_u64(&packet, 1), Some(16_667));
    }

    #[test]
    fn incomplete_stage_buffer_is_not_tagged() {
        let mut tagger = FrameTagger::new(StreamId::Right);
        tagger.on_stage_boundary(StreamId::Right, Stage::Capture, 100);
        tagger.on_stage_boundary(StreamId::Right, Stage::Convert, 200);

        let mut packet = test_packet(&[]);
        assert!(!tagger.tag_packet(&mut packet));
    }
}
