//! Per-stage latency instrumentation.
//!
//! Producer-side probes stamp timestamps as a frame moves through the send
//! pipeline and pack the resulting deltas into RTP header extensions on the
//! frame's first packet. Consumer-side probes unpack them and fill in the
//! receive-side stages, giving a full end-to-end breakdown without a shared
//! clock beyond the smoothed offset.

pub mod consumer;
pub mod producer;
pub mod rtpext;

pub use consumer::StageRecorder;
pub use producer::FrameTagger;

/// Which eye/slot a pipeline feeds. Panoramic mode uses [`StreamId::Left`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamId {
    Left,
    Right,
}

impl StreamId {
    pub fn label(self) -> &'static str {
        match self {
            StreamId::Left => "left",
            StreamId::Right => "right",
        }
    }
}

/// Instrumented stage boundaries, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    // Producer side.
    Capture,
    Convert,
    Encode,
    Payload,
    // Consumer side.
    Depayload,
    Decode,
    Queue,
}

/// A probe at a stage boundary. The media framework is an injected
/// collaborator that delivers these on its own internal threads; adapters
/// capture their context object instead of consulting any global registry.
pub trait StageProbe: Send + Sync {
    fn on_stage_boundary(&self, stream: StreamId, stage: Stage, now_us: u64);
}

impl StageProbe for std::sync::Mutex<FrameTagger> {
    fn on_stage_boundary(&self, stream: StreamId, stage: Stage, now_us: u64) {
        self.lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_stage_boundary(stream, stage, now_us);
    }
}
