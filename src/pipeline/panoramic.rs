//! Panoramic camera ring.
//!
//! Six cameras sit at 60-degree increments around the robot's head. Only a
//! three-camera sliding window is kept open at a time, fanned into an
//! input-selector so switching between neighbouring views is a pad flip
//! rather than a camera cold start. Looking further around the ring evicts
//! the window camera angularly farthest from the request and rebuilds that
//! one source branch in place while the rest of the graph keeps running.

use std::sync::atomic::Ordering;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_video::UpstreamForceKeyUnitEvent;
use tracing::{error, info, warn};

use crate::instrument::StreamId;
use crate::{ports, StreamingConfig, VideoMode};

use super::supervisor::{
    self, backoff_delay, interruptible_sleep, WorkerContext, BUS_POLL, DEGRADED_SLEEP,
    MAX_CONSECUTIVE_FAILURES, REBUILD_DELAY,
};
use super::{launch, PipelineError};

/// Cameras on the ring.
pub const CAMERA_COUNT: u8 = 6;

/// Open source branches at any time.
pub const WINDOW_SIZE: usize = 3;

/// Steps between two cameras around the ring, whichever way is shorter.
pub fn angular_distance(a: u8, b: u8) -> u8 {
    let d = a.abs_diff(b);
    d.min(CAMERA_COUNT - d)
}

/// What a camera-select request requires of the running graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapPlan {
    /// Already showing the requested camera.
    NoOp,
    /// Requested camera is in the window; flip the selector.
    Select { slot: usize },
    /// Requested camera is outside the window; rebuild one branch, then
    /// flip the selector to it.
    Swap { slot: usize, evicted: u8 },
}

/// The sliding window: which camera feeds each selector slot, and which
/// slot is live. Pure bookkeeping, the graph surgery lives elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraWindow {
    slots: [u8; WINDOW_SIZE],
    active_slot: usize,
}

impl CameraWindow {
    /// Window centred on `active`: its two ring neighbours fill the outer
    /// slots so a one-step look in either direction is already warm.
    pub fn new(active: u8) -> Self {
        let prev = (active + CAMERA_COUNT - 1) % CAMERA_COUNT;
        let next = (active + 1) % CAMERA_COUNT;
        Self { slots: [prev, active, next], active_slot: 1 }
    }

    pub fn sensors(&self) -> [u8; WINDOW_SIZE] {
        self.slots
    }

    pub fn active_slot(&self) -> usize {
        self.active_slot
    }

    pub fn active_camera(&self) -> u8 {
        self.slots[self.active_slot]
    }

    pub fn decide(&self, requested: u8) -> SwapPlan {
        if requested == self.active_camera() {
            return SwapPlan::NoOp;
        }
        if let Some(slot) = self.slots.iter().position(|&c| c == requested) {
            return SwapPlan::Select { slot };
        }

        // Evict the non-active camera farthest from the request. Strict
        // comparison keeps the lowest slot index on ties.
        let mut victim = usize::MAX;
        let mut worst = 0u8;
        for (slot, &camera) in self.slots.iter().enumerate() {
            if slot == self.active_slot {
                continue;
            }
            let d = angular_distance(camera, requested);
            if victim == usize::MAX || d > worst {
                victim = slot;
                worst = d;
            }
        }
        SwapPlan::Swap { slot: victim, evicted: self.slots[victim] }
    }

    pub fn commit(&mut self, plan: SwapPlan, requested: u8) {
        match plan {
            SwapPlan::NoOp => {}
            SwapPlan::Select { slot } => self.active_slot = slot,
            SwapPlan::Swap { slot, .. } => {
                self.slots[slot] = requested;
                self.active_slot = slot;
            }
        }
    }
}

/// A running panoramic graph plus the window it was built for.
struct PanoramicGraph {
    pipeline: gst::Pipeline,
    window: CameraWindow,
    config: StreamingConfig,
}

impl PanoramicGraph {
    fn build(window: CameraWindow, config: &StreamingConfig) -> Result<Self, PipelineError> {
        let description = launch::panoramic_pipeline(&window.sensors(), config)?;
        info!(window = ?window.sensors(), %description, "building panoramic pipeline");

        let pipeline = gst::parse::launch(&description)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| PipelineError::MissingElement("pipeline".into()))?;
        pipeline.set_property("name", "pipeline_panoramic");

        supervisor::attach_producer_probes(&pipeline, StreamId::Left)?;

        let graph = Self { pipeline, window, config: config.clone() };
        // parse-launch leaves the selector on sink_0; point it at the
        // window's active slot before anything flows.
        graph.switch_active_slot(graph.window.active_slot())?;
        Ok(graph)
    }

    fn by_name(&self, name: &str) -> Result<gst::Element, PipelineError> {
        self.pipeline
            .by_name(name)
            .ok_or_else(|| PipelineError::MissingElement(name.into()))
    }

    /// Point the input-selector at `slot`.
    fn switch_active_slot(&self, slot: usize) -> Result<(), PipelineError> {
        let selector = self.by_name("sel")?;
        let pad_name = format!("sink_{slot}");
        let pad = selector
            .static_pad(&pad_name)
            .ok_or_else(|| PipelineError::MissingElement(format!("sel.{pad_name}")))?;
        selector.set_property("active-pad", &pad);
        Ok(())
    }

    /// Replace the camera feeding `slot` while the rest of the graph runs.
    /// The branch is blocked at the old source's pad, torn down, and a new
    /// source for `sensor` is linked into the surviving capsfilter.
    fn swap_slot_source(&self, slot: usize, sensor: u8) -> Result<(), PipelineError> {
        let old = self.by_name(&format!("src_{slot}"))?;
        let caps = self.by_name(&format!("caps_{slot}"))?;
        let src_pad = old
            .static_pad("src")
            .ok_or_else(|| PipelineError::MissingElement(format!("src_{slot}.src")))?;

        // The block probe dies with the pad when the old element is removed.
        src_pad.add_probe(gst::PadProbeType::BLOCK_DOWNSTREAM, |_pad, _info| {
            gst::PadProbeReturn::Ok
        });

        old.set_state(gst::State::Null)
            .map_err(|_| PipelineError::StateChange)?;
        old.unlink(&caps);
        self.pipeline
            .remove(&old)
            .map_err(|e| PipelineError::GraphEdit(e.to_string()))?;

        let new = gst::ElementFactory::make("nvarguscamerasrc")
            .name(format!("src_{slot}"))
            .property("sensor-id", sensor as i32)
            .property("saturation", 1.2f32)
            .property_from_str("aeantibanding", "AeAntibandingMode_Off")
            .property_from_str("ee-mode", "EdgeEnhancement_Off")
            .property_from_str("tnr-mode", "NoiseReduction_Off")
            .build()
            .map_err(|e| PipelineError::GraphEdit(e.to_string()))?;

        self.pipeline
            .add(&new)
            .map_err(|e| PipelineError::GraphEdit(e.to_string()))?;
        new.link(&caps)
            .map_err(|e| PipelineError::GraphEdit(e.to_string()))?;
        new.sync_state_with_parent()
            .map_err(|e| PipelineError::GraphEdit(e.to_string()))?;
        Ok(())
    }

    /// Delta codecs keep predicting from the previous camera's frames after
    /// a switch; ask the encoder for a clean keyframe.
    fn force_key_unit(&self) -> Result<(), PipelineError> {
        if !self.config.codec.is_delta_coded() {
            return Ok(());
        }
        let encoder = self.by_name("encoder")?;
        let event = UpstreamForceKeyUnitEvent::builder().all_headers(true).build();
        if !encoder.send_event(event) {
            warn!("encoder ignored force-key-unit event");
        }
        Ok(())
    }

    /// Carry out a camera-select request.
    fn apply_selection(&mut self, requested: u8) -> Result<(), PipelineError> {
        let plan = self.window.decide(requested);
        match plan {
            SwapPlan::NoOp => return Ok(()),
            SwapPlan::Select { slot } => {
                info!(requested, slot, "camera in window, switching selector");
                self.switch_active_slot(slot)?;
            }
            SwapPlan::Swap { slot, evicted } => {
                info!(requested, slot, evicted, "camera outside window, swapping slot source");
                self.swap_slot_source(slot, requested)?;
                self.switch_active_slot(slot)?;
            }
        }
        self.window.commit(plan, requested);
        self.force_key_unit()
    }
}

/// Listen for one-byte camera-select datagrams and forward valid requests.
pub async fn camera_select_listener(tx: flume::Sender<u8>) -> color_eyre::Result<()> {
    let socket = tokio::net::UdpSocket::bind(("0.0.0.0", ports::CAMERA_SELECT)).await?;
    info!(port = ports::CAMERA_SELECT, "camera-select listener up");
    serve_selections(socket, tx).await;
    Ok(())
}

/// Receive loop behind the listener. Malformed datagrams and transient
/// socket errors are logged and absorbed; only a dropped receiver ends the
/// loop.
async fn serve_selections(socket: tokio::net::UdpSocket, tx: flume::Sender<u8>) {
    let mut buf = [0u8; 8];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!(%err, "camera-select receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        if len != 1 {
            warn!(%peer, len, "ignoring malformed camera-select datagram");
            continue;
        }
        let camera = buf[0];
        if camera >= CAMERA_COUNT {
            warn!(%peer, camera, "camera-select out of range");
            continue;
        }
        if tx.send_async(camera).await.is_err() {
            return;
        }
    }
}

/// Coalesce queued requests down to the newest one.
fn latest_selection(rx: &flume::Receiver<u8>) -> Option<u8> {
    let mut latest = None;
    while let Ok(camera) = rx.try_recv() {
        latest = Some(camera);
    }
    latest
}

enum RunEnd {
    StreamFailed,
    NeedsRebuild,
    Stopping,
}

fn supervise(
    graph: &mut PanoramicGraph,
    ctx: &WorkerContext,
    select_rx: &flume::Receiver<u8>,
    seen_version: &mut u64,
) -> RunEnd {
    let Some(bus) = graph.pipeline.bus() else {
        return RunEnd::NeedsRebuild;
    };

    loop {
        if ctx.stop.load(Ordering::Relaxed) {
            return RunEnd::Stopping;
        }

        let msg = bus.timed_pop_filtered(
            gst::ClockTime::from_mseconds(BUS_POLL.as_millis() as u64),
            &[gst::MessageType::Error, gst::MessageType::Eos],
        );
        if let Some(msg) = msg {
            match msg.view() {
                gst::MessageView::Error(err) => error!(error = %err.error(), "panoramic pipeline error"),
                _ => warn!("unexpected end of panoramic stream"),
            }
            return RunEnd::StreamFailed;
        }

        if let Some(camera) = latest_selection(select_rx) {
            if let Err(err) = graph.apply_selection(camera) {
                error!(camera, %err, "camera swap failed, rebuilding window");
                // The window already points where the operator wants to
                // look; the rebuild will open it there.
                graph.window = CameraWindow::new(camera);
                return RunEnd::NeedsRebuild;
            }
        }

        let version = ctx.config.version();
        if version != *seen_version {
            let (_, new_config) = ctx.config.load();
            *seen_version = version;

            if graph.config.is_structural_change(&new_config) {
                info!("config change requires panoramic rebuild");
                return RunEnd::NeedsRebuild;
            }
            match supervisor::update_encoder_properties(&graph.pipeline, &new_config) {
                Ok(()) => graph.config = new_config,
                Err(err) => {
                    warn!(%err, "dynamic update failed, rebuilding");
                    return RunEnd::NeedsRebuild;
                }
            }
        }
    }
}

/// Worker loop owning the panoramic graph. Idle outside panoramic mode;
/// the per-sensor workers cover stereo and mono.
pub fn run_panoramic_worker(ctx: WorkerContext, select_rx: flume::Receiver<u8>) {
    let mut window = CameraWindow::new(0);
    let mut seen_version = 0u64;
    let mut failure_streak = 0u32;

    while !ctx.stop.load(Ordering::Relaxed) {
        if failure_streak >= MAX_CONSECUTIVE_FAILURES {
            warn!(failure_streak, "panoramic worker degraded; waiting for a new configuration");
            interruptible_sleep(DEGRADED_SLEEP, &ctx.stop);
            if ctx.config.version() != seen_version {
                failure_streak = 0;
            }
            continue;
        }

        let (version, config) = ctx.config.load();
        if version == 0 || config.video_mode != VideoMode::Panoramic {
            // Drop stale selections while idle so mode entry starts clean.
            if let Some(camera) = latest_selection(&select_rx) {
                window = CameraWindow::new(camera);
            }
            interruptible_sleep(BUS_POLL, &ctx.stop);
            continue;
        }
        seen_version = version;

        let mut graph = match PanoramicGraph::build(window.clone(), &config) {
            Ok(graph) => graph,
            Err(err) => {
                failure_streak += 1;
                error!(%err, failure_streak, "failed to build panoramic pipeline");
                interruptible_sleep(backoff_delay(failure_streak), &ctx.stop);
                continue;
            }
        };

        if graph.pipeline.set_state(gst::State::Playing).is_err() {
            supervisor::stop_pipeline(graph.pipeline);
            failure_streak += 1;
            error!(failure_streak, "unable to start panoramic pipeline");
            interruptible_sleep(backoff_delay(failure_streak), &ctx.stop);
            continue;
        }
        failure_streak = 0;

        let end = supervise(&mut graph, &ctx, &select_rx, &mut seen_version);
        window = graph.window.clone();
        supervisor::stop_pipeline(graph.pipeline);

        match end {
            RunEnd::Stopping => break,
            RunEnd::StreamFailed => {
                failure_streak += 1;
                interruptible_sleep(backoff_delay(failure_streak), &ctx.stop);
            }
            RunEnd::NeedsRebuild => interruptible_sleep(REBUILD_DELAY, &ctx.stop),
        }
    }

    info!("panoramic worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_wraps_around_the_ring() {
        assert_eq!(angular_distance(0, 0), 0);
        assert_eq!(angular_distance(5, 0), 1);
        assert_eq!(angular_distance(0, 3), 3);
        assert_eq!(angular_distance(1, 4), 3);
        assert_eq!(angular_distance(1, 5), 2);
    }

    #[test]
    fn new_window_holds_ring_neighbours() {
        let w = CameraWindow::new(0);
        assert_eq!(w.sensors(), [5, 0, 1]);
        assert_eq!(w.active_slot(), 1);
        assert_eq!(w.active_camera(), 0);

        let w = CameraWindow::new(3);
        assert_eq!(w.sensors(), [2, 3, 4]);
    }

    #[test]
    fn selecting_active_camera_is_a_noop() {
        let w = CameraWindow::new(2);
        assert_eq!(w.decide(2), SwapPlan::NoOp);
    }

    #[test]
    fn in_window_camera_is_a_selector_flip() {
        let mut w = CameraWindow::new(0);
        let plan = w.decide(5);
        assert_eq!(plan, SwapPlan::Select { slot: 0 });
        w.commit(plan, 5);
        assert_eq!(w.active_camera(), 5);
        assert_eq!(w.sensors(), [5, 0, 1]);
    }

    #[test]
    fn far_camera_evicts_farthest_with_lowest_slot_on_tie() {
        // Window [5, 0, 1] looking at 0. Request 3: cameras 5 and 1 are both
        // two steps away, so the tie falls to slot 0.
        let mut w = CameraWindow::new(0);
        let plan = w.decide(3);
        assert_eq!(plan, SwapPlan::Swap { slot: 0, evicted: 5 });
        w.commit(plan, 3);
        assert_eq!(w.sensors(), [3, 0, 1]);
        assert_eq!(w.active_slot(), 0);
        assert_eq!(w.active_camera(), 3);
    }

    #[test]
    fn eviction_skips_the_active_slot() {
        // Window [5, 0, 1] looking at 1 (after a selector flip). Request 4:
        // distances are d(5,4)=1 and d(0,4)=2, so camera 0 goes.
        let mut w = CameraWindow::new(0);
        w.commit(w.decide(1), 1);
        assert_eq!(w.active_slot(), 2);

        let plan = w.decide(4);
        assert_eq!(plan, SwapPlan::Swap { slot: 1, evicted: 0 });
        w.commit(plan, 4);
        assert_eq!(w.sensors(), [5, 4, 1]);
        assert_eq!(w.active_camera(), 4);
    }

    #[tokio::test]
    async fn listener_forwards_only_valid_selections() {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, rx) = flume::bounded(4);
        tokio::spawn(serve_selections(socket, tx));

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&[9], addr).await.unwrap(); // out of range
        sender.send_to(&[1, 2], addr).await.unwrap(); // wrong length
        sender.send_to(&[4], addr).await.unwrap();

        let camera = tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(camera, 4);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn latest_selection_coalesces() {
        let (tx, rx) = flume::unbounded();
        assert_eq!(latest_selection(&rx), None);
        tx.send(1).unwrap();
        tx.send(4).unwrap();
        tx.send(2).unwrap();
        assert_eq!(latest_selection(&rx), Some(2));
        assert_eq!(latest_selection(&rx), None);
    }
}
