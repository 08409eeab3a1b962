//! Headset-side playback: receiver pipelines, instrumentation probes and
//! the decoded-frame handoff.
//!
//! The [`Player`] owns one receive pipeline per streamed eye. Reconfiguring
//! tears everything down and rebuilds from scratch in a fixed order: stop
//! the bus dispatcher, drop the old graphs, reallocate frame buffers and
//! statistics for the new geometry, build, instrument, play, and only then
//! restart the dispatcher. Validation happens before any teardown so a bad
//! configuration leaves the running stream untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{error, info, warn};

use crate::clock::ClockHandle;
use crate::instrument::{Stage, StageProbe, StageRecorder, StreamId};
use crate::pipeline::{launch, PipelineError};
use crate::stats::{StreamStats, VideoFrame};
use crate::{StreamingConfig, VideoMode};

const BUS_POLL: Duration = Duration::from_millis(100);

/// One eye's receive chain: the graph, its decoded-frame slot and stats.
struct ActiveStream {
    id: StreamId,
    pipeline: gst::Pipeline,
    frame: Arc<Mutex<VideoFrame>>,
    stats: Arc<StreamStats>,
}

/// Renderer-facing view of one stream.
#[derive(Clone)]
pub struct StreamOutput {
    pub id: StreamId,
    pub frame: Arc<Mutex<VideoFrame>>,
    pub stats: Arc<StreamStats>,
}

/// Background thread polling every active pipeline's bus.
struct BusDispatcher {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl BusDispatcher {
    fn spawn(pipelines: Vec<(StreamId, gst::Bus)>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                for (id, bus) in &pipelines {
                    while let Some(msg) =
                        bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos])
                    {
                        match msg.view() {
                            gst::MessageView::Error(err) => error!(
                                stream = id.label(),
                                error = %err.error(),
                                debug = ?err.debug(),
                                "receiver pipeline error"
                            ),
                            _ => warn!(stream = id.label(), "receiver stream ended"),
                        }
                    }
                }
                thread::sleep(BUS_POLL);
            }
        });
        Self { stop, handle }
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
    }
}

/// Owns the receive side of the system for the lifetime of the session.
pub struct Player {
    clock: ClockHandle,
    streams: Vec<ActiveStream>,
    dispatcher: Option<BusDispatcher>,
}

impl Player {
    pub fn new(clock: ClockHandle) -> Self {
        Self { clock, streams: Vec::new(), dispatcher: None }
    }

    /// Streams currently playing, in left/right order.
    pub fn outputs(&self) -> Vec<StreamOutput> {
        self.streams
            .iter()
            .map(|s| StreamOutput {
                id: s.id,
                frame: s.frame.clone(),
                stats: s.stats.clone(),
            })
            .collect()
    }

    /// Tear down and rebuild for `config`. Pipeline descriptions are built
    /// and validated up front, so errors abort before the old graphs stop.
    pub fn reconfigure(&mut self, config: &StreamingConfig) -> Result<(), PipelineError> {
        let mut wanted = vec![(StreamId::Left, config.port_left)];
        if config.video_mode == VideoMode::Stereo {
            wanted.push((StreamId::Right, config.port_right));
        }

        let descriptions = wanted
            .iter()
            .map(|&(id, port)| Ok((id, launch::receiver_pipeline(port, config)?)))
            .collect::<Result<Vec<_>, PipelineError>>()?;

        self.teardown();

        let mut streams = Vec::with_capacity(descriptions.len());
        for (id, description) in descriptions {
            info!(stream = id.label(), %description, "building receiver pipeline");
            streams.push(self.build_stream(id, &description, config)?);
        }

        for stream in &streams {
            stream
                .pipeline
                .set_state(gst::State::Playing)
                .map_err(|_| PipelineError::StateChange)?;
        }

        let buses = streams
            .iter()
            .filter_map(|s| s.pipeline.bus().map(|bus| (s.id, bus)))
            .collect();
        self.dispatcher = Some(BusDispatcher::spawn(buses));
        self.streams = streams;
        Ok(())
    }

    /// Stop the dispatcher first so no bus poll races the teardown, then
    /// drain the graphs.
    pub fn teardown(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.stop();
        }
        for stream in self.streams.drain(..) {
            stream.pipeline.send_event(gst::event::Eos::new());
            if stream.pipeline.set_state(gst::State::Null).is_err() {
                warn!(stream = stream.id.label(), "receiver pipeline refused to stop");
            }
        }
    }

    fn build_stream(
        &self,
        id: StreamId,
        description: &str,
        config: &StreamingConfig,
    ) -> Result<ActiveStream, PipelineError> {
        let pipeline = gst::parse::launch(description)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| PipelineError::MissingElement("pipeline".into()))?;
        pipeline.set_property("name", format!("receiver_{}", id.label()));

        let capsfilter = by_name(&pipeline, "rtp_capsfilter")?;
        capsfilter.set_property("caps", launch::receiver_rtp_caps(config));

        let frame = Arc::new(Mutex::new(VideoFrame::allocate(config.width, config.height)));
        let stats = frame.lock().unwrap_or_else(|e| e.into_inner()).stats.clone();
        let recorder = Arc::new(StageRecorder::new(id, stats.clone(), self.clock.clone()));

        self.attach_packet_probe(&pipeline, recorder.clone())?;
        self.attach_stage_probes(&pipeline, id, recorder.clone())?;
        self.attach_frame_sink(&pipeline, recorder, frame.clone())?;

        Ok(ActiveStream { id, pipeline, frame, stats })
    }

    /// Every arriving RTP packet passes the recorder before depayloading.
    fn attach_packet_probe(
        &self,
        pipeline: &gst::Pipeline,
        recorder: Arc<StageRecorder>,
    ) -> Result<(), PipelineError> {
        let udpsrc = by_name(pipeline, "udpsrc")?;
        let pad = udpsrc
            .static_pad("src")
            .ok_or_else(|| PipelineError::MissingElement("udpsrc.src".into()))?;

        pad.add_probe(gst::PadProbeType::BUFFER, move |_pad, info| {
            if let Some(gst::PadProbeData::Buffer(ref buffer)) = info.data {
                if let Ok(map) = buffer.map_readable() {
                    recorder.on_packet(map.as_slice());
                }
            }
            gst::PadProbeReturn::Ok
        });
        Ok(())
    }

    fn attach_stage_probes(
        &self,
        pipeline: &gst::Pipeline,
        id: StreamId,
        recorder: Arc<StageRecorder>,
    ) -> Result<(), PipelineError> {
        for (name, stage) in [
            ("rtpdepay_ident", Stage::Depayload),
            ("dec_ident", Stage::Decode),
            ("queue_ident", Stage::Queue),
        ] {
            let ident = by_name(pipeline, name)?;
            let recorder = recorder.clone();
            let clock = self.clock.clone();
            ident.connect("handoff", false, move |_args| {
                recorder.on_stage_boundary(id, stage, clock.now_us());
                None
            });
        }
        Ok(())
    }

    /// Decoded RGB frames land in the shared frame slot; fps and the
    /// frame-ready timestamp update on every pull.
    fn attach_frame_sink(
        &self,
        pipeline: &gst::Pipeline,
        recorder: Arc<StageRecorder>,
        frame: Arc<Mutex<VideoFrame>>,
    ) -> Result<(), PipelineError> {
        let appsink = by_name(pipeline, "appsink")?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| PipelineError::MissingElement("appsink".into()))?;
        appsink.set_property("sync", false);
        appsink.set_max_buffers(1);
        appsink.set_drop(true);

        let clock = self.clock.clone();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    recorder.on_frame_ready(clock.now_us());
                    if let Some(buffer) = sample.buffer() {
                        if let Ok(map) = buffer.map_readable() {
                            frame
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .store_cpu(map.as_slice());
                        }
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
        Ok(())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn by_name(pipeline: &gst::Pipeline, name: &str) -> Result<gst::Element, PipelineError> {
    pipeline
        .by_name(name)
        .ok_or_else(|| PipelineError::MissingElement(name.into()))
}
