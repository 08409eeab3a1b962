//! Per-sensor streaming workers.
//!
//! One dedicated thread owns each sensor's graph for its whole life: build,
//! play, watch the bus, apply dynamic updates, tear down, rebuild. No other
//! thread touches a graph's topology; configuration and stop requests arrive
//! through [`ConfigCell`] and a shared stop flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use tracing::{error, info, warn};

use crate::clock::sync::wall_clock_us;
use crate::instrument::{FrameTagger, Stage, StageProbe, StreamId};
use crate::{Codec, ConfigCell, StreamingConfig, VideoMode};

use super::launch;
use super::PipelineError;

/// Failure streak at which a worker stops retrying and waits for a new
/// configuration.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Degraded-mode sleep once the failure streak is exhausted.
pub(crate) const DEGRADED_SLEEP: Duration = Duration::from_secs(10);

/// Hardware release delay between a teardown and a config-change rebuild.
pub(crate) const REBUILD_DELAY: Duration = Duration::from_millis(500);

/// Bus poll granularity; also bounds stop-flag latency.
pub(crate) const BUS_POLL: Duration = Duration::from_millis(100);

/// Exponential retry backoff: 200ms doubling per consecutive failure,
/// capped at 10s.
pub fn backoff_delay(failure_streak: u32) -> Duration {
    let exp = failure_streak.saturating_sub(1).min(16);
    Duration::from_millis((200u64 << exp).min(10_000))
}

/// Shared context for one sensor worker thread.
pub struct WorkerContext {
    pub sensor_id: u8,
    pub config: Arc<ConfigCell>,
    pub stop: Arc<AtomicBool>,
}

/// Why the bus loop handed control back.
enum RunEnd {
    /// Error or EOS arrived on the bus.
    StreamFailed,
    /// Structural config change (or failed dynamic update).
    NeedsRebuild,
    /// Stop requested.
    Stopping,
}

/// Sleep in bounded slices so the stop flag stays responsive.
pub(crate) fn interruptible_sleep(duration: Duration, stop: &AtomicBool) {
    let mut remaining = duration;
    while !remaining.is_zero() && !stop.load(Ordering::Relaxed) {
        let slice = remaining.min(BUS_POLL);
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

/// Attach producer instrumentation to a parsed sender graph: identity
/// handoffs stamp capture/convert/encode boundaries, and a buffer probe on
/// the payloader boundary stamps the payload time and tags the frame's
/// first packet.
pub(crate) fn attach_producer_probes(
    pipeline: &gst::Pipeline,
    stream: StreamId,
) -> Result<Arc<Mutex<FrameTagger>>, PipelineError> {
    let tagger = Arc::new(Mutex::new(FrameTagger::new(stream)));

    for (name, stage) in [
        ("camsrc_ident", Stage::Capture),
        ("vidconv_ident", Stage::Convert),
        ("enc_ident", Stage::Encode),
    ] {
        let ident = pipeline
            .by_name(name)
            .ok_or_else(|| PipelineError::MissingElement(name.into()))?;
        let probe = tagger.clone();
        ident.connect("handoff", false, move |_args| {
            probe.on_stage_boundary(stream, stage, wall_clock_us());
            None
        });
    }

    let payloader = pipeline
        .by_name("rtppay_ident")
        .ok_or_else(|| PipelineError::MissingElement("rtppay_ident".into()))?;
    let src_pad = payloader
        .static_pad("src")
        .ok_or_else(|| PipelineError::MissingElement("rtppay_ident.src".into()))?;

    let probe = tagger.clone();
    src_pad.add_probe(gst::PadProbeType::BUFFER, move |_pad, info| {
        if let Some(gst::PadProbeData::Buffer(ref mut buffer)) = info.data {
            let now = wall_clock_us();
            let mut tagger = probe.lock().unwrap_or_else(|e| e.into_inner());
            tagger.on_stage_boundary(stream, Stage::Payload, now);

            let (pts, dts, duration) = (buffer.pts(), buffer.dts(), buffer.duration());
            let mut bytes = match buffer.map_readable() {
                Ok(map) => map.as_slice().to_vec(),
                Err(_) => return gst::PadProbeReturn::Ok,
            };
            if tagger.tag_packet(&mut bytes) {
                let mut tagged = gst::Buffer::from_mut_slice(bytes);
                if let Some(tagged_ref) = tagged.get_mut() {
                    tagged_ref.set_pts(pts);
                    tagged_ref.set_dts(dts);
                    tagged_ref.set_duration(duration);
                }
                *buffer = tagged;
            }
        }
        gst::PadProbeReturn::Ok
    });

    Ok(tagger)
}

/// Stop a graph: graceful EOS, then forced null, bounded wait, release.
pub(crate) fn stop_pipeline(pipeline: gst::Pipeline) {
    info!(name = %pipeline.name(), "stopping pipeline");
    pipeline.send_event(gst::event::Eos::new());
    if pipeline.set_state(gst::State::Null).is_err() {
        warn!(name = %pipeline.name(), "pipeline refused to stop");
    }
    let (result, _, _) = pipeline.state(gst::ClockTime::from_seconds(5));
    if result.is_err() {
        warn!(name = %pipeline.name(), "pipeline did not reach null state");
    }
}

/// In-place encoder update for quality-only changes. JPEG takes a quality
/// value; the delta codecs take a bitrate.
pub(crate) fn update_encoder_properties(
    pipeline: &gst::Pipeline,
    config: &StreamingConfig,
) -> Result<(), PipelineError> {
    let encoder = pipeline
        .by_name("encoder")
        .ok_or_else(|| PipelineError::MissingElement("encoder".into()))?;

    match config.codec {
        Codec::Jpeg => {
            info!(quality = config.encoding_quality, "updating encoder quality in place");
            encoder.set_property("quality", config.encoding_quality as i32);
        }
        Codec::H264 | Codec::H265 => {
            info!(bitrate = config.bitrate, "updating encoder bitrate in place");
            encoder.set_property("bitrate", config.bitrate);
        }
        other => return Err(PipelineError::UnsupportedCodec(other)),
    }
    Ok(())
}

fn build_sender(sensor_id: u8, config: &StreamingConfig) -> Result<gst::Pipeline, PipelineError> {
    let description = launch::sender_pipeline(sensor_id, config)?;
    info!(sensor_id, %description, "building sender pipeline");

    let pipeline = gst::parse::launch(&description)?
        .downcast::<gst::Pipeline>()
        .map_err(|_| PipelineError::MissingElement("pipeline".into()))?;

    let side = if sensor_id == 0 { "left" } else { "right" };
    pipeline.set_property("name", format!("pipeline_{side}"));

    let stream = if sensor_id == 0 { StreamId::Left } else { StreamId::Right };
    attach_producer_probes(&pipeline, stream)?;
    Ok(pipeline)
}

/// Watch the bus for errors/EOS while tracking configuration changes.
/// Quality-only changes are applied in place without leaving this loop.
fn supervise_playing(
    pipeline: &gst::Pipeline,
    ctx: &WorkerContext,
    current: &mut StreamingConfig,
    seen_version: &mut u64,
) -> RunEnd {
    let Some(bus) = pipeline.bus() else {
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
                gst::MessageView::Error(err) => {
                    error!(sensor_id = ctx.sensor_id, error = %err.error(), "pipeline error")
                }
                _ => warn!(sensor_id = ctx.sensor_id, "unexpected end of stream"),
            }
            return RunEnd::StreamFailed;
        }

        let version = ctx.config.version();
        if version != *seen_version {
            let (_, new_config) = ctx.config.load();
            *seen_version = version;

            if current.is_structural_change(&new_config) {
                info!(sensor_id = ctx.sensor_id, "config change requires pipeline rebuild");
                return RunEnd::NeedsRebuild;
            }
            match update_encoder_properties(pipeline, &new_config) {
                Ok(()) => *current = new_config,
                Err(err) => {
                    warn!(sensor_id = ctx.sensor_id, %err, "dynamic update failed, rebuilding");
                    return RunEnd::NeedsRebuild;
                }
            }
        }
    }
}

/// Worker loop for one sensor. Runs until the stop flag is raised.
pub fn run_sensor_worker(ctx: WorkerContext) {
    // Stagger sensor 1 so both cameras do not hit the capture service at
    // the same instant on startup.
    if ctx.sensor_id == 1 {
        interruptible_sleep(Duration::from_millis(100), &ctx.stop);
    }

    let mut seen_version = 0u64;
    let mut failure_streak = 0u32;

    while !ctx.stop.load(Ordering::Relaxed) {
        if failure_streak >= MAX_CONSECUTIVE_FAILURES {
            warn!(
                sensor_id = ctx.sensor_id,
                failure_streak, "sensor degraded; waiting for a new configuration"
            );
            interruptible_sleep(DEGRADED_SLEEP, &ctx.stop);
            if ctx.config.version() != seen_version {
                info!(sensor_id = ctx.sensor_id, "config changed, resuming retries");
                failure_streak = 0;
            }
            continue;
        }

        let (version, config) = ctx.config.load();
        if version == 0 {
            interruptible_sleep(BUS_POLL, &ctx.stop);
            continue;
        }
        seen_version = version;

        // Only sensor 0 streams outside stereo mode; panoramic mode has its
        // own worker.
        let active = match config.video_mode {
            VideoMode::Stereo => true,
            VideoMode::Mono => ctx.sensor_id == 0,
            VideoMode::Panoramic => false,
        };
        if !active {
            interruptible_sleep(Duration::from_secs(1), &ctx.stop);
            continue;
        }

        let pipeline = match build_sender(ctx.sensor_id, &config) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                failure_streak += 1;
                error!(
                    sensor_id = ctx.sensor_id,
                    %err, failure_streak, "failed to build pipeline"
                );
                interruptible_sleep(backoff_delay(failure_streak), &ctx.stop);
                continue;
            }
        };

        if pipeline.set_state(gst::State::Playing).is_err() {
            stop_pipeline(pipeline);
            failure_streak += 1;
            error!(
                sensor_id = ctx.sensor_id,
                failure_streak, "unable to set pipeline to playing"
            );
            interruptible_sleep(backoff_delay(failure_streak), &ctx.stop);
            continue;
        }

        if failure_streak > 0 {
            info!(sensor_id = ctx.sensor_id, failure_streak, "sensor recovered");
        }
        failure_streak = 0;
        let mut current = config;

        let end = supervise_playing(&pipeline, &ctx, &mut current, &mut seen_version);
        stop_pipeline(pipeline);

        match end {
            RunEnd::Stopping => break,
            RunEnd::StreamFailed => {
                failure_streak += 1;
                interruptible_sleep(backoff_delay(failure_streak), &ctx.stop);
            }
            RunEnd::NeedsRebuild => {
                // Give the capture hardware time to fully release.
                interruptible_sleep(REBUILD_DELAY, &ctx.stop);
            }
        }
    }

    info!(sensor_id = ctx.sensor_id, "sensor worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_200ms() {
        let expected = [200u64, 400, 800, 1600, 3200];
        for (streak, ms) in (1..=5).zip(expected) {
            assert_eq!(backoff_delay(streak), Duration::from_millis(ms));
        }
    }

    #[test]
    fn backoff_caps_at_ten_seconds() {
        assert_eq!(backoff_delay(7), Duration::from_secs(10));
        assert_eq!(backoff_delay(60), Duration::from_secs(10));
    }

    #[test]
    fn interruptible_sleep_returns_early_on_stop() {
        let stop = AtomicBool::new(true);
        let started = std::time::Instant::now();
        interruptible_sleep(Duration::from_secs(5), &stop);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
