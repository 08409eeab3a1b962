//! Pipeline description builders.
//!
//! Sender graphs run on the robot's Jetson and use the Argus camera stack;
//! receiver graphs pick the best available decoder at runtime. Instrumented
//! stage boundaries are marked with named identity elements so probes can be
//! attached after parsing.

use gstreamer as gst;
use tracing::{debug, warn};

use crate::{Codec, StreamingConfig};

use super::PipelineError;

/// Shared camera source prefix: capture caps tuned for low-latency
/// teleoperation (no auto anti-banding, edge enhancement or noise reduction).
fn camera_source(sensor_id: u8, config: &StreamingConfig) -> String {
    format!(
        "nvarguscamerasrc aeantibanding=AeAntibandingMode_Off ee-mode=EdgeEnhancement_Off \
         tnr-mode=NoiseReduction_Off saturation=1.2 sensor-id={} ! \
         video/x-raw(memory:NVMM),width=(int){},height=(int){},framerate=(fraction){}/1,format=(string)NV12",
        sensor_id, config.width, config.height, config.fps
    )
}

/// Encoder and payloader tail for the configured codec.
fn encode_tail(config: &StreamingConfig) -> Result<String, PipelineError> {
    let tail = match config.codec {
        Codec::Jpeg => format!(
            "nvjpegenc name=encoder quality={} idct-method=ifast ! \
             identity name=enc_ident ! \
             rtpjpegpay mtu=1300",
            config.encoding_quality
        ),
        Codec::H264 => format!(
            "nvv4l2h264enc name=encoder insert-sps-pps=1 bitrate={} preset-level=1 ! \
             identity name=enc_ident ! \
             rtph264pay mtu=1300 config-interval=1 pt=96",
            config.bitrate
        ),
        Codec::H265 => format!(
            "nvv4l2h265enc name=encoder insert-sps-pps=1 bitrate={} preset-level=1 ! \
             identity name=enc_ident ! \
             rtph265pay mtu=1300 config-interval=1 pt=96",
            config.bitrate
        ),
        other => return Err(PipelineError::UnsupportedCodec(other)),
    };
    Ok(tail)
}

/// Streaming pipeline for one sensor: camera -> convert -> encode -> RTP ->
/// UDP, with instrumented stage boundaries.
pub fn sender_pipeline(sensor_id: u8, config: &StreamingConfig) -> Result<String, PipelineError> {
    validate(config)?;
    let port = config.port_for_sensor(sensor_id as usize);
    Ok(format!(
        "{} ! \
         identity name=camsrc_ident ! \
         nvvidconv flip-method=vertical-flip ! \
         identity name=vidconv_ident ! \
         {} ! \
         identity name=rtppay_ident ! \
         udpsink host={} sync=false port={}",
        camera_source(sensor_id, config),
        encode_tail(config)?,
        config.host,
        port
    ))
}

/// Panoramic pipeline: one open source branch per window slot feeding an
/// input-selector, then the shared encode tail on the left-eye port. Branch
/// elements are named per slot (`src_N`, `caps_N`, `queue_N`) so a single
/// slot can be rebuilt in place during a window swap.
pub fn panoramic_pipeline(
    window_sensors: &[u8],
    config: &StreamingConfig,
) -> Result<String, PipelineError> {
    validate(config)?;
    let mut description = String::new();
    for (slot, sensor) in window_sensors.iter().enumerate() {
        description.push_str(&format!(
            "nvarguscamerasrc name=src_{slot} aeantibanding=AeAntibandingMode_Off \
             ee-mode=EdgeEnhancement_Off tnr-mode=NoiseReduction_Off saturation=1.2 sensor-id={sensor} ! \
             capsfilter name=caps_{slot} \
             caps=video/x-raw(memory:NVMM),width=(int){w},height=(int){h},framerate=(fraction){fps}/1,format=(string)NV12 ! \
             queue name=queue_{slot} max-size-buffers=2 ! \
             sel.sink_{slot} ",
            w = config.width,
            h = config.height,
            fps = config.fps,
        ));
    }
    description.push_str(&format!(
        "input-selector name=sel sync-streams=false ! \
         identity name=camsrc_ident ! \
         nvvidconv flip-method=vertical-flip ! \
         identity name=vidconv_ident ! \
         {} ! \
         identity name=rtppay_ident ! \
         udpsink host={} sync=false port={}",
        encode_tail(config)?,
        config.host,
        config.port_left
    ));
    Ok(description)
}

/// Receiver pipeline with an explicit decoder element name, kept separate
/// from runtime detection so it stays testable.
pub fn receiver_pipeline_with(
    decoder: &str,
    port: u16,
    config: &StreamingConfig,
) -> Result<String, PipelineError> {
    validate(config)?;
    let depay = match config.codec {
        Codec::Jpeg => "rtpjpegdepay",
        Codec::H264 => "rtph264depay ! h264parse",
        Codec::H265 => "rtph265depay ! h265parse",
        other => return Err(PipelineError::UnsupportedCodec(other)),
    };
    Ok(format!(
        "udpsrc name=udpsrc port={port} ! \
         capsfilter name=rtp_capsfilter ! \
         {depay} ! \
         identity name=rtpdepay_ident ! \
         {decoder} ! \
         identity name=dec_ident ! \
         videoconvert ! \
         video/x-raw,format=RGB ! \
         queue max-size-buffers=1 leaky=downstream ! \
         identity name=queue_ident ! \
         appsink name=appsink"
    ))
}

/// Receiver pipeline using the best decoder present on this machine.
pub fn receiver_pipeline(port: u16, config: &StreamingConfig) -> Result<String, PipelineError> {
    receiver_pipeline_with(detect_decoder(config.codec)?, port, config)
}

/// RTP caps for the receiver's capsfilter. JPEG dimensions ride in the
/// x-dimensions field since the codec itself does not signal them.
pub fn receiver_rtp_caps(config: &StreamingConfig) -> gst::Caps {
    gst::Caps::builder("application/x-rtp")
        .field("encoding-name", config.codec.rtp_encoding_name())
        .field("payload", config.codec.rtp_payload_type())
        .field("x-dimensions", format!("{},{}", config.width, config.height))
        .build()
}

/// Pick the best available decoder, hardware first: walk a preference list
/// and take the first factory the registry knows.
fn detect_decoder(codec: Codec) -> Result<&'static str, PipelineError> {
    let candidates: &[&'static str] = match codec {
        Codec::Jpeg => &["nvjpegdec", "vaapijpegdec", "v4l2jpegdec", "jpegdec"],
        Codec::H264 => &["nvv4l2decoder", "vaapih264dec", "avdec_h264"],
        Codec::H265 => &["nvv4l2decoder", "vaapih265dec", "avdec_h265"],
        other => return Err(PipelineError::UnsupportedCodec(other)),
    };

    for decoder in candidates {
        if gst::ElementFactory::find(decoder).is_some() {
            debug!(decoder, "selected decoder");
            return Ok(decoder);
        }
    }

    // Last candidate is always the software fallback; let the parse fail
    // loudly if even that is absent.
    warn!(?codec, "no hardware decoder found, using software fallback");
    Ok(candidates[candidates.len() - 1])
}

fn validate(config: &StreamingConfig) -> Result<(), PipelineError> {
    if config.width == 0 || config.height == 0 || config.fps == 0 {
        return Err(PipelineError::InvalidResolution {
            width: config.width,
            height: config.height,
        });
    }
    Ok(())
}
