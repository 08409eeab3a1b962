pub mod clock;
pub mod instrument;
pub mod pipeline;
pub mod receiver;
pub mod stats;

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// Well-known ports shared between the robot and the headset.
pub mod ports {
    pub const LEFT_CAMERA: u16 = 8554;
    pub const RIGHT_CAMERA: u16 = 8556;
    pub const CAMERA_SELECT: u16 = 9100;
}

/// Video codecs the wire protocol knows about. VP8/VP9 are accepted by the
/// data model but rejected by the pipeline builders in this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    #[serde(rename = "JPEG")]
    Jpeg,
    #[serde(rename = "VP8")]
    Vp8,
    #[serde(rename = "VP9")]
    Vp9,
    #[serde(rename = "H264")]
    H264,
    #[serde(rename = "H265")]
    H265,
}

impl Codec {
    /// Delta-coded codecs need a fresh keyframe after a source discontinuity.
    pub fn is_delta_coded(self) -> bool {
        !matches!(self, Codec::Jpeg)
    }

    /// Encoding name used in RTP caps.
    pub fn rtp_encoding_name(self) -> &'static str {
        match self {
            Codec::Jpeg => "JPEG",
            Codec::Vp8 => "VP8",
            Codec::Vp9 => "VP9",
            Codec::H264 => "H264",
            Codec::H265 => "H265",
        }
    }

    /// RTP payload type: 26 for JPEG (static), 96 (dynamic) otherwise.
    pub fn rtp_payload_type(self) -> i32 {
        match self {
            Codec::Jpeg => 26,
            _ => 96,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoMode {
    Stereo,
    Mono,
    Panoramic,
}

/// Predefined camera resolutions with display labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub label: &'static str,
}

impl Resolution {
    pub const LIST: &'static [Resolution] = &[
        Resolution { width: 640, height: 360, label: "nHD" },
        Resolution { width: 960, height: 540, label: "qHD" },
        Resolution { width: 1024, height: 576, label: "WSVGA" },
        Resolution { width: 1280, height: 720, label: "HD" },
        Resolution { width: 1600, height: 900, label: "HD+" },
        Resolution { width: 1920, height: 1080, label: "FHD" },
        Resolution { width: 2048, height: 1152, label: "QWXGA" },
        Resolution { width: 2560, height: 1440, label: "QHD" },
        Resolution { width: 3200, height: 1800, label: "WQXGA+" },
        Resolution { width: 3840, height: 2160, label: "UHD" },
    ];

    pub fn from_label(label: &str) -> Option<&'static Resolution> {
        Self::LIST.iter().find(|r| r.label == label)
    }

    pub fn from_index(index: usize) -> Option<&'static Resolution> {
        Self::LIST.get(index)
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

/// Streaming configuration exchanged over the control channel.
///
/// Field names follow the control protocol's camelCase JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingConfig {
    /// Destination host for the RTP/UDP streams.
    #[serde(rename = "ip")]
    pub host: String,
    pub port_left: u16,
    pub port_right: u16,
    pub codec: Codec,
    pub encoding_quality: u32,
    pub bitrate: u32,
    #[serde(rename = "horizontalResolution")]
    pub width: u32,
    #[serde(rename = "verticalResolution")]
    pub height: u32,
    pub video_mode: VideoMode,
    pub fps: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".into(),
            port_left: ports::LEFT_CAMERA,
            port_right: ports::RIGHT_CAMERA,
            codec: Codec::Jpeg,
            encoding_quality: 85,
            bitrate: 400_000,
            width: 1920,
            height: 1080,
            video_mode: VideoMode::Stereo,
            fps: 60,
        }
    }
}

impl StreamingConfig {
    /// Whether moving from `self` to `new` invalidates a running graph's
    /// topology. Bitrate and encoding quality are the only fields the
    /// encoder can absorb in place.
    pub fn is_structural_change(&self, new: &StreamingConfig) -> bool {
        self.width != new.width
            || self.height != new.height
            || self.fps != new.fps
            || self.codec != new.codec
            || self.video_mode != new.video_mode
            || self.host != new.host
            || self.port_left != new.port_left
            || self.port_right != new.port_right
    }

    pub fn port_for_sensor(&self, sensor_id: usize) -> u16 {
        if sensor_id == 0 {
            self.port_left
        } else {
            self.port_right
        }
    }
}

/// Versioned, atomically swapped desired configuration.
///
/// The control loop publishes here; pipeline workers poll the version to
/// notice changes without holding any lock across a bus poll.
pub struct ConfigCell {
    inner: ArcSwap<Versioned>,
}

struct Versioned {
    version: u64,
    config: StreamingConfig,
}

impl ConfigCell {
    /// Starts at version 0, meaning "no configuration published yet".
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(Versioned {
                version: 0,
                config: StreamingConfig::default(),
            }),
        }
    }

    pub fn publish(&self, config: StreamingConfig) -> u64 {
        let version = self.inner.load().version + 1;
        self.inner.store(Arc::new(Versioned { version, config }));
        version
    }

    /// Current (version, config). Version 0 means nothing published.
    pub fn load(&self) -> (u64, StreamingConfig) {
        let guard = self.inner.load();
        (guard.version, guard.config.clone())
    }

    pub fn version(&self) -> u64 {
        self.inner.load().version
    }
}

impl Default for ConfigCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> StreamingConfig {
        StreamingConfig::default()
    }

    #[test]
    fn quality_only_change_is_not_structural() {
        let old = base();
        let mut new = base();
        new.bitrate = 2_000_000;
        new.encoding_quality = 60;
        assert!(!old.is_structural_change(&new));
    }

    #[test]
    fn resolution_change_is_structural() {
        let old = base();
        let mut new = base();
        new.width = 1280;
        new.height = 720;
        assert!(old.is_structural_change(&new));
    }

    #[test]
    fn endpoint_change_is_structural() {
        let old = base();
        let mut new = base();
        new.port_left = 9000;
        assert!(old.is_structural_change(&new));
    }

    #[test]
    fn parses_control_json() {
        let json = r#"{
            "ip": "10.0.31.220",
            "portLeft": 8554,
            "portRight": 8556,
            "codec": "H264",
            "encodingQuality": 85,
            "bitrate": 4000000,
            "horizontalResolution": 1920,
            "verticalResolution": 1080,
            "videoMode": "panoramic",
            "fps": 60
        }"#;
        let cfg: StreamingConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.host, "10.0.31.220");
        assert_eq!(cfg.codec, Codec::H264);
        assert_eq!(cfg.video_mode, VideoMode::Panoramic);
        assert_eq!(cfg.width, 1920);
    }

    #[test]
    fn config_cell_versions_monotonic() {
        let cell = ConfigCell::new();
        assert_eq!(cell.version(), 0);
        cell.publish(base());
        cell.publish(base());
        assert_eq!(cell.version(), 2);
    }

    #[test]
    fn delta_coded_codecs() {
        assert!(!Codec::Jpeg.is_delta_coded());
        assert!(Codec::H264.is_delta_coded());
        assert!(Codec::H265.is_delta_coded());
    }
}
