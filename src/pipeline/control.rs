//! Line-delimited JSON control channel on stdin.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::{ConfigCell, StreamingConfig};

/// One control line. `{"cmd":"update","config":{...}}` publishes a new
/// configuration; `{"cmd":"stop"}` shuts the driver down.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ControlMessage {
    Update { config: StreamingConfig },
    Stop,
}

/// Read control messages from stdin until EOF or a stop command.
/// Malformed lines are logged and skipped; the operator's console should
/// never kill the stream.
pub async fn run_control_loop(config: Arc<ConfigCell>, stop: Arc<AtomicBool>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("control channel closed");
                break;
            }
            Err(err) => {
                warn!(%err, "control channel read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<ControlMessage>(&line) {
            Ok(ControlMessage::Update { config: new_config }) => {
                let version = config.publish(new_config);
                info!(version, "published new streaming configuration");
            }
            Ok(ControlMessage::Stop) => {
                info!("stop requested over control channel");
                break;
            }
            Err(err) => {
                warn!(%err, line, "ignoring malformed control message");
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Codec, VideoMode};

    #[test]
    fn parses_update_command() {
        let line = r#"{"cmd":"update","config":{
            "ip":"10.0.31.220","portLeft":8554,"portRight":8556,
            "codec":"H265","encodingQuality":85,"bitrate":8000000,
            "horizontalResolution":2560,"verticalResolution":1440,
            "videoMode":"stereo","fps":60}}"#;
        let msg: ControlMessage = serde_json::from_str(line).unwrap();
        match msg {
            ControlMessage::Update { config } => {
                assert_eq!(config.codec, Codec::H265);
                assert_eq!(config.video_mode, VideoMode::Stereo);
                assert_eq!(config.width, 2560);
                assert_eq!(config.bitrate, 8_000_000);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parses_stop_command() {
        let msg: ControlMessage = serde_json::from_str(r#"{"cmd":"stop"}"#).unwrap();
        assert!(matches!(msg, ControlMessage::Stop));
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(serde_json::from_str::<ControlMessage>(r#"{"cmd":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<ControlMessage>("not json").is_err());
    }
}
