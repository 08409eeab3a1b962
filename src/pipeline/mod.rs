//! Sender-side media graph lifecycle: construction, supervision, dynamic
//! reconfiguration and the panoramic camera window.

pub mod control;
pub mod launch;
pub mod panoramic;
pub mod supervisor;

use thiserror::Error;

use crate::Codec;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported codec in this build: {0:?}")]
    UnsupportedCodec(Codec),
    #[error("invalid resolution {width}x{height}")]
    InvalidResolution { width: u32, height: u32 },
    #[error("missing element '{0}' in pipeline")]
    MissingElement(String),
    #[error("failed to parse pipeline: {0}")]
    Parse(#[from] gstreamer::glib::Error),
    #[error("live graph edit failed: {0}")]
    GraphEdit(String),
    #[error("pipeline refused state change")]
    StateChange,
}
