//! Error type shared by the tracking engine.

use thiserror::Error;

use crate::my_types::Frame;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("frame step must not be zero")]
    InvalidStep,

    #[error("frame {0} is not available in the sequence")]
    FrameUnavailable(Frame),

    #[error("patch around ({x:.1}, {y:.1}) leaves the image at frame {frame}")]
    PatchOutOfBounds { frame: Frame, x: f64, y: f64 },

    #[error("cannot process image with shape {width} x {height}")]
    ImageShape { width: usize, height: usize },

    #[error("the enabled knob of {0} is leased to a running track")]
    KnobLeased(String),

    #[error("the {1} knob of {0} follows the selection")]
    KnobSlaved(String, &'static str),

    #[error("no marker named {0}")]
    MarkerNotFound(String),

    #[error("a marker named {0} already exists")]
    DuplicateMarkerName(String),

    #[error("no image sequence is connected")]
    NoSequence,

    #[error("the track scheduler thread has stopped")]
    SchedulerStopped,

    #[error("cannot start the track worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("cannot build the track thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("tracking backend failed: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, TrackerError>;
