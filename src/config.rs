use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendKind, MotionModel};
use crate::image::ChannelMask;

pub static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[derive(clap::Parser)]
#[serde(default)]
pub struct Config {
    #[clap(long, default_value = "0")]
    pub seed: u64,

    /// Size in pixels of the pattern window of new markers
    #[clap(long, default_value = "21")]
    pub pattern_size: f64,

    /// Size in pixels of the search window of new markers
    #[clap(long, default_value = "71")]
    pub search_size: f64,

    #[clap(long, default_value = "translation")]
    pub motion_model: MotionModel,

    #[clap(long, default_value = "optical-flow")]
    pub backend: BackendKind,

    /// A step fails when `1 - correlation` exceeds this value
    #[clap(long, default_value = "0.25")]
    pub max_error: f64,

    #[clap(long, default_value = "50")]
    pub max_iterations: usize,

    #[clap(long, default_value = "3")]
    pub pyramid_levels: usize,

    /// Side of the Lucas-Kanade integration window, odd
    #[clap(long, default_value = "7")]
    pub lk_window: usize,

    /// Color channels used to build the tracked luminance, e.g. `rgb` or `g`
    #[clap(long, default_value = "rgb")]
    pub channels: ChannelMask,

    /// Disable markers at the frame where tracking fails
    #[clap(long = "no-auto-key", parse(from_flag = std::ops::Not::not))]
    pub auto_key: bool,

    #[clap(long = "no-viewer-update", parse(from_flag = std::ops::Not::not))]
    pub update_viewer: bool,

    /// Solve the transform once a track run finishes
    #[clap(long = "no-auto-solve", parse(from_flag = std::ops::Not::not))]
    pub auto_solve: bool,

    #[clap(long, default_value = "200")]
    pub progress_interval_ms: u64,

    /// Below this many markers the viewer redraws only the search windows
    #[clap(long, default_value = "8")]
    pub partial_update_max_tracks: usize,

    /// Worker threads used per frame, 0 lets rayon decide
    #[clap(long, default_value = "0")]
    pub threads: usize,

    #[clap(long, default_value = "1024")]
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 0,
            pattern_size: 21.,
            search_size: 71.,
            motion_model: MotionModel::Translation,
            backend: BackendKind::OpticalFlow,
            max_error: 0.25,
            max_iterations: 50,
            pyramid_levels: 3,
            lk_window: 7,
            channels: ChannelMask::default(),
            auto_key: true,
            update_viewer: true,
            auto_solve: true,
            progress_interval_ms: 200,
            partial_update_max_tracks: 8,
            threads: 0,
            event_capacity: 1024,
        }
    }
}

impl Config {
    /// The process-wide configuration, or the defaults when none was installed
    pub fn current() -> Config {
        CONFIG.get().cloned().unwrap_or_default()
    }

    pub fn min_correlation(&self) -> f64 {
        (1. - self.max_error).clamp(0., 1.)
    }
}
