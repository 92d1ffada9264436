use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::frame_accessor::ImageAccessor;
use crate::image::ChannelMask;
use crate::marker::TrackMarker;
use crate::my_types::*;

/// Consumes the tracked markers once a run ends, e.g. to fit a corner pin
pub trait TransformSolver: Send + Sync {
    fn solve(&self, markers: &[Arc<TrackMarker>], reference_frame: Frame);
}

/// Everything a track run needs. Built once per request and never mutated,
/// a newer request replaces it as a whole.
#[derive(Clone)]
pub struct TrackArgs {
    start: Frame,
    end: Frame,
    step: i32,
    tracks: Vec<Arc<TrackMarker>>,
    format: Format,
    channels: ChannelMask,
    auto_disable: bool,
    update_viewer: bool,
    accessor: Arc<dyn ImageAccessor>,
    solver: Option<Arc<dyn TransformSolver>>,
    transform_reference_frame: Frame,
    progress_interval: Duration,
    partial_update_max_tracks: usize,
}

impl TrackArgs {
    /// Run over `start, start + step, ...` stopping before `end`
    pub fn new(
        start: Frame,
        end: Frame,
        step: i32,
        tracks: Vec<Arc<TrackMarker>>,
        accessor: Arc<dyn ImageAccessor>,
    ) -> Self {
        let config = Config::current();
        Self {
            start,
            end,
            step,
            tracks,
            format: accessor.format(),
            channels: config.channels,
            auto_disable: config.auto_key,
            update_viewer: config.update_viewer,
            accessor,
            solver: None,
            transform_reference_frame: start,
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            partial_update_max_tracks: config.partial_update_max_tracks,
        }
    }

    pub fn with_channels(mut self, channels: ChannelMask) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_auto_disable(mut self, auto_disable: bool) -> Self {
        self.auto_disable = auto_disable;
        self
    }

    pub fn with_viewer_updates(mut self, update_viewer: bool) -> Self {
        self.update_viewer = update_viewer;
        self
    }

    pub fn with_solver(mut self, solver: Arc<dyn TransformSolver>, reference_frame: Frame) -> Self {
        self.solver = Some(solver);
        self.transform_reference_frame = reference_frame;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_partial_update_max_tracks(mut self, count: usize) -> Self {
        self.partial_update_max_tracks = count;
        self
    }

    pub fn start(&self) -> Frame {
        self.start
    }

    pub fn end(&self) -> Frame {
        self.end
    }

    pub fn step(&self) -> i32 {
        self.step
    }

    pub fn tracks(&self) -> &[Arc<TrackMarker>] {
        &self.tracks
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn channels(&self) -> ChannelMask {
        self.channels
    }

    pub fn auto_disable(&self) -> bool {
        self.auto_disable
    }

    pub fn update_viewer(&self) -> bool {
        self.update_viewer
    }

    pub fn accessor(&self) -> &dyn ImageAccessor {
        self.accessor.as_ref()
    }

    pub fn solver(&self) -> Option<&Arc<dyn TransformSolver>> {
        self.solver.as_ref()
    }

    pub fn transform_reference_frame(&self) -> Frame {
        self.transform_reference_frame
    }

    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }

    pub fn frames(&self) -> Vec<Frame> {
        frame_range(self.start, self.end, self.step)
    }

    /// Areas of the viewer to redraw at `frame`. None asks for a full redraw,
    /// used once the markers are too many for a partial one to pay off.
    pub fn redraw_areas(&self, frame: Frame) -> Option<Vec<Rect>> {
        if self.tracks.len() >= self.partial_update_max_tracks {
            return None;
        }
        Some(
            self.tracks
                .iter()
                .map(|track| track.search_region_at(frame))
                .collect(),
        )
    }
}

impl fmt::Debug for TrackArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackArgs")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("step", &self.step)
            .field("tracks", &self.tracks.len())
            .field("format", &self.format)
            .field("auto_disable", &self.auto_disable)
            .finish()
    }
}

/// Frames `start, start + step, ...` strictly before `end` in the stepping
/// direction. Empty when `step` is zero or points away from `end`.
pub fn frame_range(start: Frame, end: Frame, step: i32) -> Vec<Frame> {
    if step == 0 {
        return vec![];
    }
    let mut frames = vec![];
    let mut frame = start;
    while (step > 0 && frame < end) || (step < 0 && frame > end) {
        frames.push(frame);
        frame = match frame.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    frames
}
