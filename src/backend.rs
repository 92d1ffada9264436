//! Tracking backends: the per-marker matching strategies the step functor
//! delegates to.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::Result;
use crate::frame_accessor::ImageAccessor;
use crate::image::ChannelMask;
use crate::my_types::*;
use crate::optical_flow::OpticalFlow;
use crate::pattern_match::PatternMatch;

/// Deformation allowed for the pattern between the reference frame and the
/// tracked frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MotionModel {
    #[default]
    Translation,
    TransRotation,
    TransScale,
    TransRotScale,
    Affine,
    Homography,
}

impl MotionModel {
    pub const ALL: [MotionModel; 6] = [
        MotionModel::Translation,
        MotionModel::TransRotation,
        MotionModel::TransScale,
        MotionModel::TransRotScale,
        MotionModel::Affine,
        MotionModel::Homography,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            MotionModel::Translation => "Trans.",
            MotionModel::TransRotation => "Trans.+Rot.",
            MotionModel::TransScale => "Trans.+Scale",
            MotionModel::TransRotScale => "Trans.+Rot.+Scale",
            MotionModel::Affine => "Affine",
            MotionModel::Homography => "Perspective",
        }
    }

    pub fn help(&self) -> &'static str {
        match self {
            MotionModel::Translation => "Search for markers that are only translated between frames.",
            MotionModel::TransRotation => {
                "Search for markers that are translated and rotated between frames."
            }
            MotionModel::TransScale => {
                "Search for markers that are translated and scaled between frames."
            }
            MotionModel::TransRotScale => {
                "Search for markers that are translated, rotated and scaled between frames."
            }
            MotionModel::Affine => {
                "Search for markers that are undergoing an affine transformation between frames."
            }
            MotionModel::Homography => {
                "Search for markers that are undergoing a perspective transformation between frames."
            }
        }
    }

    /// Whether a tracking step keys the pattern corners along with the center
    pub fn requires_pattern_keys(&self) -> bool {
        *self != MotionModel::Translation
    }

    fn name(&self) -> &'static str {
        match self {
            MotionModel::Translation => "translation",
            MotionModel::TransRotation => "trans-rotation",
            MotionModel::TransScale => "trans-scale",
            MotionModel::TransRotScale => "trans-rot-scale",
            MotionModel::Affine => "affine",
            MotionModel::Homography => "homography",
        }
    }
}

impl FromStr for MotionModel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.to_ascii_lowercase();
        if s == "perspective" {
            return Ok(MotionModel::Homography);
        }
        MotionModel::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| format!("unknown motion model \"{s}\""))
    }
}

impl fmt::Display for MotionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Available tracking backends. The backend of a marker is chosen when the
/// marker is created and never changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    OpticalFlow,
    PatternMatch,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::OpticalFlow => "optical-flow",
            BackendKind::PatternMatch => "pattern-match",
        }
    }

    pub fn create(&self, config: &Config) -> Arc<dyn TrackingBackend> {
        match self {
            BackendKind::OpticalFlow => Arc::new(OpticalFlow::new(config)),
            BackendKind::PatternMatch => Arc::new(PatternMatch::new(config)),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "optical-flow" => Ok(BackendKind::OpticalFlow),
            "pattern-match" => Ok(BackendKind::PatternMatch),
            _ => Err(format!("unknown tracking backend \"{s}\"")),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Geometry of one marker at its reference frame, in absolute pixel
/// coordinates. This is all a backend gets to see of the marker.
#[derive(Clone, Debug, PartialEq)]
pub struct MarkerSnapshot {
    pub name: String,
    pub reference_frame: Frame,
    /// center + offset, the point that is matched
    pub point: Vector2d,
    /// where the point was at the previously visited frame, the search starts there
    pub guess: Vector2d,
    pub offset: Vector2d,
    /// top-left, top-right, bottom-right, bottom-left
    pub pattern: [Vector2d; 4],
    /// centered on `guess`
    pub search_window: Rect,
    pub motion_model: MotionModel,
    pub channels: ChannelMask,
}

impl MarkerSnapshot {
    pub fn pattern_bounds(&self) -> Rect {
        Rect::bounding(&self.pattern)
    }

    /// Half extents of the pattern around the tracked point, whole pixels
    pub fn pattern_half_size(&self) -> (i32, i32) {
        let mut half_w: f64 = 1.;
        let mut half_h: f64 = 1.;
        for corner in &self.pattern {
            half_w = half_w.max((corner.x - self.point.x).abs());
            half_h = half_h.max((corner.y - self.point.y).abs());
        }
        (half_w.round() as i32, half_h.round() as i32)
    }
}

/// Outcome of one successful backend call
#[derive(Clone, Debug, PartialEq)]
pub struct TrackRegionResult {
    /// tracked position of `MarkerSnapshot::point` in the target frame
    pub point: Vector2d,
    /// tracked pattern corners, absolute
    pub pattern: [Vector2d; 4],
    /// in `[-1, 1]`, 1 for a perfect match
    pub correlation: f64,
}

pub trait TrackingBackend: Send + Sync + fmt::Debug {
    /// Find the pattern described by `reference` in `target_frame`. Any `Err`
    /// is a failed step for this marker only.
    fn track(
        &self,
        reference: &MarkerSnapshot,
        target_frame: Frame,
        accessor: &dyn ImageAccessor,
    ) -> Result<TrackRegionResult>;

    fn kind(&self) -> BackendKind;
}

/// Shift every corner of a pattern by `delta`
pub fn translate_pattern(pattern: &[Vector2d; 4], delta: Vector2d) -> [Vector2d; 4] {
    pattern.map(|p| p + delta)
}
