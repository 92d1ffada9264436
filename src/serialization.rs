//! Saving and restoring markers and whole tracker contexts as JSON.

use std::str::FromStr;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::config::Config;
use crate::context::TrackerContext;
use crate::error::{Result, TrackerError};
use crate::events::{EventSender, SelectionReason};
use crate::marker::{MarkerKnobs, TrackMarker};
use crate::my_types::*;

pub const SERIALIZATION_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerSerialization {
    /// name of the tracking backend, see `BackendKind::name`
    pub backend: String,
    pub knobs: MarkerKnobs,
}

impl MarkerSerialization {
    pub fn from_marker(marker: &TrackMarker) -> Self {
        Self {
            backend: marker.backend_kind().name().to_string(),
            knobs: marker.knobs(),
        }
    }

    /// Rebuild the marker. An unknown backend name falls back to the
    /// configured backend.
    pub fn into_marker(self, config: &Config, events: EventSender) -> Arc<TrackMarker> {
        let backend = BackendKind::from_str(&self.backend).unwrap_or_else(|err| {
            warn!(
                "{}: {}, using the {} backend",
                self.knobs.script_name, err, config.backend
            );
            config.backend
        });
        TrackMarker::from_knobs(self.knobs, backend.create(config), events)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextSerialization {
    pub version: u32,
    pub markers: Vec<MarkerSerialization>,
    /// script names of the selected markers
    #[serde(default)]
    pub selected: Vec<String>,
    #[serde(default)]
    pub transform_reference_frame: Frame,
    #[serde(default)]
    pub current_frame: Frame,
}

impl ContextSerialization {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let serialization: Self = serde_json::from_str(json)?;
        if serialization.version > SERIALIZATION_VERSION {
            warn!(
                "loading tracker saved with version {}, newer than {}",
                serialization.version, SERIALIZATION_VERSION
            );
        }
        Ok(serialization)
    }
}

impl TrackerContext {
    pub fn save(&self) -> ContextSerialization {
        ContextSerialization {
            version: SERIALIZATION_VERSION,
            markers: self
                .all_markers()
                .iter()
                .map(|m| MarkerSerialization::from_marker(m))
                .collect(),
            selected: self
                .selected_markers()
                .iter()
                .map(|m| m.script_name())
                .collect(),
            transform_reference_frame: self.transform_reference_frame(),
            current_frame: self.current_frame(),
        }
    }

    /// Replace every marker with the saved ones. A running track is aborted
    /// first.
    pub fn load(&self, serialization: ContextSerialization) -> Result<()> {
        let mut names = std::collections::BTreeSet::new();
        for marker in &serialization.markers {
            if !names.insert(marker.knobs.script_name.clone()) {
                return Err(TrackerError::DuplicateMarkerName(
                    marker.knobs.script_name.clone(),
                ));
            }
        }

        self.abort_tracking_blocking();
        let markers: Vec<_> = serialization
            .markers
            .into_iter()
            .map(|m| m.into_marker(self.config(), self.event_sender()))
            .collect();
        info!("loaded {} markers", markers.len());
        self.replace_markers(markers);
        self.set_transform_reference_frame(serialization.transform_reference_frame);
        self.set_current_frame(serialization.current_frame);

        let selected: Vec<_> = serialization
            .selected
            .iter()
            .filter_map(|name| self.marker_by_name(name))
            .collect();
        if !selected.is_empty() {
            self.add_tracks_to_selection(&selected, SelectionReason::Internal);
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        self.save().to_json()
    }

    pub fn load_json(&self, json: &str) -> Result<()> {
        self.load(ContextSerialization::from_json(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MotionModel;

    #[test]
    fn test_unknown_backend_falls_back() {
        let config = Config {
            backend: BackendKind::PatternMatch,
            ..Config::default()
        };
        let serialization = MarkerSerialization {
            backend: "planar".to_string(),
            knobs: MarkerKnobs::new("Track1", 11., 31., MotionModel::Affine),
        };
        let marker = serialization.into_marker(&config, EventSender::disconnected());
        assert_eq!(marker.backend_kind(), BackendKind::PatternMatch);
        assert_eq!(marker.motion_model(), MotionModel::Affine);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let (context, _events) = TrackerContext::new(Config::default()).unwrap();
        let marker = MarkerSerialization {
            backend: "pattern-match".to_string(),
            knobs: MarkerKnobs::new("Track1", 11., 31., MotionModel::Translation),
        };
        let serialization = ContextSerialization {
            version: SERIALIZATION_VERSION,
            markers: vec![marker.clone(), marker],
            selected: vec![],
            transform_reference_frame: 0,
            current_frame: 0,
        };
        assert!(matches!(
            context.load(serialization),
            Err(TrackerError::DuplicateMarkerName(_))
        ));
    }

    #[test]
    fn test_round_trip() {
        let (context, _events) = TrackerContext::new(Config::default()).unwrap();
        let a = context.create_marker().unwrap();
        let b = context.create_marker_with_backend(BackendKind::PatternMatch).unwrap();
        a.set_center_at_time(3, Vector2d::new(1.5, 2.), crate::events::ValueChangedReason::UserEdited);
        a.set_user_keyframe(3);
        b.set_enabled_at_time(7, false).unwrap();
        context.add_track_to_selection(&b, SelectionReason::Viewer);
        context.set_transform_reference_frame(3);

        let json = context.to_json().unwrap();
        let (restored, _events) = TrackerContext::new(Config::default()).unwrap();
        restored.create_marker().unwrap();
        restored.load_json(&json).unwrap();

        let markers = restored.all_markers();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].knobs(), a.knobs());
        assert_eq!(markers[1].knobs(), b.knobs());
        assert_eq!(markers[1].backend_kind(), BackendKind::PatternMatch);
        assert!(!markers[1].is_enabled(8));
        assert_eq!(markers[0].user_keyframes(), vec![3]);
        assert_eq!(restored.transform_reference_frame(), 3);
        let selected = restored.selected_markers();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].script_name(), b.script_name());
    }
}
