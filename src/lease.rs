//! Exclusive write access to the Enabled knob of the markers of a run.
//!
//! While a lease is alive the Enabled knob of each covered marker is detached
//! from the selection knob: UI writes through the selection skip it and direct
//! UI writes fail with `TrackerError::KnobLeased`. Releasing the lease copies
//! the marker value into the selection knob and slaves the marker back.

use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use crate::error::{Result, TrackerError};
use crate::events::ValueChangedReason;
use crate::marker::TrackMarker;
use crate::my_types::Frame;

pub struct EnabledLease {
    markers: Vec<Arc<TrackMarker>>,
    /// frame used to resync the selection knobs if the lease is dropped
    fallback_frame: Frame,
    disabled: Mutex<Vec<(String, Frame)>>,
    released: bool,
}

impl EnabledLease {
    pub fn acquire(markers: &[Arc<TrackMarker>], fallback_frame: Frame) -> Self {
        for marker in markers {
            marker.acquire_enabled();
        }
        debug!("leased the enabled knob of {} markers", markers.len());
        Self {
            markers: markers.to_vec(),
            fallback_frame,
            disabled: Mutex::new(vec![]),
            released: false,
        }
    }

    pub fn covers(&self, marker: &TrackMarker) -> bool {
        self.markers.iter().any(|m| m.id() == marker.id())
    }

    /// Write the Enabled knob of a covered marker on behalf of a track run
    pub fn write_enabled(&self, marker: &TrackMarker, time: Frame, enabled: bool) -> Result<()> {
        if !self.covers(marker) {
            return Err(TrackerError::KnobLeased(marker.script_name()));
        }
        marker.write_enabled_leased(time, enabled, ValueChangedReason::Tracking);
        if !enabled {
            self.disabled
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((marker.script_name(), time));
        }
        Ok(())
    }

    /// Markers disabled through this lease with the frame they were disabled at
    pub fn disabled_markers(&self) -> Vec<(String, Frame)> {
        self.disabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Give the knobs back, resyncing the selection knobs from the marker
    /// values at `frame`
    pub fn release(mut self, frame: Frame) -> Vec<(String, Frame)> {
        self.release_all(frame);
        self.disabled_markers()
    }

    fn release_all(&mut self, frame: Frame) {
        if self.released {
            return;
        }
        self.released = true;
        for marker in &self.markers {
            marker.release_enabled(frame);
        }
    }
}

impl Drop for EnabledLease {
    fn drop(&mut self) {
        let frame = self.fallback_frame;
        self.release_all(frame);
    }
}
