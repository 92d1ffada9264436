//! The tracked point entity.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::backend::*;
use crate::config::Config;
use crate::curve::AnimatedKnob;
use crate::error::{Result, TrackerError};
use crate::events::*;
use crate::image::ChannelMask;
use crate::knob::{KnobLink, LinkState, SelectionKnob};
use crate::my_types::*;

static NEXT_MARKER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkerId(pub u64);

impl MarkerId {
    fn next() -> Self {
        MarkerId(NEXT_MARKER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Knob values of a marker. Pattern corners and search window corners are
/// relative to `center + offset`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerKnobs {
    pub script_name: String,
    pub label: String,
    pub center: AnimatedKnob<Vector2d>,
    pub offset: AnimatedKnob<Vector2d>,
    /// top-left, top-right, bottom-right, bottom-left
    pub pattern: [AnimatedKnob<Vector2d>; 4],
    pub search_min: AnimatedKnob<Vector2d>,
    pub search_max: AnimatedKnob<Vector2d>,
    pub error: AnimatedKnob<f64>,
    pub enabled: AnimatedKnob<bool>,
    pub motion_model: MotionModel,
    pub user_keyframes: BTreeSet<Frame>,
}

impl MarkerKnobs {
    pub fn new(script_name: &str, pattern_size: f64, search_size: f64, motion_model: MotionModel) -> Self {
        let p = pattern_size / 2.;
        let s = search_size / 2.;
        Self {
            script_name: script_name.to_string(),
            label: script_name.to_string(),
            center: AnimatedKnob::new(Vector2d::zeros()),
            offset: AnimatedKnob::new(Vector2d::zeros()),
            pattern: [
                AnimatedKnob::new(Vector2d::new(-p, -p)),
                AnimatedKnob::new(Vector2d::new(p, -p)),
                AnimatedKnob::new(Vector2d::new(p, p)),
                AnimatedKnob::new(Vector2d::new(-p, p)),
            ],
            search_min: AnimatedKnob::new(Vector2d::new(-s, -s)),
            search_max: AnimatedKnob::new(Vector2d::new(s, s)),
            error: AnimatedKnob::new(0.),
            enabled: AnimatedKnob::new(true),
            motion_model,
            user_keyframes: BTreeSet::new(),
        }
    }

    fn point_at(&self, time: Frame) -> Vector2d {
        self.center.value_at(time) + self.offset.value_at(time)
    }
}

struct MarkerState {
    knobs: MarkerKnobs,
    enabled_link: KnobLink<bool>,
    motion_model_link: KnobLink<MotionModel>,
    /// nonzero while track runs own the marker
    tracking_started: u32,
    /// keyframe changes held back while tracking
    pending: BTreeMap<KnobKind, BTreeSet<Frame>>,
}

impl MarkerState {
    fn record(
        &mut self,
        kind: KnobKind,
        times: Vec<Frame>,
        reason: ValueChangedReason,
        events: &mut Vec<TrackerEvent>,
    ) {
        if times.is_empty() {
            return;
        }
        if self.tracking_started > 0 {
            self.pending.entry(kind).or_default().extend(times);
        } else {
            events.push(TrackerEvent::KeyframeChanged {
                marker: self.knobs.script_name.clone(),
                knob: kind,
                times,
                reason,
            });
        }
    }

    fn write_enabled(
        &mut self,
        time: Frame,
        enabled: bool,
        reason: ValueChangedReason,
        events: &mut Vec<TrackerEvent>,
    ) {
        if !self.knobs.enabled.set_key(time, enabled) {
            return;
        }
        if self.tracking_started > 0 {
            self.pending.entry(KnobKind::Enabled).or_default().insert(time);
        } else {
            events.push(TrackerEvent::EnabledChanged {
                marker: self.knobs.script_name.clone(),
                time,
                enabled,
                reason,
            });
        }
    }

    /// Remove non-user keys of center, offset and error matching `remove`
    fn clear_tracked_keys(&mut self, remove: impl Fn(Frame) -> bool, events: &mut Vec<TrackerEvent>) {
        let user = self.knobs.user_keyframes.clone();
        let keep_user = |t: Frame| remove(t) && !user.contains(&t);
        let center = self.knobs.center.curve.remove_keys_where(keep_user);
        let offset = self.knobs.offset.curve.remove_keys_where(keep_user);
        let error = self.knobs.error.curve.remove_keys_where(keep_user);
        let reason = ValueChangedReason::UserEdited;
        self.record(KnobKind::Center, center, reason, events);
        self.record(KnobKind::Offset, offset, reason, events);
        self.record(KnobKind::Error, error, reason, events);
    }
}

/// A point tracked through the sequence
pub struct TrackMarker {
    id: MarkerId,
    backend: Arc<dyn TrackingBackend>,
    events: EventSender,
    state: Mutex<MarkerState>,
}

impl TrackMarker {
    /// A marker at the origin with the pattern and search window sizes of `config`
    pub fn create(
        script_name: &str,
        backend: Arc<dyn TrackingBackend>,
        config: &Config,
        events: EventSender,
    ) -> Arc<TrackMarker> {
        let knobs = MarkerKnobs::new(
            script_name,
            config.pattern_size,
            config.search_size,
            config.motion_model,
        );
        Self::from_knobs(knobs, backend, events)
    }

    pub fn from_knobs(
        knobs: MarkerKnobs,
        backend: Arc<dyn TrackingBackend>,
        events: EventSender,
    ) -> Arc<TrackMarker> {
        Arc::new(TrackMarker {
            id: MarkerId::next(),
            backend,
            events,
            state: Mutex::new(MarkerState {
                knobs,
                enabled_link: KnobLink::Free,
                motion_model_link: KnobLink::Free,
                tracking_started: 0,
                pending: BTreeMap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MarkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the marker lock, then send the events it produced
    fn modify<R>(&self, f: impl FnOnce(&mut MarkerState, &mut Vec<TrackerEvent>) -> R) -> R {
        let mut events = vec![];
        let result = {
            let mut state = self.lock();
            f(&mut state, &mut events)
        };
        for event in events {
            self.events.send(event);
        }
        result
    }

    pub fn id(&self) -> MarkerId {
        self.id
    }

    pub fn backend(&self) -> &Arc<dyn TrackingBackend> {
        &self.backend
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn script_name(&self) -> String {
        self.lock().knobs.script_name.clone()
    }

    pub fn label(&self) -> String {
        self.lock().knobs.label.clone()
    }

    pub fn set_label(&self, label: &str) {
        self.lock().knobs.label = label.to_string();
    }

    /// Copy of every knob value
    pub fn knobs(&self) -> MarkerKnobs {
        self.lock().knobs.clone()
    }

    pub fn center_at(&self, time: Frame) -> Vector2d {
        self.lock().knobs.center.value_at(time)
    }

    pub fn offset_at(&self, time: Frame) -> Vector2d {
        self.lock().knobs.offset.value_at(time)
    }

    /// Tracked point, `center + offset`
    pub fn point_at(&self, time: Frame) -> Vector2d {
        self.lock().knobs.point_at(time)
    }

    /// Absolute pattern corners
    pub fn pattern_at(&self, time: Frame) -> [Vector2d; 4] {
        let state = self.lock();
        let point = state.knobs.point_at(time);
        [0, 1, 2, 3].map(|i| state.knobs.pattern[i].value_at(time) + point)
    }

    /// Absolute search window, the region a partial viewer redraw covers
    pub fn search_region_at(&self, time: Frame) -> Rect {
        let state = self.lock();
        let point = state.knobs.point_at(time);
        let min = state.knobs.search_min.value_at(time) + point;
        let max = state.knobs.search_max.value_at(time) + point;
        Rect::new(min.x, min.y, max.x, max.y)
    }

    pub fn error_at(&self, time: Frame) -> f64 {
        self.lock().knobs.error.value_at(time)
    }

    pub fn is_enabled(&self, time: Frame) -> bool {
        self.lock().knobs.enabled.value_at(time)
    }

    pub fn motion_model(&self) -> MotionModel {
        self.lock().knobs.motion_model
    }

    pub fn center_keyframes(&self) -> Vec<Frame> {
        self.lock().knobs.center.curve.key_times()
    }

    pub fn pattern_keyframes(&self) -> Vec<Frame> {
        let state = self.lock();
        let mut times: BTreeSet<Frame> = BTreeSet::new();
        for corner in &state.knobs.pattern {
            times.extend(corner.curve.key_times());
        }
        times.into_iter().collect()
    }

    pub fn error_keyframes(&self) -> Vec<Frame> {
        self.lock().knobs.error.curve.key_times()
    }

    /// Times and values of the keys of the Enabled curve
    pub fn enabled_keyframes(&self) -> Vec<(Frame, bool)> {
        self.lock()
            .knobs
            .enabled
            .curve
            .iter()
            .map(|(t, v)| (t, *v))
            .collect()
    }

    pub fn set_center_at_time(&self, time: Frame, center: Vector2d, reason: ValueChangedReason) {
        self.modify(|state, events| {
            if state.knobs.center.set_key(time, center) {
                state.record(KnobKind::Center, vec![time], reason, events);
            }
        })
    }

    /// Move the marker, keying the center when it is already animated
    pub fn set_center(&self, time: Frame, center: Vector2d) {
        self.modify(|state, events| {
            let animated = state.knobs.center.is_animated();
            if state.knobs.center.set_value(time, center) && animated {
                state.record(KnobKind::Center, vec![time], ValueChangedReason::UserEdited, events);
            }
        })
    }

    pub fn set_offset(&self, time: Frame, offset: Vector2d) {
        self.modify(|state, events| {
            let animated = state.knobs.offset.is_animated();
            if state.knobs.offset.set_value(time, offset) && animated {
                state.record(KnobKind::Offset, vec![time], ValueChangedReason::UserEdited, events);
            }
        })
    }

    /// Remove the offset animation and set it back to zero
    pub fn reset_offset(&self) {
        self.modify(|state, events| {
            let times = state.knobs.offset.curve.clear();
            state.knobs.offset.static_value = Vector2d::zeros();
            state.record(KnobKind::Offset, times, ValueChangedReason::UserEdited, events);
        })
    }

    /// Set the pattern corners, relative to the tracked point
    pub fn set_pattern(&self, time: Frame, corners: [Vector2d; 4]) {
        self.modify(|state, events| {
            let mut changed = false;
            let mut animated = false;
            for (knob, corner) in state.knobs.pattern.iter_mut().zip(corners) {
                animated |= knob.is_animated();
                changed |= knob.set_value(time, corner);
            }
            if changed && animated {
                state.record(KnobKind::Pattern, vec![time], ValueChangedReason::UserEdited, events);
            }
        })
    }

    /// Set the search window corners, relative to the tracked point
    pub fn set_search_window(&self, min: Vector2d, max: Vector2d) {
        let mut state = self.lock();
        state.knobs.search_min.static_value = min;
        state.knobs.search_max.static_value = max;
    }

    /// Write the motion model. Fails while the knob follows the selection.
    pub fn set_motion_model(&self, model: MotionModel) -> Result<()> {
        let mut state = self.lock();
        if state.motion_model_link.state() == LinkState::Slaved {
            return Err(TrackerError::KnobSlaved(
                state.knobs.script_name.clone(),
                "motion model",
            ));
        }
        state.knobs.motion_model = model;
        Ok(())
    }

    /// Write the Enabled knob at `time` as an interactive edit. Fails while a
    /// track run holds the knob.
    pub fn set_enabled_at_time(&self, time: Frame, enabled: bool) -> Result<()> {
        self.modify(|state, events| {
            if state.enabled_link.is_leased() {
                return Err(TrackerError::KnobLeased(state.knobs.script_name.clone()));
            }
            state.write_enabled(time, enabled, ValueChangedReason::UserEdited, events);
            Ok(())
        })
    }

    /// Write the Enabled knob on behalf of the holder of its lease
    pub(crate) fn write_enabled_leased(&self, time: Frame, enabled: bool, reason: ValueChangedReason) {
        self.modify(|state, events| state.write_enabled(time, enabled, reason, events))
    }

    pub fn write_error(&self, time: Frame, error: f64, reason: ValueChangedReason) {
        self.modify(|state, events| {
            if state.knobs.error.set_key(time, error) {
                state.record(KnobKind::Error, vec![time], reason, events);
            }
        })
    }

    /// Key the outcome of a tracking step at `frame`. User keyframes are left
    /// untouched.
    pub fn apply_track_result(&self, frame: Frame, result: &TrackRegionResult) {
        self.modify(|state, events| {
            if state.knobs.user_keyframes.contains(&frame) {
                return;
            }
            let reason = ValueChangedReason::Tracking;
            let offset = state.knobs.offset.value_at(frame);
            if state.knobs.center.set_key(frame, result.point - offset) {
                state.record(KnobKind::Center, vec![frame], reason, events);
            }
            if state.knobs.motion_model.requires_pattern_keys() {
                let mut changed = false;
                for (knob, corner) in state.knobs.pattern.iter_mut().zip(result.pattern) {
                    changed |= knob.set_key(frame, corner - result.point);
                }
                if changed {
                    state.record(KnobKind::Pattern, vec![frame], reason, events);
                }
            }
            let error = if result.correlation.is_nan() {
                1.
            } else {
                1. - result.correlation
            };
            if state.knobs.error.set_key(frame, error) {
                state.record(KnobKind::Error, vec![frame], reason, events);
            }
        })
    }

    /// Freeze the current center into a key at `time` and the pattern into its
    /// current values
    pub fn set_keyframe_on_center_and_pattern_at_time(&self, time: Frame) {
        self.modify(|state, events| {
            let center = state.knobs.center.value_at(time);
            if state.knobs.center.set_key(time, center) {
                state.record(KnobKind::Center, vec![time], ValueChangedReason::Internal, events);
            }
            for knob in state.knobs.pattern.iter_mut() {
                let value = knob.value_at(time);
                knob.set_value(time, value);
            }
        })
    }

    /// Frame whose geometry serves as template when tracking `time`
    pub fn get_reference_frame(&self, time: Frame, step: i32) -> Frame {
        reference_frame(&self.lock().knobs.user_keyframes, time, step)
    }

    pub fn user_keyframes(&self) -> Vec<Frame> {
        self.lock().knobs.user_keyframes.iter().copied().collect()
    }

    pub fn is_user_keyframe(&self, time: Frame) -> bool {
        self.lock().knobs.user_keyframes.contains(&time)
    }

    pub fn previous_user_keyframe(&self, time: Frame) -> Option<Frame> {
        self.lock()
            .knobs
            .user_keyframes
            .range(..time)
            .next_back()
            .copied()
    }

    pub fn next_user_keyframe(&self, time: Frame) -> Option<Frame> {
        self.lock()
            .knobs
            .user_keyframes
            .range((Bound::Excluded(time), Bound::Unbounded))
            .next()
            .copied()
    }

    pub fn set_user_keyframe(&self, time: Frame) {
        self.modify(|state, events| {
            if state.knobs.user_keyframes.insert(time) {
                events.push(TrackerEvent::UserKeyframeAdded {
                    marker: state.knobs.script_name.clone(),
                    time,
                });
            }
        })
    }

    pub fn remove_user_keyframe(&self, time: Frame) {
        self.modify(|state, events| {
            if state.knobs.user_keyframes.remove(&time) {
                events.push(TrackerEvent::UserKeyframeRemoved {
                    marker: state.knobs.script_name.clone(),
                    time,
                });
            }
        })
    }

    /// Remove the tracked animation of center, offset and error
    pub fn clear_animation(&self) {
        self.modify(|state, events| state.clear_tracked_keys(|_| true, events))
    }

    /// Remove tracked keys before `time`, user keyframes stay
    pub fn clear_animation_before(&self, time: Frame) {
        self.modify(|state, events| state.clear_tracked_keys(|t| t < time, events))
    }

    /// Remove tracked keys after `time`, user keyframes stay
    pub fn clear_animation_after(&self, time: Frame) {
        self.modify(|state, events| state.clear_tracked_keys(|t| t > time, events))
    }

    /// Reset every knob to its default, keeping the center where it is at `time`
    pub fn reset_track(&self, time: Frame) {
        self.modify(|state, events| {
            let center = state.knobs.center.value_at(time);
            let defaults = MarkerKnobs::new(
                &state.knobs.script_name,
                state.knobs.pattern[2].static_value.x * 2.,
                state.knobs.search_max.static_value.x * 2.,
                state.knobs.motion_model,
            );
            let reason = ValueChangedReason::UserEdited;
            let center_times = state.knobs.center.curve.clear();
            let error_times = state.knobs.error.curve.clear();
            let offset_times = state.knobs.offset.curve.clear();
            let enabled_times = state.knobs.enabled.curve.clear();
            let mut pattern_times = BTreeSet::new();
            for knob in state.knobs.pattern.iter() {
                pattern_times.extend(knob.curve.key_times());
            }
            let label = state.knobs.label.clone();
            let user_keys = std::mem::take(&mut state.knobs.user_keyframes);
            state.knobs = MarkerKnobs {
                label,
                center: AnimatedKnob::new(center),
                ..defaults
            };
            state.record(KnobKind::Center, center_times, reason, events);
            state.record(KnobKind::Error, error_times, reason, events);
            state.record(KnobKind::Offset, offset_times, reason, events);
            state.record(KnobKind::Enabled, enabled_times, reason, events);
            state.record(KnobKind::Pattern, pattern_times.into_iter().collect(), reason, events);
            for time in user_keys {
                events.push(TrackerEvent::UserKeyframeRemoved {
                    marker: state.knobs.script_name.clone(),
                    time,
                });
            }
        })
    }

    /// Geometry at `reference_frame` handed to the backend to track `target_frame`
    pub fn snapshot(
        &self,
        reference_frame: Frame,
        target_frame: Frame,
        step: i32,
        channels: ChannelMask,
    ) -> MarkerSnapshot {
        let state = self.lock();
        let knobs = &state.knobs;
        let point = knobs.point_at(reference_frame);
        let guess = knobs.point_at(target_frame - step);
        let min = knobs.search_min.value_at(target_frame - step) + guess;
        let max = knobs.search_max.value_at(target_frame - step) + guess;
        MarkerSnapshot {
            name: knobs.script_name.clone(),
            reference_frame,
            point,
            guess,
            offset: knobs.offset.value_at(reference_frame),
            pattern: [0, 1, 2, 3].map(|i| knobs.pattern[i].value_at(reference_frame) + point),
            search_window: Rect::new(min.x, min.y, max.x, max.y),
            motion_model: knobs.motion_model,
            channels,
        }
    }

    pub fn notify_tracking_started(&self) {
        let mut state = self.lock();
        state.tracking_started = state.tracking_started.saturating_add(1);
    }

    /// The outermost call sends the keyframe changes held back while tracking
    pub fn notify_tracking_ended(&self) {
        self.modify(|state, events| {
            state.tracking_started = state.tracking_started.saturating_sub(1);
            if state.tracking_started > 0 {
                return;
            }
            let pending = std::mem::take(&mut state.pending);
            for (knob, times) in pending {
                debug!(
                    "{}: {} {:?} keys changed while tracking",
                    state.knobs.script_name,
                    times.len(),
                    knob
                );
                events.push(TrackerEvent::KeyframeChanged {
                    marker: state.knobs.script_name.clone(),
                    knob,
                    times: times.into_iter().collect(),
                    reason: ValueChangedReason::Tracking,
                });
            }
        })
    }

    pub fn is_tracking(&self) -> bool {
        self.lock().tracking_started > 0
    }

    pub fn enabled_link_state(&self) -> LinkState {
        self.lock().enabled_link.state()
    }

    /// Selection knob the Enabled knob follows, or will follow after the run
    pub fn enabled_master(&self) -> Option<Arc<SelectionKnob<bool>>> {
        self.lock().enabled_link.master().cloned()
    }

    pub fn motion_model_link_state(&self) -> LinkState {
        self.lock().motion_model_link.state()
    }

    pub(crate) fn slave_to_selection(
        &self,
        enabled: &Arc<SelectionKnob<bool>>,
        motion_model: &Arc<SelectionKnob<MotionModel>>,
    ) {
        let mut state = self.lock();
        state.enabled_link.slave_to(enabled.clone());
        state.motion_model_link.slave_to(motion_model.clone());
    }

    pub(crate) fn unslave_from_selection(&self) {
        let mut state = self.lock();
        state.enabled_link.unslave();
        state.motion_model_link.unslave();
    }

    /// Forward a write of the enabled selection knob. Returns false when the
    /// knob does not follow `master`.
    pub(crate) fn follow_enabled(
        &self,
        master: &Arc<SelectionKnob<bool>>,
        time: Frame,
        enabled: bool,
    ) -> bool {
        self.modify(|state, events| {
            if !state.enabled_link.follows(master) {
                return false;
            }
            state.write_enabled(time, enabled, ValueChangedReason::UserEdited, events);
            true
        })
    }

    pub(crate) fn follow_motion_model(
        &self,
        master: &Arc<SelectionKnob<MotionModel>>,
        model: MotionModel,
    ) -> bool {
        let mut state = self.lock();
        if !state.motion_model_link.follows(master) {
            return false;
        }
        state.knobs.motion_model = model;
        true
    }

    pub(crate) fn acquire_enabled(&self) {
        self.lock().enabled_link.acquire();
    }

    /// Release one hold on the Enabled knob. When this was the last one and
    /// the knob gets slaved back, its value at `frame` is copied to the master
    /// first.
    pub(crate) fn release_enabled(&self, frame: Frame) {
        let mut state = self.lock();
        let value = state.knobs.enabled.value_at(frame);
        if let Some(master) = state.enabled_link.release() {
            master.set_value(value);
        }
    }
}

impl fmt::Debug for TrackMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("TrackMarker")
            .field("id", &self.id)
            .field("name", &state.knobs.script_name)
            .field("backend", &self.backend.kind())
            .field("user_keyframes", &state.knobs.user_keyframes)
            .field("enabled_link", &state.enabled_link)
            .finish()
    }
}

/// The user keyframe nearest to `time`, ties going to the later one. Without
/// user keyframes the previously visited frame.
pub fn reference_frame(user_keyframes: &BTreeSet<Frame>, time: Frame, step: i32) -> Frame {
    let Some(&last) = user_keyframes.last() else {
        return time - step;
    };
    let Some(&upper) = user_keyframes
        .range((Bound::Excluded(time), Bound::Unbounded))
        .next()
    else {
        return last;
    };
    let Some(&lower) = user_keyframes.range(..upper).next_back() else {
        return upper;
    };
    if lower == time {
        return time;
    }
    if (time - lower) < (upper - time) {
        lower
    } else {
        upper
    }
}
