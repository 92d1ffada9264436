//! The marker collection of a tracker: selection, knob hand-off around runs
//! and the entry points that issue track requests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use crate::backend::{BackendKind, MotionModel};
use crate::config::Config;
use crate::error::{Result, TrackerError};
use crate::events::*;
use crate::frame_accessor::{FrameAccessor, ImageAccessor, SequenceSource};
use crate::knob::SelectionKnob;
use crate::marker::{MarkerId, TrackMarker};
use crate::my_types::*;
use crate::scheduler::TrackScheduler;
use crate::track_args::{TrackArgs, TransformSolver};

const TRACK_BASE_NAME: &str = "Track";

#[derive(Default)]
struct ContextInner {
    markers: Vec<Arc<TrackMarker>>,
    selected: Vec<Arc<TrackMarker>>,
    markers_to_slave: Vec<Arc<TrackMarker>>,
    markers_to_unslave: Vec<Arc<TrackMarker>>,
    begin_selection_counter: u32,
    selection_recursion: u32,
    /// selection at the outermost `begin_edit_selection`
    selection_before: Option<Vec<MarkerId>>,
}

impl ContextInner {
    fn selected_ids(&self) -> Vec<MarkerId> {
        self.selected.iter().map(|m| m.id()).collect()
    }

    fn increment_selection_counter(&mut self) {
        if self.begin_selection_counter == 0 {
            self.selection_before = Some(self.selected_ids());
        }
        self.begin_selection_counter += 1;
    }

    fn decrement_selection_counter(&mut self) {
        self.begin_selection_counter = self.begin_selection_counter.saturating_sub(1);
    }

    fn add_to_selection_list(&mut self, marker: &Arc<TrackMarker>) {
        if self.selected.iter().any(|m| m.id() == marker.id()) {
            return;
        }
        self.selected.push(marker.clone());
        self.markers_to_unslave.retain(|m| m.id() != marker.id());
        self.markers_to_slave.push(marker.clone());
    }

    fn remove_from_selection_list(&mut self, marker: &Arc<TrackMarker>) {
        let Some(index) = self.selected.iter().position(|m| m.id() == marker.id()) else {
            return;
        };
        self.selected.remove(index);
        self.markers_to_slave.retain(|m| m.id() != marker.id());
        self.markers_to_unslave.push(marker.clone());
    }
}

/// Owns the markers of one tracker and the worker tracking them
pub struct TrackerContext {
    inner: Mutex<ContextInner>,
    config: Config,
    events: EventSender,
    scheduler: TrackScheduler,
    enabled_knob: Arc<SelectionKnob<bool>>,
    motion_model_knob: Arc<SelectionKnob<MotionModel>>,
    accessor: Mutex<Option<Arc<FrameAccessor>>>,
    solver: Mutex<Option<Arc<dyn TransformSolver>>>,
    transform_reference_frame: AtomicI32,
    transform_center: Mutex<Vector2d>,
    transform_out_of_date: AtomicBool,
    current_frame: AtomicI32,
}

impl TrackerContext {
    pub fn new(config: Config) -> Result<(TrackerContext, EventReceiver)> {
        let (events, receiver) = event_channel(config.event_capacity);
        let scheduler = TrackScheduler::new(config.threads, events.clone())?;
        let context = TrackerContext {
            inner: Mutex::new(ContextInner::default()),
            enabled_knob: Arc::new(SelectionKnob::new("enabled", true)),
            motion_model_knob: Arc::new(SelectionKnob::new("motionModel", config.motion_model)),
            config,
            events,
            scheduler,
            accessor: Mutex::new(None),
            solver: Mutex::new(None),
            transform_reference_frame: AtomicI32::new(0),
            transform_center: Mutex::new(Vector2d::zeros()),
            transform_out_of_date: AtomicBool::new(false),
            current_frame: AtomicI32::new(0),
        };
        Ok((context, receiver))
    }

    fn lock(&self) -> MutexGuard<'_, ContextInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &TrackScheduler {
        &self.scheduler
    }

    /// Sender for markers created outside of the context
    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    pub fn set_sequence(&self, source: Arc<dyn SequenceSource>) {
        let accessor = Arc::new(FrameAccessor::new(source, self.config.channels));
        *self.accessor.lock().unwrap_or_else(PoisonError::into_inner) = Some(accessor);
    }

    pub fn accessor(&self) -> Option<Arc<FrameAccessor>> {
        self.accessor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_solver(&self, solver: Arc<dyn TransformSolver>) {
        *self.solver.lock().unwrap_or_else(PoisonError::into_inner) = Some(solver);
    }

    fn solver(&self) -> Option<Arc<dyn TransformSolver>> {
        self.solver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn transform_reference_frame(&self) -> Frame {
        self.transform_reference_frame.load(Ordering::SeqCst)
    }

    pub fn set_transform_reference_frame(&self, frame: Frame) {
        self.transform_reference_frame.store(frame, Ordering::SeqCst);
    }

    pub fn current_frame(&self) -> Frame {
        self.current_frame.load(Ordering::SeqCst)
    }

    pub fn set_current_frame(&self, frame: Frame) {
        self.current_frame.store(frame, Ordering::SeqCst);
    }

    pub fn enabled_selection_knob(&self) -> &Arc<SelectionKnob<bool>> {
        &self.enabled_knob
    }

    pub fn motion_model_selection_knob(&self) -> &Arc<SelectionKnob<MotionModel>> {
        &self.motion_model_knob
    }

    // markers

    pub fn generate_unique_track_name(&self, base_name: &str) -> String {
        let inner = self.lock();
        let names: BTreeSet<String> = inner.markers.iter().map(|m| m.script_name()).collect();
        (1..)
            .map(|no| format!("{base_name}{no}"))
            .find(|name| !names.contains(name))
            .unwrap_or_else(|| base_name.to_string())
    }

    /// A new marker using the configured backend, centered on the sequence
    pub fn create_marker(&self) -> Result<Arc<TrackMarker>> {
        self.create_marker_with_backend(self.config.backend)
    }

    pub fn create_marker_with_backend(&self, backend: BackendKind) -> Result<Arc<TrackMarker>> {
        let name = self.generate_unique_track_name(TRACK_BASE_NAME);
        let marker = TrackMarker::create(
            &name,
            backend.create(&self.config),
            &self.config,
            self.events.clone(),
        );
        if let Some(accessor) = self.accessor() {
            marker.set_center(self.current_frame(), accessor.format().center());
        }
        self.append_marker(marker.clone())?;
        Ok(marker)
    }

    pub fn append_marker(&self, marker: Arc<TrackMarker>) -> Result<()> {
        self.insert_marker(marker, usize::MAX)
    }

    /// Insert at `index`, appending when past the end
    pub fn insert_marker(&self, marker: Arc<TrackMarker>, index: usize) -> Result<()> {
        let name = marker.script_name();
        let index = {
            let mut inner = self.lock();
            if inner.markers.iter().any(|m| m.script_name() == name) {
                return Err(TrackerError::DuplicateMarkerName(name));
            }
            let index = index.min(inner.markers.len());
            inner.markers.insert(index, marker);
            index
        };
        self.events
            .send(TrackerEvent::MarkerInserted { marker: name, index });
        Ok(())
    }

    pub fn remove_marker(&self, marker: &Arc<TrackMarker>) {
        {
            let mut inner = self.lock();
            inner.markers.retain(|m| m.id() != marker.id());
        }
        self.begin_edit_selection(SelectionReason::Internal);
        self.remove_track_from_selection(marker, SelectionReason::Internal);
        self.end_edit_selection(SelectionReason::Internal);
        self.events.send(TrackerEvent::MarkerRemoved {
            marker: marker.script_name(),
        });
    }

    pub fn marker_by_name(&self, name: &str) -> Option<Arc<TrackMarker>> {
        self.lock()
            .markers
            .iter()
            .find(|m| m.script_name() == name)
            .cloned()
    }

    pub fn marker_index(&self, marker: &TrackMarker) -> Option<usize> {
        self.lock().markers.iter().position(|m| m.id() == marker.id())
    }

    /// Marker before `marker`, wrapping to the last one when `wrap` is set
    pub fn prev_marker(&self, marker: &TrackMarker, wrap: bool) -> Option<Arc<TrackMarker>> {
        let inner = self.lock();
        match inner.markers.iter().position(|m| m.id() == marker.id()) {
            Some(i) if i > 0 => Some(inner.markers[i - 1].clone()),
            _ if wrap => inner.markers.last().cloned(),
            _ => None,
        }
    }

    /// Marker after `marker`, wrapping to the first one when `wrap` is set
    pub fn next_marker(&self, marker: &TrackMarker, wrap: bool) -> Option<Arc<TrackMarker>> {
        let inner = self.lock();
        let first = inner.markers.first()?;
        match inner.markers.iter().position(|m| m.id() == marker.id()) {
            Some(i) if i + 1 < inner.markers.len() => Some(inner.markers[i + 1].clone()),
            Some(_) if !wrap => None,
            _ if wrap && first.id() != marker.id() => Some(first.clone()),
            _ => None,
        }
    }

    pub fn all_markers(&self) -> Vec<Arc<TrackMarker>> {
        self.lock().markers.clone()
    }

    pub fn all_enabled_markers(&self, time: Frame) -> Vec<Arc<TrackMarker>> {
        self.lock()
            .markers
            .iter()
            .filter(|m| m.is_enabled(time))
            .cloned()
            .collect()
    }

    // selection

    pub fn selected_markers(&self) -> Vec<Arc<TrackMarker>> {
        self.lock().selected.clone()
    }

    pub fn is_marker_selected(&self, marker: &TrackMarker) -> bool {
        self.lock().selected.iter().any(|m| m.id() == marker.id())
    }

    /// Open a selection transaction. Transactions nest, only the outermost
    /// `end_edit_selection` applies the changes.
    pub fn begin_edit_selection(&self, reason: SelectionReason) {
        let outermost = {
            let mut inner = self.lock();
            inner.increment_selection_counter();
            inner.begin_selection_counter == 1
        };
        if outermost {
            self.events.send(TrackerEvent::SelectionAboutToChange(reason));
        }
    }

    pub fn end_edit_selection(&self, reason: SelectionReason) {
        let do_end = {
            let mut inner = self.lock();
            inner.decrement_selection_counter();
            inner.begin_selection_counter == 0
        };
        if do_end {
            self.end_selection(reason);
        }
    }

    pub fn add_track_to_selection(&self, marker: &Arc<TrackMarker>, reason: SelectionReason) {
        self.add_tracks_to_selection(std::slice::from_ref(marker), reason);
    }

    pub fn add_tracks_to_selection(&self, markers: &[Arc<TrackMarker>], reason: SelectionReason) {
        self.edit_selection(reason, |inner| {
            for marker in markers {
                inner.add_to_selection_list(marker);
            }
        });
    }

    pub fn remove_track_from_selection(&self, marker: &Arc<TrackMarker>, reason: SelectionReason) {
        self.remove_tracks_from_selection(std::slice::from_ref(marker), reason);
    }

    pub fn remove_tracks_from_selection(
        &self,
        markers: &[Arc<TrackMarker>],
        reason: SelectionReason,
    ) {
        self.edit_selection(reason, |inner| {
            for marker in markers {
                inner.remove_from_selection_list(marker);
            }
        });
    }

    pub fn clear_selection(&self, reason: SelectionReason) {
        let selected = self.selected_markers();
        if selected.is_empty() {
            return;
        }
        self.remove_tracks_from_selection(&selected, reason);
    }

    /// Select every marker enabled at the current frame
    pub fn select_all(&self, reason: SelectionReason) {
        self.begin_edit_selection(reason);
        let markers = self.all_enabled_markers(self.current_frame());
        self.add_tracks_to_selection(&markers, reason);
        self.end_edit_selection(reason);
    }

    /// Apply `edit` inside the open transaction, or inside an implicit one
    fn edit_selection(&self, reason: SelectionReason, edit: impl FnOnce(&mut ContextInner)) {
        let implicit = self.lock().begin_selection_counter == 0;
        if implicit {
            self.begin_edit_selection(reason);
        }
        edit(&mut *self.lock());
        if implicit {
            self.end_edit_selection(reason);
        }
    }

    fn end_selection(&self, reason: SelectionReason) {
        let frame = self.current_frame();
        let changed = {
            let mut inner = self.lock();
            let before = inner.selection_before.take();
            if inner.selection_recursion > 0 {
                inner.markers_to_slave.clear();
                inner.markers_to_unslave.clear();
                return;
            }
            inner.selection_recursion += 1;

            let dirty = inner.selected.len() > 1;
            for marker in std::mem::take(&mut inner.markers_to_unslave) {
                marker.unslave_from_selection();
            }
            for marker in std::mem::take(&mut inner.markers_to_slave) {
                self.enabled_knob.set_value(marker.is_enabled(frame));
                self.motion_model_knob.set_value(marker.motion_model());
                marker.slave_to_selection(&self.enabled_knob, &self.motion_model_knob);
            }
            self.enabled_knob.set_dirty(dirty);
            self.motion_model_knob.set_dirty(dirty);

            inner.selection_recursion -= 1;
            before.map_or(true, |before| before != inner.selected_ids())
        };
        if changed {
            self.events.send(TrackerEvent::SelectionChanged(reason));
        }
    }

    /// Move the current frame to the closest user keyframe before `time`
    /// among the selected markers
    pub fn go_to_previous_keyframe(&self, time: Frame) -> Option<Frame> {
        let frame = self
            .selected_markers()
            .iter()
            .filter_map(|m| m.previous_user_keyframe(time))
            .max()?;
        self.set_current_frame(frame);
        Some(frame)
    }

    pub fn go_to_next_keyframe(&self, time: Frame) -> Option<Frame> {
        let frame = self
            .selected_markers()
            .iter()
            .filter_map(|m| m.next_user_keyframe(time))
            .min()?;
        self.set_current_frame(frame);
        Some(frame)
    }

    // batch edits through the selection knobs

    /// Set Enabled at `time` on every selected marker following the
    /// selection. Markers leased to a run are skipped. Returns how many
    /// markers were written.
    pub fn set_selected_enabled(&self, time: Frame, enabled: bool) -> usize {
        self.enabled_knob.set_value(enabled);
        self.enabled_knob.set_dirty(false);
        self.selected_markers()
            .iter()
            .filter(|m| m.follow_enabled(&self.enabled_knob, time, enabled))
            .count()
    }

    pub fn set_selected_motion_model(&self, model: MotionModel) -> usize {
        self.motion_model_knob.set_value(model);
        self.motion_model_knob.set_dirty(false);
        self.selected_markers()
            .iter()
            .filter(|m| m.follow_motion_model(&self.motion_model_knob, model))
            .count()
    }

    // tracking

    /// Track the selected markers enabled at the current frame
    pub fn track_selected_markers(&self, start: Frame, end: Frame, step: i32) -> Result<()> {
        let frame = self.current_frame();
        let markers: Vec<_> = self
            .selected_markers()
            .into_iter()
            .filter(|m| m.is_enabled(frame))
            .collect();
        self.track_markers(markers, start, end, step)
    }

    pub fn track_markers(
        &self,
        markers: Vec<Arc<TrackMarker>>,
        start: Frame,
        end: Frame,
        step: i32,
    ) -> Result<()> {
        if markers.is_empty() {
            // nothing starts, listeners still see the run end
            debug!("no markers to track");
            self.events
                .send(TrackerEvent::TrackingFinished(RunSummary::default()));
            return Ok(());
        }
        if step == 0 {
            return Err(TrackerError::InvalidStep);
        }
        let accessor = self.accessor().ok_or(TrackerError::NoSequence)?;

        for marker in &markers {
            if self.config.auto_key {
                if let Err(err) = marker.set_enabled_at_time(start, true) {
                    debug!("{err}, keeping its enabled state at {start}");
                }
            }
            marker.set_keyframe_on_center_and_pattern_at_time(start);
            if marker.user_keyframes().is_empty() {
                marker.set_user_keyframe(start);
            }
        }

        info!(
            "tracking {} markers from {} to {} by {}",
            markers.len(),
            start,
            end,
            step
        );
        let accessor: Arc<dyn ImageAccessor> = accessor;
        let mut args = TrackArgs::new(start, end, step, markers, accessor)
            .with_channels(self.config.channels)
            .with_auto_disable(self.config.auto_key)
            .with_viewer_updates(self.config.update_viewer)
            .with_progress_interval(std::time::Duration::from_millis(
                self.config.progress_interval_ms,
            ))
            .with_partial_update_max_tracks(self.config.partial_update_max_tracks);
        match (self.config.auto_solve, self.solver()) {
            (true, Some(solver)) => {
                args = args.with_solver(solver, self.transform_reference_frame());
                self.transform_out_of_date.store(false, Ordering::SeqCst);
            }
            _ => self.transform_out_of_date.store(true, Ordering::SeqCst),
        }
        self.scheduler.track(args)
    }

    pub fn is_currently_tracking(&self) -> bool {
        self.scheduler.is_working()
    }

    pub fn abort_tracking(&self) {
        self.scheduler.abort_tracking();
    }

    pub fn abort_tracking_blocking(&self) {
        self.scheduler.abort_tracking_blocking();
    }

    // transform

    /// Hand every marker to the solver at the transform reference frame
    pub fn solve_transform_params(&self) {
        self.transform_out_of_date.store(false, Ordering::SeqCst);
        let markers = self.all_markers();
        if markers.is_empty() {
            return;
        }
        if let Some(solver) = self.solver() {
            solver.solve(&markers, self.transform_reference_frame());
        }
    }

    /// Whether tracks changed since the transform was last solved
    pub fn is_transform_out_of_date(&self) -> bool {
        self.transform_out_of_date.load(Ordering::SeqCst)
    }

    /// Average center of the markers enabled at the transform reference
    /// frame, the middle of the frame without any
    pub fn reset_transform_center(&self) -> Vector2d {
        let time = self.transform_reference_frame();
        let markers = self.all_enabled_markers(time);
        let center = if markers.is_empty() {
            self.accessor()
                .map(|a| a.format().center())
                .unwrap_or_else(Vector2d::zeros)
        } else {
            markers.iter().map(|m| m.center_at(time)).sum::<Vector2d>() / markers.len() as f64
        };
        *self.transform_center.lock().unwrap_or_else(PoisonError::into_inner) = center;
        center
    }

    pub fn transform_center(&self) -> Vector2d {
        *self.transform_center.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn replace_markers(&self, markers: Vec<Arc<TrackMarker>>) {
        self.clear_selection(SelectionReason::Internal);
        let removed = std::mem::replace(&mut self.lock().markers, markers.clone());
        for marker in removed {
            self.events.send(TrackerEvent::MarkerRemoved {
                marker: marker.script_name(),
            });
        }
        for (index, marker) in markers.iter().enumerate() {
            self.events.send(TrackerEvent::MarkerInserted {
                marker: marker.script_name(),
                index,
            });
        }
    }
}
