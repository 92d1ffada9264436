#![allow(dead_code)]

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use marker_tracker::backend::*;
use marker_tracker::config::Config;
use marker_tracker::context::TrackerContext;
use marker_tracker::error::{Result, TrackerError};
use marker_tracker::events::*;
use marker_tracker::frame_accessor::{ImageAccessor, Patch, SequenceSource};
use marker_tracker::image::{ColorImage, Image};
use marker_tracker::marker::TrackMarker;
use marker_tracker::my_types::*;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub type Script = dyn Fn(&MarkerSnapshot, Frame) -> Result<TrackRegionResult> + Send + Sync;

/// Backend answering from a closure and recording every call as
/// `(marker, reference frame, target frame)`
pub struct ScriptedBackend {
    script: Box<Script>,
    calls: Mutex<Vec<(String, Frame, Frame)>>,
}

impl ScriptedBackend {
    pub fn new(
        script: impl Fn(&MarkerSnapshot, Frame) -> Result<TrackRegionResult> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(vec![]),
        })
    }

    /// Moves the point by `delta` every frame
    pub fn shifting(delta: Vector2d) -> Arc<Self> {
        Self::new(move |snapshot, _| Ok(moved(snapshot, delta)))
    }

    /// Shifts by one pixel in x, fails from `frame` on
    pub fn failing_from(frame: Frame) -> Arc<Self> {
        Self::new(move |snapshot, target| {
            if target >= frame {
                Err(TrackerError::Backend(format!("lost at {target}")))
            } else {
                Ok(moved(snapshot, Vector2d::new(1., 0.)))
            }
        })
    }

    pub fn calls(&self) -> Vec<(String, Frame, Frame)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn target_frames(&self) -> Vec<Frame> {
        self.calls().into_iter().map(|(_, _, target)| target).collect()
    }
}

impl fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedBackend").finish()
    }
}

impl TrackingBackend for ScriptedBackend {
    fn track(
        &self,
        reference: &MarkerSnapshot,
        target_frame: Frame,
        _accessor: &dyn ImageAccessor,
    ) -> Result<TrackRegionResult> {
        self.calls.lock().unwrap().push((
            reference.name.clone(),
            reference.reference_frame,
            target_frame,
        ));
        (self.script)(reference, target_frame)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::PatternMatch
    }
}

/// Result placing the point at `guess + delta`
pub fn moved(snapshot: &MarkerSnapshot, delta: Vector2d) -> TrackRegionResult {
    let point = snapshot.guess + delta;
    TrackRegionResult {
        point,
        pattern: translate_pattern(&snapshot.pattern, point - snapshot.point),
        correlation: 0.75,
    }
}

/// A one-shot gate: backends block in `wait` until the test calls `open`
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }
}

/// Uniform gray frames over a wide frame range
pub struct FlatSequence;

impl SequenceSource for FlatSequence {
    fn format(&self) -> Format {
        Format::new(200, 200)
    }

    fn frame_range(&self) -> (Frame, Frame) {
        (-1000, 1000)
    }

    fn read_frame(&self, _frame: Frame) -> Result<ColorImage> {
        Ok(ColorImage::from_gray(&Image::filled(200, 200, 128)))
    }
}

/// Accessor handing out flat patches, counting `end_of_run` calls
#[derive(Default)]
pub struct FlatAccessor {
    pub runs_ended: Mutex<usize>,
}

impl ImageAccessor for FlatAccessor {
    fn format(&self) -> Format {
        Format::new(200, 200)
    }

    fn get_patch(&self, _frame: Frame, rect: Rect) -> Result<Patch> {
        let width = (rect.x2.ceil() - rect.x1.floor()).max(1.) as usize;
        let height = (rect.y2.ceil() - rect.y1.floor()).max(1.) as usize;
        Ok(Patch {
            origin: Vector2d::new(rect.x1.floor(), rect.y1.floor()),
            image: Image::filled(width, height, 128),
        })
    }

    fn end_of_run(&self) {
        *self.runs_ended.lock().unwrap() += 1;
    }
}

pub fn test_config() -> Config {
    Config {
        threads: 4,
        progress_interval_ms: 0,
        ..Config::default()
    }
}

pub fn marker(
    name: &str,
    backend: Arc<dyn TrackingBackend>,
    events: EventSender,
) -> Arc<TrackMarker> {
    let marker = TrackMarker::create(name, backend, &test_config(), events);
    marker.set_center(0, Vector2d::new(100., 100.));
    marker
}

/// A context over `FlatSequence` holding one marker per backend, named
/// `A`, `B`, ...
pub fn context_with(
    backends: &[Arc<dyn TrackingBackend>],
) -> (TrackerContext, EventReceiver, Vec<Arc<TrackMarker>>) {
    let (context, events) = TrackerContext::new(test_config()).unwrap();
    context.set_sequence(Arc::new(FlatSequence));
    let markers: Vec<_> = backends
        .iter()
        .enumerate()
        .map(|(i, backend)| {
            let name = ((b'A' + i as u8) as char).to_string();
            let marker = marker(&name, backend.clone(), context.event_sender());
            context.append_marker(marker.clone()).unwrap();
            marker
        })
        .collect();
    (context, events, markers)
}

/// Events up to and including the `n`th `TrackingFinished`
pub fn until_finished(events: &EventReceiver, n: usize) -> Vec<TrackerEvent> {
    let mut seen = vec![];
    let mut finished = 0;
    while finished < n {
        let batch = events
            .wait_for(TIMEOUT, |e| matches!(e, TrackerEvent::TrackingFinished(_)))
            .expect("timed out waiting for the run to finish");
        finished += 1;
        seen.extend(batch);
    }
    seen
}

pub fn summaries(events: &[TrackerEvent]) -> Vec<RunSummary> {
    events
        .iter()
        .filter_map(|e| match e {
            TrackerEvent::TrackingFinished(summary) => Some(summary.clone()),
            _ => None,
        })
        .collect()
}
