mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use marker_tracker::error::TrackerError;
use marker_tracker::events::*;
use marker_tracker::marker::TrackMarker;
use marker_tracker::my_types::*;
use marker_tracker::scheduler::{SchedulerState, TrackScheduler};
use marker_tracker::track_args::{TrackArgs, TransformSolver};

use common::*;

struct Harness {
    scheduler: TrackScheduler,
    events: EventReceiver,
    sender: EventSender,
    accessor: Arc<FlatAccessor>,
}

fn harness() -> Harness {
    let (sender, events) = event_channel(4096);
    Harness {
        scheduler: TrackScheduler::new(4, sender.clone()).unwrap(),
        events,
        sender,
        accessor: Arc::new(FlatAccessor::default()),
    }
}

impl Harness {
    fn args(&self, start: Frame, end: Frame, step: i32, tracks: &[Arc<TrackMarker>]) -> TrackArgs {
        TrackArgs::new(start, end, step, tracks.to_vec(), self.accessor.clone())
            .with_auto_disable(true)
            .with_progress_interval(std::time::Duration::ZERO)
    }

    fn run(&self, args: TrackArgs) -> (Vec<TrackerEvent>, RunSummary) {
        self.scheduler.track(args).unwrap();
        let events = until_finished(&self.events, 1);
        let summary = summaries(&events).remove(0);
        self.scheduler.wait_idle();
        (events, summary)
    }
}

#[test]
fn test_failing_marker_is_disabled_at_the_failing_frame() {
    let h = harness();
    let failing = ScriptedBackend::failing_from(5);
    let steady = ScriptedBackend::shifting(Vector2d::new(1., 0.));
    let a = marker("A", failing.clone(), h.sender.clone());
    let b = marker("B", steady.clone(), h.sender.clone());

    let (_, summary) = h.run(h.args(1, 11, 1, &[a.clone(), b.clone()]));

    assert_eq!(summary.last_valid_frame, Some(10));
    assert_eq!(summary.frames_processed, 10);
    assert!(!summary.aborted && !summary.all_failed);
    assert_eq!(summary.disabled_markers, vec![("A".to_string(), 5)]);

    // the start frame is an anchor, tracking begins on the next one
    assert_eq!(a.center_keyframes(), vec![2, 3, 4]);
    assert_eq!(a.error_at(1), 0.);
    assert_eq!(a.enabled_keyframes(), vec![(5, false)]);
    assert!(a.is_enabled(4));
    assert!(!a.is_enabled(5));
    // a disabled marker is not handed to its backend anymore
    assert_eq!(failing.target_frames(), vec![2, 3, 4, 5]);

    assert_eq!(b.center_keyframes(), (2..=10).collect::<Vec<_>>());
    assert!(b.enabled_keyframes().is_empty());
    assert_eq!(b.center_at(10), Vector2d::new(109., 100.));
    assert_eq!(b.error_at(10), 0.25);
}

#[test]
fn test_run_stops_when_every_marker_fails() {
    let h = harness();
    let a = marker("A", ScriptedBackend::failing_from(6), h.sender.clone());
    let b = marker("B", ScriptedBackend::failing_from(6), h.sender.clone());

    let (_, summary) = h.run(h.args(1, 11, 1, &[a.clone(), b.clone()]));

    assert_eq!(summary.last_valid_frame, Some(5));
    assert_eq!(summary.frames_processed, 6);
    assert!(summary.all_failed);
    for marker in [&a, &b] {
        assert!(marker.center_keyframes().iter().all(|t| *t < 6));
        assert!(marker.error_keyframes().iter().all(|t| *t < 6));
        assert_eq!(marker.enabled_keyframes(), vec![(6, false)]);
    }
    assert_eq!(*h.accessor.runs_ended.lock().unwrap(), 1);
}

#[test]
fn test_degenerate_range_does_nothing() {
    let h = harness();
    let backend = ScriptedBackend::shifting(Vector2d::new(1., 0.));
    let a = marker("A", backend.clone(), h.sender.clone());

    for (start, end, step) in [(5, 1, 1), (1, 5, -1), (3, 3, 1), (1, 5, 0)] {
        let (events, summary) = h.run(h.args(start, end, step, &[a.clone()]));
        assert_eq!(events.len(), 1, "{events:?}");
        assert_eq!(summary.frames_processed, 0);
        assert_eq!(summary.last_valid_frame, None);
    }
    assert!(backend.calls().is_empty());
    assert!(a.center_keyframes().is_empty());
    assert_eq!(*h.accessor.runs_ended.lock().unwrap(), 0);
}

#[test]
fn test_backend_panic_is_a_failed_step() {
    let h = harness();
    let panicking = ScriptedBackend::new(|snapshot, target| {
        if target == 3 {
            panic!("backend bug");
        }
        Ok(moved(snapshot, Vector2d::new(0., 1.)))
    });
    let a = marker("A", panicking, h.sender.clone());
    let b = marker("B", ScriptedBackend::shifting(Vector2d::new(1., 0.)), h.sender.clone());

    let (_, summary) = h.run(h.args(0, 6, 1, &[a.clone(), b.clone()]));
    assert_eq!(summary.last_valid_frame, Some(5));
    assert_eq!(a.center_keyframes(), vec![1, 2]);
    assert_eq!(a.enabled_keyframes(), vec![(3, false)]);
    assert_eq!(b.center_keyframes(), vec![1, 2, 3, 4, 5]);

    // the worker survived
    let (_, summary) = h.run(h.args(10, 12, 1, &[b.clone()]));
    assert_eq!(summary.last_valid_frame, Some(11));
}

#[test]
fn test_user_keyframes_are_anchors() {
    let h = harness();
    let backend = ScriptedBackend::shifting(Vector2d::new(1., 0.));
    let a = marker("A", backend.clone(), h.sender.clone());
    a.set_center_at_time(3, Vector2d::new(150., 100.), ValueChangedReason::UserEdited);
    a.set_user_keyframe(3);

    let (_, summary) = h.run(h.args(1, 6, 1, &[a.clone()]));
    assert_eq!(summary.last_valid_frame, Some(5));

    let calls: Vec<_> = backend
        .calls()
        .into_iter()
        .map(|(_, reference, target)| (reference, target))
        .collect();
    assert_eq!(calls, vec![(3, 2), (3, 4), (3, 5)]);
    assert_eq!(a.center_at(3), Vector2d::new(150., 100.));
    assert_eq!(a.error_at(3), 0.);
    assert_eq!(a.center_at(4), Vector2d::new(151., 100.));
}

#[test]
fn test_backward_run_visits_frames_in_order() {
    let h = harness();
    let backend = ScriptedBackend::shifting(Vector2d::new(-1., 0.));
    let a = marker("A", backend.clone(), h.sender.clone());

    let (events, summary) = h.run(h.args(10, 4, -2, &[a.clone()]));
    assert_eq!(summary.last_valid_frame, Some(6));
    assert_eq!(backend.target_frames(), vec![8, 6]);
    assert_eq!(backend.calls()[0].1, 10);
    assert!(events.contains(&TrackerEvent::TrackingStarted { step: -2 }));
}

#[test]
fn test_abort_lets_the_current_frame_finish() {
    let h = harness();
    let gate = Gate::new();
    let (entered_tx, entered_rx) = mpsc::channel();
    let entered_tx = Mutex::new(entered_tx);
    let backend = {
        let gate = gate.clone();
        ScriptedBackend::new(move |snapshot, target| {
            if target == 4 {
                let _ = entered_tx.lock().unwrap().send(target);
                gate.wait();
            }
            Ok(moved(snapshot, Vector2d::new(1., 0.)))
        })
    };
    let a = marker("A", backend.clone(), h.sender.clone());
    let b = marker("B", backend.clone(), h.sender.clone());

    h.scheduler.track(h.args(0, 50, 1, &[a.clone(), b.clone()])).unwrap();
    assert_eq!(entered_rx.recv_timeout(TIMEOUT), Ok(4));
    h.scheduler.abort_tracking();
    assert_eq!(h.scheduler.state(), SchedulerState::Aborting);
    gate.open();

    let summary = summaries(&until_finished(&h.events, 1)).remove(0);
    h.scheduler.wait_idle();
    assert!(summary.aborted);
    assert_eq!(summary.last_valid_frame, Some(4));
    assert_eq!(h.scheduler.state(), SchedulerState::Idle);

    // both markers finished frame 4, nobody started frame 5
    assert_eq!(a.center_keyframes(), vec![1, 2, 3, 4]);
    assert_eq!(b.center_keyframes(), vec![1, 2, 3, 4]);
    assert!(backend.target_frames().iter().all(|t| *t <= 4));
}

#[test]
fn test_newer_request_supersedes() {
    let h = harness();
    let gate = Gate::new();
    let (entered_tx, entered_rx) = mpsc::channel();
    let entered_tx = Mutex::new(entered_tx);
    let backend = {
        let gate = gate.clone();
        ScriptedBackend::new(move |snapshot, target| {
            if target == 3 {
                let _ = entered_tx.lock().unwrap().send(target);
                gate.wait();
            }
            Ok(moved(snapshot, Vector2d::new(1., 0.)))
        })
    };
    let a = marker("A", backend.clone(), h.sender.clone());

    h.scheduler.track(h.args(0, 50, 1, &[a.clone()])).unwrap();
    assert_eq!(entered_rx.recv_timeout(TIMEOUT), Ok(3));
    // the middle request is replaced before it ever starts
    h.scheduler.track(h.args(100, 103, 1, &[a.clone()])).unwrap();
    h.scheduler.track(h.args(200, 202, 1, &[a.clone()])).unwrap();
    gate.open();

    let events = until_finished(&h.events, 2);
    h.scheduler.wait_idle();
    let summaries = summaries(&events);
    assert_eq!(summaries[0].run_id, 1);
    assert!(summaries[0].aborted);
    assert_eq!(summaries[0].last_valid_frame, Some(3));
    assert_eq!(summaries[1].run_id, 2);
    assert_eq!(summaries[1].last_valid_frame, Some(201));
    assert_eq!(h.scheduler.runs_started(), 2);

    // runs never overlap
    let mut active = 0;
    for event in &events {
        match event {
            TrackerEvent::TrackingStarted { .. } => {
                active += 1;
                assert_eq!(active, 1);
            }
            TrackerEvent::TrackingFinished(_) => active -= 1,
            _ => {}
        }
    }
    assert_eq!(
        backend.target_frames(),
        vec![1, 2, 3, 201],
    );
}

#[test]
fn test_abort_drops_the_pending_request() {
    let h = harness();
    let gate = Gate::new();
    let (entered_tx, entered_rx) = mpsc::channel();
    let entered_tx = Mutex::new(entered_tx);
    let backend = {
        let gate = gate.clone();
        ScriptedBackend::new(move |snapshot, target| {
            if target == 1 {
                let _ = entered_tx.lock().unwrap().send(target);
                gate.wait();
            }
            Ok(moved(snapshot, Vector2d::new(1., 0.)))
        })
    };
    let a = marker("A", backend.clone(), h.sender.clone());

    h.scheduler.track(h.args(0, 50, 1, &[a.clone()])).unwrap();
    assert_eq!(entered_rx.recv_timeout(TIMEOUT), Ok(1));
    h.scheduler.track(h.args(100, 103, 1, &[a.clone()])).unwrap();
    h.scheduler.abort_tracking();
    gate.open();
    h.scheduler.wait_idle();

    assert_eq!(h.scheduler.runs_started(), 1);
    assert_eq!(backend.target_frames(), vec![1]);
    assert!(h.scheduler.last_summary().unwrap().aborted);
}

#[test]
fn test_events_of_a_run() {
    let h = harness();
    let a = marker("A", ScriptedBackend::shifting(Vector2d::new(1., 0.)), h.sender.clone());
    let b = marker("B", ScriptedBackend::shifting(Vector2d::new(0., 1.)), h.sender.clone());

    let (events, _) = h.run(h.args(0, 5, 1, &[a.clone(), b.clone()]));

    assert_eq!(events.first(), Some(&TrackerEvent::TrackingStarted { step: 1 }));
    assert!(matches!(events.last(), Some(TrackerEvent::TrackingFinished(_))));

    let progress: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            TrackerEvent::TrackingProgress(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert!(progress.iter().all(|p| *p > 0. && *p <= 1.));

    let refreshes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TrackerEvent::ViewerRefresh { frame, regions } => Some((*frame, regions.clone())),
            _ => None,
        })
        .collect();
    // partial redraws while tracking, a full one at the end
    assert!(refreshes[..refreshes.len() - 1]
        .iter()
        .all(|(_, regions)| regions.as_ref().map(|r| r.len()) == Some(2)));
    assert_eq!(refreshes.last(), Some(&(4, None)));

    // keyframe changes are batched until the run ends
    let center_changes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TrackerEvent::KeyframeChanged {
                marker,
                knob: KnobKind::Center,
                times,
                reason,
            } => Some((marker.clone(), times.clone(), *reason)),
            _ => None,
        })
        .collect();
    assert_eq!(
        center_changes,
        vec![
            ("A".to_string(), vec![1, 2, 3, 4], ValueChangedReason::Tracking),
            ("B".to_string(), vec![1, 2, 3, 4], ValueChangedReason::Tracking),
        ]
    );
    assert!(!a.is_tracking());
}

#[test]
fn test_finished_survives_a_full_queue() {
    let (sender, events) = event_channel(64);
    let scheduler = TrackScheduler::new(4, sender.clone()).unwrap();
    let backend = ScriptedBackend::shifting(Vector2d::new(1., 0.));
    let markers: Vec<_> = (0..100)
        .map(|i| marker(&format!("M{i}"), backend.clone(), sender.clone()))
        .collect();
    let args = TrackArgs::new(0, 3, 1, markers, Arc::new(FlatAccessor::default()))
        .with_progress_interval(std::time::Duration::ZERO);

    // nobody drains while the run floods the queue with keyframe batches
    scheduler.track(args).unwrap();
    scheduler.wait_idle();
    let events = events.drain();

    assert_eq!(events.first(), Some(&TrackerEvent::TrackingStarted { step: 1 }));
    let finished = summaries(&events);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].last_valid_frame, Some(2));
    assert!(matches!(events.last(), Some(TrackerEvent::TrackingFinished(_))));
}

#[test]
fn test_progress_is_throttled() {
    let h = harness();
    let a = marker("A", ScriptedBackend::shifting(Vector2d::new(1., 0.)), h.sender.clone());
    let args = h
        .args(0, 20, 1, &[a.clone()])
        .with_viewer_updates(true)
        .with_progress_interval(std::time::Duration::from_secs(3600));

    let (events, summary) = h.run(args);
    assert_eq!(summary.last_valid_frame, Some(19));
    assert!(!events
        .iter()
        .any(|e| matches!(e, TrackerEvent::TrackingProgress(_))));
    // only the closing full redraw
    let refreshes: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, TrackerEvent::ViewerRefresh { .. }))
        .collect();
    assert_eq!(refreshes.len(), 1);
}

#[derive(Default)]
struct CountingSolver {
    calls: AtomicUsize,
    markers: AtomicUsize,
}

impl TransformSolver for CountingSolver {
    fn solve(&self, markers: &[Arc<TrackMarker>], _reference_frame: Frame) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.markers.store(markers.len(), Ordering::SeqCst);
    }
}

#[test]
fn test_solver_runs_after_a_valid_run() {
    let h = harness();
    let solver = Arc::new(CountingSolver::default());
    let a = marker("A", ScriptedBackend::shifting(Vector2d::new(1., 0.)), h.sender.clone());
    let b = marker("B", ScriptedBackend::failing_from(0), h.sender.clone());

    h.run(h.args(0, 3, 1, &[a.clone(), b.clone()]).with_solver(solver.clone(), 0));
    assert_eq!(solver.calls.load(Ordering::SeqCst), 1);
    assert_eq!(solver.markers.load(Ordering::SeqCst), 2);

    // B is disabled from frame 1 on, nothing to solve
    let (_, summary) = h.run(h.args(1, 3, 1, &[b.clone()]).with_solver(solver.clone(), 0));
    assert_eq!(summary.last_valid_frame, None);
    assert_eq!(solver.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_quit_thread_refuses_new_runs() {
    let h = harness();
    let a = marker("A", ScriptedBackend::shifting(Vector2d::new(1., 0.)), h.sender.clone());
    h.scheduler.quit_thread();
    assert!(matches!(
        h.scheduler.track(h.args(0, 3, 1, &[a])),
        Err(TrackerError::SchedulerStopped)
    ));
    assert!(!h.scheduler.is_working());
}
