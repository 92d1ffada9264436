//! The track worker: a long-lived thread stepping runs frame by frame and
//! fanning each frame out over the markers on a rayon pool.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rayon::prelude::*;
use tracing::info_span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::{Result, TrackerError};
use crate::events::*;
use crate::lease::EnabledLease;
use crate::my_types::*;
use crate::track_args::TrackArgs;
use crate::track_step::track_step;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Active,
    /// an abort was requested, the run stops at the next frame boundary
    Aborting,
    /// the run left its frame loop and is doing its end-of-run bookkeeping
    Stopped,
}

struct Inner {
    state: SchedulerState,
    /// most recent request not yet started
    pending: Option<TrackArgs>,
    abort_requested: bool,
    must_quit: bool,
    runs_started: u64,
    last_summary: Option<RunSummary>,
}

struct Shared {
    inner: Mutex<Inner>,
    cond: Condvar,
    events: EventSender,
    pool: rayon::ThreadPool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SchedulerState) {
        self.lock().state = state;
        self.cond.notify_all();
    }

    fn should_stop(&self) -> bool {
        let inner = self.lock();
        inner.abort_requested || inner.must_quit
    }
}

/// Runs track requests one at a time on a dedicated thread. A request made
/// while a run is active aborts that run and replaces any request still
/// waiting, it never queues behind them.
pub struct TrackScheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TrackScheduler {
    /// `threads` sizes the pool used within a frame, 0 lets rayon decide
    pub fn new(threads: usize, events: EventSender) -> Result<TrackScheduler> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("track-step-{i}"))
            .build()?;
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: SchedulerState::Idle,
                pending: None,
                abort_requested: false,
                must_quit: false,
                runs_started: 0,
                last_summary: None,
            }),
            cond: Condvar::new(),
            events,
            pool,
        });
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("track-scheduler".to_string())
            .spawn(move || worker_loop(&worker))?;
        Ok(TrackScheduler {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Request a run. Supersedes the pending request and aborts the active run.
    pub fn track(&self, args: TrackArgs) -> Result<()> {
        let mut inner = self.shared.lock();
        if inner.must_quit {
            return Err(TrackerError::SchedulerStopped);
        }
        debug!("track request {:?}", args);
        inner.pending = Some(args);
        if inner.state == SchedulerState::Active {
            inner.state = SchedulerState::Aborting;
            inner.abort_requested = true;
        }
        drop(inner);
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Ask the active run to stop at the next frame boundary and drop the
    /// pending request. Returns immediately.
    pub fn abort_tracking(&self) {
        let mut inner = self.shared.lock();
        inner.pending = None;
        if inner.state == SchedulerState::Active {
            inner.state = SchedulerState::Aborting;
            inner.abort_requested = true;
        }
        drop(inner);
        self.shared.cond.notify_all();
    }

    /// Like `abort_tracking`, then wait until the worker is idle
    pub fn abort_tracking_blocking(&self) {
        self.abort_tracking();
        self.wait_idle();
    }

    /// Block until no run is active or pending
    pub fn wait_idle(&self) {
        let mut inner = self.shared.lock();
        while inner.state != SchedulerState::Idle || inner.pending.is_some() {
            inner = self.shared.wait(inner);
        }
    }

    /// `wait_idle` with a deadline, returns false on timeout
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.lock();
        while inner.state != SchedulerState::Idle || inner.pending.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            inner = self
                .shared
                .cond
                .wait_timeout(inner, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.lock().state
    }

    pub fn is_working(&self) -> bool {
        let inner = self.shared.lock();
        inner.state != SchedulerState::Idle || inner.pending.is_some()
    }

    pub fn runs_started(&self) -> u64 {
        self.shared.lock().runs_started
    }

    /// Summary of the most recently finished run
    pub fn last_summary(&self) -> Option<RunSummary> {
        self.shared.lock().last_summary.clone()
    }

    /// Abort, drop the pending request and join the worker thread
    pub fn quit_thread(&self) {
        {
            let mut inner = self.shared.lock();
            inner.must_quit = true;
            inner.pending = None;
            if inner.state == SchedulerState::Active {
                inner.state = SchedulerState::Aborting;
                inner.abort_requested = true;
            }
        }
        self.shared.cond.notify_all();
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("track worker panicked");
            }
        }
    }
}

impl Drop for TrackScheduler {
    fn drop(&mut self) {
        self.quit_thread();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let (args, run_id) = {
            let mut inner = shared.lock();
            while inner.pending.is_none() && !inner.must_quit {
                inner = shared.wait(inner);
            }
            if inner.must_quit {
                inner.state = SchedulerState::Idle;
                break;
            }
            let Some(args) = inner.pending.take() else {
                continue;
            };
            inner.state = SchedulerState::Active;
            inner.abort_requested = false;
            inner.runs_started += 1;
            (args, inner.runs_started)
        };
        shared.cond.notify_all();

        let summary = run(shared, &args, run_id);
        shared.events.send(TrackerEvent::TrackingFinished(summary.clone()));

        let mut inner = shared.lock();
        inner.last_summary = Some(summary);
        inner.abort_requested = false;
        inner.state = SchedulerState::Idle;
        drop(inner);
        shared.cond.notify_all();
    }
    shared.cond.notify_all();
    debug!("track worker exits");
}

/// One run: the frame loop and the bookkeeping around it
fn run(shared: &Shared, args: &TrackArgs, run_id: u64) -> RunSummary {
    let frames = args.frames();
    let mut summary = RunSummary {
        run_id,
        ..Default::default()
    };
    if frames.is_empty() {
        info!(
            "run {run_id}: nothing to track from {} to {} by {}",
            args.start(),
            args.end(),
            args.step()
        );
        shared.set_state(SchedulerState::Stopped);
        return summary;
    }

    info!(
        "run {run_id}: tracking {} markers over {} frames from {} by {}",
        args.num_tracks(),
        frames.len(),
        args.start(),
        args.step()
    );
    shared.events.send(TrackerEvent::TrackingStarted { step: args.step() });
    for track in args.tracks() {
        track.notify_tracking_started();
    }
    let lease = EnabledLease::acquire(args.tracks(), args.start());

    let span = info_span!("track", run = run_id);
    span.pb_set_length(frames.len() as u64);
    let span_enter = span.enter();

    let mut last_emit = Instant::now();
    for (i, &frame) in frames.iter().enumerate() {
        let results: Vec<bool> = shared.pool.install(|| {
            (0..args.num_tracks())
                .into_par_iter()
                .map(|index| track_step(index, args, frame, &lease))
                .collect()
        });
        summary.frames_processed += 1;
        span.pb_inc(1);

        if !results.iter().any(|ok| *ok) {
            info!("run {run_id}: every marker failed at frame {frame}");
            summary.all_failed = true;
            break;
        }
        summary.last_valid_frame = Some(frame);

        let interval = args.progress_interval();
        if interval.is_zero() || last_emit.elapsed() > interval {
            let progress = (i + 1) as f64 / frames.len() as f64;
            shared.events.send(TrackerEvent::TrackingProgress(progress));
            if args.update_viewer() {
                shared.events.send(TrackerEvent::ViewerRefresh {
                    frame,
                    regions: args.redraw_areas(frame),
                });
            }
            last_emit = Instant::now();
        }

        if shared.should_stop() {
            info!("run {run_id}: aborted after frame {frame}");
            summary.aborted = true;
            break;
        }
    }

    std::mem::drop(span_enter);
    std::mem::drop(span);
    shared.set_state(SchedulerState::Stopped);

    summary.disabled_markers = lease.release(summary.last_valid_frame.unwrap_or(args.start()));
    for track in args.tracks() {
        track.notify_tracking_ended();
    }
    args.accessor().end_of_run();

    if let (Some(solver), Some(_)) = (args.solver(), summary.last_valid_frame) {
        let solved = panic::catch_unwind(AssertUnwindSafe(|| {
            solver.solve(args.tracks(), args.transform_reference_frame())
        }));
        if solved.is_err() {
            warn!("run {run_id}: transform solver panicked");
        }
    }

    if let (true, Some(frame)) = (args.update_viewer(), summary.last_valid_frame) {
        shared.events.send(TrackerEvent::ViewerRefresh {
            frame,
            regions: None,
        });
    }
    info!(
        "run {run_id}: {} frames processed, last valid frame {:?}",
        summary.frames_processed, summary.last_valid_frame
    );
    summary
}
