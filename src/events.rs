//! Notifications flowing from the tracker to the thread that owns the UI.
//!
//! The scheduler and the markers push `TrackerEvent`s into a bounded channel
//! from whatever thread they run on. The owning thread drains the channel with
//! `EventReceiver::pump` and reacts there.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use log::{trace, warn};

use crate::my_types::*;

/// Where a value change originates from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueChangedReason {
    UserEdited,
    /// written by a track run
    Tracking,
    /// bookkeeping such as loading a project or freezing keys before a run
    Internal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KnobKind {
    Center,
    Offset,
    Pattern,
    SearchWindow,
    Error,
    Enabled,
    MotionModel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionReason {
    SettingsPanel,
    Viewer,
    Internal,
}

/// Outcome of one track run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    pub run_id: u64,
    /// last frame at which at least one marker tracked
    pub last_valid_frame: Option<Frame>,
    pub frames_processed: usize,
    pub aborted: bool,
    /// stopped early because every marker failed on the same frame
    pub all_failed: bool,
    /// markers auto-disabled during the run, with the frame they failed at
    pub disabled_markers: Vec<(String, Frame)>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TrackerEvent {
    TrackingStarted {
        step: i32,
    },
    /// fraction of the frame range consumed, in `[0, 1]`
    TrackingProgress(f64),
    TrackingFinished(RunSummary),
    /// `regions` lists the areas to redraw, None for the whole viewer
    ViewerRefresh {
        frame: Frame,
        regions: Option<Vec<Rect>>,
    },
    KeyframeChanged {
        marker: String,
        knob: KnobKind,
        times: Vec<Frame>,
        reason: ValueChangedReason,
    },
    UserKeyframeAdded {
        marker: String,
        time: Frame,
    },
    UserKeyframeRemoved {
        marker: String,
        time: Frame,
    },
    EnabledChanged {
        marker: String,
        time: Frame,
        enabled: bool,
        reason: ValueChangedReason,
    },
    SelectionAboutToChange(SelectionReason),
    SelectionChanged(SelectionReason),
    MarkerInserted {
        marker: String,
        index: usize,
    },
    MarkerRemoved {
        marker: String,
    },
}

/// Queue slots only events that must not be lost may fill
const RESERVED_SLOTS: usize = 16;

impl TrackerEvent {
    /// Progress and partial redraw hints a lagging receiver can do without
    fn is_droppable(&self) -> bool {
        matches!(
            self,
            TrackerEvent::TrackingProgress(_)
                | TrackerEvent::ViewerRefresh {
                    regions: Some(_),
                    ..
                }
                | TrackerEvent::KeyframeChanged { .. }
        )
    }
}

/// Sending half, cheap to clone. Once the receiver lags `capacity` events
/// behind, droppable events are discarded with a warning while the rest still
/// go through the reserved slots.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: Option<SyncSender<TrackerEvent>>,
    queued: Arc<AtomicUsize>,
    capacity: usize,
}

impl EventSender {
    /// A sender that discards everything
    pub fn disconnected() -> Self {
        Self {
            tx: None,
            queued: Arc::default(),
            capacity: 0,
        }
    }

    pub fn send(&self, event: TrackerEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if event.is_droppable() && self.queued.load(Ordering::SeqCst) >= self.capacity {
            warn!("event queue full, dropping {event:?}");
            return;
        }
        // counted before sending so the receiver never sees more than was counted
        self.queued.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                warn!("event queue full, dropping {event:?}");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                trace!("event receiver gone");
            }
        }
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<TrackerEvent>,
    queued: Arc<AtomicUsize>,
}

impl EventReceiver {
    fn took(&self, event: TrackerEvent) -> TrackerEvent {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        event
    }

    /// Every event currently queued, without blocking
    pub fn drain(&self) -> Vec<TrackerEvent> {
        self.rx.try_iter().map(|e| self.took(e)).collect()
    }

    /// Hand every queued event to `handler`, returns how many were handled
    pub fn pump(&self, mut handler: impl FnMut(TrackerEvent)) -> usize {
        let mut count = 0;
        for event in self.rx.try_iter() {
            handler(self.took(event));
            count += 1;
        }
        count
    }

    /// Wait up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: Duration) -> Option<TrackerEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(self.took(event)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Block until an event matching `predicate` arrives, collecting every
    /// event received on the way. Returns None on timeout.
    pub fn wait_for(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&TrackerEvent) -> bool,
    ) -> Option<Vec<TrackerEvent>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut seen = vec![];
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let event = self.recv_timeout(remaining)?;
            let done = predicate(&event);
            seen.push(event);
            if done {
                return Some(seen);
            }
        }
    }
}

pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::sync_channel(capacity + RESERVED_SLOTS);
    let queued = Arc::new(AtomicUsize::new(0));
    let sender = EventSender {
        tx: Some(tx),
        queued: queued.clone(),
        capacity,
    };
    (sender, EventReceiver { rx, queued })
}
